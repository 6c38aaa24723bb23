//! Core configuration, paths, clocks and logging setup for Courier.

mod clock;
mod config;
mod error;
mod logging;
mod paths;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock, SystemClock};
pub use config::{
    Config, DeliveryConfig, RateLimitConfig, RetryPolicyConfig, DEFAULT_ENDPOINT_URL,
    DEFAULT_LOG_LEVEL, MAX_REDELIVERY_RETRIES,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, init_logging_for_service};
pub use paths::Paths;
