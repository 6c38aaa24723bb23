//! # Classified retry
//!
//! Decides whether an outbound failure is worth another attempt and, when it
//! is, retries it on an exponential schedule.
//!
//! - [`OutboundError`]: what went wrong talking to a remote endpoint, with the
//!   underlying cause attached
//! - [`FailureKind`]: the five-way taxonomy every failure is mapped to
//! - [`Classify`]: lets any error type take part in retry decisions
//! - [`RetryPolicy`]: `min(max_delay, initial * multiplier^attempt) + jitter`
//! - [`RetryEngine`]: runs an operation until it succeeds, fails fatally, or
//!   runs out of attempts, optionally gated by a rate limiter
//!
//! Unknown failures are fatal. Retrying something nobody understands tends
//! to turn one bad request into a storm of them.

mod classifier;
mod engine;
mod error;
mod policy;

pub use classifier::{classify_status, Classify, ErrorClass, FailureKind};
pub use engine::{RetryEngine, RetryError};
pub use error::{BoxError, OutboundError};
pub use policy::RetryPolicy;
