//! Idempotent webhook redelivery.
//!
//! - [`WebhookDeliveryScheduler`]: persisted events keyed by idempotency
//!   key, driven through the delivery state machine in [`fsm`]
//! - [`WebhookEventStore`]: storage seam, implemented for
//!   [`webhook_database::AsyncDatabase`]
//! - [`WebhookTransport`] / [`HttpTransport`]: one delivery attempt
//! - [`DeliveryWorker`]: background driver pairing the scheduler with a
//!   rate-limited [`classified_retry::RetryEngine`]

mod error;
pub mod fsm;
mod scheduler;
mod store;
mod transport;
mod worker;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::WebhookDeliveryScheduler;
pub use store::WebhookEventStore;
pub use transport::{
    HttpTransport, WebhookTransport, EVENT_ID_HEADER, EVENT_TYPE_HEADER, IDEMPOTENCY_KEY_HEADER,
    TRANSACTION_ID_HEADER,
};
pub use worker::{CycleReport, DeliveryOutcome, DeliveryWorker, MaintenanceReport, WorkerConfig};

pub use webhook_database::{
    DeletedFilter, DeliveryStats, DeliveryStatus, EventFilter, EventOrder, NewWebhookEvent,
    UpsertOutcome, WebhookEvent,
};
