//! Scheduler error types.

use thiserror::Error;
use webhook_database::{DatabaseError, DeliveryStatus};

/// Scheduler error type.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// Persistence error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// No event with this ID
    #[error("Webhook event not found: {0}")]
    NotFound(String),

    /// The event's current status does not accept the requested action
    #[error("Cannot {action} webhook event {id} in status {status}")]
    InvalidTransition {
        id: String,
        status: DeliveryStatus,
        action: &'static str,
    },

    /// Another active event already holds the idempotency key
    #[error("Idempotency key already active: {0}")]
    KeyConflict(String),

    /// Rejected input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transport could not be constructed
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using SchedulerError.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
