//! Token bucket rate limiting for outbound calls.
//!
//! - [`TokenBucket`]: one capacity refilled continuously over a window
//! - [`MultiLevelLimiter`]: several buckets that must all admit a request
//!
//! Both answer "may I act now?" without blocking. [`acquire`] turns either
//! into a cancellable wait that sleeps on the returned wait hint.

mod bucket;
mod multi_level;

pub use bucket::TokenBucket;
pub use multi_level::MultiLevelLimiter;

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Outcome of a non-blocking acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A token was consumed.
    Granted,
    /// No token available; one will be after `retry_after`.
    Throttled { retry_after: Duration },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// Wait hint for a throttled request, `None` when granted.
    pub fn wait_hint(&self) -> Option<Duration> {
        match self {
            Admission::Granted => None,
            Admission::Throttled { retry_after } => Some(*retry_after),
        }
    }
}

/// Anything that can admit or throttle a single request.
pub trait RateGate: Send + Sync {
    fn try_acquire(&self) -> Admission;
}

/// Error returned by [`acquire`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("rate limit wait cancelled")]
    Cancelled,
}

/// Wait until `gate` admits a request, or until `cancel` fires.
pub async fn acquire<G>(gate: &G, cancel: &CancellationToken) -> Result<(), AcquireError>
where
    G: RateGate + ?Sized,
{
    loop {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let retry_after = match gate.try_acquire() {
            Admission::Granted => return Ok(()),
            Admission::Throttled { retry_after } => retry_after,
        };

        trace!(wait_ms = retry_after.as_millis() as u64, "Rate limited, waiting");

        tokio::select! {
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            _ = tokio::time::sleep(retry_after) => {}
        }
    }
}
