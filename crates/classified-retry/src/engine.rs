//! Retry loop driven by failure classification.

use crate::{Classify, RetryPolicy};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use token_bucket_limiter::{Admission, RateGate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Failure of [`RetryEngine::execute_with_cancel`].
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The operation failed fatally or ran out of attempts.
    #[error("{0}")]
    Failed(E),

    /// The caller cancelled while waiting for a backoff or a rate limit.
    #[error("Retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last error the operation produced, if it ran at all.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Failed(error) => Some(error),
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// When built with a limiter, a token is taken before every attempt. Time
/// spent waiting for a token is not an attempt.
#[derive(Clone, Default)]
pub struct RetryEngine {
    limiter: Option<Arc<dyn RateGate>>,
}

impl fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEngine")
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limiter(limiter: Arc<dyn RateGate>) -> Self {
        Self {
            limiter: Some(limiter),
        }
    }

    /// Run `operation` until it succeeds, fails fatally, or exhausts
    /// `policy`. The error returned is the operation's own last error.
    pub async fn execute<T, E, F, Fut>(&self, policy: &RetryPolicy, operation: F) -> Result<T, E>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.run(policy, None, operation).await {
            Ok(value) => Ok(value),
            Err(RetryError::Failed(error)) => Err(error),
            Err(RetryError::Cancelled { .. }) => {
                unreachable!("retry loop cannot be cancelled without a token")
            }
        }
    }

    /// Like [`RetryEngine::execute`], abandoning any backoff or limiter wait
    /// once `cancel` fires. An attempt already in flight is not interrupted.
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(policy, Some(cancel), operation).await
    }

    async fn run<T, E, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        let mut last_error: Option<E> = None;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last_error,
                });
            }

            if let Some(limiter) = &self.limiter {
                loop {
                    let retry_after = match limiter.try_acquire() {
                        Admission::Granted => break,
                        Admission::Throttled { retry_after } => retry_after,
                    };
                    debug!(
                        attempt,
                        wait_ms = retry_after.as_millis() as u64,
                        "Rate limited before attempt"
                    );
                    tokio::select! {
                        _ = cancelled(cancel) => {
                            return Err(RetryError::Cancelled { attempts: attempt, last_error });
                        }
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
            }

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.failure_kind();
            if !kind.is_retryable() {
                warn!(
                    attempt,
                    kind = kind.as_str(),
                    error = %error,
                    "Fatal failure, not retrying"
                );
                return Err(RetryError::Failed(error));
            }

            if attempt >= policy.max_retries {
                error!(
                    attempts = attempt + 1,
                    kind = kind.as_str(),
                    error = %error,
                    "Retries exhausted"
                );
                return Err(RetryError::Failed(error));
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = kind.as_str(),
                error = %error,
                "Retryable failure, backing off"
            );
            last_error = Some(error);
            attempt += 1;

            tokio::select! {
                _ = cancelled(cancel) => {
                    return Err(RetryError::Cancelled { attempts: attempt, last_error });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

async fn cancelled(cancel: Option<&CancellationToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
