use courier_config_and_utils::RetryPolicyConfig;
use rand::Rng;
use std::time::Duration;

/// Immutable retry schedule.
///
/// Attempt `n` (zero-based) that fails with a retryable error is followed by
/// a sleep of `min(max_delay, initial_delay * multiplier^n)` plus a uniform
/// jitter in `[0, jitter]`. At most `max_retries + 1` attempts are made.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// One attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(0, Duration::from_millis(1), Duration::from_millis(1), 2.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Backoff after `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);

        let delay_ms = (initial_ms * self.backoff_multiplier.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms.round() as u64)
    }

    /// Backoff after `attempt` including a fresh jitter sample.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + self.sample_jitter()
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicyConfig::default())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.backoff_multiplier,
        )
        .with_jitter(Duration::from_millis(config.jitter_ms))
    }
}
