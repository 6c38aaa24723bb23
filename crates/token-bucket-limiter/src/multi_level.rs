use crate::{Admission, RateGate, TokenBucket};
use courier_config_and_utils::{RateLimitConfig, SharedClock};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered set of buckets that must all admit a request.
///
/// Every level is peeked before any is debited, so a denial never costs a
/// token on the levels that did have room.
#[derive(Debug)]
pub struct MultiLevelLimiter {
    levels: Vec<TokenBucket>,
    commit: Mutex<()>,
}

impl MultiLevelLimiter {
    pub fn new(levels: Vec<TokenBucket>) -> Self {
        Self {
            levels,
            commit: Mutex::new(()),
        }
    }

    /// Per-second and per-minute ceilings, the usual outbound pairing.
    pub fn per_second_and_minute(per_second: u32, per_minute: u32) -> Self {
        Self::new(vec![
            TokenBucket::per_second(per_second),
            TokenBucket::per_minute(per_minute),
        ])
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::per_second_and_minute(config.per_second, config.per_minute)
    }

    /// Same as [`MultiLevelLimiter::from_config`] with an injected clock.
    pub fn from_config_with_clock(config: &RateLimitConfig, clock: SharedClock) -> Self {
        Self::new(vec![
            TokenBucket::with_clock(config.per_second, Duration::from_secs(1), clock.clone()),
            TokenBucket::with_clock(config.per_minute, Duration::from_secs(60), clock),
        ])
    }

    /// Capacity of each level, in order.
    pub fn capacities(&self) -> Vec<u32> {
        self.levels.iter().map(TokenBucket::capacity).collect()
    }

    pub fn try_acquire(&self) -> Admission {
        let _commit = self.commit.lock();

        let mut wait: Option<Duration> = None;
        for (level, bucket) in self.levels.iter().enumerate() {
            let (available, next) = bucket.peek();
            if available < 1 {
                debug!(
                    level,
                    capacity = bucket.capacity(),
                    wait_ms = next.as_millis() as u64,
                    "Rate limit level exhausted"
                );
                wait = Some(wait.map_or(next, |w| w.max(next)));
            }
        }

        if let Some(retry_after) = wait {
            return Admission::Throttled { retry_after };
        }

        for (level, bucket) in self.levels.iter().enumerate() {
            // Refill only grows between peek and commit, so this holds.
            if let Admission::Throttled { retry_after } = bucket.try_acquire() {
                warn!(level, "Rate limit level denied after successful peek");
                return Admission::Throttled { retry_after };
            }
        }

        Admission::Granted
    }

    /// Whole tokens available per level, in order.
    pub fn status(&self) -> Vec<u32> {
        self.levels.iter().map(TokenBucket::available_tokens).collect()
    }

    pub fn reset(&self) {
        let _commit = self.commit.lock();
        for bucket in &self.levels {
            bucket.reset();
        }
    }
}

impl RateGate for MultiLevelLimiter {
    fn try_acquire(&self) -> Admission {
        MultiLevelLimiter::try_acquire(self)
    }
}
