//! Continuously refilling token bucket.

use crate::{Admission, RateGate};
use chrono::{DateTime, Utc};
use courier_config_and_utils::{MonotonicClock, SharedClock};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Fill level in token units: one token is `window_ns` units and each
/// elapsed nanosecond adds `capacity` units.
#[derive(Debug)]
struct BucketState {
    units: u128,
    last_refill_at: DateTime<Utc>,
}

/// A bucket of `capacity` tokens refilled at `capacity / window`.
///
/// Starts full. Refill is computed lazily from elapsed time on every
/// access, so an idle bucket costs nothing. Waiting exactly the returned
/// hint always yields a token: the state is integral, so the hint round
/// trips without drift.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity` requests per second.
    pub fn per_second(capacity: u32) -> Self {
        Self::custom(capacity, Duration::from_secs(1))
    }

    /// `capacity` requests per minute.
    pub fn per_minute(capacity: u32) -> Self {
        Self::custom(capacity, Duration::from_secs(60))
    }

    /// `capacity` requests per arbitrary `window`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `window` is empty.
    pub fn custom(capacity: u32, window: Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(MonotonicClock::new()))
    }

    /// Same as [`TokenBucket::custom`] with an injected clock.
    pub fn with_clock(capacity: u32, window: Duration, clock: SharedClock) -> Self {
        assert!(capacity > 0, "token bucket capacity must be positive");
        assert!(!window.is_zero(), "token bucket window must be positive");

        let now = clock.now();
        Self {
            capacity,
            window,
            clock,
            state: Mutex::new(BucketState {
                units: u128::from(capacity) * window.as_nanos(),
                last_refill_at: now,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Consume one token if available.
    pub fn try_acquire(&self) -> Admission {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let token = self.token();
        if state.units >= token {
            state.units -= token;
            Admission::Granted
        } else {
            let retry_after = self.time_until_whole_token(state.units);
            trace!(
                capacity = self.capacity,
                window_ms = self.window.as_millis() as u64,
                wait_ms = retry_after.as_millis() as u64,
                "Token bucket exhausted"
            );
            Admission::Throttled { retry_after }
        }
    }

    /// Whole tokens available right now.
    pub fn available_tokens(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        self.whole_tokens(state.units)
    }

    /// Zero if a token is available, otherwise the time until one is.
    pub fn time_to_next_token(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        self.time_until_whole_token(state.units)
    }

    /// Refill to capacity.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.units = self.full();
        state.last_refill_at = self.clock.now();
    }

    /// Refill and report `(available, time_to_next_token)` without consuming.
    pub(crate) fn peek(&self) -> (u32, Duration) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        (
            self.whole_tokens(state.units),
            self.time_until_whole_token(state.units),
        )
    }

    fn token(&self) -> u128 {
        self.window.as_nanos()
    }

    fn full(&self) -> u128 {
        u128::from(self.capacity) * self.token()
    }

    fn whole_tokens(&self, units: u128) -> u32 {
        u32::try_from(units / self.token()).unwrap_or(self.capacity)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        if now <= state.last_refill_at {
            // Clock went backwards or no time passed: nothing to add.
            return;
        }

        let added = match (now - state.last_refill_at).num_nanoseconds() {
            Some(nanos) => u128::from(nanos.unsigned_abs()) * u128::from(self.capacity),
            // More than ~292 years idle.
            None => self.full(),
        };
        state.units = state.units.saturating_add(added).min(self.full());
        state.last_refill_at = now;
    }

    fn time_until_whole_token(&self, units: u128) -> Duration {
        let token = self.token();
        if units >= token {
            return Duration::ZERO;
        }
        let nanos = (token - units).div_ceil(u128::from(self.capacity));
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl RateGate for TokenBucket {
    fn try_acquire(&self) -> Admission {
        TokenBucket::try_acquire(self)
    }
}
