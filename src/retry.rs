//! Linear backoff shared by reconnection and webhook retries.
//!
//! Both retry loops in the relay wait `n × base` before attempt `n`:
//! - Reconnect: attempt `n` of `max_reconnect_attempts` (default 5 × 5s)
//! - Webhook retry: retry `n` of `max_retries` (default 3, 5s/10s/15s)

use std::time::Duration;

/// Bounded linear backoff: delay before attempt `n` (1-based) is `n × base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    base: Duration,
    limit: u32,
}

impl LinearBackoff {
    /// Create a backoff with `limit` attempts spaced by multiples of `base`.
    pub fn new(base: Duration, limit: u32) -> Self {
        Self { base, limit }
    }

    /// Base delay (the delay before the first attempt).
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Maximum number of attempts this backoff allows.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Delay before attempt `attempt` (1-based).
    ///
    /// Attempt 0 has no delay. Attempts past the limit are still computed so
    /// callers can log what the next delay would have been.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.limit
    }

    /// Iterate `(attempt, delay)` pairs for the whole budget.
    pub fn schedule(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.limit).map(move |attempt| (attempt, self.delay_for(attempt)))
    }
}
