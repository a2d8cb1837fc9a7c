//! Reconnection backoff schedule.

use std::time::Duration;

use crate::config::ConnectionConfig;

/// Exponential backoff over a bounded attempt budget.
///
/// Attempt `n` waits `base * 2^n` milliseconds, with no jitter. Once the
/// budget is exhausted the connection is considered terminally failed.
pub struct Backoff {
    base_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            base_ms: config.base_backoff_ms,
            max_attempts: config.max_retry_attempts,
            attempt: 0,
        }
    }

    /// Record a failure and get the delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;

        // Cap the shift so pathological budgets cannot overflow
        let exponent = self.attempt.min(16);
        let delay_ms = self.base_ms.saturating_mul(1u64 << exponent);

        Duration::from_millis(delay_ms)
    }

    /// Whether the attempt budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset to the initial state after a successful connect.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
