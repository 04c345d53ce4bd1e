//! Exponential backoff for rate-limited provider calls.

use std::time::Duration;

/// Retry decision for a single outbound call.
///
/// Only rate-limit responses are retried; the delay before retry `n`
/// (counting from zero) is `2^n * base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(3),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay to wait after failed attempt `attempt`, or `None` once the
    /// retry budget is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 2u32.checked_pow(attempt)?;
        self.base_delay.checked_mul(factor)
    }

    /// Total attempts made before giving up, counting the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}
