//! Exponential backoff policy for the reconnect supervisor.

use std::time::Duration;

/// Retry schedule for unexpected disconnects.
///
/// The delay before retry `n` is `base_delay * 2^n`, capped at `max_delay`.
/// Once `max_attempts` consecutive failures accumulate, the supervisor stops
/// scheduling and surfaces a terminal error; only an explicit `connect()`
/// (which resets the counter) resumes retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Whether the attempt counter has hit the ceiling.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
