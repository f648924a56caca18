//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff between reconnect attempts, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Creates a new policy.
    ///
    /// # Arguments
    /// * `initial_delay` - Delay after the first failed attempt.
    /// * `max_delay` - Ceiling no delay will exceed.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self { initial_delay, max_delay }
    }

    /// Returns the delay to wait after the failed attempt number `attempt` (0-based).
    ///
    /// Doubles per attempt starting from `initial_delay`, never exceeding `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
