//! Capped exponential backoff shared by consumers and the event publisher.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First retry delay.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay.
    pub max_delay_ms: u64,
    /// Attempts before giving up and dead-lettering.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based): base * 2^attempt,
    /// capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(32);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exp.min(63))
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}
