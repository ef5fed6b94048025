//! Exponential backoff policy.
//!
//! One policy type covers every retry loop in the crate: the pool's
//! reconnect schedule and the fire-and-forget senders' bounded retries
//! are both instances. Call sites own their loops and ask the policy
//! for the delay between attempts, so every backoff in the system
//! follows the same curve.

use std::time::Duration;

/// Backoff parameters. Attempts are 1-based; the delay after attempt
/// `n` is `min(base * 2^(n-1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self { max_attempts, base, cap }
    }

    /// Pool reconnect schedule: 1 s doubling to a 30 s cap, retrying
    /// for as long as the pool lives.
    #[must_use]
    pub const fn reconnect() -> Self {
        Self::new(u32::MAX, Duration::from_millis(1000), Duration::from_millis(30_000))
    }

    /// Fire-and-forget sender schedule: three attempts, 200 ms doubling
    /// to a 2 s cap.
    #[must_use]
    pub const fn sender() -> Self {
        Self::new(3, Duration::from_millis(200), Duration::from_millis(2000))
    }

    /// Delay to sleep after the `attempt`-th failure (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    #[must_use]
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
#[path = "retry_test.rs"]
mod tests;
