//! Bounded retry policy shared by link open, login, sync, ACK, and setup

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Attempt-counted retry with capped exponential back-off
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub backoff_ms: u64,
    /// Upper bound on any single delay
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            backoff_cap_ms: 2000,
        }
    }
}

impl RetryPolicy {
    /// Same delay between every attempt
    pub fn fixed(max_attempts: u32, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms: delay_ms,
            backoff_cap_ms: delay_ms,
        }
    }

    /// Attempt numbers, starting at 1
    pub fn attempts(&self) -> RangeInclusive<u32> {
        1..=self.max_attempts
    }

    /// Delay to wait after `attempt` failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.backoff_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(delay)
    }

    /// Wait before the next attempt; no wait after the last one
    pub async fn pause(&self, attempt: u32) {
        if attempt < self.max_attempts {
            tokio::time::sleep(self.delay_for(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            backoff_ms: 100,
            backoff_cap_ms: 500,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(3, 3000);
        assert_eq!(policy.attempts().count(), 3);
        assert_eq!(policy.delay_for(1), policy.delay_for(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_pause_after_last_attempt() {
        let policy = RetryPolicy::fixed(2, 1000);
        let start = tokio::time::Instant::now();
        policy.pause(2).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        policy.pause(1).await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1010));
    }
}
