//! Delay between retry attempts.

use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_secs(config.backoff_base_secs),
            cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    pub fn delay(&self, retry: u32) -> Duration {
        backoff_delay(self.base, self.cap, retry)
    }
}

/// `base * 2^(retry - 1)`, capped. `retry` is 1 for the first retry.
pub fn backoff_delay(base: Duration, cap: Duration, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(cap).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(8);
        let delays: Vec<u64> = (1..=5).map(|r| backoff_delay(base, cap, r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);
    }

    #[test]
    fn huge_retry_numbers_saturate_at_cap() {
        let cap = Duration::from_secs(300);
        assert_eq!(backoff_delay(Duration::from_secs(5), cap, 1000), cap);
        assert_eq!(backoff_delay(Duration::from_secs(u64::MAX / 2), cap, 3), cap);
    }

    #[test]
    fn zero_retry_uses_base() {
        assert_eq!(
            backoff_delay(Duration::from_secs(3), Duration::from_secs(60), 0),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
        };
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
    }
}
