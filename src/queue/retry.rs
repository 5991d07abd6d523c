//! Retry decision and exponential backoff schedule.

use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_retry_delay(),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Whether a failure of `kind` after `retries_so_far` retries gets
    /// another attempt.
    pub fn should_retry(&self, kind: ErrorKind, retries_so_far: u32) -> bool {
        kind.is_retryable() && retries_so_far < self.max_retries
    }

    /// Backoff before retry number `retry` (1-based):
    /// `base_delay * multiplier^(retry - 1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_is_one_two_four_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(ErrorKind::Transient, 0));
        assert!(policy.should_retry(ErrorKind::Transient, 2));
        assert!(!policy.should_retry(ErrorKind::Transient, 3));
        assert!(!policy.should_retry(ErrorKind::Permanent, 0));
        assert!(!policy.should_retry(ErrorKind::RateLimit, 0));
    }

    #[test]
    fn test_huge_exponent_saturates() {
        let policy = RetryPolicy {
            max_retries: u32::MAX,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
        };
        assert_eq!(
            policy.delay_for(200),
            Duration::from_millis(1000).saturating_mul(u32::MAX)
        );
    }
}
