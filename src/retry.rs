//! Shared retry policy with exponential backoff.
//!
//! The API client, the PDF downloader and the geocoder all retry transient
//! failures the same way: base delay doubled per attempt, capped, up to a
//! configured attempt limit.

use std::time::Duration;

/// Retry parameters for an operation against a flaky collaborator.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts (first try included).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before retrying after the given zero-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(exp);
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// HTTP statuses worth retrying: 429 and all 5xx. Other 4xx are terminal.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1));
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(403));
        assert!(!is_retryable_status(200));
    }
}
