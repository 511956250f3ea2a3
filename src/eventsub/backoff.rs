//! Reconnect backoff policy
//!
//! Pure attempt-count → delay mapping, without jitter.

use std::time::Duration;

/// 5s base, doubling per attempt
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 5;
/// 24h delay ceiling
pub const DEFAULT_BACKOFF_CEILING_SECS: u64 = 86_400;
/// Attempts before automatic reconnection stops and a manual reconnect is required
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            ceiling: Duration::from_secs(DEFAULT_BACKOFF_CEILING_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            ceiling,
            max_attempts,
        }
    }

    /// `min(base * 2^attempt, ceiling)`, saturating for large attempts.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(63);
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let delay = Duration::from_millis(base_ms.saturating_mul(factor));
        delay.min(self.ceiling)
    }

    /// False once `attempt` reaches the manual-intervention cutoff.
    #[inline]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_doubles_from_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_secs(5));
        assert_eq!(policy.next_delay(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(2), Duration::from_secs(20));
        assert_eq!(policy.next_delay(10), Duration::from_secs(5 * 1024));
    }

    #[test]
    fn test_next_delay_matches_formula_and_is_monotonic() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..policy.max_attempts {
            let expected = (5u64 * 2u64.pow(attempt)).min(86_400);
            let delay = policy.next_delay(attempt);
            assert_eq!(delay, Duration::from_secs(expected), "attempt {attempt}");
            assert!(delay >= previous);
            previous = delay;
        }
    }

    #[test]
    fn test_next_delay_caps_without_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(15), Duration::from_secs(86_400));
        assert_eq!(policy.next_delay(64), Duration::from_secs(86_400));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(86_400));
    }

    #[test]
    fn test_should_retry_cutoff() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(100));
    }
}
