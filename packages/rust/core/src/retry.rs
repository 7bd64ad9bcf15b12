//! Per-stage retry policy.

use std::time::Duration;

use refeed_shared::{RefeedError, WorkerConfig};

/// Attempt ceiling plus exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base: Duration,
}

/// What the pool does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay`.
    Retry { delay: Duration },
    /// The attempt ceiling is reached.
    Exhausted,
    /// The error can never succeed on retry.
    NotRetryable,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.attempts, Duration::from_millis(config.backoff_ms))
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp)
    }

    /// Decide after attempt number `attempt` failed with `error`.
    pub fn decide(&self, attempt: u32, error: &RefeedError) -> RetryDecision {
        if !error.is_retryable() {
            RetryDecision::NotRetryable
        } else if attempt >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(attempt),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1200));
        let delays: Vec<_> = (1..5).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1200, 2400, 4800, 9600]);
    }

    #[test]
    fn five_attempts_then_exhausted() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1200));
        let err = RefeedError::transient("https://example.com", "boom");
        let mut last = Duration::ZERO;
        for attempt in 1..5 {
            match policy.decide(attempt, &err) {
                RetryDecision::Retry { delay } => {
                    assert!(delay >= last);
                    last = delay;
                }
                other => panic!("attempt {attempt}: {other:?}"),
            }
        }
        assert_eq!(policy.decide(5, &err), RetryDecision::Exhausted);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(
            policy.decide(1, &RefeedError::permanent("no link")),
            RetryDecision::NotRetryable
        );
    }

    #[test]
    fn huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert!(policy.delay_for(90) >= policy.delay_for(40));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
