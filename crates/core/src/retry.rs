//! Retry policy: exponential backoff and the DLQ threshold.

use std::time::Duration;

/// What the owning worker should do with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `pending`, eligible again after `delay`.
    Retry { delay: Duration },
    /// Retries exhausted; quarantine in the dead-letter queue.
    Dead,
}

/// Decide retry vs DLQ for a job whose attempt counter, after the failed
/// execution is counted, is `attempts`.
///
/// `delay = min(base_backoff ^ attempts, max_backoff)`, so with the default
/// base of 2 the sequence is 2, 4, 8, ... seconds. A job is dead once its
/// attempts exceed `max_retries`, which bounds `attempts` at
/// `max_retries + 1`.
pub fn evaluate(
    attempts: i64,
    max_retries: i64,
    base_backoff_secs: u64,
    max_backoff_secs: u64,
) -> RetryDecision {
    if attempts > max_retries {
        return RetryDecision::Dead;
    }
    let exponent = attempts.clamp(0, u32::MAX as i64) as u32;
    let delay = base_backoff_secs
        .saturating_pow(exponent)
        .min(max_backoff_secs);
    RetryDecision::Retry {
        delay: Duration::from_secs(delay),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delay_secs(decision: RetryDecision) -> u64 {
        match decision {
            RetryDecision::Retry { delay } => delay.as_secs(),
            RetryDecision::Dead => panic!("expected a retry"),
        }
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(delay_secs(evaluate(1, 10, 2, 3600)), 2);
        assert_eq!(delay_secs(evaluate(2, 10, 2, 3600)), 4);
        assert_eq!(delay_secs(evaluate(3, 10, 2, 3600)), 8);
        assert_eq!(delay_secs(evaluate(4, 10, 2, 3600)), 16);
    }

    #[test]
    fn test_backoff_caps_at_max() {
        // 2^12 = 4096 > 3600
        assert_eq!(delay_secs(evaluate(12, 100, 2, 3600)), 3600);
        // Huge attempt counts must not overflow.
        assert_eq!(delay_secs(evaluate(63, 100, 2, 3600)), 3600);
    }

    #[test]
    fn test_dlq_threshold() {
        // max_retries = 2: attempts 1 and 2 retry, 3 is dead.
        assert!(matches!(evaluate(1, 2, 2, 3600), RetryDecision::Retry { .. }));
        assert!(matches!(evaluate(2, 2, 2, 3600), RetryDecision::Retry { .. }));
        assert_eq!(evaluate(3, 2, 2, 3600), RetryDecision::Dead);
    }

    #[test]
    fn test_zero_max_retries_dies_on_first_failure() {
        assert_eq!(evaluate(1, 0, 2, 3600), RetryDecision::Dead);
    }

    #[test]
    fn test_custom_base() {
        assert_eq!(delay_secs(evaluate(2, 10, 5, 3600)), 25);
    }
}
