use crate::config::RetryPolicy;
use std::time::Duration;

/// Exponential backoff with a ceiling.
///
/// The delay after attempt `n` (1-based) is `initial × 2^(n-1)`, clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RetryPolicy::default())
    }
}

impl From<&RetryPolicy> for BackoffPolicy {
    fn from(policy: &RetryPolicy) -> Self {
        let initial = policy.initial_backoff_ms.max(1);
        Self {
            initial: Duration::from_millis(initial),
            max: Duration::from_millis(policy.max_backoff_ms.max(initial)),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis().max(1).min(u64::MAX as u128) as u64;
        let cap = (self.max.as_millis().min(u64::MAX as u128) as u64).max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_doubles_from_two_seconds() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn test_growth_is_strictly_increasing_until_cap() {
        let backoff = BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(1_000));
        let delays: Vec<_> = (1..=12).map(|a| backoff.delay_for_attempt(a)).collect();

        let below_cap: Vec<_> = delays
            .iter()
            .take_while(|d| **d < Duration::from_millis(1_000))
            .collect();
        assert!(below_cap.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delays[11], Duration::from_millis(1_000));
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_max_below_initial_is_raised() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_backoff_ms: 500,
            max_backoff_ms: 100,
        };
        let backoff = BackoffPolicy::from(&policy);
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(500));
    }
}
