//! Retry backoff policy.

use std::time::Duration;

use crate::config::TimingConfig;

/// Exponential backoff with a cap and a bounded attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        RetryPolicy { base, cap, max_attempts }
    }

    pub fn from_config(config: &TimingConfig) -> Self {
        RetryPolicy::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.max_submit_attempts,
        )
    }

    /// Delay before the next attempt, given attempts already made.
    ///
    /// Doubles per attempt from `base` up to `cap`; zero before the first
    /// attempt so fresh records submit immediately.
    pub fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let shift = (attempts - 1).min(16);
        self.base.saturating_mul(1u32 << shift).min(self.cap)
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 8)
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::ZERO);
        assert_eq!(p.delay(1), Duration::from_secs(1));
        assert_eq!(p.delay(2), Duration::from_secs(2));
        assert_eq!(p.delay(3), Duration::from_secs(4));
        assert_eq!(p.delay(7), Duration::from_secs(60));
        assert_eq!(p.delay(30), Duration::from_secs(60));
    }

    #[test]
    fn budget_is_bounded() {
        let p = policy();
        assert!(!p.exhausted(7));
        assert!(p.exhausted(8));
        assert!(p.exhausted(9));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let p = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(3600), u32::MAX);
        assert_eq!(p.delay(u32::MAX), Duration::from_secs(3600));
    }
}
