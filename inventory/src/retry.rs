//! Exponential backoff policy for the outbox relay.
//!
//! Unlike an in-process retry loop, the relay persists its schedule: after a
//! failed publish it stamps `next_retry_at = now + delay(attempt)` on the row
//! and moves on. The policy here only computes delays and the ceiling.

use chrono::Duration;

/// Backoff schedule: `base * multiplier^attempt`, capped at `max_delay`,
/// dead after `max_retries` attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before a row is marked `Failed`.
    pub max_retries: i32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Cap for the exponential schedule.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 30s base doubling per attempt, capped at 30min, dead after 5 attempts.
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::seconds(30),
            max_delay: Duration::minutes(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (0-based: the delay scheduled
    /// after the first failure is `delay_for_attempt(0) == base_delay`).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        if attempt <= 0 {
            return self.base_delay;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let millis = (self.base_delay.num_milliseconds() as f64
            * self.multiplier.powi(attempt)) as i64;
        let delay = Duration::milliseconds(millis);
        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    /// Whether a row that has already failed `retry_count` times is dead.
    #[must_use]
    pub const fn is_exhausted(&self, retry_count: i32) -> bool {
        retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::seconds(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::seconds(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::seconds(120));
        // 30s * 2^10 would be ~8.5h; capped at 30min.
        assert_eq!(policy.delay_for_attempt(10), Duration::minutes(30));
    }

    #[test]
    fn ceiling_marks_rows_dead() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }

    proptest::proptest! {
        #[test]
        fn delays_are_monotone_and_bounded(attempt in 0i32..64) {
            let policy = RetryPolicy::default();
            let delay = policy.delay_for_attempt(attempt);
            proptest::prop_assert!(delay >= policy.base_delay);
            proptest::prop_assert!(delay <= policy.max_delay);
            proptest::prop_assert!(delay <= policy.delay_for_attempt(attempt + 1));
        }
    }
}
