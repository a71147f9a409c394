use chrono::{DateTime, Duration, Utc};

/// Retry delay after a failed stage: `base * multiplier^attempt` while attempts
/// remain, then a fixed cooldown once the budget is spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_minutes: i64,
    pub multiplier: i64,
    pub cooldown_hours: i64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base_delay_minutes: 10, multiplier: 2, cooldown_hours: 24 }
    }
}

const MAX_EXPONENT: u32 = 16;
const MAX_DELAY_MINUTES: i64 = 60 * 24 * 365;

impl BackoffPolicy {
    pub fn is_exhausted(&self, attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count >= max_attempts
    }

    pub fn delay_after_failure(&self, attempt_count: u32, max_attempts: u32) -> Duration {
        if self.is_exhausted(attempt_count, max_attempts) {
            return Duration::hours(self.cooldown_hours);
        }

        let factor = self.multiplier.saturating_pow(attempt_count.min(MAX_EXPONENT));
        Duration::minutes(self.base_delay_minutes.saturating_mul(factor).clamp(0, MAX_DELAY_MINUTES))
    }

    pub fn next_attempt_at(
        &self,
        attempt_count: u32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        now + self.delay_after_failure(attempt_count, max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::BackoffPolicy;

    #[test]
    fn delays_double_per_attempt_until_budget_is_spent() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay_after_failure(1, 3), Duration::minutes(20));
        assert_eq!(policy.delay_after_failure(2, 3), Duration::minutes(40));
        assert_eq!(policy.delay_after_failure(3, 3), Duration::hours(24));
        assert_eq!(policy.delay_after_failure(9, 3), Duration::hours(24));
    }

    #[test]
    fn delays_are_non_decreasing_below_the_cap() {
        let policy = BackoffPolicy::default();

        for max_attempts in 1..=12 {
            let mut previous = Duration::zero();
            for attempt in 1..max_attempts {
                let delay = policy.delay_after_failure(attempt, max_attempts);
                assert_eq!(delay, Duration::minutes(10 * 2_i64.pow(attempt)));
                assert!(delay >= previous);
                previous = delay;
            }
        }
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_after_failure(60, u32::MAX);

        assert!(delay > Duration::zero());
    }
}
