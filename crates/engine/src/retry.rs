//! Exponential backoff with jitter.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

use herald_common::config::AppConfig;

/// Retry budget and backoff schedule for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base: Duration,
    /// Ceiling for any single delay, before jitter.
    pub max_delay: Duration,
    /// Total attempts allowed, first attempt included.
    pub max_attempts: i32,
    /// Jitter upper bound as a fraction of the computed delay.
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_attempts: config.retry_max_attempts,
            jitter_fraction: config.retry_jitter_fraction,
        }
    }

    /// Whether a task that just failed its `attempt`-th try may be tried again.
    ///
    /// The attempt that reaches `max_attempts` still counts; the task then
    /// becomes permanently failed.
    pub fn should_retry(&self, attempt: i32) -> bool {
        attempt < self.max_attempts
    }

    /// `base * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Random jitter in `[0, delay * jitter_fraction]`.
    pub fn jitter(&self, delay: Duration) -> Duration {
        let upper = delay.mul_f64(self.jitter_fraction.clamp(0.0, 1.0));
        if upper.is_zero() {
            return Duration::ZERO;
        }
        let secs = rand::rng().random_range(0.0..=upper.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Full delay after the `attempt`-th failure, jitter included.
    pub fn delay(&self, attempt: i32) -> Duration {
        let delay = self.base_delay(attempt);
        delay + self.jitter(delay)
    }

    /// Timestamp at which the next attempt becomes claimable.
    pub fn next_attempt_at(&self, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay(attempt)).unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: i32, jitter_fraction: f64) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts,
            jitter_fraction,
        }
    }

    #[test]
    fn test_base_delays_double_per_attempt() {
        let p = policy(3, 0.0);
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_base_delay_capped_at_max() {
        let p = policy(10, 0.0);
        assert_eq!(p.base_delay(4), Duration::from_secs(8));
        assert_eq!(p.base_delay(5), Duration::from_secs(10));
        assert_eq!(p.base_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let p = policy(3, 0.0);
        for attempt in 1..=3 {
            assert_eq!(p.delay(attempt), p.base_delay(attempt));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(5, 0.5);
        for attempt in 1..=5 {
            let base = p.base_delay(attempt);
            for _ in 0..100 {
                let delay = p.delay(attempt);
                assert!(delay >= base);
                assert!(delay <= base + base.mul_f64(0.5));
            }
        }
    }

    #[test]
    fn test_retry_budget_checked_after_attempt() {
        let p = policy(3, 0.0);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!p.should_retry(4));
    }

    #[test]
    fn test_next_attempt_at_offsets_now() {
        let p = policy(3, 0.0);
        let now = Utc::now();
        assert_eq!(p.next_attempt_at(2, now), now + TimeDelta::seconds(2));
    }
}
