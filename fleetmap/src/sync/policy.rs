//! Retry backoff for queued mutations.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default delay before the first retry (1 second).
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1_000;

/// Default cap on the retry delay (5 minutes).
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5 * 60 * 1_000;

/// Default multiplier applied after each failure.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Exponential backoff between delivery attempts.
///
/// Unlike a task retry policy the attempts are spread over passes of the
/// sync queue: the policy only decides when an action is next due.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Attempts before the action is given up as rejected; `None` retries
    /// forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Retry on the next pass without waiting.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// `0` means unlimited.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.powi(exponent);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// When an action that has failed `attempts` times is next due, or
    /// `None` when no more attempts are allowed.
    pub fn next_attempt_at(&self, attempts: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_exhausted(attempts) {
            return None;
        }
        let delay = self.delay_for_attempt(attempts);
        let millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        Some(now + chrono::Duration::milliseconds(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_doubles_from_one_second() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_next_attempt_at() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.next_attempt_at(3, now),
            Some(now + chrono::Duration::seconds(4))
        );
        assert_eq!(RetryPolicy::immediate().next_attempt_at(5, now), Some(now));
    }

    #[test]
    fn test_max_attempts() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        assert!(!policy.is_exhausted(2));
        assert!(policy.next_attempt_at(3, Utc::now()).is_none());
        assert_eq!(RetryPolicy::default().with_max_attempts(0).max_attempts, None);
    }
}
