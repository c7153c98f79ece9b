//! # Retry Backoff
//!
//! Exponential backoff with jitter for retrying inference-dependent stages.
//! The policy only computes delays and budgets; whether an error is worth
//! retrying is decided by its [`ErrorKind`](crate::types::ErrorKind).

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::ServiceError;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage, the first one included
    pub max_attempts: u32,
    /// Base delay before the second attempt
    pub base_backoff: Duration,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
    /// Jitter as a fraction of the delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            jitter_factor: 0.1,
        }
    }
}

/// A retry policy that determines how long to wait and when to give up
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempts_made` failures of `error`
    pub fn should_retry<E: ServiceError + ?Sized>(&self, error: &E, attempts_made: u32) -> bool {
        error.is_transient() && attempts_made < self.max_attempts()
    }

    /// Delay before attempt number `attempt + 1` (attempt is 1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_backoff.as_millis() as f64;
        let max_ms = self.config.max_backoff.as_millis() as f64;

        let exp = attempt.saturating_sub(1).min(16) as i32;
        let capped = (base_ms * 2.0_f64.powi(exp)).min(max_ms);

        let jitter_range = capped * self.config.jitter_factor.clamp(0.0, 1.0);
        let jittered = if jitter_range > 0.0 {
            capped + rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            capped
        };

        Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[derive(Debug, thiserror::Error)]
    #[error("{0:?}")]
    struct Kinded(ErrorKind);

    impl ServiceError for Kinded {
        fn kind(&self) -> ErrorKind {
            self.0
        }

        fn service(&self) -> &'static str {
            "test"
        }
    }

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 4,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_factor: 0.5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..RetryConfig::default()
        });
        for _ in 0..100 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_should_retry_only_transient_within_budget() {
        let policy = no_jitter();
        assert!(policy.should_retry(&Kinded(ErrorKind::Timeout), 1));
        assert!(policy.should_retry(&Kinded(ErrorKind::WorkerCrashed), 3));
        assert!(!policy.should_retry(&Kinded(ErrorKind::Timeout), 4));
        assert!(!policy.should_retry(&Kinded(ErrorKind::ResourceExhausted), 1));
    }
}
