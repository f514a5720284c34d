//! Shared retry policy.
//!
//! One `BackoffPolicy` value is shared by every adapter call site. It decides
//! the delay sequence; `SourceError::is_retriable` decides whether an error is
//! worth another attempt.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use super::types::{ConstructionError, SourceError};
use crate::config::{
    RETRY_INITIAL_DELAY_MS, RETRY_MAX_ATTEMPTS, RETRY_MAX_DELAY_SECS, RETRY_MAX_TOTAL_WAIT_SECS,
};

/// Exponential backoff with an attempt cap and a total-wait budget.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// Cap on the sum of all delays of one call
    pub max_total_wait: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_secs(RETRY_MAX_DELAY_SECS),
            max_attempts: RETRY_MAX_ATTEMPTS,
            max_total_wait: Duration::from_secs(RETRY_MAX_TOTAL_WAIT_SECS),
        }
    }
}

/// Result of running an operation under a `BackoffPolicy`.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, SourceError>,
    /// Attempts made, including the first one
    pub attempts: u32,
}

impl BackoffPolicy {
    /// Policy without delays, for tests and local sources.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_attempts,
            max_total_wait: Duration::ZERO,
        }
    }

    pub fn validate(&self) -> Result<(), ConstructionError> {
        if self.max_attempts == 0 {
            return Err(ConstructionError::InvalidConfig(
                "backoff max_attempts must be at least 1".into(),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConstructionError::InvalidConfig(
                "backoff initial_delay exceeds max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Delays between attempts.
    ///
    /// Holds at most `max_attempts - 1` entries, doubles from `initial_delay`,
    /// caps each at `max_delay`, and stops before the running sum passes
    /// `max_total_wait`.
    pub fn delays(&self) -> Vec<Duration> {
        // from_millis(2) doubles on every step; factor scales the first step
        // to initial_delay.
        let factor = (self.initial_delay.as_millis() as u64) / 2;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay);

        let mut total = Duration::ZERO;
        let mut delays = Vec::new();
        for delay in strategy.take(self.max_attempts.saturating_sub(1)) {
            if total + delay > self.max_total_wait {
                break;
            }
            total += delay;
            delays.push(delay);
        }
        delays
    }

    /// Runs `operation`, retrying retriable errors along `delays()`.
    ///
    /// Non-retriable errors return immediately. When retries run out the last
    /// error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let attempts = Arc::new(AtomicU32::new(0));
        let result = RetryIf::start(
            self.delays(),
            {
                let attempts = Arc::clone(&attempts);
                move || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    operation()
                }
            },
            |e: &SourceError| {
                let retry = e.is_retriable();
                if retry {
                    log::debug!("Retrying after retriable error: {e}");
                }
                retry
            },
        )
        .await;

        RetryOutcome {
            result,
            attempts: attempts.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double() {
        let policy = BackoffPolicy::default();
        let delays = policy.delays();
        assert_eq!(
            delays,
            vec![Duration::from_millis(500), Duration::from_millis(1000)]
        );
    }

    #[test]
    fn test_delays_respect_max_attempts() {
        let policy = BackoffPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        assert!(policy.delays().is_empty());
    }

    #[test]
    fn test_delays_capped_by_max_delay() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(600),
            max_attempts: 5,
            max_total_wait: Duration::from_secs(60),
        };
        for delay in policy.delays() {
            assert!(delay <= Duration::from_millis(600));
        }
        assert_eq!(policy.delays().len(), 4);
    }

    #[test]
    fn test_delays_stop_at_total_wait_budget() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
            max_total_wait: Duration::from_millis(1000),
        };
        // 500 fits, 500 + 1000 does not
        assert_eq!(policy.delays(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::default().validate().is_ok());
        assert!(BackoffPolicy::immediate(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_run_retries_rate_limited_until_success() {
        let policy = BackoffPolicy::immediate(3);
        let calls = Arc::new(AtomicU32::new(0));
        let outcome = policy
            .run(|| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(SourceError::RateLimited { retry_after: None })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(outcome.result, Ok("done"));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_run_surfaces_rate_limited_after_exhaustion() {
        let policy = BackoffPolicy::immediate(3);
        let outcome: RetryOutcome<()> = policy
            .run(|| async { Err(SourceError::RateLimited { retry_after: None }) })
            .await;
        assert!(matches!(
            outcome.result,
            Err(SourceError::RateLimited { .. })
        ));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_unauthorized() {
        let policy = BackoffPolicy::immediate(3);
        let outcome: RetryOutcome<()> = policy
            .run(|| async { Err(SourceError::Unauthorized) })
            .await;
        assert_eq!(outcome.result, Err(SourceError::Unauthorized));
        assert_eq!(outcome.attempts, 1);
    }
}
