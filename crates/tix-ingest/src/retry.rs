//! Bounded retry with exponential backoff
//!
//! Used for both upstream fetches and database commits. The policy itself is
//! stateless; every [`RetryPolicy::execute`] call keeps its own attempt count.

use crate::config::BatchConfig;
use crate::error::{IngestError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Ceiling for a single attempt; expiry counts as a transient failure
    pub attempt_timeout: Option<Duration>,
}

/// The outcome of a retried operation plus how many retries it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            attempt_timeout: None,
        }
    }

    pub fn from_config(config: &BatchConfig) -> Self {
        Self::new(config.max_retries, config.base_delay, config.max_delay)
            .with_attempt_timeout(config.batch_timeout)
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Sleep before retry number `attempt + 1`: `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of retries.
    ///
    /// `op` receives the zero-based attempt number. Transient failures past
    /// `max_retries` come back as [`IngestError::RetryExhausted`] wrapping the
    /// last error; permanent failures come back unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op(attempt)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(IngestError::Timeout(limit)),
                },
                None => op(attempt).await,
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, retries = attempt, "Succeeded after retry");
                    }
                    return Attempted {
                        result: Ok(value),
                        retries: attempt,
                    };
                },
                Err(err) => err,
            };

            if !err.is_transient() {
                return Attempted {
                    result: Err(err),
                    retries: attempt,
                };
            }

            if attempt >= self.max_retries {
                warn!(operation, attempts = attempt + 1, error = %err, "Retries exhausted");
                return Attempted {
                    result: Err(IngestError::RetryExhausted {
                        attempts: attempt + 1,
                        source: Box::new(err),
                    }),
                    retries: attempt,
                };
            }

            let delay = self.delay_for(attempt);
            warn!(
                operation,
                attempt = attempt + 1,
                max_attempts = self.max_retries + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let p = policy(10);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_secs(1));
        assert_eq!(p.delay_for(40), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let attempted = policy(3)
            .execute("fetch", |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(IngestError::transient("503"))
                    } else {
                        Ok("page")
                    }
                }
            })
            .await;

        assert_eq!(attempted.result.unwrap(), "page");
        assert_eq!(attempted.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let attempted: Attempted<()> = policy(3)
            .execute("commit", |attempt| async move {
                Err(IngestError::transient(format!("attempt {attempt}")))
            })
            .await;

        assert_eq!(attempted.retries, 3);
        match attempted.result.unwrap_err() {
            IngestError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert_eq!(source.to_string(), "Transient failure: attempt 3");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let attempted: Attempted<()> = policy(3)
            .execute("fetch", |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(IngestError::permanent("401 unauthorized")) }
            })
            .await;

        assert!(matches!(attempted.result, Err(IngestError::Permanent(_))));
        assert_eq!(attempted.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_elapsed_time() {
        let start = tokio::time::Instant::now();
        let _: Attempted<()> = policy(3)
            .execute("fetch", |_| async { Err(IngestError::transient("reset")) })
            .await;
        // 100 + 200 + 400 ms of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(700) && elapsed < Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let attempted = policy(1)
            .with_attempt_timeout(Duration::from_secs(5))
            .execute("commit", |attempt| async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(attempt)
            })
            .await;

        assert_eq!(attempted.result.unwrap(), 1);
        assert_eq!(attempted.retries, 1);
    }
}
