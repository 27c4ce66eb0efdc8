use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{DubError, Result};

/// Bounded attempt budget for one external call.
///
/// An operation gets `max_retries + 1` attempts. Each attempt may be cut off by
/// `attempt_timeout`; a timeout counts as a retryable failure. Errors that
/// [`DubError::is_retryable`] rejects end the loop immediately.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            attempt_timeout: Some(config.attempt_timeout()),
        }
    }

    /// No retries, no timeout
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            attempt_timeout: None,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_backoff.mul_f64(factor)
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, operation(attempt))
                    .await
                    .unwrap_or(Err(DubError::Timeout(limit))),
                None => operation(attempt).await,
            };

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded after {} retries", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {} - retrying in {:?}",
                        label,
                        attempt,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::ZERO,
            backoff_multiplier: 2.0,
            attempt_timeout: None,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(500),
            ..quick(3)
        };
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = quick(2)
            .run("flaky", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DubError::transcription("rate limited", true))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = quick(5)
            .run("auth", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DubError::transcription("invalid api key", false))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_is_exhausted() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = quick(2)
            .run("down", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DubError::synthesis("backend unavailable", true))
            })
            .await;
        assert!(matches!(result, Err(DubError::Synthesis { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(10)),
            ..quick(1)
        };
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = policy
            .run("slow", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DubError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
