//! Shared retry/backoff policy.
//!
//! Used by the orchestrator around each scrape and by the health monitor's
//! recovery strategies.

use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::RetryConfig;

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    retries: u32,
    backoff_factor: Duration,
    max_backoff: Duration,
    retry_on: fn(&AppError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_factor: Duration, max_backoff: Duration) -> Self {
        Self {
            retries: retries.max(1),
            backoff_factor,
            max_backoff,
            retry_on: AppError::is_transient,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.retries,
            Duration::from_millis(config.backoff_factor_ms),
            Duration::from_secs(config.max_backoff_secs),
        )
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the retryable-error predicate (default: [`AppError::is_transient`]).
    pub fn retry_on(mut self, predicate: fn(&AppError) -> bool) -> Self {
        self.retry_on = predicate;
        self
    }

    /// Delay before retry number `attempt` (0-based): `factor * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.backoff_factor
            .saturating_mul(multiplier)
            .min(self.max_backoff)
    }

    /// `min(2^failures, cap)` seconds.
    pub fn exponential_delay(failures: u32, cap: Duration) -> Duration {
        Duration::from_secs(2u64.saturating_pow(failures)).min(cap)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.retries && (self.retry_on)(&e) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{label}: attempt {}/{} failed ({e}); retrying in {:?}",
                        attempt + 1,
                        self.retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_delay_for_is_capped() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_delay() {
        let cap = Duration::from_secs(300);
        assert_eq!(RetryPolicy::exponential_delay(0, cap), Duration::from_secs(1));
        assert_eq!(RetryPolicy::exponential_delay(3, cap), Duration::from_secs(8));
        assert_eq!(RetryPolicy::exponential_delay(9, cap), cap);
        assert_eq!(RetryPolicy::exponential_delay(200, cap), cap);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = &AtomicU32::new(0);
        let result = fast(3)
            .run("test", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::network("https://x.test", "reset"))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast(2)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::network("https://x.test", "reset"))
            })
            .await;
        assert!(result.unwrap_err().is_network());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast(5)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::HttpStatus {
                    url: "https://x.test".into(),
                    status: 404,
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = fast(3)
            .retry_on(|_| true)
            .run("test", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::validation("always"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
