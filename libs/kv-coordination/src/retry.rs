//! Exponential backoff for transient coordination failures.

use std::{future::Future, time::Duration};

use tracing::warn;

use crate::error::CoordinationResult;

/// Default maximum retry attempts for transient failures.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry policy configuration for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff).
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl From<&config::WatchConfig> for RetryPolicy {
    fn from(cfg: &config::WatchConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: cfg.base_delay,
            max_delay: cfg.max_delay,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are exhausted. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> CoordinationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CoordinationResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max_retries = self.max_retries,
                        retry_in_ms = delay.as_millis(),
                        error = %err,
                        "transient coordination failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tracing_test::traced_test;

    use super::*;
    use crate::error::CoordinationError;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_delay_backoff_is_capped() {
        let policy = fast();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for(10), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let out = fast()
            .retry("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CoordinationError::Transport("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_retry_exhausted() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoordinationError::Timeout("slow".into()))
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // first try plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(logs_contain("transient coordination failure, retrying"));
    }

    #[tokio::test]
    async fn test_no_retry_on_config_error() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .retry("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoordinationError::Config("bad".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
