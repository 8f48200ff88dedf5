//! Retry policy for transient failures

use crate::TransportError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How often and how patiently to retry a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_retries: 1,
            retry_delay: Duration::ZERO,
        }
    }

    /// Run `op`, retrying while it fails with a transient error
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", op_name, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("{} attempt {} of {} failed: {}", op_name, attempt, attempts, e);
                    sleep(self.retry_delay).await;
                    attempt += 1;
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

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let calls = AtomicU32::new(0);

        let result = fast_policy(3)
            .run("upload", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Connection("reset".into()))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast_policy(3)
            .run("upload", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Timeout)
            })
            .await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = fast_policy(5)
            .run("mkdir", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::CommandFailed { code: 1, message: "Permission denied".into() })
            })
            .await;

        assert!(matches!(result, Err(TransportError::CommandFailed { code: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_none_policy_tries_once() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = RetryPolicy::none()
            .run("stat", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Connection("refused".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
