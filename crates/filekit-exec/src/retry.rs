//! Exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use filekit_core::{FsError, RetryConfig};
use tracing::warn;

/// Retries an operation while its error is transient.
///
/// Attempt `n` (0-based) that fails is followed by a delay of
/// `min(base_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the failed attempt with 0-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Blocking variant of [`RetryPolicy::run`] for code already on a blocking thread.
    pub fn run_blocking<F, T>(&self, label: &str, mut op: F) -> Result<T, FsError>
    where
        F: FnMut() -> Result<T, FsError>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && e.is_transient() => {
                    std::thread::sleep(self.backoff(label, attempt, &e));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff(&self, label: &str, attempt: u32, error: &dyn std::fmt::Display) -> Duration {
        let delay = self.delay_for(attempt);
        warn!(
            operation = label,
            attempt = attempt + 1,
            max_attempts = self.attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Transient failure, retrying"
        );
        delay
    }

    /// Run `op`, retrying errors for which [`FsError::is_transient`] holds.
    pub async fn run<F, Fut, T>(&self, label: &str, op: F) -> Result<T, FsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FsError>>,
    {
        self.run_if(label, op, FsError::is_transient).await
    }

    /// Run `op`, retrying errors accepted by `should_retry`.
    pub async fn run_if<F, Fut, T, E, P>(
        &self,
        label: &str,
        mut op: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && should_retry(&e) => {
                    let delay = self.backoff(label, attempt, &e);
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
    use super::*;
    use std::io::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    use filekit_core::OperationKind;

    fn busy() -> FsError {
        FsError::io(
            "/locked",
            OperationKind::Move,
            std::io::Error::new(ErrorKind::ResourceBusy, "busy"),
        )
    }

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1600));
        assert_eq!(policy.delay_for(5), Duration::from_millis(3000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = fast(3)
            .run("move", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast(2)
            .run("move", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(busy())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_retry_stops_on_success() {
        let mut calls = 0;
        let result = fast(4).run_blocking("copy", || {
            calls += 1;
            if calls < 3 { Err(busy()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: Result<(), _> = fast(1).run_blocking("copy", || {
            calls += 1;
            Err(busy())
        });
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = fast(5)
            .run("delete", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FsError::NotFound {
                    path: "/gone".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(FsError::NotFound { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
