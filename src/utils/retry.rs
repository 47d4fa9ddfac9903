//! Retry utilities for teardown operations
//!
//! Unmounting a template right after a bulk copy regularly fails with
//! "target is busy" while the kernel releases file handles. The helper here
//! retries such operations with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Error;

/// Backoff policy for [`with_retry_if`]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,

    /// Delay before the first retry; doubled for each following retry
    pub base_delay_ms: u64,

    /// Upper bound for a single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-based)
    fn delay_before(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(32);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects its error, or
/// the retries are used up. The last error is returned.
pub async fn with_retry_if<T, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let mut retry = 0;

    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !should_retry(&error) || retry >= config.max_retries {
            warn!(attempts = retry + 1, error = %error, "Giving up");
            return Err(error);
        }

        retry += 1;
        let delay = config.delay_before(retry);
        debug!(retry, delay_ms = delay.as_millis() as u64, error = %error, "Retrying");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> Error {
        Error::Unmount {
            target: PathBuf::from("/mnt/raspbian-1"),
            reason: "target is busy".to_string(),
        }
    }

    #[tokio::test]
    async fn test_busy_unmount_succeeds_on_third_attempt() {
        let config = RetryConfig::with_delays(3, 1, 5);
        let attempts = AtomicU32::new(0);

        let result = with_retry_if(
            &config,
            || {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        return Err(busy());
                    }
                    Ok("unmounted")
                }
            },
            Error::is_recoverable,
        )
        .await;

        assert_eq!(result.unwrap(), "unmounted");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let config = RetryConfig::with_delays(2, 1, 5);
        let attempts = AtomicU32::new(0);

        let result: Result<(), Error> = with_retry_if(
            &config,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(busy()) }
            },
            Error::is_recoverable,
        )
        .await;

        assert!(matches!(result, Err(Error::Unmount { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_is_not_retried() {
        let config = RetryConfig::with_delays(3, 1, 5);
        let attempts = AtomicU32::new(0);

        let result: Result<(), Error> = with_retry_if(
            &config,
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidSize(0)) }
            },
            Error::is_recoverable,
        )
        .await;

        assert!(matches!(result, Err(Error::InvalidSize(0))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_before(1), Duration::from_millis(500));
        assert_eq!(config.delay_before(2), Duration::from_millis(1000));
        assert_eq!(config.delay_before(3), Duration::from_millis(2000));

        let capped = RetryConfig::with_delays(10, 1000, 5000);
        assert_eq!(capped.delay_before(10), Duration::from_millis(5000));
    }
}
