//! Retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::config::SyncConfig;
use crate::errors::VaultResult;
use crate::metrics::record_counter;

/// Delay doubles after each failed attempt, up to `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_max, config.max_attempts)
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. The last error is returned.
    pub async fn retry<F, Fut, T>(&self, what: &str, mut op: F) -> VaultResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = VaultResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    record_counter("sync.retries", 1);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VaultError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(4), 4)
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let b = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350), 5);
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(350));
        assert_eq!(b.delay(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = backoff()
            .retry("test", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(VaultError::Transport("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: VaultResult<()> = backoff()
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VaultError::SyncTimeout(Duration::from_millis(1)))
            })
            .await;
        assert!(matches!(result, Err(VaultError::SyncTimeout(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_integrity_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: VaultResult<()> = backoff()
            .retry("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VaultError::Integrity("tag".into()))
            })
            .await;
        assert!(matches!(result, Err(VaultError::Integrity(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
