//! Bounded retry with exponential backoff

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::Retryable;

/// Retry schedule shared by the broker and the snapshot fetcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 500, multiplier: 2.0, max_delay_ms: 10_000 }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts && e.is_retryable() => {
                    let delay = self.delay_for(attempt);
                    warn!(operation, attempt, ?delay, "Attempt failed: {}, retrying", e);
                    sleep(delay).await;
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
    use crate::error::TerminalError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_grows_and_is_capped() {
        let policy = RetryPolicy { max_attempts: 6, base_delay_ms: 100, multiplier: 2.0, max_delay_ms: 500 };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::default();

        let result: Result<u32, TerminalError> = policy
            .run("probe", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(TerminalError::Unreachable("refused".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy { max_attempts: 4, ..RetryPolicy::default() };

        let result: Result<(), TerminalError> = policy
            .run("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TerminalError::Unreachable("refused".into()))
            })
            .await;

        assert!(matches!(result, Err(TerminalError::Unreachable(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::default();

        let result: Result<(), TerminalError> = policy
            .run("login", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TerminalError::AuthFailed { account: 7, reason: "invalid password".into() })
            })
            .await;

        assert!(matches!(result, Err(TerminalError::AuthFailed { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
