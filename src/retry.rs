//! Retry with exponential backoff
//!
//! Policies are plain values; `with_retry` wraps an async operation and
//! replays it on retryable failures with doubling delays.

use crate::error::ExchangeError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Whether timeouts count as retryable. Must stay false for order
    /// placement: a blind replay of a timed-out order can double-fill.
    pub retry_timeouts: bool,
}

impl RetryPolicy {
    /// Policy for read-only calls (tickers, balances, order status)
    pub fn api() -> Self {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_retries: 4,
            retry_timeouts: true,
        }
    }

    /// Policy for order placement; timeouts propagate to the status-poll branch
    pub fn order() -> Self {
        RetryPolicy {
            retry_timeouts: false,
            ..Self::api()
        }
    }

    pub fn should_retry(&self, err: &ExchangeError) -> bool {
        err.is_retryable() || (self.retry_timeouts && err.is_timeout())
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Run `op`, retrying per `policy`. The final error is returned unchanged.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt > policy.max_retries || !policy.should_retry(&e) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    "retryable failure (attempt {}/{}), retrying in {:.0?}: {}",
                    attempt, policy.max_retries, delay, e
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::api();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        // capped
        assert_eq!(policy.delay_for(7), Duration::from_secs(60));
    }

    #[test]
    fn test_timeout_retryability_per_policy() {
        let timeout = ExchangeError::Timeout { order_id: None };
        assert!(RetryPolicy::api().should_retry(&timeout));
        assert!(!RetryPolicy::order().should_retry(&timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::api(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Network("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::api(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Rejected("bad params".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::api(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Network("down".into())) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Network(_))));
        // initial attempt + 4 retries
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
