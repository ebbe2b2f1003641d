use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

/// Bounded retry for gateway calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 250,
            call_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff. Used where a retry could double an order.
    #[must_use]
    pub const fn once(call_timeout_ms: u64) -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 0,
            call_timeout_ms,
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }
}

/// Runs `call` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is exhausted. Every attempt is bounded by `call_timeout_ms`.
///
/// # Errors
/// Returns the last error seen.
pub async fn retry_call<T, F, Fut>(policy: RetryPolicy, operation: &str, mut call: F) -> GatewayResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GatewayResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let timeout = Duration::from_millis(policy.call_timeout_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation: operation.to_string(),
                timeout_ms: policy.call_timeout_ms,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = match &err {
                    GatewayError::RateLimited { retry_after_ms } => {
                        (*retry_after_ms).max(policy.backoff_ms)
                    }
                    _ => policy.backoff_ms * u64::from(attempt),
                };
                warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    error = %err,
                    "gateway call failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_backoff_ms(1);
        let result = retry_call(policy, "get_balance", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GatewayError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_backoff_ms(1).with_max_attempts(2);
        let result: GatewayResult<()> = retry_call(policy, "get_position", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Network("down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: GatewayResult<()> = retry_call(RetryPolicy::default(), "place_order", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::Rejected {
                    reason: "min notional".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let policy = RetryPolicy::once(50);
        let result: GatewayResult<()> = retry_call(policy, "get_open_orders", || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::Timeout { timeout_ms: 50, .. })));
    }
}
