//! Single-retry policy for transient gateway failures.
//!
//! Conditional-order management tolerates individual call failures, so
//! the policy here is deliberately shallow: one retry after a short
//! jittered backoff, and only for errors worth retrying. Anything else
//! surfaces immediately and the cycle moves on.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::GatewayError;

/// Retry configuration for gateway calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the single retry.
    pub backoff: Duration,
    /// Jitter factor applied to the delay (0.2 = ±20%).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(250),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay with jitter applied.
    fn jittered_backoff(&self) -> Duration {
        let base_ms = self.backoff.as_millis() as f64;
        let jitter = base_ms * self.jitter_factor;
        let min = (base_ms - jitter).max(0.0);
        let max = base_ms + jitter;

        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(min..=max) as u64)
    }
}

/// Run a gateway call, retrying once on a transient failure.
///
/// # Errors
///
/// Returns the last error when both attempts fail, or the first error
/// when it is not transient.
pub async fn with_retry<T, F, Fut>(
    op: &'static str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, GatewayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            let delay = policy.jittered_backoff();
            warn!(
                operation = op,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Transient gateway error, retrying once"
            );
            tokio::time::sleep(delay).await;
            call().await
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_does_not_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retry("op", &RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, GatewayError>(7) }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retried_exactly_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            jitter_factor: 0.0,
        };

        let result: Result<u32, _> = with_retry("op", &policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::Timeout(1)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, _> = with_retry("op", &RetryPolicy::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::OrderRejected("bad size".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_attempt_can_succeed() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            backoff: Duration::from_millis(1),
            jitter_factor: 0.0,
        };

        let result = with_retry("op", &policy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(GatewayError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
