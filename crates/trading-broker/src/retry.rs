//! Bounded retries with exponential backoff.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use trading_core::error::BrokerError;
use trading_core::traits::BrokerSession;
use trading_core::types::OrderRequest;

/// How often and how patiently to retry a broker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay
    pub max_backoff_ms: u64,
    /// Growth factor between delays
    pub multiplier: f64,
    /// Deadline for a single attempt
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            attempt_timeout_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1, got {}", self.multiplier));
        }
        if self.attempt_timeout_ms == 0 {
            return Err("attempt_timeout_ms must be positive".into());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms exceeds max_backoff_ms".into());
        }
        Ok(())
    }
}

/// Why a retried call gave up.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    /// A non-transient error; retrying would not help.
    #[error("{0}")]
    Fatal(BrokerError),

    /// Every attempt failed with a transient error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BrokerError },
}

impl RetryError {
    /// Attempts made before giving up.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::Fatal(_) => None,
            RetryError::Exhausted { attempts, .. } => Some(*attempts),
        }
    }

    /// The last broker error seen.
    pub fn last_error(&self) -> &BrokerError {
        match self {
            RetryError::Fatal(err) => err,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or runs out of attempts.
///
/// Each attempt is bounded by the policy's attempt timeout; a timeout
/// counts as a transient failure. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BrokerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout(), op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(format!(
                "{} attempt {} exceeded {}ms",
                op_name, attempt, policy.attempt_timeout_ms
            ))),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(RetryError::Fatal(err));
        }
        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        let mut delay = policy.backoff(attempt);
        if let BrokerError::RateLimited { retry_after_secs } = err {
            delay = delay.max(Duration::from_secs(retry_after_secs));
        }
        warn!(
            operation = op_name,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Submit an order, retrying transient failures.
///
/// Every attempt carries the same client order id, so a broker that
/// accepted an earlier attempt returns the existing order instead of
/// creating another.
pub async fn submit_with_retry(
    session: Arc<dyn BrokerSession>,
    request: OrderRequest,
    policy: &RetryPolicy,
) -> Result<String, RetryError> {
    retry(policy, "submit_order", |_| {
        let session = Arc::clone(&session);
        let request = request.clone();
        async move { session.submit_order(&request).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
            attempt_timeout_ms: 50,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(fast_policy(0).validate().is_err());
        let policy = RetryPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry(&fast_policy(3), "op", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(BrokerError::NetworkError("reset".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let result: Result<(), _> = retry(&fast_policy(2), "op", |_| async {
            Err(BrokerError::Connection("refused".into()))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert!(matches!(err.last_error(), BrokerError::Connection(_)));
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&fast_policy(5), "op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::OrderRejected("no".into())) }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Fatal(BrokerError::OrderRejected("no".into())))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_transient() {
        let result: Result<(), _> = retry(&fast_policy(2), "slow", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert!(matches!(err.last_error(), BrokerError::Timeout(_)));
    }
}
