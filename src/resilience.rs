//! Retry with exponential backoff and an abandonable timeout envelope.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// How often and how patiently an operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Runs `attempt` until it succeeds or the policy is exhausted. The delay
/// between attempts starts at `initial_delay` and doubles each time; the last
/// error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut delay = policy.initial_delay;
    let mut number = 1;

    loop {
        match attempt().await {
            Ok(value) => {
                if number > 1 {
                    debug!(operation, attempt = number, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if number >= attempts => return Err(error),
            Err(error) => {
                warn!(
                    operation,
                    attempt = number,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                number += 1;
            }
        }
    }
}

/// Runs `future` on the runtime and gives up waiting after `limit`.
///
/// An abandoned operation keeps running in the background until it finishes
/// on its own; only the caller stops waiting for it.
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::spawn(future);
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(StoreError::Task(format!("{operation}: {join_error}"))),
        Err(_) => {
            warn!(operation, limit_ms = limit.as_millis() as u64, "operation timed out");
            Err(StoreError::Timeout {
                operation: operation.to_string(),
                limit,
            })
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorKind;

    fn failing(calls: &Arc<AtomicU32>, succeed_on: u32) -> impl Future<Output = Result<u32>> {
        let calls = Arc::clone(calls);
        async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= succeed_on {
                Ok(call)
            } else {
                Err(StoreError::Validation(format!("call {call}")))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_millis(100));

        let started = tokio::time::Instant::now();
        let value = with_retry(&policy, "flaky", || failing(&calls, 3)).await.unwrap();

        assert_eq!(value, 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn last_error_propagates() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let err = with_retry(&policy, "broken", || failing(&calls, 10)).await.unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.to_string(), "validation failed: call 2");
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(0, Duration::ZERO);

        assert!(with_retry(&policy, "once", || failing(&calls, 5)).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_distinct_from_operation_errors() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_timeout("slow", Duration::from_secs(1), slow).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let fast = async { Err::<(), _>(StoreError::NotFound("row 4".into())) };
        let err = with_timeout("fast", Duration::from_secs(1), fast).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn panicking_operation_is_a_task_failure() {
        let err = with_timeout("panics", Duration::from_secs(5), async {
            if true {
                panic!("boom");
            }
            Ok::<(), StoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Task(_)));
    }
}
