//! Retry with exponential backoff
//!
//! Writer batches and embedding dispatches retry transient failures up to
//! a fixed budget; exhausting the budget is a typed fatal error carrying
//! the stage context.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{PipelineError, Result};

/// Retry policy: `attempts` total tries with doubling delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (0-based) retry.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.min(16);
        (self.base_delay * factor as u32).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, the error is non-transient, or the budget
/// runs out. `is_transient` classifies the error; non-transient errors
/// surface immediately.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: RetryPolicy,
    pipeline: &str,
    stage: &str,
    is_transient: P,
    mut op: F,
) -> Result<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    PipelineError: From<E>,
{
    let mut last_message = String::new();
    for attempt in 0..policy.attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) => {
                last_message = e.to_string();
                let delay = policy.delay_for(attempt);
                warn!(
                    "{}/{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                    pipeline,
                    stage,
                    attempt + 1,
                    policy.attempts,
                    delay,
                    last_message
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(PipelineError::from(e)),
        }
    }

    Err(PipelineError::RetriesExhausted {
        pipeline: pipeline.to_string(),
        stage: stage.to_string(),
        attempts: policy.attempts,
        message: last_message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use etymograph_store::StoreError;

    fn transient_error() -> StoreError {
        StoreError::Connection("refused".to_string())
    }

    fn fatal_error() -> StoreError {
        StoreError::CheckpointNotFound("x".to_string())
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        let result = retry_with_backoff(
            policy,
            "test",
            "writer",
            StoreError::is_transient,
            move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient_error())
                    } else {
                        Ok(42u32)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_is_typed() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let result: Result<u32> = retry_with_backoff(
            policy,
            "test",
            "writer",
            StoreError::is_transient,
            || async { Err(transient_error()) },
        )
        .await;

        match result {
            Err(PipelineError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_fatal_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32> = retry_with_backoff(
            RetryPolicy::default(),
            "test",
            "writer",
            StoreError::is_transient,
            move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async { Err(fatal_error()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on fatal errors");
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }
}
