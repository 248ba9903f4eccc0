//! Retry driver with exponential backoff and jitter
//!
//! Wraps an operation with up to `max_retries` additional attempts. The
//! default retry predicate consults the error classifier; a platform
//! retry-after hint overrides the computed backoff. Backoff sleeps race a
//! cancellation token so a cancelled batch never sits out a long delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::infrastructure::error_classifier::classify;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Additional attempts after the first failure.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter band applied multiplicatively to the exponential delay.
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }
}

type RetryPredicate = Arc<dyn Fn(&DispatchError, u32) -> bool + Send + Sync>;

/// Drives retries for one kind of operation.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    should_retry: Option<RetryPredicate>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
        }
    }

    /// Replace the default classifier-driven predicate.
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&DispatchError, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether a failed attempt should be retried.
    pub fn should_retry(&self, error: &DispatchError, attempt: u32) -> bool {
        if let Some(predicate) = &self.should_retry {
            return predicate(error, attempt);
        }
        classify(error).retriable
    }

    /// Backoff for the given zero-based attempt index:
    /// `min(max_delay, initial_delay * 2^attempt * jitter)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.config.initial_delay_ms as f64 * 2f64.powi(attempt as i32);
        let band = (self.config.jitter_max - self.config.jitter_min).max(0.0);
        let jitter = self.config.jitter_min + fastrand::f64() * band;
        let capped = (exponential * jitter).min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Execute with retries. The closure receives the zero-based attempt
    /// index. The final error is propagated unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> DispatchResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        self.execute_with_cancellation(operation, &CancellationToken::new())
            .await
    }

    /// Execute with retries, observing a cancellation token between
    /// attempts and during backoff sleeps.
    pub async fn execute_with_cancellation<T, F, Fut>(
        &self,
        operation: F,
        cancel: &CancellationToken,
    ) -> DispatchResult<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = DispatchResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.config.max_retries || !self.should_retry(&error, attempt) {
                        return Err(error);
                    }

                    let delay = classify(&error)
                        .retry_after
                        .unwrap_or_else(|| self.backoff_delay(attempt));
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure: {error}"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 10,
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let policy = RetryPolicy::new(quick_config(3));
        let calls = AtomicU32::new(0);
        let result = policy
            .execute(|_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, DispatchError>(7)
            })
            .await
            .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let policy = RetryPolicy::new(quick_config(3));
        let calls = AtomicU32::new(0);
        let result = policy
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(DispatchError::Storage {
                            status: Some(503),
                            message: "unavailable".to_string(),
                            retry_after_secs: None,
                        })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_propagate_the_final_error() {
        let policy = RetryPolicy::new(quick_config(2));
        let calls = AtomicU32::new(0);
        let err = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(DispatchError::Storage {
                        status: Some(500),
                        message: "boom".to_string(),
                        retry_after_secs: None,
                    })
                }
            })
            .await
            .unwrap_err();
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, DispatchError::Storage { status: Some(500), .. }));
    }

    #[tokio::test]
    async fn non_retriable_errors_fail_fast() {
        let policy = RetryPolicy::new(quick_config(5));
        let calls = AtomicU32::new(0);
        let err = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(DispatchError::Storage {
                        status: Some(422),
                        message: "invalid media".to_string(),
                        retry_after_secs: None,
                    })
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, DispatchError::Storage { status: Some(422), .. }));
    }

    #[tokio::test]
    async fn custom_predicate_overrides_classifier() {
        let policy = RetryPolicy::new(quick_config(5)).with_predicate(|_, attempt| attempt < 1);
        let calls = AtomicU32::new(0);
        let _ = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(DispatchError::Storage {
                        status: Some(500),
                        message: "boom".to_string(),
                        retry_after_secs: None,
                    })
                }
            })
            .await;
        // predicate stops after the first retry
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff_sleep() {
        let config = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 60_000,
            max_delay_ms: 120_000,
            jitter_min: 1.0,
            jitter_max: 1.0,
        };
        let policy = RetryPolicy::new(config);
        let token = CancellationToken::new();
        let cancel = token.clone();

        let handle = tokio::spawn(async move {
            policy
                .execute_with_cancellation(
                    |_| async {
                        Err::<(), _>(DispatchError::Storage {
                            status: Some(500),
                            message: "boom".to_string(),
                            retry_after_secs: None,
                        })
                    },
                    &cancel,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_the_cap(attempt in 0u32..20, max_delay in 1u64..60_000) {
            let policy = RetryPolicy::new(RetryConfig {
                max_retries: 3,
                initial_delay_ms: 100,
                max_delay_ms: max_delay,
                jitter_min: 0.8,
                jitter_max: 1.2,
            });
            let delay = policy.backoff_delay(attempt);
            prop_assert!(delay <= Duration::from_millis(max_delay));
        }

        #[test]
        fn backoff_stays_inside_the_jitter_band(attempt in 0u32..6) {
            let policy = RetryPolicy::new(RetryConfig {
                max_retries: 3,
                initial_delay_ms: 100,
                max_delay_ms: u64::MAX / 4,
                jitter_min: 0.8,
                jitter_max: 1.2,
            });
            let delay = policy.backoff_delay(attempt).as_millis() as f64;
            let base = 100.0 * 2f64.powi(attempt as i32);
            prop_assert!(delay >= (base * 0.8) - 1.0);
            prop_assert!(delay <= (base * 1.2) + 1.0);
        }
    }
}
