//! Error recovery coordination
//!
//! Owns one circuit breaker per protected operation and turns classified
//! failures into recovery decisions. The authentication path drives the
//! credential collaborator: a successful token refresh keeps the failure
//! retriable, a failed refresh demotes it to user action.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::errors::{DispatchError, ErrorCategory, RecoveryAction};
use crate::domain::events::ClassifiedError;
use crate::domain::repositories::{TelemetrySink, TokenProvider, TracingTelemetry};
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::infrastructure::error_classifier::classify;

/// Outcome of running recovery for one failure.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub category: ErrorCategory,
    pub action: RecoveryAction,
    /// Whether the failed work may be attempted again.
    pub retriable: bool,
    pub message: String,
}

/// Breaker registry plus category-dispatched recovery strategies.
pub struct ErrorRecovery {
    breaker_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    telemetry: Arc<dyn TelemetrySink>,
    tokens: Option<Arc<dyn TokenProvider>>,
}

impl ErrorRecovery {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self::with_telemetry(breaker_config, Arc::new(TracingTelemetry))
    }

    pub fn with_telemetry(
        breaker_config: CircuitBreakerConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            breaker_config,
            breakers: RwLock::new(HashMap::new()),
            telemetry,
            tokens: None,
        }
    }

    pub fn with_token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Get or create the breaker protecting one operation. Breakers live
    /// for the process lifetime.
    pub async fn breaker_for(&self, operation: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(existing) = breakers.get(operation) {
                return Arc::clone(existing);
            }
        }

        let mut breakers = self.breakers.write().await;
        Arc::clone(breakers.entry(operation.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_telemetry(
                operation,
                self.breaker_config.clone(),
                Arc::clone(&self.telemetry),
            ))
        }))
    }

    /// Classify a failure, report it to telemetry, and decide whether the
    /// work is still retriable.
    pub async fn recover(
        &self,
        error: &DispatchError,
        owner_id: &str,
        platform: &str,
    ) -> RecoveryReport {
        let classification = classify(error);

        self.telemetry.classified_error(&ClassifiedError {
            category: classification.category,
            retriable: classification.retriable,
            recovery: classification.recovery,
            message: error.to_string(),
            timestamp: Utc::now(),
        });

        match classification.recovery {
            RecoveryAction::TokenRefresh => self.try_token_refresh(error, owner_id, platform).await,
            RecoveryAction::Retry => RecoveryReport {
                category: classification.category,
                action: RecoveryAction::Retry,
                retriable: classification.retriable,
                message: format!("{} error, will retry with backoff", classification.category),
            },
            RecoveryAction::UserAction => RecoveryReport {
                category: classification.category,
                action: RecoveryAction::UserAction,
                retriable: false,
                message: format!("{} error, user action required", classification.category),
            },
            RecoveryAction::None => RecoveryReport {
                category: classification.category,
                action: RecoveryAction::None,
                retriable: false,
                message: "cannot recover automatically".to_string(),
            },
        }
    }

    async fn try_token_refresh(
        &self,
        error: &DispatchError,
        owner_id: &str,
        platform: &str,
    ) -> RecoveryReport {
        let Some(tokens) = &self.tokens else {
            return RecoveryReport {
                category: ErrorCategory::Authentication,
                action: RecoveryAction::UserAction,
                retriable: false,
                message: "authentication error and no token provider configured".to_string(),
            };
        };

        match tokens.refresh_token(owner_id, platform).await {
            Ok(()) => {
                info!(owner_id, platform, "token refreshed after auth failure");
                RecoveryReport {
                    category: ErrorCategory::Authentication,
                    action: RecoveryAction::TokenRefresh,
                    retriable: true,
                    message: "token refreshed, operation can be retried".to_string(),
                }
            }
            Err(refresh_err) => {
                warn!(
                    owner_id,
                    platform,
                    "token refresh failed after auth failure: {refresh_err} (original: {error})"
                );
                RecoveryReport {
                    category: ErrorCategory::Authentication,
                    action: RecoveryAction::UserAction,
                    retriable: false,
                    message: format!("token refresh failed: {refresh_err}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::domain::errors::DispatchResult;

    struct FlakyTokens {
        succeed: bool,
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenProvider for FlakyTokens {
        async fn refresh_token(&self, _owner_id: &str, _platform: &str) -> DispatchResult<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(())
            } else {
                Err(DispatchError::storage("refresh endpoint down"))
            }
        }

        async fn verify_token(&self, _owner_id: &str, _platform: &str) -> DispatchResult<bool> {
            Ok(self.succeed)
        }
    }

    fn auth_error() -> DispatchError {
        DispatchError::Storage {
            status: Some(401),
            message: "unauthorized".to_string(),
            retry_after_secs: None,
        }
    }

    #[tokio::test]
    async fn breakers_are_cached_per_operation() {
        let recovery = ErrorRecovery::new(CircuitBreakerConfig::default());
        let a = recovery.breaker_for("tiktok:media/upload").await;
        let b = recovery.breaker_for("tiktok:media/upload").await;
        let c = recovery.breaker_for("twitter:media/upload").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn successful_refresh_keeps_auth_failure_retriable() {
        let tokens = Arc::new(FlakyTokens {
            succeed: true,
            refreshes: AtomicU32::new(0),
        });
        let recovery = ErrorRecovery::new(CircuitBreakerConfig::default())
            .with_token_provider(tokens.clone());

        let report = recovery.recover(&auth_error(), "owner-1", "tiktok").await;
        assert!(report.retriable);
        assert_eq!(report.action, RecoveryAction::TokenRefresh);
        assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_demotes_to_user_action() {
        let tokens = Arc::new(FlakyTokens {
            succeed: false,
            refreshes: AtomicU32::new(0),
        });
        let recovery = ErrorRecovery::new(CircuitBreakerConfig::default())
            .with_token_provider(tokens);

        let report = recovery.recover(&auth_error(), "owner-1", "tiktok").await;
        assert!(!report.retriable);
        assert_eq!(report.action, RecoveryAction::UserAction);
    }

    #[tokio::test]
    async fn auth_failure_without_provider_is_not_retriable() {
        let recovery = ErrorRecovery::new(CircuitBreakerConfig::default());
        let report = recovery.recover(&auth_error(), "owner-1", "tiktok").await;
        assert!(!report.retriable);
    }

    #[tokio::test]
    async fn server_errors_stay_retriable() {
        let recovery = ErrorRecovery::new(CircuitBreakerConfig::default());
        let err = DispatchError::Storage {
            status: Some(503),
            message: "unavailable".to_string(),
            retry_after_secs: None,
        };
        let report = recovery.recover(&err, "owner-1", "tiktok").await;
        assert!(report.retriable);
        assert_eq!(report.category, ErrorCategory::Server);
    }
}
