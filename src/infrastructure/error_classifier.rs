//! Failure classification for remote errors
//!
//! Maps raw failure signals (HTTP status, connection message text,
//! platform retry-after hints) onto the closed [`ErrorCategory`] set. The
//! result feeds the retry driver's default predicate and the recovery
//! coordinator's action dispatch.

use std::time::Duration;

use crate::domain::errors::{DispatchError, ErrorCategory, RecoveryAction};

/// Outcome of classifying one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retriable: bool,
    pub recovery: RecoveryAction,
    /// Platform-provided retry-after hint, when the failure carried one.
    pub retry_after: Option<Duration>,
}

impl Classification {
    fn from_category(category: ErrorCategory) -> Self {
        Self {
            category,
            retriable: category.default_retriable(),
            recovery: category.recovery_action(),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after = secs.map(Duration::from_secs);
        self
    }
}

/// Classify a dispatch error.
///
/// Local control-flow errors are mapped conservatively: an open circuit or
/// an observed cancellation must never be retried blindly, and validation
/// failures need user action, not another attempt.
pub fn classify(error: &DispatchError) -> Classification {
    match error {
        DispatchError::CircuitOpen { .. } | DispatchError::Cancelled => Classification {
            category: ErrorCategory::Unknown,
            retriable: false,
            recovery: RecoveryAction::None,
            retry_after: None,
        },
        DispatchError::RateLimited {
            retry_after_secs, ..
        } => Classification::from_category(ErrorCategory::RateLimit)
            .with_retry_after(*retry_after_secs),
        DispatchError::Validation(_)
        | DispatchError::BatchNotFound(_)
        | DispatchError::TaskNotFound(_) => Classification {
            category: ErrorCategory::Validation,
            retriable: false,
            recovery: RecoveryAction::UserAction,
            retry_after: None,
        },
        DispatchError::Database(message) => {
            // a dropped pool connection is worth another attempt
            if message.to_lowercase().contains("connection") {
                Classification::from_category(ErrorCategory::Network)
            } else {
                Classification::from_category(ErrorCategory::Unknown)
            }
        }
        DispatchError::Storage {
            status,
            message,
            retry_after_secs,
        } => classify_remote(*status, message).with_retry_after(*retry_after_secs),
    }
}

/// Classify a remote failure by status code first, message text second.
fn classify_remote(status: Option<u16>, message: &str) -> Classification {
    if let Some(code) = status {
        match code {
            401 | 403 => return Classification::from_category(ErrorCategory::Authentication),
            429 => return Classification::from_category(ErrorCategory::RateLimit),
            400 | 422 => return Classification::from_category(ErrorCategory::Validation),
            code if code >= 500 => return Classification::from_category(ErrorCategory::Server),
            _ => {}
        }
    }

    let text = message.to_lowercase();

    let network_markers = [
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "network",
        "dns",
        "broken pipe",
    ];
    if network_markers.iter().any(|m| text.contains(m)) {
        return Classification::from_category(ErrorCategory::Network);
    }

    if text.contains("unauthorized")
        || text.contains("forbidden")
        || text.contains("auth")
        || text.contains("token")
        || text.contains("permission")
    {
        return Classification::from_category(ErrorCategory::Authentication);
    }

    if text.contains("rate limit") || text.contains("too many requests") {
        return Classification::from_category(ErrorCategory::RateLimit);
    }

    if text.contains("validation") || text.contains("invalid") {
        return Classification::from_category(ErrorCategory::Validation);
    }

    if text.contains("server error") || text.contains("internal error") {
        return Classification::from_category(ErrorCategory::Server);
    }

    Classification::from_category(ErrorCategory::Unknown)
}
