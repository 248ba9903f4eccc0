//! Error taxonomy for the dispatch engine
//!
//! All operational failures inside the engine travel as [`DispatchError`].
//! Remote failures carry enough raw signal (HTTP status, message text,
//! retry-after hints) for the classifier to map them onto a closed
//! category set with recovery hints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Unified error type for all dispatch operations.
///
/// Local control-flow signals (`CircuitOpen`, `RateLimited`, `Cancelled`)
/// and remote failures (`Storage`) share this type so the retry driver and
/// the recovery coordinator can make decisions over a single enum.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The protecting circuit breaker is open; the wrapped call was never made.
    #[error("circuit breaker is open until {next_attempt_at}")]
    CircuitOpen {
        next_attempt_at: DateTime<Utc>,
        last_error: Option<String>,
    },

    /// A rate limit window is exhausted. Deferral signal, not a task failure.
    #[error("rate limit exhausted for {key}")]
    RateLimited {
        key: String,
        retry_after_secs: Option<u64>,
    },

    /// Programmer-input error (bad batch size, malformed window spec, ...).
    #[error("{0}")]
    Validation(String),

    #[error("batch not found: {0}")]
    BatchNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Cooperative cancellation was observed.
    #[error("operation cancelled")]
    Cancelled,

    /// Failure reported by the storage provider or the transport under it.
    #[error("storage error: {message}")]
    Storage {
        status: Option<u16>,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// Failure in the persistence collaborator.
    #[error("database error: {0}")]
    Database(String),
}

impl DispatchError {
    /// Shorthand for a storage failure with no HTTP status attached.
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

impl From<sqlx::Error> for DispatchError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Storage {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            retry_after_secs: None,
        }
    }
}

/// Closed set of failure categories for remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    Validation,
    Server,
    Unknown,
}

impl ErrorCategory {
    /// Whether failures in this category are retriable by default.
    pub fn default_retriable(self) -> bool {
        match self {
            ErrorCategory::Network => true,
            ErrorCategory::Authentication => false,
            ErrorCategory::RateLimit => true,
            ErrorCategory::Validation => false,
            ErrorCategory::Server => true,
            ErrorCategory::Unknown => false,
        }
    }

    /// Suggested recovery action for this category.
    pub fn recovery_action(self) -> RecoveryAction {
        match self {
            ErrorCategory::Network => RecoveryAction::Retry,
            ErrorCategory::Authentication => RecoveryAction::TokenRefresh,
            ErrorCategory::RateLimit => RecoveryAction::Retry,
            ErrorCategory::Validation => RecoveryAction::UserAction,
            ErrorCategory::Server => RecoveryAction::Retry,
            ErrorCategory::Unknown => RecoveryAction::None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Server => "server",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    TokenRefresh,
    UserAction,
    None,
}
