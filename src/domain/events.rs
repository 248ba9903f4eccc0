//! Event types emitted during dispatch
//!
//! Task and batch lifecycle events are published on a broadcast channel by
//! the queue processor; circuit transitions and classified errors are
//! additionally pushed to the telemetry sink collaborator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::BatchStatus;
use crate::domain::errors::{ErrorCategory, RecoveryAction};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Observer payload for a circuit breaker state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTransition {
    /// Name of the protected operation, e.g. `tiktok:media/upload`.
    pub operation: String,
    pub previous: CircuitState,
    pub next: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A classified operational failure, for telemetry and audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub retriable: bool,
    pub recovery: RecoveryAction,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle events published by the queue processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    TaskStarted {
        task_id: String,
        batch_id: String,
        timestamp: DateTime<Utc>,
    },
    TaskProgress {
        task_id: String,
        batch_id: String,
        progress: u8,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: String,
        batch_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A task attempt failed. `permanent` is true once retries are spent.
    TaskFailed {
        task_id: String,
        batch_id: String,
        error: String,
        permanent: bool,
        timestamp: DateTime<Utc>,
    },
    /// A task was pushed back to the queue tail without counting a retry.
    TaskDeferred {
        task_id: String,
        batch_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    TaskCancelled {
        task_id: String,
        batch_id: String,
        timestamp: DateTime<Utc>,
    },
    BatchFinished {
        batch_id: String,
        status: BatchStatus,
        timestamp: DateTime<Utc>,
    },
    CircuitTransition(CircuitTransition),
}
