//! Core entities for batch upload dispatch
//!
//! A [`Batch`] groups up to [`MAX_BATCH_FILES`] upload tasks submitted
//! together; each [`UploadTask`] tracks one file's lifecycle through the
//! queue. Both are persisted through the `BatchRepository` collaborator,
//! with status enums stored as their string form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Hard cap on files per submitted batch.
pub const MAX_BATCH_FILES: usize = 90;

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    Processing,
    Completed,
    CompletedWithErrors,
    Cancelled,
}

impl BatchStatus {
    /// Terminal batches are immutable; the tracker never rewrites them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::CompletedWithErrors | BatchStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::CompletedWithErrors => "completed_with_errors",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(BatchStatus::Queued),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "completed_with_errors" => Ok(BatchStatus::CompletedWithErrors),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(format!("invalid batch status: {other}")),
        }
    }
}

/// Lifecycle status of a single upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "uploading" => Ok(TaskStatus::Uploading),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// A batch of upload tasks submitted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub owner_id: String,
    pub total_files: u32,
    pub completed_files: u32,
    pub failed_files: u32,
    /// Aggregate progress, 0-100.
    pub progress: u8,
    pub status: BatchStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Persisted record of one file's upload lifecycle within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub batch_id: String,
    pub owner_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    /// Target platform, used for rate-limit and breaker keying.
    pub platform: String,
    pub status: TaskStatus,
    /// Chunk progress, 0-100. Monotonic within one Uploading span.
    pub progress: u8,
    pub retry_count: u32,
    pub queue_position: u32,
    pub last_error: Option<String>,
    /// Storage provider result stored after finalization.
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// In-memory handle to the media being uploaded.
///
/// File bytes stay out of the persisted task record; only this queue-side
/// handle carries them.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub mime_type: String,
    pub platform: String,
    pub data: Vec<u8>,
}

impl UploadFile {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        platform: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            mime_type: mime_type.into(),
            platform: platform.into(),
            data,
        }
    }

    /// Read a file from disk into an upload handle.
    pub async fn from_path(
        path: impl AsRef<Path>,
        mime_type: impl Into<String>,
        platform: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());

        Ok(Self {
            filename,
            mime_type: mime_type.into(),
            platform: platform.into(),
            data,
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_round_trips_through_strings() {
        for status in [
            BatchStatus::Queued,
            BatchStatus::Processing,
            BatchStatus::Completed,
            BatchStatus::CompletedWithErrors,
            BatchStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!BatchStatus::Queued.is_terminal());
        assert!(!BatchStatus::Processing.is_terminal());
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::CompletedWithErrors.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
    }
}
