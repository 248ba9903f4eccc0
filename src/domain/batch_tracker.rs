//! Batch aggregate tracking
//!
//! Batch-level counters and status are always recomputed from the full
//! task set rather than incrementally mutated, so concurrent task workers
//! can never race each other into a lost update.

use std::sync::Arc;

use chrono::Utc;

use crate::domain::entities::{Batch, BatchStatus, TaskStatus};
use crate::domain::errors::DispatchResult;
use crate::domain::repositories::BatchRepository;

/// Recomputes batch aggregates after task updates.
#[derive(Clone)]
pub struct BatchTracker {
    database: Arc<dyn BatchRepository>,
    max_retries: u32,
}

impl BatchTracker {
    pub fn new(database: Arc<dyn BatchRepository>, max_retries: u32) -> Self {
        Self {
            database,
            max_retries,
        }
    }

    /// Recompute counters, mean progress and derived status for a batch.
    ///
    /// Terminal batches are left untouched. A task sitting in `Failed` with
    /// retries remaining is a transient state (it is about to re-queue) and
    /// is not counted as a permanent failure.
    ///
    /// Returns the batch as persisted, or `None` for an unknown id.
    pub async fn recompute(&self, batch_id: &str) -> DispatchResult<Option<Batch>> {
        let Some(mut batch) = self.database.get_batch(batch_id).await? else {
            return Ok(None);
        };
        if batch.status.is_terminal() {
            return Ok(Some(batch));
        }

        let tasks = self.database.get_batch_tasks(batch_id).await?;
        if tasks.is_empty() {
            return Ok(Some(batch));
        }

        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as u32;
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed && t.retry_count >= self.max_retries)
            .count() as u32;
        let total_progress: u64 = tasks.iter().map(|t| u64::from(t.progress)).sum();
        let mean_progress = (total_progress as f64 / tasks.len() as f64).round() as u8;

        let status = if completed == tasks.len() as u32 {
            BatchStatus::Completed
        } else if completed + failed == tasks.len() as u32 {
            BatchStatus::CompletedWithErrors
        } else {
            BatchStatus::Processing
        };

        batch.completed_files = completed;
        batch.failed_files = failed;
        batch.progress = mean_progress;
        batch.status = status;
        batch.updated_at = Utc::now();
        if status.is_terminal() {
            batch.completed_at = Some(batch.updated_at);
            tracing::info!(
                batch_id = %batch.id,
                status = %status,
                completed,
                failed,
                "batch reached terminal state"
            );
        }

        self.database.update_batch(&batch).await?;
        Ok(Some(batch))
    }
}
