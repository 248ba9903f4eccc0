//! In-memory batch repository
//!
//! Thread-safe map-backed implementation for tests and single-process
//! embedding where nothing needs to survive a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::entities::{Batch, UploadTask};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::BatchRepository;

#[derive(Default)]
pub struct MemoryBatchRepository {
    batches: RwLock<HashMap<String, Batch>>,
    tasks: RwLock<HashMap<String, UploadTask>>,
}

impl MemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn create_batch(&self, batch: &Batch) -> DispatchResult<()> {
        let mut batches = self.batches.write().await;
        if batches.contains_key(&batch.id) {
            return Err(DispatchError::Database(format!(
                "batch already exists: {}",
                batch.id
            )));
        }
        batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> DispatchResult<Option<Batch>> {
        Ok(self.batches.read().await.get(batch_id).cloned())
    }

    async fn update_batch(&self, batch: &Batch) -> DispatchResult<()> {
        let mut batches = self.batches.write().await;
        if !batches.contains_key(&batch.id) {
            return Err(DispatchError::Database(format!(
                "cannot update unknown batch: {}",
                batch.id
            )));
        }
        batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn create_tasks(&self, new_tasks: &[UploadTask]) -> DispatchResult<()> {
        let mut tasks = self.tasks.write().await;
        for task in new_tasks {
            tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> DispatchResult<Option<UploadTask>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn get_batch_tasks(&self, batch_id: &str) -> DispatchResult<Vec<UploadTask>> {
        let tasks = self.tasks.read().await;
        let mut found: Vec<UploadTask> = tasks
            .values()
            .filter(|t| t.batch_id == batch_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.queue_position);
        Ok(found)
    }

    async fn update_task(&self, task: &UploadTask) -> DispatchResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(DispatchError::Database(format!(
                "cannot update unknown task: {}",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }
}
