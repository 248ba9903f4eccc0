//! SQLite-backed batch repository
//!
//! Persists batch and task records through `sqlx`. Status enums are stored
//! as their string form; metadata and results as JSON text.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::domain::entities::{Batch, BatchStatus, TaskStatus, UploadTask};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::BatchRepository;

#[derive(Clone)]
pub struct SqliteBatchRepository {
    pool: Arc<SqlitePool>,
}

impl SqliteBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    fn map_batch(row: &SqliteRow) -> DispatchResult<Batch> {
        let status: String = row.try_get("status")?;
        let metadata: String = row.try_get("metadata")?;
        Ok(Batch {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            total_files: row.try_get::<i64, _>("total_files")? as u32,
            completed_files: row.try_get::<i64, _>("completed_files")? as u32,
            failed_files: row.try_get::<i64, _>("failed_files")? as u32,
            progress: row.try_get::<i64, _>("progress")? as u8,
            status: BatchStatus::from_str(&status).map_err(DispatchError::Database)?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| DispatchError::Database(e.to_string()))?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
        })
    }

    fn map_task(row: &SqliteRow) -> DispatchResult<UploadTask> {
        let status: String = row.try_get("status")?;
        let result: Option<String> = row.try_get("result")?;
        let result = match result {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .map_err(|e| DispatchError::Database(e.to_string()))?,
            ),
            None => None,
        };
        Ok(UploadTask {
            id: row.try_get("id")?,
            batch_id: row.try_get("batch_id")?,
            owner_id: row.try_get("owner_id")?,
            filename: row.try_get("filename")?,
            mime_type: row.try_get("mime_type")?,
            file_size: row.try_get::<i64, _>("file_size")? as u64,
            platform: row.try_get("platform")?,
            status: TaskStatus::from_str(&status).map_err(DispatchError::Database)?,
            progress: row.try_get::<i64, _>("progress")? as u8,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            queue_position: row.try_get::<i64, _>("queue_position")? as u32,
            last_error: row.try_get("last_error")?,
            result,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            started_at: row.try_get::<Option<DateTime<Utc>>, _>("started_at")?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl BatchRepository for SqliteBatchRepository {
    async fn create_batch(&self, batch: &Batch) -> DispatchResult<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_batches
            (id, owner_id, total_files, completed_files, failed_files, progress,
             status, metadata, created_at, updated_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&batch.id)
        .bind(&batch.owner_id)
        .bind(batch.total_files as i64)
        .bind(batch.completed_files as i64)
        .bind(batch.failed_files as i64)
        .bind(batch.progress as i64)
        .bind(batch.status.as_str())
        .bind(batch.metadata.to_string())
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> DispatchResult<Option<Batch>> {
        let row = sqlx::query("SELECT * FROM upload_batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(Self::map_batch).transpose()
    }

    async fn update_batch(&self, batch: &Batch) -> DispatchResult<()> {
        sqlx::query(
            r#"
            UPDATE upload_batches
            SET completed_files = ?, failed_files = ?, progress = ?, status = ?,
                metadata = ?, updated_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(batch.completed_files as i64)
        .bind(batch.failed_files as i64)
        .bind(batch.progress as i64)
        .bind(batch.status.as_str())
        .bind(batch.metadata.to_string())
        .bind(batch.updated_at)
        .bind(batch.completed_at)
        .bind(&batch.id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn create_tasks(&self, tasks: &[UploadTask]) -> DispatchResult<()> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO upload_tasks
                (id, batch_id, owner_id, filename, mime_type, file_size, platform,
                 status, progress, retry_count, queue_position, last_error, result,
                 created_at, started_at, completed_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.batch_id)
            .bind(&task.owner_id)
            .bind(&task.filename)
            .bind(&task.mime_type)
            .bind(task.file_size as i64)
            .bind(&task.platform)
            .bind(task.status.as_str())
            .bind(task.progress as i64)
            .bind(task.retry_count as i64)
            .bind(task.queue_position as i64)
            .bind(&task.last_error)
            .bind(task.result.as_ref().map(|v| v.to_string()))
            .bind(task.created_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> DispatchResult<Option<UploadTask>> {
        let row = sqlx::query("SELECT * FROM upload_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(Self::map_task).transpose()
    }

    async fn get_batch_tasks(&self, batch_id: &str) -> DispatchResult<Vec<UploadTask>> {
        let rows =
            sqlx::query("SELECT * FROM upload_tasks WHERE batch_id = ? ORDER BY queue_position")
                .bind(batch_id)
                .fetch_all(&*self.pool)
                .await?;
        rows.iter().map(Self::map_task).collect()
    }

    async fn update_task(&self, task: &UploadTask) -> DispatchResult<()> {
        sqlx::query(
            r#"
            UPDATE upload_tasks
            SET status = ?, progress = ?, retry_count = ?, last_error = ?, result = ?,
                started_at = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress as i64)
        .bind(task.retry_count as i64)
        .bind(&task.last_error)
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .bind(&task.id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}
