//! Tests for the SQLite-backed batch repository
//!
//! Round-trips batch and task records through a real database file and
//! runs one small dispatch end-to-end on top of it.

use std::sync::Arc;

use chrono::Utc;
use media_dispatch::domain::entities::{Batch, BatchStatus, TaskStatus, UploadTask};
use media_dispatch::domain::repositories::BatchRepository;
use media_dispatch::infrastructure::database_connection::DatabaseConnection;
use media_dispatch::infrastructure::sqlite_repository::SqliteBatchRepository;
use media_dispatch::test_support::MockStorageProvider;
use media_dispatch::{
    AppConfig, InMemoryCounterStore, RateLimitConfig, RateLimiter, UploadFile,
    UploadQueueProcessor,
};

async fn repository(dir: &tempfile::TempDir) -> SqliteBatchRepository {
    let db_path = dir.path().join("dispatch.db");
    let url = format!("sqlite://{}", db_path.display());
    let connection = DatabaseConnection::new(&url).await.unwrap();
    connection.migrate().await.unwrap();
    SqliteBatchRepository::new(connection.pool().clone())
}

fn sample_batch(id: &str) -> Batch {
    let now = Utc::now();
    Batch {
        id: id.to_string(),
        owner_id: "owner-1".to_string(),
        total_files: 2,
        completed_files: 0,
        failed_files: 0,
        progress: 0,
        status: BatchStatus::Queued,
        metadata: serde_json::json!({"campaign": "spring"}),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn sample_task(id: &str, batch_id: &str, position: u32) -> UploadTask {
    let now = Utc::now();
    UploadTask {
        id: id.to_string(),
        batch_id: batch_id.to_string(),
        owner_id: "owner-1".to_string(),
        filename: format!("{id}.jpg"),
        mime_type: "image/jpeg".to_string(),
        file_size: 2048,
        platform: "instagram".to_string(),
        status: TaskStatus::Queued,
        progress: 0,
        retry_count: 0,
        queue_position: position,
        last_error: None,
        result: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    }
}

#[tokio::test]
async fn batch_records_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir).await;

    let batch = sample_batch("batch_rt");
    repo.create_batch(&batch).await.unwrap();

    let loaded = repo.get_batch("batch_rt").await.unwrap().unwrap();
    assert_eq!(loaded.owner_id, "owner-1");
    assert_eq!(loaded.status, BatchStatus::Queued);
    assert_eq!(loaded.metadata["campaign"], "spring");
    assert_eq!(loaded.total_files, 2);

    let mut updated = loaded.clone();
    updated.status = BatchStatus::CompletedWithErrors;
    updated.completed_files = 1;
    updated.failed_files = 1;
    updated.progress = 70;
    updated.completed_at = Some(Utc::now());
    repo.update_batch(&updated).await.unwrap();

    let reloaded = repo.get_batch("batch_rt").await.unwrap().unwrap();
    assert_eq!(reloaded.status, BatchStatus::CompletedWithErrors);
    assert_eq!(reloaded.progress, 70);
    assert!(reloaded.completed_at.is_some());

    assert!(repo.get_batch("batch_nope").await.unwrap().is_none());
}

#[tokio::test]
async fn task_records_round_trip_in_queue_order() {
    let dir = tempfile::tempdir().unwrap();
    let repo = repository(&dir).await;

    repo.create_batch(&sample_batch("batch_t")).await.unwrap();
    repo.create_tasks(&[
        sample_task("batch_t-1", "batch_t", 1),
        sample_task("batch_t-0", "batch_t", 0),
    ])
    .await
    .unwrap();

    let tasks = repo.get_batch_tasks("batch_t").await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "batch_t-0");
    assert_eq!(tasks[1].id, "batch_t-1");

    let mut task = tasks[1].clone();
    task.status = TaskStatus::Failed;
    task.retry_count = 2;
    task.progress = 40;
    task.last_error = Some("storage request failed with status 503".to_string());
    task.result = Some(serde_json::json!({"partial": true}));
    repo.update_task(&task).await.unwrap();

    let reloaded = repo.get_task("batch_t-1").await.unwrap().unwrap();
    assert_eq!(reloaded.status, TaskStatus::Failed);
    assert_eq!(reloaded.retry_count, 2);
    assert_eq!(reloaded.progress, 40);
    assert!(reloaded.last_error.unwrap().contains("503"));
    assert_eq!(reloaded.result.unwrap()["partial"], true);
}

#[tokio::test]
async fn dispatch_runs_end_to_end_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(repository(&dir).await);
    let storage = Arc::new(MockStorageProvider::succeeding());
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(InMemoryCounterStore::new()),
        RateLimitConfig {
            platforms: std::collections::HashMap::new(),
        },
    ));

    let mut config = AppConfig::default();
    config.dispatcher.concurrency_limit = 2;
    config.dispatcher.chunk_size = 4;
    let processor = UploadQueueProcessor::new(storage, repo, limiter, &config);

    let files: Vec<UploadFile> = (0..5)
        .map(|i| UploadFile::new(format!("clip-{i}.mp4"), "video/mp4", "tiktok", vec![1u8; 6]))
        .collect();
    let receipt = processor
        .add_batch(files, "owner-9", serde_json::json!({"source": "test"}))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    let report = loop {
        let report = processor.get_batch_status(&receipt.batch_id).await.unwrap();
        if report.batch.status.is_terminal() {
            break report;
        }
        assert!(tokio::time::Instant::now() < deadline, "batch did not settle");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };

    assert_eq!(report.batch.status, BatchStatus::Completed);
    assert_eq!(report.batch.completed_files, 5);
    assert!(report.tasks.iter().all(|t| t.result.is_some()));
}
