//! Upload queue processor
//!
//! The orchestrator: owns the FIFO task queue, bounds concurrency with a
//! semaphore, and wires the rate limiter, circuit breakers and retry
//! driver around each chunked transfer.
//!
//! Admission is edge-triggered: every terminal task outcome immediately
//! attempts to admit the next queued task. A rate-limited task is deferred
//! to the queue tail without consuming a retry; a task whose chunk retries
//! are exhausted re-queues at the tail with `retry_count + 1` until the
//! failure becomes permanent. Cancellation is cooperative and observed at
//! chunk boundaries only.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::recovery::ErrorRecovery;
use crate::domain::batch_tracker::BatchTracker;
use crate::domain::entities::{
    Batch, BatchStatus, MAX_BATCH_FILES, TaskStatus, UploadFile, UploadTask,
};
use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::events::DispatchEvent;
use crate::domain::repositories::{
    BatchRepository, StorageProvider, UploadMeta, UploadResult, UploadSession,
};
use crate::infrastructure::config::{AppConfig, DispatcherConfig};
use crate::infrastructure::rate_limiter::RateLimiter;
use crate::infrastructure::retry::RetryPolicy;

/// Endpoint name used for rate-limit and breaker keying of chunk uploads.
const UPLOAD_ENDPOINT: &str = "media/upload";

/// Receipt returned by [`UploadQueueProcessor::add_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    pub total_files: u32,
    pub status: BatchStatus,
}

/// Full batch view returned by [`UploadQueueProcessor::get_batch_status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatusReport {
    pub batch: Batch,
    /// Arithmetic mean of task progress, from one consistent read.
    pub overall_progress: u8,
    pub tasks: Vec<UploadTask>,
}

/// Outcome of [`UploadQueueProcessor::cancel_batch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    /// Queued tasks purged from the queue; in-flight tasks stop at their
    /// next chunk boundary and are not counted here.
    pub cancelled_tasks: u32,
}

/// Hook invoked on cancel with the batch id and any still-open storage
/// session ids. No compensating delete is issued by default, so remote
/// partial uploads are orphaned unless a hook claims them.
pub type CancelCleanupHook = Arc<dyn Fn(&str, Vec<String>) + Send + Sync>;

/// Queue-side handle for one admitted or waiting upload.
struct QueuedUpload {
    task_id: String,
    batch_id: String,
    owner_id: String,
    platform: String,
    file: Arc<UploadFile>,
}

/// Orchestrates bulk chunked uploads against rate-limited platform APIs.
pub struct UploadQueueProcessor {
    storage: Arc<dyn StorageProvider>,
    database: Arc<dyn BatchRepository>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    recovery: ErrorRecovery,
    tracker: BatchTracker,
    config: DispatcherConfig,
    queue: Mutex<VecDeque<QueuedUpload>>,
    slots: Arc<Semaphore>,
    batch_tokens: RwLock<HashMap<String, CancellationToken>>,
    /// task id -> open storage session id, for the cancel cleanup hook
    active_sessions: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<DispatchEvent>,
    cleanup_hook: RwLock<Option<CancelCleanupHook>>,
}

impl UploadQueueProcessor {
    pub fn new(
        storage: Arc<dyn StorageProvider>,
        database: Arc<dyn BatchRepository>,
        rate_limiter: Arc<RateLimiter>,
        config: &AppConfig,
    ) -> Arc<Self> {
        let recovery = ErrorRecovery::new(config.circuit_breaker.clone());
        Self::with_recovery(storage, database, rate_limiter, config, recovery)
    }

    /// Construct with a custom recovery coordinator (token provider,
    /// telemetry sink).
    pub fn with_recovery(
        storage: Arc<dyn StorageProvider>,
        database: Arc<dyn BatchRepository>,
        rate_limiter: Arc<RateLimiter>,
        config: &AppConfig,
        recovery: ErrorRecovery,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            tracker: BatchTracker::new(Arc::clone(&database), config.dispatcher.max_retries),
            retry: RetryPolicy::new(config.retry.clone()),
            slots: Arc::new(Semaphore::new(config.dispatcher.concurrency_limit.max(1))),
            config: config.dispatcher.clone(),
            storage,
            database,
            rate_limiter,
            recovery,
            queue: Mutex::new(VecDeque::new()),
            batch_tokens: RwLock::new(HashMap::new()),
            active_sessions: RwLock::new(HashMap::new()),
            events,
            cleanup_hook: RwLock::new(None),
        })
    }

    /// Subscribe to task and batch lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Install the optional cancel cleanup hook.
    pub async fn set_cancel_cleanup(&self, hook: CancelCleanupHook) {
        *self.cleanup_hook.write().await = Some(hook);
    }

    /// Tasks currently uploading.
    pub fn active_count(&self) -> usize {
        self.config
            .concurrency_limit
            .saturating_sub(self.slots.available_permits())
    }

    /// Tasks waiting in the queue.
    pub async fn queued_count(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Submit a batch of files for upload.
    ///
    /// Creates one queued task per file, persists batch and task records,
    /// and triggers the admission loop. Rejects empty input and input over
    /// [`MAX_BATCH_FILES`].
    pub async fn add_batch(
        self: &Arc<Self>,
        files: Vec<UploadFile>,
        owner_id: &str,
        metadata: serde_json::Value,
    ) -> DispatchResult<BatchReceipt> {
        if files.is_empty() {
            return Err(DispatchError::Validation(
                "at least one file is required".to_string(),
            ));
        }
        if files.len() > MAX_BATCH_FILES {
            return Err(DispatchError::Validation(format!(
                "a maximum of {MAX_BATCH_FILES} files can be uploaded at once"
            )));
        }

        let batch_id = format!("batch_{}", Uuid::new_v4().simple());
        let now = Utc::now();
        let total_files = files.len() as u32;

        let batch = Batch {
            id: batch_id.clone(),
            owner_id: owner_id.to_string(),
            total_files,
            completed_files: 0,
            failed_files: 0,
            progress: 0,
            status: BatchStatus::Queued,
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.database.create_batch(&batch).await?;

        let mut tasks = Vec::with_capacity(files.len());
        let mut jobs = Vec::with_capacity(files.len());
        for (index, file) in files.into_iter().enumerate() {
            let task_id = format!("{batch_id}-{index}");
            let file = Arc::new(file);
            tasks.push(UploadTask {
                id: task_id.clone(),
                batch_id: batch_id.clone(),
                owner_id: owner_id.to_string(),
                filename: file.filename.clone(),
                mime_type: file.mime_type.clone(),
                file_size: file.size(),
                platform: file.platform.clone(),
                status: TaskStatus::Queued,
                progress: 0,
                retry_count: 0,
                queue_position: index as u32,
                last_error: None,
                result: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
            });
            jobs.push(QueuedUpload {
                task_id,
                batch_id: batch_id.clone(),
                owner_id: owner_id.to_string(),
                platform: file.platform.clone(),
                file,
            });
        }
        self.database.create_tasks(&tasks).await?;

        self.batch_tokens
            .write()
            .await
            .insert(batch_id.clone(), CancellationToken::new());
        self.queue.lock().await.extend(jobs);

        info!(batch_id = %batch_id, total_files, "batch queued");
        self.spawn_pump();

        Ok(BatchReceipt {
            batch_id,
            total_files,
            status: BatchStatus::Queued,
        })
    }

    /// Batch record plus all tasks and the mean task progress.
    pub async fn get_batch_status(&self, batch_id: &str) -> DispatchResult<BatchStatusReport> {
        let batch = self
            .database
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| DispatchError::BatchNotFound(batch_id.to_string()))?;
        let tasks = self.database.get_batch_tasks(batch_id).await?;

        let overall_progress = if tasks.is_empty() {
            0
        } else {
            let total: u64 = tasks.iter().map(|t| u64::from(t.progress)).sum();
            (total as f64 / tasks.len() as f64).round() as u8
        };

        Ok(BatchStatusReport {
            batch,
            overall_progress,
            tasks,
        })
    }

    /// Cancel a batch: purge its queued tasks, flag its in-flight tasks,
    /// and mark the batch Cancelled immediately.
    pub async fn cancel_batch(&self, batch_id: &str) -> DispatchResult<CancelOutcome> {
        let mut batch = self
            .database
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| DispatchError::BatchNotFound(batch_id.to_string()))?;
        if batch.status.is_terminal() {
            return Ok(CancelOutcome {
                batch_id: batch_id.to_string(),
                status: batch.status,
                cancelled_tasks: 0,
            });
        }

        let removed: Vec<QueuedUpload> = {
            let mut queue = self.queue.lock().await;
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut removed = Vec::new();
            while let Some(job) = queue.pop_front() {
                if job.batch_id == batch_id {
                    removed.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            *queue = kept;
            removed
        };

        // in-flight workers observe this at their next chunk boundary
        if let Some(token) = self.batch_tokens.write().await.remove(batch_id) {
            token.cancel();
        }

        let updates = removed.iter().map(|job| {
            let database = Arc::clone(&self.database);
            let task_id = job.task_id.clone();
            async move {
                match database.get_task(&task_id).await {
                    Ok(Some(mut task)) => {
                        task.status = TaskStatus::Cancelled;
                        task.updated_at = Utc::now();
                        if let Err(err) = database.update_task(&task).await {
                            error!(task_id = %task.id, "failed to mark task cancelled: {err}");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!(task_id = %task_id, "failed to load task: {err}"),
                }
            }
        });
        futures::future::join_all(updates).await;

        for job in &removed {
            self.emit(DispatchEvent::TaskCancelled {
                task_id: job.task_id.clone(),
                batch_id: batch_id.to_string(),
                timestamp: Utc::now(),
            });
        }

        batch.status = BatchStatus::Cancelled;
        batch.updated_at = Utc::now();
        batch.completed_at = Some(batch.updated_at);
        self.database.update_batch(&batch).await?;

        let orphaned: Vec<String> = {
            let sessions = self.active_sessions.read().await;
            let prefix = format!("{batch_id}-");
            sessions
                .iter()
                .filter(|(task_id, _)| task_id.starts_with(&prefix))
                .map(|(_, session_id)| session_id.clone())
                .collect()
        };
        let hook = self.cleanup_hook.read().await.clone();
        if let Some(hook) = hook {
            hook(batch_id, orphaned);
        } else if !orphaned.is_empty() {
            warn!(
                batch_id,
                orphans = orphaned.len(),
                "cancel left partial uploads at the storage provider"
            );
        }

        self.emit(DispatchEvent::BatchFinished {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Cancelled,
            timestamp: Utc::now(),
        });

        info!(batch_id, purged = removed.len(), "batch cancelled");
        Ok(CancelOutcome {
            batch_id: batch_id.to_string(),
            status: BatchStatus::Cancelled,
            cancelled_tasks: removed.len() as u32,
        })
    }

    fn emit(&self, event: DispatchEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn spawn_pump(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.admit_ready().await;
        });
    }

    /// Admit queued tasks while free slots remain. Each finished task calls
    /// back into this, so admission is edge-triggered rather than polled.
    fn admit_ready(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            loop {
                let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let job = { self.queue.lock().await.pop_front() };
                let Some(job) = job else {
                    drop(permit);
                    break;
                };

                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    this.run_task(job).await;
                    drop(permit);
                    this.admit_ready().await;
                });
            }
        }
        .boxed()
    }

    /// Drive one admitted task to a terminal or re-queued state.
    async fn run_task(&self, job: QueuedUpload) {
        let token = {
            let tokens = self.batch_tokens.read().await;
            tokens.get(&job.batch_id).cloned()
        };
        // a missing token means the batch was cancelled after this job was queued
        let Some(token) = token else {
            self.finish_cancelled_task(&job).await;
            return;
        };
        if token.is_cancelled() {
            self.finish_cancelled_task(&job).await;
            return;
        }

        let mut task = match self.database.get_task(&job.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                error!(task_id = %job.task_id, "task record missing, dropping");
                return;
            }
            Err(err) => {
                error!(task_id = %job.task_id, "failed to load task: {err}");
                return;
            }
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }

        task.status = TaskStatus::Uploading;
        task.started_at = Some(Utc::now());
        task.updated_at = Utc::now();
        if let Err(err) = self.database.update_task(&task).await {
            error!(task_id = %task.id, "failed to mark task uploading: {err}");
        }
        self.emit(DispatchEvent::TaskStarted {
            task_id: task.id.clone(),
            batch_id: task.batch_id.clone(),
            timestamp: Utc::now(),
        });

        match self.transfer(&job, &mut task, &token).await {
            Ok(result) => {
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.result = serde_json::to_value(&result).ok();
                task.completed_at = Some(Utc::now());
                task.updated_at = Utc::now();
                if let Err(err) = self.database.update_task(&task).await {
                    error!(task_id = %task.id, "failed to persist completion: {err}");
                }
                debug!(task_id = %task.id, remote_id = %result.remote_id, "upload completed");
                self.emit(DispatchEvent::TaskCompleted {
                    task_id: task.id.clone(),
                    batch_id: task.batch_id.clone(),
                    timestamp: Utc::now(),
                });
                self.recompute_batch(&job.batch_id).await;
            }
            Err(DispatchError::RateLimited { key, .. }) => {
                self.defer_task(job, task, key).await;
            }
            Err(DispatchError::Cancelled) => {
                self.finish_cancelled_task(&job).await;
            }
            Err(err) => {
                self.handle_task_failure(job, task, err).await;
            }
        }
    }

    /// Quota denial: push the task back to the queue tail untouched.
    async fn defer_task(&self, job: QueuedUpload, mut task: UploadTask, reason: String) {
        task.status = TaskStatus::Queued;
        task.updated_at = Utc::now();
        if let Err(err) = self.database.update_task(&task).await {
            error!(task_id = %task.id, "failed to re-queue task: {err}");
        }
        self.emit(DispatchEvent::TaskDeferred {
            task_id: task.id.clone(),
            batch_id: task.batch_id.clone(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        debug!(task_id = %task.id, reason, "task deferred by rate limit");
        self.queue.lock().await.push_back(job);
    }

    /// Exhausted chunk retries: consult recovery, then either re-queue at
    /// the tail with `retry_count + 1` or fail permanently.
    async fn handle_task_failure(&self, job: QueuedUpload, mut task: UploadTask, error: DispatchError) {
        let report = self
            .recovery
            .recover(&error, &job.owner_id, &job.platform)
            .await;
        let permanent = !(report.retriable && task.retry_count < self.config.max_retries);

        task.status = TaskStatus::Failed;
        task.last_error = Some(error.to_string());
        task.updated_at = Utc::now();
        if let Err(err) = self.database.update_task(&task).await {
            error!(task_id = %task.id, "failed to persist failure: {err}");
        }
        self.emit(DispatchEvent::TaskFailed {
            task_id: task.id.clone(),
            batch_id: task.batch_id.clone(),
            error: error.to_string(),
            permanent,
            timestamp: Utc::now(),
        });

        if permanent {
            warn!(
                task_id = %task.id,
                retries = task.retry_count,
                "task failed permanently: {error}"
            );
            self.recompute_batch(&job.batch_id).await;
        } else {
            task.retry_count += 1;
            task.status = TaskStatus::Queued;
            task.progress = 0;
            task.updated_at = Utc::now();
            if let Err(err) = self.database.update_task(&task).await {
                error!(task_id = %task.id, "failed to re-queue task: {err}");
            }
            info!(
                task_id = %task.id,
                retry = task.retry_count,
                "task re-queued after failure ({})", report.message
            );
            self.queue.lock().await.push_back(job);
        }
    }

    async fn finish_cancelled_task(&self, job: &QueuedUpload) {
        match self.database.get_task(&job.task_id).await {
            Ok(Some(mut task)) if task.status != TaskStatus::Cancelled => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = Utc::now();
                if let Err(err) = self.database.update_task(&task).await {
                    error!(task_id = %task.id, "failed to mark task cancelled: {err}");
                }
            }
            Ok(_) => {}
            Err(err) => error!(task_id = %job.task_id, "failed to load task: {err}"),
        }
        self.emit(DispatchEvent::TaskCancelled {
            task_id: job.task_id.clone(),
            batch_id: job.batch_id.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Wait for quota, or signal deferral when it does not free up in time.
    async fn acquire_quota(&self, job: &QueuedUpload) -> DispatchResult<()> {
        if self
            .rate_limiter
            .can_proceed(&job.owner_id, &job.platform, UPLOAD_ENDPOINT)
            .await?
        {
            return Ok(());
        }

        let available = self
            .rate_limiter
            .await_availability(
                &job.owner_id,
                &job.platform,
                UPLOAD_ENDPOINT,
                Duration::from_millis(self.config.rate_limit_wait_ms),
                Duration::from_millis(self.config.rate_limit_poll_ms),
            )
            .await?;
        if available {
            Ok(())
        } else {
            Err(DispatchError::RateLimited {
                key: format!("{}:{}:{}", job.owner_id, job.platform, UPLOAD_ENDPOINT),
                retry_after_secs: None,
            })
        }
    }

    /// Chunked transfer for one task. Every chunk is quota-gated and runs
    /// through the breaker-wrapped, retry-driven upload call.
    async fn transfer(
        &self,
        job: &QueuedUpload,
        task: &mut UploadTask,
        cancel: &CancellationToken,
    ) -> DispatchResult<UploadResult> {
        // don't open a storage session we may not be allowed to feed
        self.acquire_quota(job).await?;

        let data = &job.file.data;
        let chunk_size = self.config.chunk_size.max(1);
        let total_chunks = (data.len().div_ceil(chunk_size)).max(1) as u32;

        let session = self
            .storage
            .initialize_upload(UploadMeta {
                filename: job.file.filename.clone(),
                mime_type: job.file.mime_type.clone(),
                file_size: job.file.size(),
                metadata: serde_json::json!({
                    "batch_id": job.batch_id,
                    "task_id": job.task_id,
                    "queue_position": task.queue_position,
                }),
            })
            .await?;

        self.active_sessions
            .write()
            .await
            .insert(job.task_id.clone(), session.session_id.clone());

        let outcome = self
            .transfer_chunks(job, task, cancel, &session, total_chunks, chunk_size)
            .await;

        self.active_sessions.write().await.remove(&job.task_id);
        outcome
    }

    async fn transfer_chunks(
        &self,
        job: &QueuedUpload,
        task: &mut UploadTask,
        cancel: &CancellationToken,
        session: &UploadSession,
        total_chunks: u32,
        chunk_size: usize,
    ) -> DispatchResult<UploadResult> {
        let data = &job.file.data;
        let breaker = self
            .recovery
            .breaker_for(&format!("{}:{UPLOAD_ENDPOINT}", job.platform))
            .await;

        for index in 0..total_chunks {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            self.acquire_quota(job).await?;
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            self.rate_limiter
                .record(&job.owner_id, &job.platform, UPLOAD_ENDPOINT)
                .await?;

            let start = index as usize * chunk_size;
            let end = usize::min(data.len(), start + chunk_size);
            let chunk = &data[start..end];

            self.retry
                .execute_with_cancellation(
                    |_attempt| {
                        let storage = Arc::clone(&self.storage);
                        let breaker = Arc::clone(&breaker);
                        let session = session.clone();
                        async move {
                            breaker
                                .call(|| storage.upload_chunk(&session, chunk, index, total_chunks))
                                .await
                        }
                    },
                    cancel,
                )
                .await?;

            let progress = (f64::from(index + 1) / f64::from(total_chunks) * 100.0).round() as u8;
            task.progress = progress;
            task.updated_at = Utc::now();
            self.database.update_task(task).await?;
            self.emit(DispatchEvent::TaskProgress {
                task_id: task.id.clone(),
                batch_id: task.batch_id.clone(),
                progress,
                timestamp: Utc::now(),
            });
            self.tracker.recompute(&job.batch_id).await?;
        }

        // last cooperative checkpoint before the upload becomes visible
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        self.storage.finalize_upload(session).await
    }

    /// Refresh batch aggregates; on the transition into a terminal state,
    /// emit the batch event and drop the cancel token.
    async fn recompute_batch(&self, batch_id: &str) {
        match self.tracker.recompute(batch_id).await {
            Ok(Some(batch)) if batch.status.is_terminal() => {
                let newly_terminal = self
                    .batch_tokens
                    .write()
                    .await
                    .remove(batch_id)
                    .is_some();
                if newly_terminal {
                    self.emit(DispatchEvent::BatchFinished {
                        batch_id: batch.id.clone(),
                        status: batch.status,
                        timestamp: Utc::now(),
                    });
                }
            }
            Ok(_) => {}
            Err(err) => error!(batch_id, "failed to recompute batch aggregates: {err}"),
        }
    }
}
