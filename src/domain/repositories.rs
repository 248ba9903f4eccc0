//! Collaborator interfaces for the dispatch engine
//!
//! Contains trait definitions for the external collaborators: persistence,
//! storage provider, rate-limit counter store, credential provider and the
//! telemetry sink. The engine is purely an orchestration layer over these.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::entities::{Batch, UploadTask};
use crate::domain::errors::DispatchResult;
use crate::domain::events::{CircuitTransition, ClassifiedError};

/// Persistence collaborator for batch and task records.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create_batch(&self, batch: &Batch) -> DispatchResult<()>;
    async fn get_batch(&self, batch_id: &str) -> DispatchResult<Option<Batch>>;
    async fn update_batch(&self, batch: &Batch) -> DispatchResult<()>;
    async fn create_tasks(&self, tasks: &[UploadTask]) -> DispatchResult<()>;
    async fn get_task(&self, task_id: &str) -> DispatchResult<Option<UploadTask>>;
    async fn get_batch_tasks(&self, batch_id: &str) -> DispatchResult<Vec<UploadTask>>;
    async fn update_task(&self, task: &UploadTask) -> DispatchResult<()>;
}

/// Metadata handed to the storage provider when opening an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMeta {
    pub filename: String,
    pub mime_type: String,
    pub file_size: u64,
    pub metadata: serde_json::Value,
}

/// An open chunked-upload session at the storage provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub filename: String,
}

/// Result returned by the storage provider after finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub remote_id: String,
    pub url: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// Chunked-upload storage collaborator (e.g. a media CDN).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn initialize_upload(&self, meta: UploadMeta) -> DispatchResult<UploadSession>;

    /// Upload one chunk. Must be resumable for a fixed (session, index)
    /// pair so the retry driver can safely re-send it.
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        chunk: &[u8],
        index: u32,
        total: u32,
    ) -> DispatchResult<()>;

    async fn finalize_upload(&self, session: &UploadSession) -> DispatchResult<UploadResult>;
}

/// Pluggable counter backend for rate-limit windows.
///
/// The in-memory implementation is sufficient for a single process; a
/// shared store (e.g. Redis) is required to keep window limits globally
/// true across multiple instances.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get_count(&self, key: &str) -> DispatchResult<u64>;

    /// Atomically increment, creating the counter with the given TTL if
    /// absent, and return the post-increment count. A plain read-then-write
    /// is not an acceptable implementation.
    async fn increment_count(&self, key: &str, ttl: Duration) -> DispatchResult<u64>;

    async fn get_ttl(&self, key: &str) -> DispatchResult<Option<Duration>>;
}

/// Credential collaborator driving the authentication-error recovery path.
/// Token encryption and storage live outside this engine.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn refresh_token(&self, owner_id: &str, platform: &str) -> DispatchResult<()>;
    async fn verify_token(&self, owner_id: &str, platform: &str) -> DispatchResult<bool>;
}

/// Receives circuit transitions and classified errors for audit logging.
pub trait TelemetrySink: Send + Sync {
    fn circuit_transition(&self, event: &CircuitTransition);
    fn classified_error(&self, entry: &ClassifiedError);
}

/// Default sink that forwards everything to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn circuit_transition(&self, event: &CircuitTransition) {
        tracing::info!(
            operation = %event.operation,
            previous = %event.previous,
            next = %event.next,
            last_error = event.last_error.as_deref().unwrap_or(""),
            "circuit breaker state change"
        );
    }

    fn classified_error(&self, entry: &ClassifiedError) {
        tracing::warn!(
            category = %entry.category,
            retriable = entry.retriable,
            "classified error: {}",
            entry.message
        );
    }
}
