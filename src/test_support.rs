//! Test doubles for the dispatch engine
//!
//! A configurable in-memory storage provider and a scripted token
//! provider, shared by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::{DispatchError, DispatchResult};
use crate::domain::repositories::{
    StorageProvider, TokenProvider, UploadMeta, UploadResult, UploadSession,
};

/// Failure behavior for [`MockStorageProvider`].
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Every call succeeds.
    None,
    /// Every chunk upload fails with this HTTP status.
    ChunkStatus(u16),
    /// The first N chunk calls fail with this status, then succeed.
    FailFirstChunks(usize, u16),
    /// Chunks of files whose name contains the needle fail with this status.
    FailFilename(String, u16),
}

/// In-memory storage provider with scripted failures and concurrency
/// accounting.
pub struct MockStorageProvider {
    failure: MockFailure,
    chunk_delay: Duration,
    sessions: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    chunk_calls: AtomicUsize,
    init_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
}

impl MockStorageProvider {
    pub fn new(failure: MockFailure) -> Self {
        Self {
            failure,
            chunk_delay: Duration::from_millis(0),
            sessions: AtomicUsize::new(0),
            concurrent: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
            chunk_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockFailure::None)
    }

    /// Hold each chunk open for a while so uploads overlap observably.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Highest number of chunk uploads observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn chunk_calls(&self) -> usize {
        self.chunk_calls.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    fn failure_for(&self, session: &UploadSession, call_index: usize) -> Option<DispatchError> {
        let status = match &self.failure {
            MockFailure::None => return None,
            MockFailure::ChunkStatus(status) => *status,
            MockFailure::FailFirstChunks(n, status) => {
                if call_index < *n {
                    *status
                } else {
                    return None;
                }
            }
            MockFailure::FailFilename(needle, status) => {
                if session.filename.contains(needle.as_str()) {
                    *status
                } else {
                    return None;
                }
            }
        };
        Some(DispatchError::Storage {
            status: Some(status),
            message: format!("mock chunk failure with status {status}"),
            retry_after_secs: None,
        })
    }
}

#[async_trait]
impl StorageProvider for MockStorageProvider {
    async fn initialize_upload(&self, meta: UploadMeta) -> DispatchResult<UploadSession> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(UploadSession {
            session_id: format!("mock-session-{id}"),
            filename: meta.filename,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        _chunk: &[u8],
        _index: u32,
        _total: u32,
    ) -> DispatchResult<()> {
        let call_index = self.chunk_calls.fetch_add(1, Ordering::SeqCst);
        let active = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(active, Ordering::SeqCst);

        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        let outcome = self.failure_for(session, call_index);

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn finalize_upload(&self, session: &UploadSession) -> DispatchResult<UploadResult> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(UploadResult {
            remote_id: format!("remote-{}", session.session_id),
            url: Some(format!("https://cdn.example.com/{}", session.filename)),
            raw: serde_json::json!({ "session_id": session.session_id }),
        })
    }
}

/// Token provider with a fixed refresh outcome.
pub struct StaticTokenProvider {
    pub refresh_succeeds: bool,
    pub refreshes: AtomicUsize,
}

impl StaticTokenProvider {
    pub fn new(refresh_succeeds: bool) -> Self {
        Self {
            refresh_succeeds,
            refreshes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn refresh_token(&self, _owner_id: &str, _platform: &str) -> DispatchResult<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.refresh_succeeds {
            Ok(())
        } else {
            Err(DispatchError::storage("refresh rejected"))
        }
    }

    async fn verify_token(&self, _owner_id: &str, _platform: &str) -> DispatchResult<bool> {
        Ok(self.refresh_succeeds)
    }
}
