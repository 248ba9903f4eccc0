//! media-dispatch - resilient bulk media upload dispatch engine
//!
//! A client-side orchestration layer that submits many concurrent chunked
//! uploads against external, rate-limited platform APIs while enforcing
//! per-platform quotas, isolating cascading failures with circuit
//! breakers, and retrying transient failures with jittered backoff.
//!
//! The entry point is [`UploadQueueProcessor`]: submit a batch of files,
//! watch progress through [`UploadQueueProcessor::subscribe`] or
//! [`UploadQueueProcessor::get_batch_status`], and cancel cooperatively
//! with [`UploadQueueProcessor::cancel_batch`].

// Module declarations
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod test_support;

// Re-export the primary API surface
pub use application::dispatcher::{
    BatchReceipt, BatchStatusReport, CancelCleanupHook, CancelOutcome, UploadQueueProcessor,
};
pub use application::recovery::{ErrorRecovery, RecoveryReport};
pub use domain::entities::{
    Batch, BatchStatus, MAX_BATCH_FILES, TaskStatus, UploadFile, UploadTask,
};
pub use domain::errors::{DispatchError, DispatchResult, ErrorCategory, RecoveryAction};
pub use domain::events::{CircuitState, CircuitTransition, DispatchEvent};
pub use domain::repositories::{
    BatchRepository, CounterStore, StorageProvider, TelemetrySink, TokenProvider,
};
pub use infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use infrastructure::config::{AppConfig, ConfigManager, DispatcherConfig};
pub use infrastructure::rate_limiter::{InMemoryCounterStore, RateLimitConfig, RateLimiter};
pub use infrastructure::retry::{RetryConfig, RetryPolicy};
