//! Infrastructure layer for resilience primitives, persistence and
//! external integrations
//!
//! Provides the rate limiter, circuit breaker, retry driver and error
//! classifier, plus configuration, logging, and the repository / storage
//! provider implementations.

pub mod circuit_breaker;
pub mod config;
pub mod database_connection;
pub mod error_classifier;
pub mod http_storage;
pub mod logging;
pub mod memory_repository;
pub mod rate_limiter;
pub mod retry;
pub mod sqlite_repository;

// Re-export commonly used items
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
pub use config::{AppConfig, ConfigManager, DispatcherConfig, LoggingConfig, StorageConfig};
pub use database_connection::DatabaseConnection;
pub use error_classifier::{Classification, classify};
pub use http_storage::HttpStorageProvider;
pub use logging::init_logging;
pub use memory_repository::MemoryBatchRepository;
pub use rate_limiter::{
    InMemoryCounterStore, PlatformLimits, RateLimitConfig, RateLimiter, RecordOutcome,
    WindowLimit, WindowSpec, WindowStatus,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use sqlite_repository::SqliteBatchRepository;
