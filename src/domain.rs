//! Domain module - core entities, events and collaborator interfaces
//!
//! Modern Rust module organization (Rust 2018+ style):
//! - Each module is its own file in the domain/ directory
//! - Public exports are defined here for convenience

pub mod batch_tracker;
pub mod entities;
pub mod errors;
pub mod events;
pub mod repositories;

// Re-export commonly used items
pub use batch_tracker::BatchTracker;
pub use entities::{Batch, BatchStatus, MAX_BATCH_FILES, TaskStatus, UploadFile, UploadTask};
pub use errors::{DispatchError, DispatchResult, ErrorCategory, RecoveryAction};
pub use events::{CircuitState, CircuitTransition, ClassifiedError, DispatchEvent};
pub use repositories::{
    BatchRepository, CounterStore, StorageProvider, TelemetrySink, TokenProvider,
    TracingTelemetry, UploadMeta, UploadResult, UploadSession,
};
