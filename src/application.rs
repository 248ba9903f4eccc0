//! Application layer module
//!
//! Contains the queue processor that orchestrates batch uploads and the
//! recovery coordinator that turns classified failures into decisions.

pub mod dispatcher;
pub mod recovery;

pub use dispatcher::{
    BatchReceipt, BatchStatusReport, CancelCleanupHook, CancelOutcome, UploadQueueProcessor,
};
pub use recovery::{ErrorRecovery, RecoveryReport};
