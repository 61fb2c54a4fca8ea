//! Error types for the orchid-state persistence layer.

use thiserror::Error;

/// Errors that can occur while persisting or loading workflow run state.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with the given id exists in the store.
    #[error("run not found: {run_id}")]
    NotFound { run_id: String },

    /// Optimistic version check failed: another driver saved this run since
    /// the caller loaded it. The caller must abandon its transition, not
    /// force-overwrite.
    #[error("version conflict for run {run_id}: expected {expected}, stored {stored}")]
    Conflict {
        run_id: String,
        expected: u64,
        stored: u64,
    },

    /// The run reached a terminal status and is immutable.
    #[error("run {run_id} is terminal and cannot be mutated")]
    Terminal { run_id: String },

    /// A persisted document failed its integrity check.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Serialization or deserialization of a run document failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from a disk-backed store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
