//! Engine-level error taxonomy for Orchid.

use orchid_state::{RunId, StorageError, WorkflowNode};

/// Errors produced by the graph engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum OrchidError {
    /// No role is bound to a node in the registry. Configuration bug.
    #[error("no role bound for node {node}")]
    MissingRole { node: WorkflowNode },

    /// A node's declared dependency artifact is absent. Configuration bug.
    #[error("node {node} requires artifact {artifact} which is absent")]
    MissingDependency {
        node: WorkflowNode,
        artifact: String,
    },

    /// Another driver holds the exclusive lease for this run.
    #[error("lease for run {run_id} is held by another driver")]
    LeaseHeld { run_id: RunId },

    /// The liveness threshold does not exceed the node deadline, so the
    /// recovery sweep could declare a healthy in-flight run stale.
    #[error("liveness threshold {threshold_ms}ms must exceed node deadline {deadline_ms}ms")]
    ThresholdTooShort { threshold_ms: u128, deadline_ms: u128 },

    /// A run was asked to do something its status forbids.
    #[error("run {run_id} is in an invalid state for this operation: {detail}")]
    InvalidState { run_id: RunId, detail: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchidError {
    /// Whether this error means another driver owns the run and the caller
    /// should step aside rather than retry.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            OrchidError::LeaseHeld { .. }
                | OrchidError::Storage(StorageError::Conflict { .. })
                | OrchidError::Storage(StorageError::Terminal { .. })
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, OrchidError>;
