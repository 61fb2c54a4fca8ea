//! Persistence contract for workflow run state.
//!
//! `WorkflowStore` is async and backend-agnostic. An in-memory fake is
//! provided for testing via the `memory` module; `fs` provides a
//! digest-verified filesystem backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::model::{RunId, WorkflowState};

/// Durable store of `WorkflowState` documents, one per run.
///
/// Guarantees:
/// - `save` performs an optimistic version check: it only persists when the
///   stored version equals the version the caller loaded, and the persisted
///   copy carries `version + 1`. A mismatch is `StorageError::Conflict` and
///   means another driver owns the run and the caller must step aside.
/// - Terminal runs are immutable; saving over one is `StorageError::Terminal`.
/// - `load` returns exactly what was last saved.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a brand-new run. Fails with `Conflict` if the run id exists.
    async fn create(&self, state: &WorkflowState) -> StorageResult<()>;

    /// Persist a mutated run under the optimistic version check.
    ///
    /// Returns the new stored version; the caller must adopt it before the
    /// next save.
    async fn save(&self, state: &WorkflowState) -> StorageResult<u64>;

    /// Load a run document. `NotFound` if absent.
    async fn load(&self, run_id: &RunId) -> StorageResult<WorkflowState>;

    /// Runs still marked running whose `updated_at` is older than the
    /// cutoff, candidates for the recovery sweep.
    async fn list_stale(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<RunId>>;

    /// All run ids known to the store.
    async fn list_runs(&self) -> StorageResult<Vec<RunId>>;
}
