//! In-memory fake for the `WorkflowStore` trait (testing only).
//!
//! Satisfies the full contract, including the optimistic version check,
//! without any external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StorageError, StorageResult};
use crate::model::{RunId, WorkflowState};
use crate::store::WorkflowStore;

/// In-memory workflow store backed by a `HashMap<run_id, WorkflowState>`.
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    runs: Mutex<HashMap<String, WorkflowState>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn create(&self, state: &WorkflowState) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        if runs.contains_key(state.run_id.as_str()) {
            return Err(StorageError::Conflict {
                run_id: state.run_id.to_string(),
                expected: state.version,
                stored: runs[state.run_id.as_str()].version,
            });
        }
        runs.insert(state.run_id.as_str().to_string(), state.clone());
        Ok(())
    }

    async fn save(&self, state: &WorkflowState) -> StorageResult<u64> {
        let mut runs = self.runs.lock().unwrap();
        let stored = runs
            .get_mut(state.run_id.as_str())
            .ok_or_else(|| StorageError::NotFound {
                run_id: state.run_id.to_string(),
            })?;
        if stored.is_terminal() {
            return Err(StorageError::Terminal {
                run_id: state.run_id.to_string(),
            });
        }
        if stored.version != state.version {
            return Err(StorageError::Conflict {
                run_id: state.run_id.to_string(),
                expected: state.version,
                stored: stored.version,
            });
        }
        let mut next = state.clone();
        next.version += 1;
        let new_version = next.version;
        *stored = next;
        Ok(new_version)
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<WorkflowState> {
        let runs = self.runs.lock().unwrap();
        runs.get(run_id.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                run_id: run_id.to_string(),
            })
    }

    async fn list_stale(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<RunId>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs
            .values()
            .filter(|s| s.status == crate::model::RunStatus::Running && s.updated_at < older_than)
            .map(|s| s.run_id.clone())
            .collect())
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let runs = self.runs.lock().unwrap();
        Ok(runs.values().map(|s| s.run_id.clone()).collect())
    }
}
