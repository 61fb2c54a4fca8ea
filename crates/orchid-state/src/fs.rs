//! Filesystem-backed `WorkflowStore`.
//!
//! Layout: `<root>/runs/<run_id>.json` plus a `<run_id>.digest` sidecar
//! holding the SHA-256 of the document. Writes go through a temp file in the
//! same directory followed by an atomic rename, so a crash mid-write leaves
//! either the previous document or the new one, never a torn file. The
//! digest is re-derived on load; a mismatch is surfaced, not ignored.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{StorageError, StorageResult};
use crate::model::{RunId, RunStatus, WorkflowState};
use crate::store::WorkflowStore;

/// Disk-backed workflow store, one JSON document per run.
pub struct FsWorkflowStore {
    runs_dir: PathBuf,
}

impl FsWorkflowStore {
    /// Create a store rooted at `root`. Creates `root/runs/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    fn doc_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    fn digest_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.digest"))
    }

    fn digest_of(bytes: &[u8]) -> String {
        use sha2::Digest as _;
        hex::encode(sha2::Sha256::digest(bytes))
    }

    fn write_doc(&self, state: &WorkflowState) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let digest = Self::digest_of(&json);

        let mut tmp = NamedTempFile::new_in(&self.runs_dir)?;
        tmp.write_all(&json)?;
        tmp.persist(self.doc_path(&state.run_id))
            .map_err(|e| StorageError::Io(e.error))?;

        let mut tmp = NamedTempFile::new_in(&self.runs_dir)?;
        tmp.write_all(digest.as_bytes())?;
        tmp.persist(self.digest_path(&state.run_id))
            .map_err(|e| StorageError::Io(e.error))?;

        Ok(())
    }

    fn read_doc(&self, run_id: &RunId) -> StorageResult<WorkflowState> {
        let json = fs::read(self.doc_path(run_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    run_id: run_id.to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        let expected = fs::read_to_string(self.digest_path(run_id))?;
        let actual = Self::digest_of(&json);
        if expected.trim() != actual {
            return Err(StorageError::DigestMismatch {
                expected: expected.trim().to_string(),
                actual,
            });
        }
        Ok(serde_json::from_slice(&json)?)
    }
}

#[async_trait]
impl WorkflowStore for FsWorkflowStore {
    async fn create(&self, state: &WorkflowState) -> StorageResult<()> {
        if self.doc_path(&state.run_id).exists() {
            let stored = self.read_doc(&state.run_id)?;
            return Err(StorageError::Conflict {
                run_id: state.run_id.to_string(),
                expected: state.version,
                stored: stored.version,
            });
        }
        self.write_doc(state)
    }

    async fn save(&self, state: &WorkflowState) -> StorageResult<u64> {
        let stored = self.read_doc(&state.run_id)?;
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
        self.write_doc(&next)?;
        Ok(next.version)
    }

    async fn load(&self, run_id: &RunId) -> StorageResult<WorkflowState> {
        self.read_doc(run_id)
    }

    async fn list_stale(&self, older_than: DateTime<Utc>) -> StorageResult<Vec<RunId>> {
        let mut stale = Vec::new();
        for run_id in self.list_runs().await? {
            match self.read_doc(&run_id) {
                Ok(state) => {
                    if state.status == RunStatus::Running && state.updated_at < older_than {
                        stale.push(run_id);
                    }
                }
                Err(e) => {
                    // An unreadable document must not stop the sweep.
                    warn!(run_id = %run_id, error = %e, "skipping unreadable run document");
                }
            }
        }
        Ok(stale)
    }

    async fn list_runs(&self) -> StorageResult<Vec<RunId>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    runs.push(RunId(stem.to_string()));
                }
            }
        }
        Ok(runs)
    }
}
