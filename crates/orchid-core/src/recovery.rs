//! Crash recovery for orphaned runs.
//!
//! A run is orphaned when its driver died between persisted transitions: the
//! document says `running` but nothing holds the lease and `updated_at` has
//! gone stale. The sweep adopts such runs one at a time, resuming them from
//! their last persisted state or marking them abandoned when their retry
//! budget is already spent.
//!
//! Staleness is inferred from `updated_at` alone. The liveness threshold must
//! exceed the node deadline, otherwise a healthy run blocked inside a single
//! slow role invocation would look dead.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::warn;

use orchid_state::{RunId, RunStatus, TerminalReason};

use crate::engine::GraphEngine;
use crate::error::{OrchidError, Result};
use crate::obs;

/// Outcome of examining one candidate run during a sweep.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Left alone: lease held, already terminal, or refreshed since listing.
    Skipped { reason: String },
    /// Adopted and driven to a terminal state.
    Resumed { status: RunStatus },
    /// Retry budget already spent at the crashed node; closed as failed.
    MarkedAbandoned,
    /// Adoption failed; the run stays as-is for a later sweep.
    Errored { error: String },
}

/// What one sweep did, per run.
#[derive(Debug)]
pub struct SweepReport {
    pub examined: usize,
    pub outcomes: Vec<(RunId, RecoveryOutcome)>,
}

impl SweepReport {
    pub fn resumed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RecoveryOutcome::Resumed { .. }))
            .count()
    }

    pub fn abandoned(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, RecoveryOutcome::MarkedAbandoned))
            .count()
    }
}

pub struct RecoveryManager {
    engine: Arc<GraphEngine>,
    liveness_threshold: Duration,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("liveness_threshold", &self.liveness_threshold)
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Build a sweeper over the engine's store and lease registry.
    ///
    /// Fails if `liveness_threshold` does not exceed the engine's node
    /// deadline.
    pub fn new(engine: Arc<GraphEngine>, liveness_threshold: Duration) -> Result<Self> {
        let deadline = engine.config().node_deadline;
        if liveness_threshold <= deadline {
            return Err(OrchidError::ThresholdTooShort {
                threshold_ms: liveness_threshold.as_millis(),
                deadline_ms: deadline.as_millis(),
            });
        }
        Ok(Self {
            engine,
            liveness_threshold,
        })
    }

    /// Examine every stale non-terminal run and resume or abandon each.
    ///
    /// Safe to run concurrently with live drivers and with other sweeps:
    /// every adoption goes through the lease registry and the store's
    /// version check, so each run has at most one driver.
    pub async fn sweep(&self) -> Result<SweepReport> {
        // An out-of-range threshold clamps to "never stale".
        let threshold = chrono::Duration::from_std(self.liveness_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        let cutoff = Utc::now() - threshold;
        let stale = self.engine.store().list_stale(cutoff).await?;

        let mut outcomes = Vec::with_capacity(stale.len());
        for run_id in stale {
            let outcome = self.adopt(&run_id, cutoff).await;
            if let RecoveryOutcome::Errored { error } = &outcome {
                warn!(run_id = %run_id, error = %error, "recovery adoption failed");
            }
            outcomes.push((run_id, outcome));
        }

        let report = SweepReport {
            examined: outcomes.len(),
            outcomes,
        };
        obs::emit_recovery_swept(report.examined, report.resumed(), report.abandoned());
        Ok(report)
    }

    async fn adopt(&self, run_id: &RunId, cutoff: chrono::DateTime<Utc>) -> RecoveryOutcome {
        let Some(_guard) = self.engine.leases().try_acquire(run_id) else {
            return RecoveryOutcome::Skipped {
                reason: "lease held".to_string(),
            };
        };

        // Reload under the lease: the listing may be arbitrarily old.
        let state = match self.engine.store().load(run_id).await {
            Ok(state) => state,
            Err(e) => {
                return RecoveryOutcome::Errored {
                    error: e.to_string(),
                }
            }
        };
        if state.is_terminal() {
            return RecoveryOutcome::Skipped {
                reason: "terminal".to_string(),
            };
        }
        if state.updated_at >= cutoff {
            return RecoveryOutcome::Skipped {
                reason: "refreshed".to_string(),
            };
        }

        // A crashed run whose current node already spent its attempts cannot
        // make progress; close it instead of replaying the last failure.
        if let Some(node) = state.current_node {
            if state.attempts(node) >= state.task.max_attempts_per_node() {
                return match self
                    .engine
                    .finish(state, RunStatus::Failed, TerminalReason::Abandoned)
                    .await
                {
                    Ok(_) => RecoveryOutcome::MarkedAbandoned,
                    Err(e) => RecoveryOutcome::Errored {
                        error: e.to_string(),
                    },
                };
            }
        }

        // Keep the sender alive for the whole resumed drive.
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        match self.engine.drive_locked(run_id, cancel_rx).await {
            Ok(state) => RecoveryOutcome::Resumed {
                status: state.status,
            },
            Err(e) => RecoveryOutcome::Errored {
                error: e.to_string(),
            },
        }
    }
}
