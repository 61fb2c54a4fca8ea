//! One role invocation, isolated from the graph.
//!
//! The executor derives the node's artifacts view, races the role future
//! against the deadline and the run's cancellation signal, and maps whatever
//! happens, including a panic inside the role, into the step outcome
//! taxonomy. It never persists; that belongs to the engine.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::warn;

use orchid_state::{ArtifactRef, StepOutcome, StepRecord, WorkflowNode, WorkflowState};

use crate::role::{ArtifactsView, Role, RoleResult};

/// What a single step produced, before the engine persists it.
#[derive(Debug)]
pub struct StepReport {
    pub record: StepRecord,
    /// The artifact value to merge into the run's artifact map on success.
    pub produced: Option<(String, serde_json::Value)>,
}

/// Result of running one step.
#[derive(Debug)]
pub enum StepRun {
    Completed(StepReport),
    /// The run's cancellation signal fired mid-invocation; the role future
    /// was aborted and no record should be appended.
    Cancelled,
}

/// Executes one node invocation with deadline and cancellation enforcement.
#[derive(Debug, Clone, Copy)]
pub struct StepExecutor {
    deadline: Duration,
}

impl StepExecutor {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Invoke the role bound to `node` once.
    ///
    /// The role runs on its own task: a timeout or cancellation aborts it
    /// (it is interrupted, not left running in the background), and a panic
    /// is caught as a join error and treated as retryable.
    pub async fn run(
        &self,
        role: Arc<dyn Role>,
        node: WorkflowNode,
        state: &WorkflowState,
        attempt: u32,
        cancel: &mut watch::Receiver<bool>,
    ) -> StepRun {
        let started_at = Utc::now();

        let view = match ArtifactsView::project(&state.artifacts, node) {
            Ok(view) => view,
            Err(e) => {
                // Dependency wiring is fixed at compile time, so an absent
                // artifact here is an engine bug, not a transient condition.
                return StepRun::Completed(StepReport {
                    record: StepRecord {
                        node,
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                        outcome: StepOutcome::FatalFailure {
                            reason: e.to_string(),
                        },
                    },
                    produced: None,
                });
            }
        };

        let task = state.task.clone();
        let deadline = self.deadline;
        let mut handle =
            tokio::spawn(async move { role.invoke(&task, &view, deadline).await });

        let result = tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                handle.abort();
                return StepRun::Cancelled;
            }
            timed = tokio::time::timeout(deadline, &mut handle) => match timed {
                Err(_elapsed) => {
                    handle.abort();
                    RoleResult::RetryableFailure {
                        reason: "timeout".to_string(),
                    }
                }
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    warn!(node = %node, error = %join_err, "role crashed mid-invocation");
                    RoleResult::RetryableFailure {
                        reason: format!("role crashed: {join_err}"),
                    }
                }
            },
        };

        let (outcome, produced) = match result {
            RoleResult::Produced { name, value } => {
                if name != node.artifact_name() {
                    (
                        StepOutcome::FatalFailure {
                            reason: format!(
                                "role for {node} produced artifact {name}, expected {}",
                                node.artifact_name()
                            ),
                        },
                        None,
                    )
                } else {
                    match ArtifactRef::for_value(&name, &value) {
                        Ok(artifact) => (
                            StepOutcome::Success { artifact },
                            Some((name, value)),
                        ),
                        Err(e) => (
                            StepOutcome::FatalFailure {
                                reason: format!("artifact not serializable: {e}"),
                            },
                            None,
                        ),
                    }
                }
            }
            RoleResult::RetryableFailure { reason } => {
                (StepOutcome::RetryableFailure { reason }, None)
            }
            RoleResult::FatalFailure { reason } => (StepOutcome::FatalFailure { reason }, None),
        };

        StepRun::Completed(StepReport {
            record: StepRecord {
                node,
                attempt,
                started_at,
                finished_at: Utc::now(),
                outcome,
            },
            produced,
        })
    }
}

/// Resolves when the cancellation flag flips to `true`; pends forever if the
/// sender is dropped without firing.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
