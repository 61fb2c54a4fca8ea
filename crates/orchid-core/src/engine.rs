//! The workflow graph engine.
//!
//! The graph is fixed: `pending → plan → build → critique → verify →
//! succeeded`, with bounded rework edges back to `build` on critique
//! rejection or verification failure. It is encoded as a static transition
//! function over tagged enums, not a traversed graph structure, so the state
//! machine is checkable by `match` exhaustiveness.
//!
//! The engine persists the full `WorkflowState` after every transition,
//! synchronously, before taking any further action. A persistence conflict
//! always means "someone else is driving this run" and makes the current
//! driver step aside.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{warn, Instrument};

use orchid_state::{
    RunId, RunStatus, StepOutcome, StepRecord, Task, TerminalReason, WorkflowNode, WorkflowState,
    WorkflowStore,
};

use crate::error::{OrchidError, Result};
use crate::executor::{StepExecutor, StepRun};
use crate::lease::LeaseRegistry;
use crate::obs;
use crate::reward::RewardSink;
use crate::role::RoleRegistry;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a single role invocation.
    pub node_deadline: Duration,
    /// Capacity of the reward queue.
    pub reward_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_deadline: Duration::from_secs(60),
            reward_capacity: 64,
        }
    }
}

/// Normalized judgment carried by critique/verify artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Judgment {
    /// Critique "accept" or verify "pass".
    Accept,
    /// Critique "reject" or verify "fail"; routes back to build.
    Reject,
}

/// Where the state machine goes after one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    /// Move to the next node in the pipeline.
    Advance(WorkflowNode),
    /// Route back to build, carrying the critique/report as context.
    Rework,
    /// Re-invoke the same node (bound re-checked against the retry budget).
    Retry,
    /// Terminal success.
    Succeed,
    /// Terminal failure, no retry.
    FailFatal(String),
}

/// The static transition table: node × outcome (× judgment) → next.
pub fn next_transition(
    node: WorkflowNode,
    outcome: &StepOutcome,
    judgment: Option<Judgment>,
) -> StepDecision {
    match outcome {
        StepOutcome::FatalFailure { reason } => StepDecision::FailFatal(reason.clone()),
        StepOutcome::RetryableFailure { .. } => StepDecision::Retry,
        StepOutcome::Success { .. } => match node {
            WorkflowNode::Plan => StepDecision::Advance(WorkflowNode::Build),
            WorkflowNode::Build => StepDecision::Advance(WorkflowNode::Critique),
            WorkflowNode::Critique => match judgment {
                Some(Judgment::Accept) => StepDecision::Advance(WorkflowNode::Verify),
                Some(Judgment::Reject) => StepDecision::Rework,
                // Malformed-but-correctable output: retry the node.
                None => StepDecision::Retry,
            },
            WorkflowNode::Verify => match judgment {
                Some(Judgment::Accept) => StepDecision::Succeed,
                Some(Judgment::Reject) => StepDecision::Rework,
                None => StepDecision::Retry,
            },
        },
    }
}

/// Extract the judgment field from a critique or verification artifact.
///
/// Critique artifacts carry `{"judgment": "accept"|"reject"}`; verification
/// reports carry `{"verdict": "pass"|"fail"}`. Anything else is `None`.
pub fn judgment_of(node: WorkflowNode, value: &serde_json::Value) -> Option<Judgment> {
    match node {
        WorkflowNode::Critique => match value.get("judgment")?.as_str()? {
            "accept" => Some(Judgment::Accept),
            "reject" => Some(Judgment::Reject),
            _ => None,
        },
        WorkflowNode::Verify => match value.get("verdict")?.as_str()? {
            "pass" => Some(Judgment::Accept),
            "fail" => Some(Judgment::Reject),
            _ => None,
        },
        WorkflowNode::Plan | WorkflowNode::Build => None,
    }
}

/// Read-only projection of a run for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub run_id: String,
    pub status: RunStatus,
    pub current_node: Option<WorkflowNode>,
    pub terminal_reason: Option<TerminalReason>,
    pub attempt_counts: BTreeMap<String, u32>,
    pub steps: usize,
    pub artifacts: BTreeMap<String, serde_json::Value>,
    /// Most recent step records, newest last.
    pub recent_history: Vec<StepRecord>,
    pub updated_at: DateTime<Utc>,
}

impl RunStatusView {
    const RECENT: usize = 5;

    fn project(state: &WorkflowState) -> Self {
        let skip = state.history.len().saturating_sub(Self::RECENT);
        Self {
            run_id: state.run_id.to_string(),
            status: state.status,
            current_node: state.current_node,
            terminal_reason: state.terminal_reason.clone(),
            attempt_counts: state.attempt_counts.clone(),
            steps: state.history.len(),
            artifacts: state.artifacts.clone(),
            recent_history: state.history[skip..].to_vec(),
            updated_at: state.updated_at,
        }
    }
}

/// Drives runs through the fixed workflow graph.
///
/// One engine serves many concurrent runs; within a run, execution is
/// strictly sequential under the run's exclusive lease.
pub struct GraphEngine {
    store: Arc<dyn WorkflowStore>,
    registry: RoleRegistry,
    executor: StepExecutor,
    leases: LeaseRegistry,
    reward: Option<RewardSink>,
    config: EngineConfig,
}

impl GraphEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, registry: RoleRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            executor: StepExecutor::new(config.node_deadline),
            leases: LeaseRegistry::new(),
            reward: None,
            config,
        }
    }

    /// Attach the reward sink fed on terminal outcomes.
    pub fn with_reward_sink(mut self, sink: RewardSink) -> Self {
        self.reward = Some(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub(crate) fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    /// Accept a task: create and persist the pending run.
    ///
    /// Synchronous acknowledgement only; no execution happens until
    /// [`GraphEngine::drive`] is called for the returned id. Rejects
    /// submission when the registry leaves any node unbound.
    pub async fn submit(&self, task: Task) -> Result<RunId> {
        if let Some(node) = self.registry.unbound_nodes().first().copied() {
            return Err(OrchidError::MissingRole { node });
        }
        let run_id = RunId::new();
        let state = WorkflowState::new(run_id.clone(), task);
        self.store.create(&state).await?;
        obs::emit_run_submitted(run_id.as_str(), &state.task.goal);
        Ok(run_id)
    }

    /// Read-only status projection for a run.
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusView> {
        let state = self.store.load(run_id).await?;
        Ok(RunStatusView::project(&state))
    }

    /// Drive a run to a terminal state under its exclusive lease.
    ///
    /// `cancel` is the external abort request channel: flipping it to `true`
    /// aborts the run at the next safe point, interrupting an in-flight role
    /// invocation through the executor's race.
    pub async fn drive(
        &self,
        run_id: &RunId,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkflowState> {
        let _guard = self
            .leases
            .try_acquire(run_id)
            .ok_or_else(|| OrchidError::LeaseHeld {
                run_id: run_id.clone(),
            })?;
        self.drive_locked(run_id, cancel).await
    }

    /// Drive loop body; the caller must hold the run's lease.
    ///
    /// The run span is attached via `Instrument` so the returned future
    /// stays `Send` and can be spawned onto the runtime.
    pub(crate) async fn drive_locked(
        &self,
        run_id: &RunId,
        cancel: watch::Receiver<bool>,
    ) -> Result<WorkflowState> {
        let span = obs::run_span(run_id.as_str());
        self.drive_loop(run_id, cancel).instrument(span).await
    }

    async fn drive_loop(
        &self,
        run_id: &RunId,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<WorkflowState> {
        let mut state = self.store.load(run_id).await?;

        // Driving a finished run is a no-op, not an error.
        if state.is_terminal() {
            return Ok(state);
        }

        if state.status == RunStatus::Pending {
            state.status = RunStatus::Running;
            state.current_node = Some(WorkflowNode::Plan);
            state.touch();
            self.persist(&mut state).await?;
        }

        loop {
            if *cancel.borrow() {
                return self.finish(state, RunStatus::Aborted, TerminalReason::Cancelled).await;
            }

            if let Some(budget) = self.exceeded_budget(&state) {
                return self
                    .finish(
                        state,
                        RunStatus::Failed,
                        TerminalReason::BudgetExceeded { budget },
                    )
                    .await;
            }

            let node = state.current_node.ok_or_else(|| OrchidError::InvalidState {
                run_id: run_id.clone(),
                detail: "running with no current node".to_string(),
            })?;

            if state.attempts(node) >= state.task.max_attempts_per_node() {
                return self
                    .finish(
                        state,
                        RunStatus::Failed,
                        TerminalReason::RetriesExhausted { node },
                    )
                    .await;
            }

            let Some(role) = self.registry.role_for(node) else {
                return self
                    .finish(
                        state,
                        RunStatus::Failed,
                        TerminalReason::Fatal {
                            node,
                            detail: "no role bound for node".to_string(),
                        },
                    )
                    .await;
            };

            // The attempt is only counted once a record exists for it: a
            // cancelled invocation leaves no history entry and must not
            // leave a dangling counter either.
            let attempt = state.attempts(node) + 1;
            obs::emit_node_entered(run_id.as_str(), node.as_str(), attempt);

            let report = match self
                .executor
                .run(role, node, &state, attempt, &mut cancel)
                .await
            {
                StepRun::Cancelled => {
                    return self
                        .finish(state, RunStatus::Aborted, TerminalReason::Cancelled)
                        .await;
                }
                StepRun::Completed(report) => report,
            };
            state.begin_attempt(node);

            let outcome_label = match &report.record.outcome {
                StepOutcome::Success { .. } => "success",
                StepOutcome::RetryableFailure { .. } => "retryable_failure",
                StepOutcome::FatalFailure { .. } => "fatal_failure",
            };
            obs::emit_step_finished(run_id.as_str(), node.as_str(), attempt, outcome_label);

            let judgment = report
                .produced
                .as_ref()
                .and_then(|(_, value)| judgment_of(node, value));
            if report.record.outcome.is_success()
                && judgment.is_none()
                && matches!(node, WorkflowNode::Critique | WorkflowNode::Verify)
            {
                warn!(run_id = %run_id, node = %node, "artifact carries no readable judgment, retrying node");
            }

            let decision = next_transition(node, &report.record.outcome, judgment);
            let produced_value = report.produced.map(|(_, value)| value);
            state.record_step(report.record, produced_value);

            match decision {
                StepDecision::Advance(next) => state.current_node = Some(next),
                StepDecision::Rework => state.current_node = Some(WorkflowNode::Build),
                StepDecision::Retry => {}
                StepDecision::Succeed => {
                    return self
                        .finish(state, RunStatus::Succeeded, TerminalReason::Completed)
                        .await;
                }
                StepDecision::FailFatal(detail) => {
                    return self
                        .finish(
                            state,
                            RunStatus::Failed,
                            TerminalReason::Fatal { node, detail },
                        )
                        .await;
                }
            }

            self.persist(&mut state).await?;
        }
    }

    /// Which global budget, if any, the run has exceeded.
    fn exceeded_budget(&self, state: &WorkflowState) -> Option<String> {
        let constraints = &state.task.constraints;
        if state.history.len() as u32 >= constraints.max_steps {
            return Some("steps".to_string());
        }
        let elapsed = (Utc::now() - state.created_at).to_std().unwrap_or_default();
        if elapsed > constraints.max_wall_clock {
            return Some("wall_clock".to_string());
        }
        None
    }

    /// Apply a terminal transition, persist it, and feed the reward sink.
    pub(crate) async fn finish(
        &self,
        mut state: WorkflowState,
        status: RunStatus,
        reason: TerminalReason,
    ) -> Result<WorkflowState> {
        state.finish(status, reason);
        self.persist(&mut state).await?;
        obs::emit_run_finished(
            state.run_id.as_str(),
            &state.status.to_string(),
            state.history.len(),
        );
        if let Some(sink) = &self.reward {
            sink.publish(&state);
        }
        Ok(state)
    }

    /// Synchronous save on the critical path; adopts the new version.
    ///
    /// A conflict means another driver saved this run since we loaded it;
    /// we abandon the transition rather than force-overwrite.
    async fn persist(&self, state: &mut WorkflowState) -> Result<()> {
        match self.store.save(state).await {
            Ok(version) => {
                state.version = version;
                Ok(())
            }
            Err(e) => {
                let err: OrchidError = e.into();
                if err.is_contention() {
                    warn!(run_id = %state.run_id, "persistence conflict, stepping aside");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchid_state::ArtifactRef;
    use serde_json::json;

    fn success() -> StepOutcome {
        StepOutcome::Success {
            artifact: ArtifactRef::for_value("plan", &json!([])).unwrap(),
        }
    }

    #[test]
    fn pipeline_advances_in_order() {
        assert_eq!(
            next_transition(WorkflowNode::Plan, &success(), None),
            StepDecision::Advance(WorkflowNode::Build)
        );
        assert_eq!(
            next_transition(WorkflowNode::Build, &success(), None),
            StepDecision::Advance(WorkflowNode::Critique)
        );
        assert_eq!(
            next_transition(WorkflowNode::Critique, &success(), Some(Judgment::Accept)),
            StepDecision::Advance(WorkflowNode::Verify)
        );
        assert_eq!(
            next_transition(WorkflowNode::Verify, &success(), Some(Judgment::Accept)),
            StepDecision::Succeed
        );
    }

    #[test]
    fn rejection_routes_back_to_build() {
        assert_eq!(
            next_transition(WorkflowNode::Critique, &success(), Some(Judgment::Reject)),
            StepDecision::Rework
        );
        assert_eq!(
            next_transition(WorkflowNode::Verify, &success(), Some(Judgment::Reject)),
            StepDecision::Rework
        );
    }

    #[test]
    fn failures_follow_the_taxonomy() {
        let retryable = StepOutcome::RetryableFailure {
            reason: "timeout".to_string(),
        };
        let fatal = StepOutcome::FatalFailure {
            reason: "bad config".to_string(),
        };
        for node in WorkflowNode::all() {
            assert_eq!(next_transition(*node, &retryable, None), StepDecision::Retry);
            assert!(matches!(
                next_transition(*node, &fatal, None),
                StepDecision::FailFatal(_)
            ));
        }
    }

    #[test]
    fn malformed_judgment_retries_the_node() {
        assert_eq!(
            next_transition(WorkflowNode::Critique, &success(), None),
            StepDecision::Retry
        );
        assert_eq!(
            next_transition(WorkflowNode::Verify, &success(), None),
            StepDecision::Retry
        );
    }

    #[test]
    fn judgment_parsing_reads_node_specific_fields() {
        assert_eq!(
            judgment_of(WorkflowNode::Critique, &json!({"judgment": "accept"})),
            Some(Judgment::Accept)
        );
        assert_eq!(
            judgment_of(WorkflowNode::Critique, &json!({"judgment": "reject"})),
            Some(Judgment::Reject)
        );
        assert_eq!(
            judgment_of(WorkflowNode::Verify, &json!({"verdict": "pass"})),
            Some(Judgment::Accept)
        );
        assert_eq!(
            judgment_of(WorkflowNode::Verify, &json!({"verdict": "fail"})),
            Some(Judgment::Reject)
        );
        assert_eq!(judgment_of(WorkflowNode::Verify, &json!({"verdict": 7})), None);
        assert_eq!(judgment_of(WorkflowNode::Plan, &json!({"judgment": "accept"})), None);
    }
}
