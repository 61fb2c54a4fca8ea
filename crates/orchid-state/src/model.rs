//! The durable workflow run model.
//!
//! `WorkflowState` is the single mutable record of one run: where it is in
//! the graph, what each role invocation did, and which artifacts exist.
//! Everything here serializes to one JSON document per run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// Budget constraints attached to a task at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskBudget {
    /// Maximum retries per node beyond the initial attempt.
    pub max_retries_per_node: u32,
    /// Maximum total role invocations across the run.
    pub max_steps: u32,
    /// Maximum wall-clock for the whole run, measured from creation.
    pub max_wall_clock: std::time::Duration,
}

impl Default for TaskBudget {
    fn default() -> Self {
        Self {
            max_retries_per_node: 2,
            max_steps: 32,
            max_wall_clock: std::time::Duration::from_secs(600),
        }
    }
}

/// Immutable input to a run. Created by the caller, persisted with the run
/// document, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: uuid::Uuid,
    pub goal: String,
    pub constraints: TaskBudget,
}

impl Task {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4(),
            goal: goal.into(),
            constraints: TaskBudget::default(),
        }
    }

    pub fn with_budget(mut self, constraints: TaskBudget) -> Self {
        self.constraints = constraints;
        self
    }

    /// Attempts allowed per node: the initial try plus the retry budget.
    pub fn max_attempts_per_node(&self) -> u32 {
        self.constraints.max_retries_per_node + 1
    }
}

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId.
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The four stages of the fixed workflow graph.
///
/// The topology is a linear pipeline with bounded rework edges back to
/// `Build`; it is not a user-programmable DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowNode {
    Plan,
    Build,
    Critique,
    Verify,
}

impl WorkflowNode {
    /// Stable string form, used as the key in `attempt_counts`.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowNode::Plan => "plan",
            WorkflowNode::Build => "build",
            WorkflowNode::Critique => "critique",
            WorkflowNode::Verify => "verify",
        }
    }

    /// Logical name of the artifact this node produces.
    pub fn artifact_name(&self) -> &'static str {
        match self {
            WorkflowNode::Plan => "plan",
            WorkflowNode::Build => "patch",
            WorkflowNode::Critique => "critique",
            WorkflowNode::Verify => "verification_report",
        }
    }

    /// Artifacts this node declares a read dependency on.
    ///
    /// A missing dependency at invocation time is a configuration bug, not a
    /// retryable condition.
    pub fn dependencies(&self) -> &'static [WorkflowNode] {
        match self {
            WorkflowNode::Plan => &[],
            WorkflowNode::Build => &[WorkflowNode::Plan],
            WorkflowNode::Critique => &[WorkflowNode::Plan, WorkflowNode::Build],
            WorkflowNode::Verify => &[WorkflowNode::Build],
        }
    }

    /// Feedback artifacts a node reads when they exist.
    ///
    /// A build re-entry after a critique rejection or a verification
    /// failure carries the judgment that routed it back; on the first pass
    /// these artifacts are simply absent, which is not an error.
    pub fn context_artifacts(&self) -> &'static [&'static str] {
        match self {
            WorkflowNode::Build => &["critique", "verification_report"],
            WorkflowNode::Plan | WorkflowNode::Critique | WorkflowNode::Verify => &[],
        }
    }

    /// All nodes in pipeline order.
    pub fn all() -> &'static [WorkflowNode] {
        &[
            WorkflowNode::Plan,
            WorkflowNode::Build,
            WorkflowNode::Critique,
            WorkflowNode::Verify,
        ]
    }
}

impl std::fmt::Display for WorkflowNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Terminal states are immutable; the store rejects further saves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Why a run reached its terminal status.
///
/// Callers can distinguish "gave up after retries" from "lost and never
/// resumed"; `Abandoned` is only ever set by the recovery sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    RetriesExhausted { node: WorkflowNode },
    Fatal { node: WorkflowNode, detail: String },
    BudgetExceeded { budget: String },
    Abandoned,
    Cancelled,
}

/// Reference to an artifact produced by a step: its logical name plus a
/// SHA-256 digest of the serialized value, for audit and tamper detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub digest: String,
}

impl ArtifactRef {
    /// Build a reference for a produced artifact value.
    pub fn for_value(name: &str, value: &serde_json::Value) -> StorageResult<Self> {
        use sha2::Digest as _;
        let bytes = serde_json::to_vec(value)?;
        Ok(Self {
            name: name.to_string(),
            digest: hex::encode(sha2::Sha256::digest(&bytes)),
        })
    }
}

/// Outcome of a single role invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { artifact: ArtifactRef },
    RetryableFailure { reason: String },
    FatalFailure { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

/// One role invocation, immutable once appended to `history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub node: WorkflowNode,
    /// 1-based attempt number for this node.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
}

/// The durable record of one workflow run.
///
/// Mutated exclusively by the graph engine and the recovery manager, under
/// the run's lease; immutable once `status` is terminal. `version` is the
/// optimistic-concurrency counter bumped by every successful save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub run_id: RunId,
    /// The immutable task this run executes.
    pub task: Task,
    pub status: RunStatus,
    /// The node the run is at; `None` once terminal.
    pub current_node: Option<WorkflowNode>,
    pub terminal_reason: Option<TerminalReason>,
    /// Append-only record of every role invocation.
    pub history: Vec<StepRecord>,
    /// Last produced value per logical artifact name (last-write-wins).
    pub artifacts: BTreeMap<String, serde_json::Value>,
    /// Attempts used so far, keyed by node name.
    pub attempt_counts: BTreeMap<String, u32>,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last persisted mutation; the recovery sweep uses
    /// this to detect runs whose driver died mid-transition.
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl WorkflowState {
    /// Fresh pending state for a newly submitted run.
    pub fn new(run_id: RunId, task: Task) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            task,
            status: RunStatus::Pending,
            current_node: None,
            terminal_reason: None,
            history: Vec::new(),
            artifacts: BTreeMap::new(),
            attempt_counts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempts used so far for `node`.
    pub fn attempts(&self, node: WorkflowNode) -> u32 {
        self.attempt_counts.get(node.as_str()).copied().unwrap_or(0)
    }

    /// Increment and return the attempt counter for `node`.
    pub fn begin_attempt(&mut self, node: WorkflowNode) -> u32 {
        let count = self.attempt_counts.entry(node.as_str().to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Append a step record and, on success, replace the artifact value.
    pub fn record_step(&mut self, record: StepRecord, artifact_value: Option<serde_json::Value>) {
        if let (StepOutcome::Success { artifact }, Some(value)) = (&record.outcome, artifact_value)
        {
            self.artifacts.insert(artifact.name.clone(), value);
        }
        self.history.push(record);
        self.touch();
    }

    /// Mark the run terminal. The status/reason pair is final.
    pub fn finish(&mut self, status: RunStatus, reason: TerminalReason) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.terminal_reason = Some(reason);
        self.current_node = None;
        self.touch();
    }

    /// Refresh `updated_at` after a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
