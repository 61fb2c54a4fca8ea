//! Deterministic scripted roles.
//!
//! `ScriptedRole` plays back a pre-programmed sequence of results, repeating
//! the final entry once the script is drained. The CLI demo and the engine
//! tests both drive the graph with these.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use orchid_state::{Task, WorkflowNode};

use crate::role::{ArtifactsView, Role, RoleResult};

/// A role whose results are a canned queue.
pub struct ScriptedRole {
    script: Mutex<ScriptState>,
    /// Simulated work time per invocation; the deadline race applies to it.
    delay: Duration,
}

struct ScriptState {
    results: Vec<RoleResult>,
    next: usize,
}

impl ScriptedRole {
    /// Play `results` in order; the last entry repeats forever.
    pub fn new(results: Vec<RoleResult>) -> Self {
        assert!(!results.is_empty(), "script must have at least one result");
        Self {
            script: Mutex::new(ScriptState { results, next: 0 }),
            delay: Duration::ZERO,
        }
    }

    /// A role that always produces the same artifact value for `node`.
    pub fn producing(node: WorkflowNode, value: serde_json::Value) -> Self {
        Self::new(vec![RoleResult::Produced {
            name: node.artifact_name().to_string(),
            value,
        }])
    }

    /// A role that always reports a retryable failure.
    pub fn always_retryable(reason: &str) -> Self {
        Self::new(vec![RoleResult::RetryableFailure {
            reason: reason.to_string(),
        }])
    }

    /// Sleep this long inside each invocation before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Invocations consumed so far.
    pub fn invocations(&self) -> usize {
        self.script.lock().unwrap().next
    }

    fn next_result(&self) -> RoleResult {
        let mut state = self.script.lock().unwrap();
        let idx = state.next.min(state.results.len() - 1);
        state.next += 1;
        state.results[idx].clone()
    }
}

#[async_trait]
impl Role for ScriptedRole {
    async fn invoke(
        &self,
        _task: &Task,
        _artifacts: &ArtifactsView,
        _deadline: Duration,
    ) -> RoleResult {
        if self.delay > Duration::ZERO {
            tokio::time::sleep(self.delay).await;
        }
        self.next_result()
    }
}
