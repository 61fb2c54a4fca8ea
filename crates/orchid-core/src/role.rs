//! Role contract: the uniform capability shape every node is bound to.
//!
//! A role is a pure function-shaped unit over `(Task, artifacts view,
//! deadline) -> RoleResult`. The concrete backend (model call, static
//! analysis tool, test runner) is pluggable and selected by node name
//! through the [`RoleRegistry`]; the engine never knows what a role does,
//! only which variant it returned.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use orchid_state::{Task, WorkflowNode};

use crate::error::{OrchidError, Result};

/// Typed result of one role invocation.
///
/// Roles must be side-effect-idempotent under retry: invoking the same node
/// twice with the same inputs is safe, and artifact values are
/// last-write-wins.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleResult {
    /// The role produced its artifact.
    Produced {
        name: String,
        value: serde_json::Value,
    },
    /// Transient failure, retried up to the node's budget.
    RetryableFailure { reason: String },
    /// Unrecoverable failure, ends the run immediately.
    FatalFailure { reason: String },
}

/// Read-only projection of the artifacts a node declared a dependency on.
///
/// Roles never see `history` or `attempt_counts`; only the engine does.
#[derive(Debug, Clone)]
pub struct ArtifactsView {
    entries: BTreeMap<String, serde_json::Value>,
}

impl ArtifactsView {
    /// Project the declared-dependency subset for `node` out of the run's
    /// artifact map. A missing dependency is a configuration bug, reported
    /// as [`OrchidError::MissingDependency`].
    ///
    /// Feedback context (the critique or verification report that routed a
    /// rework back to build) is included when present and skipped when not;
    /// only the declared dependencies are mandatory.
    pub fn project(
        artifacts: &BTreeMap<String, serde_json::Value>,
        node: WorkflowNode,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for dep in node.dependencies() {
            let name = dep.artifact_name();
            let value = artifacts
                .get(name)
                .ok_or_else(|| OrchidError::MissingDependency {
                    node,
                    artifact: name.to_string(),
                })?;
            entries.insert(name.to_string(), value.clone());
        }
        for name in node.context_artifacts() {
            if let Some(value) = artifacts.get(*name) {
                entries.insert((*name).to_string(), value.clone());
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The capability every role implements.
///
/// A role must honor `deadline`: the executor cancels (not merely warns) an
/// invocation that does not return in time, and the cancellation surfaces as
/// `RetryableFailure("timeout")`.
#[async_trait]
pub trait Role: Send + Sync {
    async fn invoke(
        &self,
        task: &Task,
        artifacts: &ArtifactsView,
        deadline: Duration,
    ) -> RoleResult;
}

/// Node-to-role binding table.
///
/// A registry missing a binding for a node the graph reaches is a
/// configuration error and fails the run fatally.
#[derive(Default, Clone)]
pub struct RoleRegistry {
    roles: BTreeMap<WorkflowNode, Arc<dyn Role>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `role` to `node`, replacing any previous binding.
    pub fn bind(mut self, node: WorkflowNode, role: Arc<dyn Role>) -> Self {
        self.roles.insert(node, role);
        self
    }

    pub fn role_for(&self, node: WorkflowNode) -> Option<Arc<dyn Role>> {
        self.roles.get(&node).cloned()
    }

    /// Nodes with no binding, useful for validating a registry up front.
    pub fn unbound_nodes(&self) -> Vec<WorkflowNode> {
        WorkflowNode::all()
            .iter()
            .copied()
            .filter(|n| !self.roles.contains_key(n))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_includes_only_declared_dependencies() {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("plan".to_string(), json!(["step"]));
        artifacts.insert("patch".to_string(), json!({"diff": "+x"}));
        artifacts.insert("critique".to_string(), json!({"judgment": "accept"}));

        let view = ArtifactsView::project(&artifacts, WorkflowNode::Verify).unwrap();
        assert!(view.get("patch").is_some());
        assert!(view.get("plan").is_none());
        assert!(view.get("critique").is_none());
    }

    #[test]
    fn project_fails_fast_on_missing_dependency() {
        let artifacts = BTreeMap::new();
        let err = ArtifactsView::project(&artifacts, WorkflowNode::Build).unwrap_err();
        assert!(matches!(
            err,
            OrchidError::MissingDependency {
                node: WorkflowNode::Build,
                ..
            }
        ));
    }

    #[test]
    fn build_view_carries_rework_feedback_when_present() {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("plan".to_string(), json!(["step"]));
        artifacts.insert(
            "critique".to_string(),
            json!({"judgment": "reject", "notes": "missing tests"}),
        );
        artifacts.insert(
            "verification_report".to_string(),
            json!({"verdict": "fail", "detail": "2 tests red"}),
        );

        let view = ArtifactsView::project(&artifacts, WorkflowNode::Build).unwrap();
        assert!(view.get("plan").is_some());
        assert!(view.get("critique").is_some());
        assert!(view.get("verification_report").is_some());
    }

    #[test]
    fn absent_feedback_does_not_fail_the_build_view() {
        // First pass through build: no critique or report exists yet.
        let mut artifacts = BTreeMap::new();
        artifacts.insert("plan".to_string(), json!(["step"]));

        let view = ArtifactsView::project(&artifacts, WorkflowNode::Build).unwrap();
        assert!(view.get("plan").is_some());
        assert!(view.get("critique").is_none());
        assert!(view.get("verification_report").is_none());
    }

    #[test]
    fn plan_has_an_empty_view() {
        let view = ArtifactsView::project(&BTreeMap::new(), WorkflowNode::Plan).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn registry_reports_unbound_nodes() {
        let registry = RoleRegistry::new();
        assert_eq!(registry.unbound_nodes().len(), 4);
    }
}
