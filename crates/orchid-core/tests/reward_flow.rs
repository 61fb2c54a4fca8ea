//! Reward emission on terminal outcomes, off the orchestration path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use orchid_core::{
    EngineConfig, GraphEngine, RewardDelivery, RewardSignal, RewardSink, RoleRegistry, RoleResult,
    ScriptedRole,
};
use orchid_state::{MemoryWorkflowStore, RunStatus, Task, WorkflowNode};

/// Forwards each delivered signal to the test over a channel.
struct ChannelDelivery {
    tx: mpsc::UnboundedSender<RewardSignal>,
}

#[async_trait]
impl RewardDelivery for ChannelDelivery {
    async fn deliver(&self, signal: RewardSignal) -> anyhow::Result<()> {
        self.tx
            .send(signal)
            .map_err(|_| anyhow::anyhow!("test receiver dropped"))
    }
}

/// Fails every delivery.
struct BrokenDelivery;

#[async_trait]
impl RewardDelivery for BrokenDelivery {
    async fn deliver(&self, _signal: RewardSignal) -> anyhow::Result<()> {
        anyhow::bail!("learning backend offline")
    }
}

fn registry_with_flaky_verify() -> RoleRegistry {
    RoleRegistry::new()
        .bind(
            WorkflowNode::Plan,
            Arc::new(ScriptedRole::producing(WorkflowNode::Plan, json!(["outline"]))),
        )
        .bind(
            WorkflowNode::Build,
            Arc::new(ScriptedRole::producing(WorkflowNode::Build, json!({"diff": "+x"}))),
        )
        .bind(
            WorkflowNode::Critique,
            Arc::new(ScriptedRole::producing(WorkflowNode::Critique, json!({"judgment": "accept"}))),
        )
        .bind(
            WorkflowNode::Verify,
            Arc::new(ScriptedRole::new(vec![
                RoleResult::Produced {
                    name: "verification_report".to_string(),
                    value: json!({"verdict": "fail"}),
                },
                RoleResult::Produced {
                    name: "verification_report".to_string(),
                    value: json!({"verdict": "pass"}),
                },
            ])),
        )
}

#[tokio::test]
async fn terminal_run_emits_one_structured_signal() {
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let sink = RewardSink::spawn(Arc::new(ChannelDelivery { tx: signal_tx }), 8);

    let store = Arc::new(MemoryWorkflowStore::new());
    let engine = GraphEngine::new(store, registry_with_flaky_verify(), EngineConfig::default())
        .with_reward_sink(sink);

    let run_id = engine.submit(Task::new("reward me")).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    engine.drive(&run_id, rx).await.unwrap();

    let signal = tokio::time::timeout(Duration::from_secs(5), signal_rx.recv())
        .await
        .expect("signal within timeout")
        .expect("sink consumer alive");

    assert_eq!(signal.run_id, run_id.to_string());
    assert!(signal.success);
    assert_eq!(signal.status, RunStatus::Succeeded);
    assert_eq!(signal.steps, 7);
    // One verify failure means build ran twice: one rework.
    assert_eq!(signal.build_reworks, 1);
    assert_eq!(signal.attempt_counts.get("build"), Some(&2));

    // Exactly one signal per terminal run.
    assert!(signal_rx.try_recv().is_err());
}

#[tokio::test]
async fn delivery_failure_never_changes_the_run_outcome() {
    let sink = RewardSink::spawn(Arc::new(BrokenDelivery), 8);
    let store = Arc::new(MemoryWorkflowStore::new());
    let engine = GraphEngine::new(store, registry_with_flaky_verify(), EngineConfig::default())
        .with_reward_sink(sink);

    let run_id = engine.submit(Task::new("lossy reward")).await.unwrap();
    let (_tx, rx) = watch::channel(false);
    let state = engine.drive(&run_id, rx).await.unwrap();

    assert_eq!(state.status, RunStatus::Succeeded);
}
