//! Sweeping stale runs: resume, abandon, and skip paths.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use orchid_core::{
    EngineConfig, GraphEngine, OrchidError, RecoveryManager, RecoveryOutcome, RoleRegistry,
    ScriptedRole,
};
use orchid_state::{
    MemoryWorkflowStore, RunId, RunStatus, Task, TaskBudget, TerminalReason, WorkflowNode,
    WorkflowState, WorkflowStore,
};

const THRESHOLD: Duration = Duration::from_secs(120);

fn clean_registry() -> RoleRegistry {
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
            Arc::new(ScriptedRole::producing(WorkflowNode::Verify, json!({"verdict": "pass"}))),
        )
}

/// A run whose driver died mid-flight an hour ago, parked at `node`.
fn crashed_run(node: WorkflowNode, node_attempts: u32) -> WorkflowState {
    let task = Task::new("recover me").with_budget(TaskBudget {
        max_retries_per_node: 2,
        max_steps: 32,
        max_wall_clock: Duration::from_secs(24 * 3600),
    });
    let mut state = WorkflowState::new(RunId::new(), task);
    state.status = RunStatus::Running;
    state.current_node = Some(node);
    if node != WorkflowNode::Plan {
        state
            .artifacts
            .insert("plan".to_string(), json!(["outline"]));
        state.attempt_counts.insert("plan".to_string(), 1);
    }
    if node_attempts > 0 {
        state
            .attempt_counts
            .insert(node.as_str().to_string(), node_attempts);
    }
    let old = Utc::now() - chrono::Duration::hours(1);
    state.created_at = old;
    state.updated_at = old;
    state
}

fn setup(registry: RoleRegistry) -> (Arc<MemoryWorkflowStore>, Arc<GraphEngine>, RecoveryManager) {
    let store = Arc::new(MemoryWorkflowStore::new());
    let engine = Arc::new(GraphEngine::new(
        store.clone(),
        registry,
        EngineConfig::default(),
    ));
    let recovery = RecoveryManager::new(engine.clone(), THRESHOLD).unwrap();
    (store, engine, recovery)
}

#[tokio::test]
async fn sweep_resumes_a_stale_run_to_completion() {
    let (store, _engine, recovery) = setup(clean_registry());
    let crashed = crashed_run(WorkflowNode::Build, 0);
    let run_id = crashed.run_id.clone();
    store.create(&crashed).await.unwrap();

    // Spawned so a periodic sweeper task can own it; the future must be Send.
    let recovery = Arc::new(recovery);
    let report = tokio::spawn({
        let recovery = recovery.clone();
        async move { recovery.sweep().await }
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.examined, 1);
    assert_eq!(report.resumed(), 1);
    assert!(matches!(
        report.outcomes[0].1,
        RecoveryOutcome::Resumed {
            status: RunStatus::Succeeded
        }
    ));

    let stored = store.load(&run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);
    // Resumed from build: build, critique, verify appended.
    assert_eq!(stored.history.len(), 3);
}

#[tokio::test]
async fn sweep_abandons_a_run_with_no_attempts_left() {
    let (store, _engine, recovery) = setup(clean_registry());
    let crashed = crashed_run(WorkflowNode::Build, 3);
    let run_id = crashed.run_id.clone();
    store.create(&crashed).await.unwrap();

    let report = recovery.sweep().await.unwrap();

    assert_eq!(report.abandoned(), 1);
    let stored = store.load(&run_id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.terminal_reason, Some(TerminalReason::Abandoned));
}

#[tokio::test]
async fn sweep_ignores_fresh_and_terminal_runs() {
    let (store, _engine, recovery) = setup(clean_registry());

    let mut fresh = crashed_run(WorkflowNode::Build, 0);
    fresh.updated_at = Utc::now();
    store.create(&fresh).await.unwrap();

    let mut done = crashed_run(WorkflowNode::Verify, 1);
    done.finish(RunStatus::Succeeded, TerminalReason::Completed);
    let done_updated = Utc::now() - chrono::Duration::hours(1);
    done.updated_at = done_updated;
    store.create(&done).await.unwrap();

    let report = recovery.sweep().await.unwrap();
    assert_eq!(report.examined, 0);
}

#[tokio::test]
async fn threshold_must_exceed_the_node_deadline() {
    let store = Arc::new(MemoryWorkflowStore::new());
    let engine = Arc::new(GraphEngine::new(
        store,
        clean_registry(),
        EngineConfig::default(),
    ));
    // Default node deadline is 60s.
    let err = RecoveryManager::new(engine, Duration::from_secs(10)).unwrap_err();
    assert!(matches!(err, OrchidError::ThresholdTooShort { .. }));
}

#[tokio::test(start_paused = true)]
async fn sweep_skips_a_run_with_a_live_driver() {
    let registry = clean_registry().bind(
        WorkflowNode::Build,
        Arc::new(
            ScriptedRole::producing(WorkflowNode::Build, json!({"diff": "slow"}))
                .with_delay(Duration::from_secs(30)),
        ),
    );
    let (store, engine, recovery) = setup(registry);
    let crashed = crashed_run(WorkflowNode::Build, 0);
    let run_id = crashed.run_id.clone();
    store.create(&crashed).await.unwrap();

    // A driver adopts the run and blocks inside the slow build.
    let (tx, rx) = watch::channel(false);
    let driver = {
        let engine = engine.clone();
        let run_id = run_id.clone();
        tokio::spawn(async move { engine.drive(&run_id, rx).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = recovery.sweep().await.unwrap();
    assert_eq!(report.examined, 1);
    assert!(matches!(
        report.outcomes[0].1,
        RecoveryOutcome::Skipped { .. }
    ));

    tx.send(true).unwrap();
    let state = driver.await.unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Aborted);
}
