//! Terminal-outcome reward signal, decoupled from the critical path.
//!
//! The engine publishes `(task, terminal state)` onto a bounded queue and
//! moves on; a consumer task computes the structured signal and hands it to
//! a pluggable [`RewardDelivery`] collaborator. Delivery failures are logged
//! and dropped: they never change a run's outcome and never apply
//! backpressure to orchestration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use orchid_state::{RunStatus, TerminalReason, WorkflowNode, WorkflowState};

use crate::obs;

/// Structured learning signal derived from one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardSignal {
    pub run_id: String,
    pub task_id: uuid::Uuid,
    pub goal: String,
    pub success: bool,
    pub status: RunStatus,
    pub terminal_reason: Option<TerminalReason>,
    /// Total role invocations across the run.
    pub steps: u32,
    pub attempt_counts: BTreeMap<String, u32>,
    /// Re-entries into build from critique rejection or verify failure.
    pub build_reworks: u32,
    pub wall_clock_ms: u64,
}

impl RewardSignal {
    /// Derive the signal from a terminal `WorkflowState`.
    pub fn from_terminal(state: &WorkflowState) -> Self {
        debug_assert!(state.is_terminal());
        let wall_clock_ms = (state.updated_at - state.created_at)
            .num_milliseconds()
            .max(0) as u64;
        Self {
            run_id: state.run_id.to_string(),
            task_id: state.task.task_id,
            goal: state.task.goal.clone(),
            success: state.status == RunStatus::Succeeded,
            status: state.status,
            terminal_reason: state.terminal_reason.clone(),
            steps: state.history.len() as u32,
            attempt_counts: state.attempt_counts.clone(),
            build_reworks: state.attempts(WorkflowNode::Build).saturating_sub(1),
            wall_clock_ms,
        }
    }
}

/// External collaborator that receives reward signals.
///
/// Fire-and-forget from the engine's perspective: the engine never awaits a
/// delivery and never observes its result.
#[async_trait]
pub trait RewardDelivery: Send + Sync {
    async fn deliver(&self, signal: RewardSignal) -> anyhow::Result<()>;
}

/// Delivery that emits the signal as a structured log line. The default
/// collaborator when no learning backend is wired up.
#[derive(Debug, Default)]
pub struct LogDelivery;

#[async_trait]
impl RewardDelivery for LogDelivery {
    async fn deliver(&self, signal: RewardSignal) -> anyhow::Result<()> {
        info!(
            event = "reward.delivered",
            run_id = %signal.run_id,
            success = signal.success,
            steps = signal.steps,
            build_reworks = signal.build_reworks,
            wall_clock_ms = signal.wall_clock_ms,
        );
        Ok(())
    }
}

/// Bounded queue plus consumer task feeding a [`RewardDelivery`].
#[derive(Clone)]
pub struct RewardSink {
    tx: mpsc::Sender<RewardSignal>,
}

impl RewardSink {
    /// Spawn the consumer task. Must be called from within a Tokio runtime.
    pub fn spawn(delivery: Arc<dyn RewardDelivery>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RewardSignal>(capacity);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let run_id = signal.run_id.clone();
                if let Err(e) = delivery.deliver(signal).await {
                    warn!(run_id = %run_id, error = %e, "reward delivery failed, dropping signal");
                }
            }
        });
        Self { tx }
    }

    /// Enqueue the terminal outcome without waiting.
    ///
    /// A full queue drops the signal (logged); a slow consumer can never
    /// block the engine.
    pub fn publish(&self, state: &WorkflowState) {
        let signal = RewardSignal::from_terminal(state);
        if let Err(e) = self.tx.try_send(signal) {
            obs::emit_reward_dropped(state.run_id.as_str(), &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchid_state::{RunId, Task, WorkflowState};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Captures delivered signals for assertions.
    #[derive(Default)]
    pub struct CapturingDelivery {
        pub signals: Mutex<Vec<RewardSignal>>,
    }

    #[async_trait]
    impl RewardDelivery for CapturingDelivery {
        async fn deliver(&self, signal: RewardSignal) -> anyhow::Result<()> {
            self.signals.lock().unwrap().push(signal);
            Ok(())
        }
    }

    fn terminal_state() -> WorkflowState {
        let mut state = WorkflowState::new(RunId::new(), Task::new("goal"));
        state.begin_attempt(WorkflowNode::Build);
        state.begin_attempt(WorkflowNode::Build);
        state.finish(RunStatus::Succeeded, TerminalReason::Completed);
        state
    }

    #[test]
    fn signal_counts_build_reworks() {
        let signal = RewardSignal::from_terminal(&terminal_state());
        assert!(signal.success);
        assert_eq!(signal.build_reworks, 1);
    }

    #[tokio::test]
    async fn published_signal_reaches_delivery() {
        let delivery = Arc::new(CapturingDelivery::default());
        let sink = RewardSink::spawn(delivery.clone(), 8);

        sink.publish(&terminal_state());

        // The consumer runs on its own task; give it a moment.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if !delivery.signals.lock().unwrap().is_empty() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("signal should be consumed");

        let signals = delivery.signals.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        struct StuckDelivery;
        #[async_trait]
        impl RewardDelivery for StuckDelivery {
            async fn deliver(&self, _signal: RewardSignal) -> anyhow::Result<()> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let sink = RewardSink::spawn(Arc::new(StuckDelivery), 1);
        // Publishing far past capacity must return promptly every time.
        for _ in 0..16 {
            sink.publish(&terminal_state());
        }
    }
}
