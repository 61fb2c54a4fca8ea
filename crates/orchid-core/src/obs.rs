//! Structured observability hooks for run lifecycle events.
//!
//! Emitted at `info!` (warnings for dropped signals); filtering is
//! controlled by the subscriber installed via [`crate::telemetry`].
//!
//! The per-run span is attached with `tracing::Instrument` where the drive
//! loop is awaited; entered-span guards are never held across await points.

use tracing::{info, warn};

/// The span every drive of `run_id` executes under.
///
/// Attach with `.instrument(run_span(...))`; do not `enter()` it around
/// async code.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("orchid.run", run_id = %run_id)
}

/// A task was accepted and its pending state persisted.
pub fn emit_run_submitted(run_id: &str, goal: &str) {
    info!(event = "run.submitted", run_id = %run_id, goal = %goal);
}

/// The engine moved the run to a node and is about to invoke its role.
pub fn emit_node_entered(run_id: &str, node: &str, attempt: u32) {
    info!(event = "run.node_entered", run_id = %run_id, node = %node, attempt = attempt);
}

/// One role invocation finished (any outcome).
pub fn emit_step_finished(run_id: &str, node: &str, attempt: u32, outcome: &str) {
    info!(
        event = "run.step_finished",
        run_id = %run_id,
        node = %node,
        attempt = attempt,
        outcome = %outcome,
    );
}

/// The run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, steps: usize) {
    info!(event = "run.finished", run_id = %run_id, status = %status, steps = steps);
}

/// A recovery sweep completed.
pub fn emit_recovery_swept(examined: usize, resumed: usize, abandoned: usize) {
    info!(
        event = "recovery.swept",
        examined = examined,
        resumed = resumed,
        abandoned = abandoned,
    );
}

/// A reward signal could not be enqueued and was dropped.
pub fn emit_reward_dropped(run_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "reward.dropped", run_id = %run_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Emission is fire-and-forget; these only pin that the helpers are
    // callable without a subscriber installed.
    #[test]
    fn emitters_are_safe_without_subscriber() {
        let span = run_span("run-test");
        let _guard = span.enter();
        emit_run_submitted("run-test", "fix lint error");
        emit_node_entered("run-test", "plan", 1);
        emit_step_finished("run-test", "plan", 1, "success");
        emit_run_finished("run-test", "succeeded", 4);
        emit_recovery_swept(3, 1, 1);
        emit_reward_dropped("run-test", &"queue full");
    }
}
