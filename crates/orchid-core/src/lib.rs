//! Workflow orchestration core: the fixed plan/build/critique/verify graph,
//! role contracts, step execution with timeouts and cancellation, crash
//! recovery, and reward emission.
//!
//! Durable state and its stores live in `orchid-state`; this crate drives
//! them.

pub mod engine;
pub mod error;
pub mod executor;
pub mod lease;
pub mod obs;
pub mod recovery;
pub mod reward;
pub mod role;
pub mod script;
pub mod telemetry;

pub use engine::{
    judgment_of, next_transition, EngineConfig, GraphEngine, Judgment, RunStatusView, StepDecision,
};
pub use error::{OrchidError, Result};
pub use executor::{StepExecutor, StepReport, StepRun};
pub use lease::{LeaseGuard, LeaseRegistry};
pub use recovery::{RecoveryManager, RecoveryOutcome, SweepReport};
pub use reward::{LogDelivery, RewardDelivery, RewardSignal, RewardSink};
pub use role::{ArtifactsView, Role, RoleRegistry, RoleResult};
pub use script::ScriptedRole;
pub use telemetry::init_tracing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
