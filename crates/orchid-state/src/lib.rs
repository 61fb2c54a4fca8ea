//! orchid-state: durable workflow run state and its persistence contract.
//!
//! This crate defines:
//! - the run model (`WorkflowState`, `StepRecord`, status/outcome enums)
//! - the `WorkflowStore` trait with optimistic-concurrency saves
//! - an in-memory fake for tests and a digest-verified filesystem backend

pub mod error;
pub mod fs;
pub mod memory;
pub mod model;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use fs::FsWorkflowStore;
pub use memory::MemoryWorkflowStore;
pub use model::{
    ArtifactRef, RunId, RunStatus, StepOutcome, StepRecord, Task, TaskBudget, TerminalReason,
    WorkflowNode, WorkflowState,
};
pub use store::WorkflowStore;
