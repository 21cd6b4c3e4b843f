/// Workflow Layer
///
/// Multi-step operations over the store with partial-success semantics:
/// - Step errors, outcomes, and run results
/// - Pipeline definitions and the `Step` trait
/// - Per-run undo log for rollback
/// - Sequential engine that runs each pipeline under the store lock

// Run result and error types
pub mod types;

// Pipeline builder and step trait
pub mod pipeline;

// In-memory undo log
pub mod transaction;

// Lock-scoped, transactional step execution
pub mod engine;

pub use engine::{StepContext, WorkflowEngine};
pub use pipeline::{FnStep, Pipeline, Step};
pub use transaction::TransactionLog;
pub use types::{
    RollbackReport, StepError, StepOutcome, StepStatus, UndoFailure, WorkflowError, WorkflowResult,
};
