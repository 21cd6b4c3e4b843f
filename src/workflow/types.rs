/// Workflow run types
///
/// Step errors, per-step outcomes, and the structured result of one pipeline
/// run. Results serialize to JSON so callers can log or persist them.

use crate::lock::LockError;
use crate::store::{RecordPath, StoreError};
use serde::Serialize;
use serde_json::Value;

/// An error raised by (or on behalf of) one step
///
/// `recoverable` errors are recorded and the run continues; anything else
/// halts the run and rolls back every write made since it started.
/// `run_successful` says whether the run may still count as a success with
/// this error on the books.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("step '{step_name}' failed: {message}")]
pub struct StepError {
    pub step_name: String,
    pub message: String,
    pub recoverable: bool,
    pub run_successful: bool,
}

impl StepError {
    /// Item-level problem; the run continues and still counts as successful
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::build(message, true, true)
    }

    /// The run continues but can no longer count as successful
    pub fn degraded(message: impl Into<String>) -> Self {
        Self::build(message, true, false)
    }

    /// Halts the run and triggers rollback
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::build(message, false, false)
    }

    /// Attribute the error to `step_name` unless a step was already named
    pub fn in_step(mut self, step_name: &str) -> Self {
        if self.step_name.is_empty() {
            self.step_name = step_name.to_string();
        }
        self
    }

    fn build(message: impl Into<String>, recoverable: bool, run_successful: bool) -> Self {
        Self {
            step_name: String::new(),
            message: message.into(),
            recoverable,
            run_successful,
        }
    }
}

// Store failures surfacing through `?` are fatal
impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::fatal(err.to_string())
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    /// Returned a recoverable error; its writes were undone
    Recovered,
    /// Returned a fatal error, was poisoned by a store failure, or panicked
    Failed,
    /// Not run because an earlier step failed fatally
    Skipped,
}

/// Outcome of a single step, in pipeline order
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    /// Data the step produced; `None` for failed, skipped, or silent steps
    pub output: Option<Value>,
    /// Files written or deleted by the step (before any undo)
    pub writes: usize,
}

/// A single undo that could not be applied
#[derive(Debug, Clone, Serialize)]
pub struct UndoFailure {
    pub path: RecordPath,
    pub message: String,
}

/// What a rollback put back
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    /// Paths restored or removed, in the order they were undone
    pub undone: Vec<RecordPath>,
    pub failures: Vec<UndoFailure>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn absorb(&mut self, other: RollbackReport) {
        self.undone.extend(other.undone);
        self.failures.extend(other.failures);
    }
}

/// Structured result of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub pipeline: String,
    pub outcomes: Vec<StepOutcome>,
    /// Every error raised during the run, in order, including the fatal one
    pub errors: Vec<StepError>,
    pub fatal: Option<StepError>,
    /// Present only when a fatal error forced a rollback of the whole run
    pub rollback: Option<RollbackReport>,
}

impl WorkflowResult {
    pub(crate) fn new(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            outcomes: Vec::new(),
            errors: Vec::new(),
            fatal: None,
            rollback: None,
        }
    }

    /// No fatal error, and every collected error keeps the run successful
    pub fn succeeded(&self) -> bool {
        self.fatal.is_none() && self.errors.iter().all(|e| e.run_successful)
    }

    pub fn outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.name == step_name)
    }

    /// Output produced by `step_name`, if it completed with one
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.outcome(step_name).and_then(|o| o.output.as_ref())
    }
}

/// Errors that prevent a run from starting at all
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("could not lock pipeline scope: {0}")]
    Lock(#[from] LockError),
}
