/// Workflow engine
///
/// Runs a pipeline's steps in order under one store-wide lock. Every write
/// goes through a `StepContext`, which snapshots the target first, so a fatal
/// failure can put every touched file back the way the run found it.

use crate::config::Config;
use crate::lock::{Lock, LockManager};
use crate::store::{AtomicRecordStore, Record, RecordKey, RecordPath, StoreError, StoreResult};
use crate::workflow::pipeline::{Pipeline, Step};
use crate::workflow::transaction::TransactionLog;
use crate::workflow::types::{StepError, StepOutcome, StepStatus, WorkflowError, WorkflowResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Sequential, transactional executor for pipelines
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    store: AtomicRecordStore,
    locks: LockManager,
    /// How long `run` waits for the lock before giving up
    lock_timeout: Duration,
}

impl WorkflowEngine {
    pub fn new(store: AtomicRecordStore, locks: LockManager) -> Self {
        Self {
            store,
            locks,
            lock_timeout: Duration::from_secs(30),
        }
    }

    /// Engine whose lock manager and timeout come from `config`
    pub fn from_config(config: &Config, store: AtomicRecordStore) -> Self {
        Self::new(store, LockManager::from_config(config)).with_lock_timeout(config.lock.acquire_timeout())
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn store(&self) -> &AtomicRecordStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Execute `pipeline` under a lock over its scope
    ///
    /// Returns `Err` only when the lock cannot be acquired, in which case no
    /// step has run. Step failures, including fatal ones, are reported in the
    /// returned `WorkflowResult`.
    pub fn run(&self, pipeline: &Pipeline) -> Result<WorkflowResult, WorkflowError> {
        let started = Instant::now();
        tracing::info!("🚀 Starting pipeline '{}' with {} steps", pipeline.name(), pipeline.len());

        let guard = self
            .locks
            .acquire(pipeline.name(), pipeline.scopes(), self.lock_timeout)?;

        let mut log = TransactionLog::new();
        let mut outputs = Map::new();
        let mut result = WorkflowResult::new(pipeline.name());

        for step in pipeline.steps() {
            if result.fatal.is_some() {
                tracing::debug!("⏭️ Skipping step '{}' after fatal error", step.name());
                result.outcomes.push(StepOutcome {
                    name: step.name().to_string(),
                    status: StepStatus::Skipped,
                    output: None,
                    writes: 0,
                });
                continue;
            }

            let outcome = self.run_step(step.as_ref(), guard.lock(), &mut log, &mut outputs, &mut result);
            result.outcomes.push(outcome);
        }

        match result.fatal.as_ref() {
            Some(fatal) => {
                tracing::error!(
                    "💥 Pipeline '{}' failed in step '{}'; rolling back {} changes",
                    pipeline.name(),
                    fatal.step_name,
                    log.len()
                );
                let mut report = result.rollback.take().unwrap_or_default();
                report.absorb(log.rollback(&self.store));
                if !report.is_clean() {
                    tracing::error!(
                        "❌ Rollback of '{}' left {} paths unrestored",
                        pipeline.name(),
                        report.failures.len()
                    );
                }
                result.rollback = Some(report);
            }
            None => {
                let kept = log.commit();
                tracing::debug!("💾 Committed {} changes for '{}'", kept, pipeline.name());
            }
        }

        if let Err(e) = guard.release() {
            tracing::error!("❌ Failed to release lock after '{}': {}", pipeline.name(), e);
        }

        tracing::info!(
            "✅ Pipeline '{}' finished in {:?} (succeeded: {}, errors: {})",
            pipeline.name(),
            started.elapsed(),
            result.succeeded(),
            result.errors.len()
        );
        Ok(result)
    }

    fn run_step(
        &self,
        step: &dyn Step,
        lock: &Lock,
        log: &mut TransactionLog,
        outputs: &mut Map<String, Value>,
        result: &mut WorkflowResult,
    ) -> StepOutcome {
        let name = step.name();
        let step_started = Instant::now();
        let mark = log.savepoint();
        tracing::debug!("▶️ Running step '{}'", name);

        let mut ctx = StepContext {
            step_name: name,
            store: &self.store,
            lock,
            log: &mut *log,
            outputs: &*outputs,
            issues: Vec::new(),
            poison: None,
            writes: 0,
        };
        let returned = panic::catch_unwind(AssertUnwindSafe(|| step.run(&mut ctx)));
        let (issues, poison, writes) = (ctx.issues, ctx.poison, ctx.writes);

        result.errors.extend(issues);

        let verdict = match returned {
            Err(payload) => Err(StepError::fatal(format!("step panicked: {}", panic_message(payload.as_ref())))),
            Ok(Err(err)) if !err.recoverable => Err(err),
            Ok(returned) => match poison {
                Some(poison) => Err(poison),
                None => returned,
            },
        }
        .map_err(|err| err.in_step(name));

        let status = match verdict {
            Ok(output) => {
                tracing::debug!("✅ Step '{}' completed in {:?} ({} writes)", name, step_started.elapsed(), writes);
                let output = (!output.is_null()).then_some(output);
                if let Some(output) = &output {
                    outputs.insert(name.to_string(), output.clone());
                }
                return StepOutcome {
                    name: name.to_string(),
                    status: StepStatus::Completed,
                    output,
                    writes,
                };
            }
            Err(err) if err.recoverable => {
                tracing::warn!("⚠️ Step '{}' hit a recoverable error: {}", name, err.message);
                result.errors.push(err);
                let undo = log.rollback_to(&self.store, mark);
                if undo.is_clean() {
                    StepStatus::Recovered
                } else {
                    let fatal = StepError::fatal(format!(
                        "could not undo {} writes of a recovered step",
                        undo.failures.len()
                    ))
                    .in_step(name);
                    result.errors.push(fatal.clone());
                    result.fatal = Some(fatal);
                    result.rollback = Some(undo);
                    StepStatus::Failed
                }
            }
            Err(err) => {
                tracing::error!("❌ Step '{}' failed: {}", name, err.message);
                result.errors.push(err.clone());
                result.fatal = Some(err);
                StepStatus::Failed
            }
        };

        StepOutcome {
            name: name.to_string(),
            status,
            output: None,
            writes,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A step's transactional view of the store
///
/// Writes and deletes are checked against the run's locked scope and
/// snapshotted for rollback. Any store failure poisons the step, so it is
/// treated as fatal whatever the step itself returns. The one exception is a
/// read of a file that does not exist.
pub struct StepContext<'run> {
    step_name: &'run str,
    store: &'run AtomicRecordStore,
    lock: &'run Lock,
    log: &'run mut TransactionLog,
    outputs: &'run Map<String, Value>,
    issues: Vec<StepError>,
    poison: Option<StepError>,
    writes: usize,
}

impl<'run> StepContext<'run> {
    pub fn step_name(&self) -> &str {
        self.step_name
    }

    /// The lock this run holds
    pub fn lock(&self) -> &Lock {
        self.lock
    }

    /// Read a record; failures other than a missing file poison the step
    pub fn read(&mut self, path: &RecordPath, kind: &str) -> StoreResult<Record> {
        let read = self.store.read(path, kind);
        self.checked(read)
    }

    pub fn read_optional(&mut self, path: &RecordPath, kind: &str) -> StoreResult<Option<Record>> {
        let read = self.store.read_optional(path, kind);
        self.checked(read)
    }

    pub fn read_as<T: DeserializeOwned>(&mut self, path: &RecordPath, kind: &str) -> StoreResult<T> {
        let read = self.store.read_as(path, kind);
        self.checked(read)
    }

    pub fn exists(&self, path: &RecordPath) -> bool {
        self.store.exists(path)
    }

    pub fn list(&mut self, pattern: &str) -> StoreResult<Vec<RecordPath>> {
        let listed = self.store.list(pattern);
        self.checked(listed)
    }

    pub fn allocate(&mut self, key: &RecordKey) -> StoreResult<RecordPath> {
        let allocated = self.store.allocate(key);
        self.checked(allocated)
    }

    /// Write `record` to `path`, remembering what was there before
    pub fn write(&mut self, path: &RecordPath, record: &Record) -> StoreResult<()> {
        self.check_scope(path)?;
        match self.store.read_raw(path).map_err(|e| self.poisoned(e))? {
            Some(previous) => self.log.record(path.clone(), Some(previous)),
            None => self
                .log
                .record_creation(path.clone(), self.store.first_missing_dir(path)),
        }
        self.store.write(path, record).map_err(|e| self.poisoned(e))?;
        self.writes += 1;
        Ok(())
    }

    /// Delete `path`, remembering its bytes; returns whether it existed
    pub fn delete(&mut self, path: &RecordPath) -> StoreResult<bool> {
        self.check_scope(path)?;
        let Some(previous) = self.store.read_raw(path).map_err(|e| self.poisoned(e))? else {
            return Ok(false);
        };
        self.log.record(path.clone(), Some(previous));
        let removed = self.store.delete(path).map_err(|e| self.poisoned(e))?;
        self.writes += 1;
        Ok(removed)
    }

    /// Output of an earlier step that completed in this run
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.outputs.get(step_name)
    }

    pub fn outputs(&self) -> &Map<String, Value> {
        self.outputs
    }

    /// Record an item-level problem without failing the step
    pub fn report_issue(&mut self, message: impl Into<String>) {
        let issue = StepError::recoverable(message).in_step(self.step_name);
        tracing::warn!("⚠️ {}: {}", self.step_name, issue.message);
        self.issues.push(issue);
    }

    fn check_scope(&mut self, path: &RecordPath) -> StoreResult<()> {
        if self.lock.covers(path) {
            return Ok(());
        }
        let err = StoreError::invalid_path(
            path.as_str(),
            format!("outside the locked scope {:?}", self.lock.locked_paths),
        );
        Err(self.poisoned(err))
    }

    // A missing file is the step's call; anything else means the store is
    // not in the state the step expects
    fn checked<T>(&mut self, result: StoreResult<T>) -> StoreResult<T> {
        result.map_err(|e| if e.is_not_found() { e } else { self.poisoned(e) })
    }

    fn poisoned(&mut self, err: StoreError) -> StoreError {
        if self.poison.is_none() {
            self.poison = Some(StepError::fatal(err.to_string()).in_step(self.step_name));
        }
        err
    }
}
