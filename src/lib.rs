/// Coachstore: durable file-backed record storage for coaching data
///
/// This library provides atomic, schema-versioned record files, a
/// cross-process lock over the data directory, and a workflow engine that
/// runs multi-step operations with rollback.

// Core configuration and setup
pub mod config;

// Schema layer - record kinds, field schemas, format versions and migrations
pub mod schema;

// Record store layer - path mapping, atomic writes, validated reads, listings
pub mod store;

// Locking layer - single lock file with stale-lock breaking
pub mod lock;

// Workflow layer - ordered steps, error aggregation, transactional rollback
pub mod workflow;

// Re-export commonly used types for external consumers
pub use config::Config;
pub use lock::{Lock, LockError, LockGuard, LockManager};
pub use schema::{FieldKind, RecordSchema, SchemaRegistry};
pub use store::{AtomicRecordStore, PathResolver, Record, RecordKey, RecordPath, StoreError};
pub use workflow::{Pipeline, StepContext, StepError, WorkflowEngine, WorkflowError, WorkflowResult};
