/// Cross-Process Locking
///
/// One lock file guards the whole store. Acquisition is create-if-absent,
/// and stale locks (too old, or owner dead) are broken by the next acquirer.

// Lock document, staleness and status types
pub mod types;

// Lock manager errors
pub mod error;

// Owner process checks
pub mod liveness;

// Acquire / release / status / clear-stale
pub mod manager;

pub use error::LockError;
pub use liveness::{ProcessLiveness, SystemLiveness};
pub use manager::{LockGuard, LockManager, LockSettings};
pub use types::{Lock, LockStatus, StaleReason};
