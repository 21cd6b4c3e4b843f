use crate::lock::types::Lock;
use std::path::PathBuf;
use std::time::Duration;

/// Errors returned by the lock manager
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// A live, fresh lock was held by someone else for the whole timeout,
    /// or create races kept being lost
    #[error("timed out after {waited:?} acquiring lock for '{operation}'{}", describe_holder(.holder))]
    Timeout {
        operation: String,
        waited: Duration,
        holder: Option<Box<Lock>>,
    },

    #[error("lock file I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The lock file exists but cannot be parsed
    #[error("lock file {} is unreadable: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },
}

impl LockError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LockError::Io {
            path: path.into(),
            source,
        }
    }
}

fn describe_holder(holder: &Option<Box<Lock>>) -> String {
    match holder {
        Some(lock) => format!(
            " (held by pid {} for '{}' since {})",
            lock.owner_pid,
            lock.operation,
            lock.acquired_at.to_rfc3339()
        ),
        None => String::new(),
    }
}
