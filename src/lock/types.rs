/// Lock document and status types
///
/// The lock document is the on-disk source of truth for cross-process
/// ownership: `{owner_pid, acquired_at, operation, locked_paths, lock_id}`.

use crate::store::RecordPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Exclusive ownership of one operation over a set of path prefixes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub operation: String,
    pub locked_paths: Vec<String>,
    /// Distinguishes acquirers that share a pid
    pub lock_id: String,
}

impl Lock {
    pub(crate) fn for_current_process(operation: &str, locked_paths: Vec<String>) -> Self {
        Self {
            owner_pid: std::process::id(),
            acquired_at: Utc::now(),
            operation: operation.to_string(),
            locked_paths,
            lock_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Time since acquisition; a timestamp in the future counts as zero
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether `path` lies under one of the locked prefixes
    pub fn covers(&self, path: &RecordPath) -> bool {
        self.locked_paths.iter().any(|prefix| path.is_under(prefix))
    }
}

/// Why a lock may be broken by another acquirer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Older than the staleness threshold
    Expired,
    /// The owning process is no longer running
    OwnerDead,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Expired => write!(f, "older than the staleness threshold"),
            StaleReason::OwnerDead => write!(f, "owner process is not running"),
        }
    }
}

/// Snapshot of the current lock file, for tooling
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub lock: Lock,
    #[serde(with = "duration_secs")]
    pub age: Duration,
    pub stale: Option<StaleReason>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(age: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(age.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_checks_whole_prefix_segments() {
        let lock = Lock::for_current_process("sync", vec!["activities".into(), "metrics/weekly".into()]);
        assert!(lock.covers(&RecordPath::new("activities/2025-03/a.yaml").unwrap()));
        assert!(lock.covers(&RecordPath::new("metrics/weekly/2025-W10.yaml").unwrap()));
        assert!(!lock.covers(&RecordPath::new("metrics/daily/x.yaml").unwrap()));
        assert!(!lock.covers(&RecordPath::new("activities-archive/a.yaml").unwrap()));
    }

    #[test]
    fn age_never_goes_negative() {
        let mut lock = Lock::for_current_process("sync", vec![]);
        lock.acquired_at = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(lock.age(Utc::now()), Duration::ZERO);

        lock.acquired_at = Utc::now() - chrono::Duration::seconds(400);
        assert!(lock.age(Utc::now()) >= Duration::from_secs(400));
    }

    #[test]
    fn lock_document_uses_wire_field_names() {
        let lock = Lock::for_current_process("weekly-sync", vec!["activities".into()]);
        let yaml = serde_yaml::to_string(&lock).unwrap();
        for field in ["owner_pid:", "acquired_at:", "operation:", "locked_paths:", "lock_id:"] {
            assert!(yaml.contains(field), "{field} missing from {yaml}");
        }
        let back: Lock = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, lock);
    }
}
