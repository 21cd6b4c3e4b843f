/// Per-run undo log
///
/// Before every write or delete inside a run, the exact previous bytes of the
/// target (or its absence) are recorded. Rolling back replays the entries in
/// reverse, so a path touched several times ends up with its oldest snapshot.
/// The log lives in memory only and is dropped on commit.

use crate::store::{AtomicRecordStore, RecordPath};
use crate::workflow::types::{RollbackReport, UndoFailure};
use std::path::PathBuf;

#[derive(Debug)]
struct Entry {
    path: RecordPath,
    /// `None` when the file did not exist before the change
    previous: Option<Vec<u8>>,
    /// Outermost directory the change created, pruned again on undo
    created_dir: Option<PathBuf>,
}

/// Ordered snapshots of files changed during one run
#[derive(Debug, Default)]
pub struct TransactionLog {
    entries: Vec<Entry>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: RecordPath, previous: Option<Vec<u8>>) {
        self.entries.push(Entry {
            path,
            previous,
            created_dir: None,
        });
    }

    /// Record a file about to be created, along with the outermost
    /// directory its write will create (see `first_missing_dir`)
    pub fn record_creation(&mut self, path: RecordPath, created_dir: Option<PathBuf>) {
        self.entries.push(Entry {
            path,
            previous: None,
            created_dir,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mark to later roll back to with `rollback_to`
    pub fn savepoint(&self) -> usize {
        self.entries.len()
    }

    /// Undo every entry recorded after `mark`, newest first
    ///
    /// Undo failures are collected rather than stopping the rollback, so one
    /// bad path does not leave the others in their new state.
    pub fn rollback_to(&mut self, store: &AtomicRecordStore, mark: usize) -> RollbackReport {
        let mut report = RollbackReport::default();
        while self.entries.len() > mark {
            let Some(entry) = self.entries.pop() else {
                break;
            };

            let undone = match &entry.previous {
                Some(bytes) => store.restore_raw(&entry.path, bytes),
                None => store.delete(&entry.path).map(|_| ()),
            };
            match undone {
                Ok(()) => {
                    tracing::debug!("↩️ Undid change to {}", entry.path);
                    if let Some(top) = &entry.created_dir {
                        store.prune_empty_dirs(&entry.path, top);
                    }
                    report.undone.push(entry.path);
                }
                Err(e) => {
                    tracing::error!("❌ Could not undo change to {}: {}", entry.path, e);
                    report.failures.push(UndoFailure {
                        path: entry.path,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Undo everything recorded in this run
    pub fn rollback(&mut self, store: &AtomicRecordStore) -> RollbackReport {
        self.rollback_to(store, 0)
    }

    /// Keep every change; the snapshots are discarded
    pub fn commit(self) -> usize {
        self.entries.len()
    }
}
