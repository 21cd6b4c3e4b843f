/// Cross-process lock manager
///
/// "The lock file exists, is fresh, and its owner is alive" is the only
/// source of truth for ownership. A lock that is too old or whose owner has
/// exited is broken by the next acquirer so a crashed holder never wedges the
/// store.
///
/// State machine: `UNLOCKED -> HELD_BY_SELF | HELD_BY_OTHER -> UNLOCKED`.

use crate::config::Config;
use crate::lock::error::LockError;
use crate::lock::liveness::{ProcessLiveness, SystemLiveness};
use crate::lock::types::{Lock, LockStatus, StaleReason};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Timing parameters for acquisition and staleness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Locks older than this are stale
    pub stale_after: Duration,
    /// Back-off between attempts while another holder is live
    pub retry_delay: Duration,
    /// Lost create races tolerated before giving up
    pub race_retries: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(300),
            retry_delay: Duration::from_millis(100),
            race_retries: 5,
        }
    }
}

/// What was found at the lock path
#[derive(Debug)]
enum Observed {
    Free,
    Held { lock: Lock, bytes: Vec<u8> },
    /// Unparseable content; only reclaimable once its mtime is old enough
    Corrupt { bytes: Vec<u8>, age: Duration, message: String },
}

/// Acquires and releases the single store-wide lock file
#[derive(Debug, Clone)]
pub struct LockManager {
    /// Absolute path of the lock file
    path: PathBuf,
    settings: LockSettings,
    liveness: Arc<dyn ProcessLiveness>,
}

impl LockManager {
    pub fn new(
        path: impl Into<PathBuf>,
        settings: LockSettings,
        liveness: Arc<dyn ProcessLiveness>,
    ) -> Self {
        Self {
            path: path.into(),
            settings,
            liveness,
        }
    }

    /// Manager for the configured lock file using the OS liveness check
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.lock_path(),
            LockSettings {
                stale_after: config.lock.stale_after(),
                retry_delay: config.lock.retry_delay(),
                race_retries: config.lock.race_retries,
            },
            Arc::new(SystemLiveness),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Acquire the lock for `operation` over `path_prefixes`, waiting up to `timeout`
    ///
    /// The returned guard releases the lock when dropped.
    pub fn acquire<S: AsRef<str>>(
        &self,
        operation: &str,
        path_prefixes: &[S],
        timeout: Duration,
    ) -> Result<LockGuard<'_>, LockError> {
        let prefixes: Vec<String> = path_prefixes
            .iter()
            .map(|p| p.as_ref().trim_matches('/').to_string())
            .collect();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut races_lost = 0u32;

        tracing::debug!("🔒 Acquiring lock for '{}' over {:?}", operation, prefixes);

        loop {
            match self.observe()? {
                Observed::Free => {
                    let candidate = Lock::for_current_process(operation, prefixes.clone());
                    if self.try_create(&candidate)? && self.confirm(&candidate)? {
                        tracing::info!(
                            "🔒 Lock acquired for '{}' (pid {}, waited {:?})",
                            operation,
                            candidate.owner_pid,
                            started.elapsed()
                        );
                        return Ok(LockGuard {
                            manager: self,
                            lock: candidate,
                            released: false,
                        });
                    }

                    races_lost += 1;
                    tracing::debug!("🏁 Lost lock race for '{}' ({} so far)", operation, races_lost);
                    if races_lost > self.settings.race_retries {
                        return Err(LockError::Timeout {
                            operation: operation.to_string(),
                            waited: started.elapsed(),
                            holder: self.current_holder(),
                        });
                    }
                    std::thread::sleep(self.settings.retry_delay);
                }
                Observed::Held { lock, bytes } => {
                    if let Some(reason) = self.staleness(&lock) {
                        tracing::warn!(
                            "⚠️ Breaking stale lock for '{}' held by pid {} ({})",
                            lock.operation,
                            lock.owner_pid,
                            reason
                        );
                        self.remove_if_unchanged(&bytes)?;
                        continue;
                    }
                    self.wait_or_timeout(operation, started, deadline, Some(lock))?;
                }
                Observed::Corrupt { bytes, age, message } => {
                    if age > self.settings.stale_after {
                        tracing::warn!("⚠️ Removing unreadable stale lock file: {}", message);
                        self.remove_if_unchanged(&bytes)?;
                        continue;
                    }
                    self.wait_or_timeout(operation, started, deadline, None)?;
                }
            }
        }
    }

    /// Delete the lock file if it still belongs to `lock`
    ///
    /// Idempotent: releasing twice, or after the lock was broken, returns `Ok(false)`.
    pub fn release(&self, lock: &Lock) -> Result<bool, LockError> {
        let bytes = match self.observe()? {
            Observed::Held { lock: current, bytes } if current.lock_id == lock.lock_id => bytes,
            _ => {
                tracing::debug!("🔓 Lock for '{}' no longer held by us; nothing to release", lock.operation);
                return Ok(false);
            }
        };
        let removed = self.remove_if_unchanged(&bytes)?;
        if removed {
            tracing::info!("🔓 Lock released for '{}'", lock.operation);
        }
        Ok(removed)
    }

    /// Current lock holder, if any, with its computed staleness
    pub fn status(&self) -> Result<Option<LockStatus>, LockError> {
        match self.observe()? {
            Observed::Free => Ok(None),
            Observed::Held { lock, .. } => {
                let stale = self.staleness(&lock);
                Ok(Some(LockStatus {
                    age: lock.age(Utc::now()),
                    stale,
                    lock,
                }))
            }
            Observed::Corrupt { message, .. } => Err(LockError::Corrupt {
                path: self.path.clone(),
                message,
            }),
        }
    }

    /// Remove the current lock only if it is stale; returns the removed lock
    pub fn clear_stale(&self) -> Result<Option<Lock>, LockError> {
        match self.observe()? {
            Observed::Held { lock, bytes } => match self.staleness(&lock) {
                Some(reason) => {
                    tracing::warn!("⚠️ Clearing stale lock for '{}' ({})", lock.operation, reason);
                    Ok(self.remove_if_unchanged(&bytes)?.then_some(lock))
                }
                None => Ok(None),
            },
            Observed::Free | Observed::Corrupt { .. } => Ok(None),
        }
    }

    fn staleness(&self, lock: &Lock) -> Option<StaleReason> {
        if lock.age(Utc::now()) > self.settings.stale_after {
            Some(StaleReason::Expired)
        } else if !self.liveness.is_alive(lock.owner_pid) {
            Some(StaleReason::OwnerDead)
        } else {
            None
        }
    }

    fn wait_or_timeout(
        &self,
        operation: &str,
        started: Instant,
        deadline: Instant,
        holder: Option<Lock>,
    ) -> Result<(), LockError> {
        let now = Instant::now();
        if now >= deadline {
            tracing::warn!("⏱️ Timed out acquiring lock for '{}' after {:?}", operation, started.elapsed());
            return Err(LockError::Timeout {
                operation: operation.to_string(),
                waited: started.elapsed(),
                holder: holder.map(Box::new),
            });
        }
        std::thread::sleep(self.settings.retry_delay.min(deadline - now));
        Ok(())
    }

    fn current_holder(&self) -> Option<Box<Lock>> {
        match self.observe() {
            Ok(Observed::Held { lock, .. }) => Some(Box::new(lock)),
            _ => None,
        }
    }

    fn observe(&self) -> Result<Observed, LockError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Observed::Free),
            Err(e) => return Err(LockError::io(&self.path, e)),
        };

        match serde_yaml::from_slice::<Lock>(&bytes) {
            Ok(lock) => Ok(Observed::Held { lock, bytes }),
            Err(e) => {
                let age = fs::metadata(&self.path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO);
                Ok(Observed::Corrupt {
                    bytes,
                    age,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Create the lock file only if absent, with complete content from the start
    ///
    /// The document is written and synced to a temp file, then published with
    /// a no-clobber persist, so no reader ever sees a half-written lock.
    /// Returns `false` if a lock file already exists.
    fn try_create(&self, lock: &Lock) -> Result<bool, LockError> {
        let dir = self.dir();
        fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))?;

        let document = serde_yaml::to_string(lock).map_err(|e| LockError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", self.file_stem()))
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| LockError::io(dir, e))?;
        temp.write_all(document.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| LockError::io(temp.path(), e))?;

        match temp.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LockError::io(&self.path, e.error)),
        }
    }

    /// Re-read the lock file to make sure our document is the one in place
    fn confirm(&self, candidate: &Lock) -> Result<bool, LockError> {
        Ok(matches!(
            self.observe()?,
            Observed::Held { lock, .. } if lock.lock_id == candidate.lock_id
        ))
    }

    /// Remove the lock file only if its bytes still equal `expected`
    ///
    /// Every removal holds an exclusive advisory lock on a sidecar file. The
    /// lock file is only ever created with no-clobber and only ever removed
    /// under that sidecar lock, so bytes that match on re-read cannot change
    /// before the removal.
    fn remove_if_unchanged(&self, expected: &[u8]) -> Result<bool, LockError> {
        let _removal = self.lock_removals()?;

        match fs::read(&self.path) {
            Ok(current) if current == expected => {}
            Ok(_) => {
                tracing::debug!("🔁 Lock file changed since it was observed; leaving it in place");
                return Ok(false);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(LockError::io(&self.path, e)),
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::io(&self.path, e)),
        }
    }

    /// Blocks until this caller is the only one allowed to remove the lock file
    ///
    /// The advisory lock is released when the returned file is dropped.
    fn lock_removals(&self) -> Result<File, LockError> {
        let dir = self.dir();
        fs::create_dir_all(dir).map_err(|e| LockError::io(dir, e))?;

        let sidecar = dir.join(format!(".{}.guard", self.file_stem()));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&sidecar)
            .map_err(|e| LockError::io(&sidecar, e))?;
        fs2::FileExt::lock_exclusive(&file).map_err(|e| LockError::io(&sidecar, e))?;
        Ok(file)
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Lock file name without its leading dot, for naming siblings
    fn file_stem(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().trim_start_matches('.').to_string())
            .unwrap_or_else(|| "lock".to_string())
    }
}

/// Scoped ownership of the lock; released on drop, including during unwinding
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    lock: Lock,
    released: bool,
}

impl LockGuard<'_> {
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Release explicitly, surfacing any I/O error that `Drop` would only log
    pub fn release(mut self) -> Result<bool, LockError> {
        self.released = true;
        self.manager.release(&self.lock)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.manager.release(&self.lock) {
            tracing::error!("❌ Failed to release lock for '{}': {}", self.lock.operation, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Mutex};
    use tempfile::TempDir;

    #[derive(Debug)]
    struct DeadOwners;

    impl ProcessLiveness for DeadOwners {
        fn is_alive(&self, pid: u32) -> bool {
            pid == std::process::id()
        }
    }

    fn settings() -> LockSettings {
        LockSettings {
            stale_after: Duration::from_secs(300),
            retry_delay: Duration::from_millis(5),
            race_retries: 5,
        }
    }

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path().join("config/.sync_lock"), settings(), Arc::new(SystemLiveness))
    }

    fn plant(manager: &LockManager, lock: &Lock) {
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(manager.path(), serde_yaml::to_string(lock).unwrap()).unwrap();
    }

    #[test]
    fn acquire_writes_lock_document_and_drop_releases() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        {
            let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
            assert_eq!(guard.lock().owner_pid, std::process::id());
            assert_eq!(guard.lock().locked_paths, vec!["activities".to_string()]);

            let status = manager.status().unwrap().unwrap();
            assert_eq!(status.lock, *guard.lock());
            assert_eq!(status.stale, None);
        }

        assert!(!manager.path().exists());
        assert!(manager.status().unwrap().is_none());
    }

    #[test]
    fn live_holder_causes_timeout() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let _held = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();

        let err = manager
            .acquire("other", &["plans"], Duration::from_millis(30))
            .unwrap_err();
        match err {
            LockError::Timeout { operation, holder, .. } => {
                assert_eq!(operation, "other");
                assert_eq!(holder.unwrap().operation, "sync");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn release_is_idempotent_and_ownership_checked() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
        let lock = guard.lock().clone();

        let mut impostor = lock.clone();
        impostor.lock_id = "someone-else".into();
        assert!(!manager.release(&impostor).unwrap());
        assert!(manager.path().exists());

        assert!(guard.release().unwrap());
        assert!(!manager.release(&lock).unwrap());
        assert!(!manager.path().exists());
    }

    #[test]
    fn expired_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let mut old = Lock::for_current_process("crashed-sync", vec!["activities".into()]);
        old.acquired_at = Utc::now() - chrono::Duration::minutes(6);
        plant(&manager, &old);

        assert_eq!(manager.status().unwrap().unwrap().stale, Some(StaleReason::Expired));
        let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
        assert_ne!(guard.lock().lock_id, old.lock_id);
    }

    #[test]
    fn dead_owner_lock_is_broken_even_when_fresh() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path().join(".sync_lock"), settings(), Arc::new(DeadOwners));
        let mut orphan = Lock::for_current_process("crashed-sync", vec!["activities".into()]);
        orphan.owner_pid = std::process::id().wrapping_add(1);
        plant(&manager, &orphan);

        assert_eq!(manager.status().unwrap().unwrap().stale, Some(StaleReason::OwnerDead));
        let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
        assert_eq!(guard.lock().operation, "sync");
    }

    #[test]
    fn clear_stale_leaves_fresh_locks_alone() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
        assert!(manager.clear_stale().unwrap().is_none());
        assert!(manager.path().exists());
        drop(guard);

        let mut old = Lock::for_current_process("crashed", vec![]);
        old.acquired_at = Utc::now() - chrono::Duration::hours(1);
        plant(&manager, &old);
        assert_eq!(manager.clear_stale().unwrap().map(|l| l.lock_id), Some(old.lock_id));
        assert!(!manager.path().exists());
    }

    #[test]
    fn fresh_corrupt_lock_blocks_then_reports() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(manager.path(), "owner_pid: [").unwrap();

        assert!(matches!(manager.status(), Err(LockError::Corrupt { .. })));
        assert!(matches!(
            manager.acquire("sync", &["activities"], Duration::from_millis(20)),
            Err(LockError::Timeout { .. })
        ));
    }

    #[test]
    fn old_corrupt_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        fs::create_dir_all(manager.path().parent().unwrap()).unwrap();
        fs::write(manager.path(), "owner_pid: [").unwrap();
        fs::File::options()
            .write(true)
            .open(manager.path())
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
        assert_eq!(manager.status().unwrap().unwrap().lock, *guard.lock());
    }

    #[cfg(unix)]
    #[test]
    fn exhausted_race_retries_time_out() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(
            dir.path().join(".sync_lock"),
            LockSettings {
                race_retries: 2,
                retry_delay: Duration::from_millis(1),
                ..settings()
            },
            Arc::new(SystemLiveness),
        );
        // A dangling symlink reads as absent but can never be published over
        std::os::unix::fs::symlink(dir.path().join("missing"), manager.path()).unwrap();

        let err = manager
            .acquire("sync", &["activities"], Duration::from_secs(10))
            .unwrap_err();
        match err {
            LockError::Timeout { holder, waited, .. } => {
                assert!(holder.is_none());
                assert!(waited < Duration::from_secs(10));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Reports one pid as dead, pausing the first check until told to go on
    #[derive(Debug)]
    struct PausingLiveness {
        dead_pid: u32,
        entered: Mutex<Option<mpsc::Sender<()>>>,
        resume: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl ProcessLiveness for PausingLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            if pid != self.dead_pid {
                return true;
            }
            if let Some(entered) = self.entered.lock().unwrap().take() {
                entered.send(()).unwrap();
                if let Some(resume) = self.resume.lock().unwrap().take() {
                    resume.recv().unwrap();
                }
            }
            false
        }
    }

    #[derive(Debug)]
    struct OneDeadPid(u32);

    impl ProcessLiveness for OneDeadPid {
        fn is_alive(&self, pid: u32) -> bool {
            pid != self.0
        }
    }

    #[test]
    fn late_breaker_leaves_a_newer_lock_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".sync_lock");
        let dead_pid = u32::MAX - 7;

        let mut orphan = Lock::for_current_process("crashed-sync", vec!["activities".into()]);
        orphan.owner_pid = dead_pid;
        fs::write(&path, serde_yaml::to_string(&orphan).unwrap()).unwrap();

        let (entered_tx, entered_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        let slow = LockManager::new(
            &path,
            settings(),
            Arc::new(PausingLiveness {
                dead_pid,
                entered: Mutex::new(Some(entered_tx)),
                resume: Mutex::new(Some(resume_rx)),
            }),
        );
        let fast = LockManager::new(&path, settings(), Arc::new(OneDeadPid(dead_pid)));

        std::thread::scope(|scope| {
            let slow_attempt = scope.spawn(|| {
                slow.acquire("slow-sync", &["activities"], Duration::from_millis(100))
                    .map(|guard| guard.lock().lock_id.clone())
            });

            // The slow acquirer has seen the orphan as stale but not yet acted on it
            entered_rx.recv().unwrap();
            let guard = fast.acquire("fast-sync", &["activities"], Duration::ZERO).unwrap();
            let published = fs::read(&path).unwrap();
            resume_tx.send(()).unwrap();

            match slow_attempt.join().unwrap() {
                Err(LockError::Timeout { holder, .. }) => {
                    assert_eq!(holder.unwrap().lock_id, guard.lock().lock_id);
                }
                other => panic!("slow acquirer should have timed out, got {other:?}"),
            }
            assert_eq!(fs::read(&path).unwrap(), published);
            assert!(guard.release().unwrap());
        });
    }

    #[test]
    fn guard_releases_during_unwinding() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = manager.acquire("sync", &["activities"], Duration::ZERO).unwrap();
            panic!("step blew up");
        }));

        assert!(result.is_err());
        assert!(!manager.path().exists());
    }

    #[test]
    fn concurrent_acquirers_are_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(
            dir.path().join(".sync_lock"),
            LockSettings {
                race_retries: 1_000,
                ..settings()
            },
            Arc::new(SystemLiveness),
        );
        let inside = AtomicBool::new(false);
        let completed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..6 {
                let (manager, inside, completed) = (&manager, &inside, &completed);
                scope.spawn(move || {
                    for round in 0..5 {
                        let guard = manager
                            .acquire(&format!("worker-{worker}-{round}"), &["activities"], Duration::from_secs(20))
                            .unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        std::thread::sleep(Duration::from_millis(2));
                        inside.store(false, Ordering::SeqCst);
                        drop(guard);
                        completed.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(completed.load(Ordering::SeqCst), 30);
        assert!(!manager.path().exists());
    }
}
