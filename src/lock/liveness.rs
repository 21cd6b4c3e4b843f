/// Process liveness checks for stale lock detection
///
/// A lock whose owner process has exited can be reclaimed immediately rather
/// than waiting out the age threshold.

use std::fmt::Debug;

/// Answers whether a process id is still running on this machine
pub trait ProcessLiveness: Send + Sync + Debug {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Liveness check backed by the operating system
///
/// On Unix this is `kill(pid, 0)`; on other platforms every process is
/// assumed alive, so only the age threshold can reclaim a lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLiveness;

impl ProcessLiveness for SystemLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return true;
        }
        is_pid_alive(pid)
    }
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs the existence and permission checks only;
    // no signal is delivered.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to someone else
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
    true
}
