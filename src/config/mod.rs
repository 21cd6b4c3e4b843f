/// Configuration management for the coachstore engine
///
/// Handles the data root, lock file placement, and lock timing parameters.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Record store configuration
    pub store: StoreConfig,
    /// Cross-process lock configuration
    pub lock: LockConfig,
}

/// Record store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding every record kind directory (default: "data")
    pub root_dir: PathBuf,
}

/// Lock file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lock file path, relative to the store root (default: "config/.sync_lock")
    pub file: PathBuf,
    /// Age after which a lock is considered stale, in seconds
    pub stale_after_secs: u64,
    /// How long `acquire` waits for a live holder before giving up, in milliseconds
    pub acquire_timeout_ms: u64,
    /// Back-off between acquisition attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// How many lost create races are tolerated before giving up
    pub race_retries: u32,
}

impl LockConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            file: env_or("COACHSTORE_LOCK_FILE", "config/.sync_lock").into(),
            stale_after_secs: env_parse("COACHSTORE_LOCK_STALE_SECS", 300),
            acquire_timeout_ms: env_parse("COACHSTORE_LOCK_TIMEOUT_MS", 30_000),
            retry_delay_ms: env_parse("COACHSTORE_LOCK_RETRY_MS", 100),
            race_retries: env_parse("COACHSTORE_LOCK_RACE_RETRIES", 5),
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            store: StoreConfig {
                root_dir: env_or("COACHSTORE_ROOT", "data").into(),
            },
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    /// Configuration rooted at an explicit directory, everything else from the environment
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                root_dir: root_dir.into(),
            },
            lock: LockConfig::default(),
        }
    }

    /// Absolute (root-joined) location of the lock file
    pub fn lock_path(&self) -> PathBuf {
        self.store.root_dir.join(&self.lock.file)
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_joined_under_root() {
        let mut config = Config::with_root("/tmp/coach");
        config.lock.file = PathBuf::from("config/.sync_lock");
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/coach/config/.sync_lock"));
    }

    #[test]
    fn durations_follow_raw_fields() {
        let lock = LockConfig {
            file: PathBuf::from("x"),
            stale_after_secs: 300,
            acquire_timeout_ms: 1500,
            retry_delay_ms: 25,
            race_retries: 3,
        };
        assert_eq!(lock.stale_after(), Duration::from_secs(300));
        assert_eq!(lock.acquire_timeout(), Duration::from_millis(1500));
        assert_eq!(lock.retry_delay(), Duration::from_millis(25));
    }
}
