use crate::schema::{FieldIssue, VersionProblem};
use std::path::PathBuf;

/// Errors returned by the record store and the path resolver.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {}", .path.display())]
    NotFound { path: PathBuf },

    /// The file exists but is not well-formed YAML/JSON.
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    /// The payload does not match the current schema for its kind.
    #[error("{kind} record {} failed validation: {}", .path.display(), join_issues(.issues))]
    Validation {
        path: PathBuf,
        kind: String,
        issues: Vec<FieldIssue>,
    },

    /// Header newer than supported, missing migration edge, or failed migration.
    #[error("schema version error for {kind} ({found} vs supported {supported}): {problem}")]
    SchemaVersion {
        kind: String,
        found: String,
        supported: String,
        problem: VersionProblem,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("permission denied: {}", .path.display())]
    Permission {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("directory error at {}: {message}", .path.display())]
    Directory { path: PathBuf, message: String },

    /// A logical key or relative path that cannot be mapped under the root.
    #[error("invalid record path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
}

impl StoreError {
    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Classify an I/O error raised while reading `path`.
    pub(crate) fn from_read(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound { path },
            std::io::ErrorKind::PermissionDenied => StoreError::Permission { path, source },
            _ => StoreError::Directory {
                path,
                message: source.to_string(),
            },
        }
    }

    /// Classify an I/O error raised while writing `path`.
    pub(crate) fn from_write(path: PathBuf, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => StoreError::Permission { path, source },
            _ => StoreError::Write { path, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias used across the store
pub type StoreResult<T> = Result<T, StoreError>;
