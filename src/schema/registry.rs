/// Per-kind schema registry with single-hop migrations
///
/// Each record kind registers its current format version and field schema.
/// Older on-disk versions are brought forward by a migration registered for the
/// exact edge `file_version -> current_version`; there is no chaining through
/// intermediate versions, so an unknown gap stops the read instead of guessing.

use crate::schema::types::{parse_version, RecordSchema, VersionProblem, KIND_FIELD, VERSION_FIELD};
use crate::store::StoreError;
use semver::Version;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Untyped record body handed to migrations
pub type RawRecord = Map<String, Value>;

/// A pure transformation from one format version's shape to another's
pub type MigrationFn = Box<dyn Fn(RawRecord) -> Result<RawRecord, String> + Send + Sync>;

/// Errors raised while populating a registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("record kind already registered: {0}")]
    DuplicateKind(String),

    #[error("record kind not registered: {0}")]
    UnknownKind(String),

    #[error("invalid format version {raw:?}: {message}")]
    InvalidVersion { raw: String, message: String },

    #[error("migration for {kind} must move forward, got {from} -> {to}")]
    BackwardEdge { kind: String, from: Version, to: Version },

    #[error("migration for {kind} {from} -> {to} is already registered")]
    DuplicateMigration { kind: String, from: Version, to: Version },
}

/// Registration of one record kind
#[derive(Debug, Clone)]
pub struct KindSpec {
    pub kind: String,
    pub current_version: Version,
    pub schema: RecordSchema,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MigrationKey {
    kind: String,
    from: Version,
    to: Version,
}

/// Registry of record kinds and their migration edges
///
/// Built once by the embedding application and passed to the store explicitly.
#[derive(Default)]
pub struct SchemaRegistry {
    kinds: HashMap<String, KindSpec>,
    migrations: HashMap<MigrationKey, MigrationFn>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.kinds.keys().collect::<Vec<_>>())
            .field("migrations", &self.migrations.len())
            .finish()
    }
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record kind at its current format version
    pub fn register_kind(
        &mut self,
        kind: &str,
        current_version: &str,
        schema: RecordSchema,
    ) -> Result<(), RegistryError> {
        if self.kinds.contains_key(kind) {
            return Err(RegistryError::DuplicateKind(kind.to_string()));
        }
        let current_version = version_arg(current_version)?;

        tracing::debug!("📘 Registered kind '{}' at v{}", kind, current_version);
        self.kinds.insert(
            kind.to_string(),
            KindSpec {
                kind: kind.to_string(),
                current_version,
                schema,
            },
        );
        Ok(())
    }

    /// Register a migration edge for `kind` from `from_version` to `to_version`
    pub fn register_migration<F>(
        &mut self,
        kind: &str,
        from_version: &str,
        to_version: &str,
        migration: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(RawRecord) -> Result<RawRecord, String> + Send + Sync + 'static,
    {
        if !self.kinds.contains_key(kind) {
            return Err(RegistryError::UnknownKind(kind.to_string()));
        }
        let from = version_arg(from_version)?;
        let to = version_arg(to_version)?;
        if from >= to {
            return Err(RegistryError::BackwardEdge {
                kind: kind.to_string(),
                from,
                to,
            });
        }

        let key = MigrationKey {
            kind: kind.to_string(),
            from,
            to,
        };
        if self.migrations.contains_key(&key) {
            return Err(RegistryError::DuplicateMigration {
                kind: key.kind,
                from: key.from,
                to: key.to,
            });
        }

        tracing::debug!("🔀 Registered migration {} {} -> {}", kind, key.from, key.to);
        self.migrations.insert(key, Box::new(migration));
        Ok(())
    }

    pub fn kind(&self, kind: &str) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    pub fn current_version(&self, kind: &str) -> Option<&Version> {
        self.kinds.get(kind).map(|spec| &spec.current_version)
    }

    /// Bring a raw record up to the current version of `kind`.
    ///
    /// Records already at the current version pass through untouched. Older
    /// records need a direct edge to the current version; newer records are
    /// always rejected. The returned map carries the current version header.
    pub fn migrate(&self, mut raw: RawRecord, kind: &str) -> Result<RawRecord, StoreError> {
        let spec = self.spec_or_err(kind)?;
        let found = self.header_version(&raw, spec)?;

        if found == spec.current_version {
            return Ok(raw);
        }
        if found > spec.current_version {
            return Err(version_error(spec, found.to_string(), VersionProblem::NewerThanSupported));
        }

        let key = MigrationKey {
            kind: spec.kind.clone(),
            from: found.clone(),
            to: spec.current_version.clone(),
        };
        let migration = self
            .migrations
            .get(&key)
            .ok_or_else(|| version_error(spec, found.to_string(), VersionProblem::NoMigrationEdge))?;

        raw.remove(KIND_FIELD);
        raw.remove(VERSION_FIELD);
        let mut migrated = migration(raw).map_err(|reason| {
            version_error(spec, found.to_string(), VersionProblem::MigrationFailed(reason))
        })?;
        stamp(&mut migrated, spec);

        tracing::debug!("🔀 Migrated {} record v{} -> v{}", kind, found, spec.current_version);
        Ok(migrated)
    }

    /// Overwrite the header fields of `raw` with `kind`'s current version
    pub fn stamp_header(&self, raw: &mut RawRecord, kind: &str) -> Result<(), StoreError> {
        let spec = self.spec_or_err(kind)?;
        stamp(raw, spec);
        Ok(())
    }

    pub(crate) fn spec_or_err(&self, kind: &str) -> Result<&KindSpec, StoreError> {
        self.kinds.get(kind).ok_or_else(|| StoreError::SchemaVersion {
            kind: kind.to_string(),
            found: "-".to_string(),
            supported: "-".to_string(),
            problem: VersionProblem::UnknownKind,
        })
    }

    fn header_version(&self, raw: &RawRecord, spec: &KindSpec) -> Result<Version, StoreError> {
        let bad_header = |reason: String| {
            version_error(spec, "-".to_string(), VersionProblem::BadHeader(reason))
        };

        match raw.get(KIND_FIELD) {
            Some(Value::String(declared)) if declared == &spec.kind => {}
            Some(Value::String(declared)) => {
                return Err(bad_header(format!("declared kind '{declared}'")));
            }
            _ => return Err(bad_header(format!("missing {KIND_FIELD}"))),
        }

        let raw_version = match raw.get(VERSION_FIELD) {
            Some(Value::String(v)) => v.clone(),
            // A bare integer is unambiguous; an unquoted `1.10` has already
            // been read as the float 1.1
            Some(Value::Number(n)) if n.is_u64() => n.to_string(),
            Some(Value::Number(n)) => {
                return Err(bad_header(format!("{VERSION_FIELD} {n} must be quoted")));
            }
            _ => return Err(bad_header(format!("missing {VERSION_FIELD}"))),
        };
        parse_version(&raw_version).map_err(|e| bad_header(format!("{raw_version}: {e}")))
    }
}

fn version_arg(raw: &str) -> Result<Version, RegistryError> {
    parse_version(raw).map_err(|e| RegistryError::InvalidVersion {
        raw: raw.to_string(),
        message: e.to_string(),
    })
}

fn version_error(spec: &KindSpec, found: String, problem: VersionProblem) -> StoreError {
    StoreError::SchemaVersion {
        kind: spec.kind.clone(),
        found,
        supported: spec.current_version.to_string(),
        problem,
    }
}

fn stamp(raw: &mut RawRecord, spec: &KindSpec) {
    raw.insert(KIND_FIELD.to_string(), Value::String(spec.kind.clone()));
    raw.insert(
        VERSION_FIELD.to_string(),
        Value::String(spec.current_version.to_string()),
    );
}
