/// Atomic, schema-validated record I/O
///
/// Reads parse, migrate, and validate on every call; nothing is cached, so a
/// read always reflects the latest complete generation of the file. Writes go
/// to a hidden temp file in the target's directory and are renamed over the
/// target, so readers observe either the old bytes or the new bytes, never a mix.

use crate::schema::{FieldIssue, SchemaRegistry};
use crate::store::error::{StoreError, StoreResult};
use crate::store::glob::GlobPattern;
use crate::store::paths::{PathResolver, RecordFormat, RecordKey, RecordPath};
use crate::store::record::Record;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::ffi::OsStr;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;

/// Upper bound on `_N` suffixes tried when allocating a colliding filename
const MAX_SUFFIX_ATTEMPTS: u32 = 10_000;

/// Suffix of in-flight write files; they are also dot-prefixed
const TEMP_SUFFIX: &str = ".tmp";

/// File-backed record store rooted at one directory
///
/// Single-file reads and writes are safe without a lock. Multi-file updates
/// that must appear consistent as a set need a held `Lock` from the
/// `LockManager` for their whole duration.
#[derive(Debug, Clone)]
pub struct AtomicRecordStore {
    /// Key to path mapping for every registered kind
    resolver: PathResolver,
    /// Current versions, schemas, and migrations
    registry: Arc<SchemaRegistry>,
}

impl AtomicRecordStore {
    pub fn new(resolver: PathResolver, registry: Arc<SchemaRegistry>) -> Self {
        Self { resolver, registry }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    /// Read, migrate, and validate the record at `path`
    ///
    /// Returns `StoreError::NotFound` when the file does not exist.
    pub fn read(&self, path: &RecordPath, kind: &str) -> StoreResult<Record> {
        let absolute = self.resolver.absolute(path);
        let bytes = fs::read(&absolute).map_err(|e| StoreError::from_read(absolute.clone(), e))?;
        tracing::debug!("📖 Read {} ({} bytes)", path, bytes.len());
        self.decode(path, kind, &bytes)
    }

    /// Like `read`, but a missing file is `Ok(None)`
    pub fn read_optional(&self, path: &RecordPath, kind: &str) -> StoreResult<Option<Record>> {
        match self.read(path, kind) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read and decode into a typed structure
    pub fn read_as<T: DeserializeOwned>(&self, path: &RecordPath, kind: &str) -> StoreResult<T> {
        let record = self.read(path, kind)?;
        record.decode().map_err(|e| StoreError::Validation {
            path: self.resolver.absolute(path),
            kind: kind.to_string(),
            issues: vec![FieldIssue::new("<root>", e.to_string())],
        })
    }

    /// Validate `record` and atomically replace the file at `path` with it
    ///
    /// The header is rewritten to the kind's current version. Parent
    /// directories are created as needed.
    pub fn write(&self, path: &RecordPath, record: &Record) -> StoreResult<()> {
        let format = RecordFormat::for_path(path)?;
        let spec = self.registry.spec_or_err(record.kind())?;
        let absolute = self.resolver.absolute(path);

        let issues = spec.schema.validate(record.fields());
        if !issues.is_empty() {
            return Err(StoreError::Validation {
                path: absolute,
                kind: record.kind().to_string(),
                issues,
            });
        }

        let document = record.to_document(&spec.current_version);
        let bytes = serialize(format, &document).map_err(|message| StoreError::Write {
            path: absolute.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, message),
        })?;

        write_atomic(&absolute, &bytes)?;
        tracing::debug!("💾 Wrote {} record to {} ({} bytes)", record.kind(), path, bytes.len());
        Ok(())
    }

    /// Remove the file at `path`; returns whether anything was removed
    pub fn delete(&self, path: &RecordPath) -> StoreResult<bool> {
        let absolute = self.resolver.absolute(path);
        match fs::remove_file(&absolute) {
            Ok(()) => {
                tracing::debug!("🗑️ Deleted {}", path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::from_write(absolute, e)),
        }
    }

    pub fn exists(&self, path: &RecordPath) -> bool {
        self.resolver.absolute(path).is_file()
    }

    /// Exact current bytes of `path`, or `None` if it does not exist
    pub fn read_raw(&self, path: &RecordPath) -> StoreResult<Option<Vec<u8>>> {
        let absolute = self.resolver.absolute(path);
        match fs::read(&absolute) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::from_read(absolute, e)),
        }
    }

    /// Atomically put back bytes previously captured with `read_raw`
    pub fn restore_raw(&self, path: &RecordPath, bytes: &[u8]) -> StoreResult<()> {
        write_atomic(&self.resolver.absolute(path), bytes)
    }

    /// Outermost directory that writing `path` would have to create
    ///
    /// `None` when the parent directory already exists.
    pub fn first_missing_dir(&self, path: &RecordPath) -> Option<PathBuf> {
        let root = self.root();
        let absolute = self.resolver.absolute(path);
        let mut missing = None;
        let mut dir = absolute.parent();
        while let Some(current) = dir {
            if current == root || !current.starts_with(root) || current.is_dir() {
                break;
            }
            missing = Some(current.to_path_buf());
            dir = current.parent();
        }
        missing
    }

    /// Remove empty directories from the parent of `path` up to and
    /// including `top`; stops at the first one that cannot be removed
    pub fn prune_empty_dirs(&self, path: &RecordPath, top: &Path) -> usize {
        let absolute = self.resolver.absolute(path);
        let mut pruned = 0;
        let mut dir = absolute.parent();
        while let Some(current) = dir {
            if !current.starts_with(top) || fs::remove_dir(current).is_err() {
                break;
            }
            tracing::debug!("🧹 Removed empty directory {}", current.display());
            pruned += 1;
            if current == top {
                break;
            }
            dir = current.parent();
        }
        pruned
    }

    /// Paths matching `pattern`, sorted; re-scans the filesystem on every call
    pub fn list(&self, pattern: &str) -> StoreResult<Vec<RecordPath>> {
        let glob = GlobPattern::new(pattern)?;
        let start = glob
            .literal_prefix()
            .iter()
            .fold(self.root().to_path_buf(), |acc, seg| acc.join(seg));
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(&start).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                // Entries removed while we walk are simply not listed
                Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => continue,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| start.clone());
                    return Err(match e.into_io_error() {
                        Some(io) => StoreError::from_read(path, io),
                        None => StoreError::Directory {
                            path,
                            message: "filesystem loop while listing".to_string(),
                        },
                    });
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(path) = self.resolver.relative(entry.path()) {
                if glob.matches(&path) {
                    found.push(path);
                }
            }
        }

        found.sort();
        tracing::debug!("📂 Listed {} paths for '{}'", found.len(), pattern);
        Ok(found)
    }

    /// First free path for `key` under the suffix-increment rule
    ///
    /// Check-then-write: callers allocating several paths that must not
    /// collide with other processes should hold the lock while writing.
    pub fn allocate(&self, key: &RecordKey) -> StoreResult<RecordPath> {
        let base = self.resolver.resolve(key)?;
        for attempt in 1..=MAX_SUFFIX_ATTEMPTS {
            let candidate = self.resolver.candidate(&base, attempt);
            if !self.resolver.absolute(&candidate).exists() {
                return Ok(candidate);
            }
        }
        Err(StoreError::Directory {
            path: self.resolver.absolute(&base),
            message: format!("no free filename after {MAX_SUFFIX_ATTEMPTS} attempts"),
        })
    }

    /// Remove hidden temp files left by writers that died mid-write
    ///
    /// Only files at least `older_than` old are touched, so writes in flight
    /// elsewhere are left alone. Returns the removed paths, sorted.
    pub fn sweep_temp_files(&self, older_than: Duration) -> StoreResult<Vec<PathBuf>> {
        let root = self.root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let now = SystemTime::now();
        let mut removed = Vec::new();
        for entry in walkdir::WalkDir::new(root).follow_links(false).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || !is_temp_name(entry.file_name()) {
                continue;
            }
            let age = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or(Duration::ZERO);
            if age < older_than {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::info!("🧹 Removed abandoned temp file {} ({:?} old)", entry.path().display(), age);
                    removed.push(entry.into_path());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::from_write(entry.into_path(), e)),
            }
        }

        removed.sort();
        Ok(removed)
    }

    fn decode(&self, path: &RecordPath, kind: &str, bytes: &[u8]) -> StoreResult<Record> {
        let absolute = || self.resolver.absolute(path);
        let format = RecordFormat::for_path(path)?;

        let value = parse(format, bytes).map_err(|message| StoreError::Parse {
            path: absolute(),
            message,
        })?;
        let raw = match value {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Parse {
                    path: absolute(),
                    message: format!("top level must be a mapping, found {}", type_name(&other)),
                })
            }
        };

        let migrated = self.registry.migrate(raw, kind)?;
        let spec = self.registry.spec_or_err(kind)?;
        let issues = spec.schema.validate(&migrated);
        if !issues.is_empty() {
            return Err(StoreError::Validation {
                path: absolute(),
                kind: kind.to_string(),
                issues,
            });
        }

        Ok(Record::loaded(kind.to_string(), spec.current_version.clone(), migrated))
    }
}

fn parse(format: RecordFormat, bytes: &[u8]) -> Result<Value, String> {
    match format {
        RecordFormat::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        RecordFormat::Yaml => serde_yaml::from_slice(bytes).map_err(|e| e.to_string()),
    }
}

fn serialize(format: RecordFormat, document: &Value) -> Result<Vec<u8>, String> {
    match format {
        RecordFormat::Json => {
            let mut bytes = serde_json::to_vec_pretty(document).map_err(|e| e.to_string())?;
            bytes.push(b'\n');
            Ok(bytes)
        }
        RecordFormat::Yaml => serde_yaml::to_string(document)
            .map(String::into_bytes)
            .map_err(|e| e.to_string()),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// Replace `target` with `bytes` via temp file + rename in the same directory
///
/// The temp file is deleted if anything fails before the rename; the target
/// is left with its previous content.
pub(crate) fn write_atomic(target: &Path, bytes: &[u8]) -> StoreResult<()> {
    let dir = target.parent().ok_or_else(|| StoreError::Directory {
        path: target.to_path_buf(),
        message: "target has no parent directory".to_string(),
    })?;
    ensure_dir(dir)?;

    let file_name = target
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StoreError::Directory {
            path: target.to_path_buf(),
            message: "target has no usable file name".to_string(),
        })?;

    let written = temp_file(dir, file_name).and_then(|mut temp| {
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(target).map(|_| ()).map_err(|e| e.error)
    });
    if let Err(source) = written {
        tracing::error!("❌ Atomic write to {} failed: {}", target.display(), source);
        return Err(StoreError::from_write(target.to_path_buf(), source));
    }

    sync_dir(dir);
    Ok(())
}

/// Hidden, uniquely named sibling of the target so listings never see it
fn temp_file(dir: &Path, file_name: &str) -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
}

fn is_temp_name(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| name.starts_with('.') && name.ends_with(TEMP_SUFFIX))
}

fn ensure_dir(dir: &Path) -> StoreResult<()> {
    fs::create_dir_all(dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => StoreError::Permission {
            path: dir.to_path_buf(),
            source: e,
        },
        _ => StoreError::Directory {
            path: dir.to_path_buf(),
            message: e.to_string(),
        },
    })
}

/// Persist the rename itself; best effort, not every platform can open directories
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            tracing::debug!("Directory fsync skipped for {}: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldKind, RecordSchema, VersionProblem};
    use crate::store::paths::KindLayout;
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> AtomicRecordStore {
        let mut registry = SchemaRegistry::new();
        registry
            .register_kind(
                "activity",
                "2.0.0",
                RecordSchema::new()
                    .required("date", FieldKind::Date)
                    .required("distance_m", FieldKind::Number),
            )
            .unwrap();
        registry
            .register_migration("activity", "1.0.0", "2.0.0", |mut raw| {
                let km = raw.remove("distance_km").and_then(|v| v.as_f64()).unwrap_or(0.0);
                raw.insert("distance_m".into(), json!(km * 1000.0));
                Ok(raw)
            })
            .unwrap();
        registry
            .register_kind("profile", "1", RecordSchema::new().required("name", FieldKind::String))
            .unwrap();

        let resolver = PathResolver::new(dir.path())
            .with_layout("activity", KindLayout::monthly("activities"))
            .with_layout("profile", KindLayout::singleton("config", "profile"));
        AtomicRecordStore::new(resolver, Arc::new(registry))
    }

    fn activity(distance_m: f64) -> Record {
        Record::new(
            "activity",
            json!({"date": "2025-03-09", "distance_m": distance_m})
                .as_object()
                .cloned()
                .unwrap(),
        )
    }

    fn path(raw: &str) -> RecordPath {
        RecordPath::new(raw).unwrap()
    }

    #[test]
    fn write_then_read_stamps_current_header() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let target = path("activities/2025-03/a.yaml");

        store.write(&target, &activity(5000.0)).unwrap();

        let text = fs::read_to_string(dir.path().join("activities/2025-03/a.yaml")).unwrap();
        assert!(text.starts_with("schema_kind: activity\nformat_version:"), "{text}");
        assert!(text.lines().nth(1).unwrap().contains("2.0.0"), "{text}");

        let back = store.read(&target, "activity").unwrap();
        assert_eq!(back.get("distance_m"), Some(&json!(5000.0)));
        assert_eq!(back.version(), Some(&semver::Version::new(2, 0, 0)));
    }

    #[test]
    fn json_files_are_supported() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let target = path("activities/2025-03/a.json");

        store.write(&target, &activity(1200.0)).unwrap();
        let raw: Value = serde_json::from_slice(&fs::read(dir.path().join("activities/2025-03/a.json")).unwrap()).unwrap();
        assert_eq!(raw["format_version"], json!("2.0.0"));
        assert_eq!(store.read(&target, "activity").unwrap().get("distance_m"), Some(&json!(1200.0)));
    }

    #[test]
    fn old_files_are_migrated_on_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(dir.path().join("activities/2025-03")).unwrap();
        fs::write(
            dir.path().join("activities/2025-03/old.yaml"),
            "schema_kind: activity\nformat_version: '1.0'\ndate: 2025-03-01\ndistance_km: 4.2\n",
        )
        .unwrap();

        let record = store.read(&path("activities/2025-03/old.yaml"), "activity").unwrap();
        assert_eq!(record.get("distance_m"), Some(&json!(4200.0)));
        assert!(record.get("distance_km").is_none());
    }

    #[test]
    fn newer_files_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(
            dir.path().join("config/profile.yaml"),
            "schema_kind: profile\nformat_version: 2.0.0\nname: Sam\n",
        )
        .unwrap();

        let err = store.read(&path("config/profile.yaml"), "profile").unwrap_err();
        assert!(matches!(
            err,
            StoreError::SchemaVersion { problem: VersionProblem::NewerThanSupported, .. }
        ));
    }

    #[test]
    fn read_errors_are_classified() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let target = path("config/profile.yaml");

        assert!(store.read(&target, "profile").unwrap_err().is_not_found());
        assert!(store.read_optional(&target, "profile").unwrap().is_none());

        fs::create_dir_all(dir.path().join("config")).unwrap();
        fs::write(dir.path().join("config/profile.yaml"), "name: [unclosed").unwrap();
        assert!(matches!(store.read(&target, "profile"), Err(StoreError::Parse { .. })));

        fs::write(
            dir.path().join("config/profile.yaml"),
            "schema_kind: profile\nformat_version: 1.0.0\nname: 42\n",
        )
        .unwrap();
        match store.read(&target, "profile").unwrap_err() {
            StoreError::Validation { issues, .. } => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].field, "name");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_records_are_never_written() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let bad = Record::new("activity", json!({"date": "soon"}).as_object().cloned().unwrap());

        let err = store.write(&path("activities/2025-03/a.yaml"), &bad).unwrap_err();
        match err {
            StoreError::Validation { issues, .. } => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!dir.path().join("activities/2025-03/a.yaml").exists());
    }

    #[test]
    fn failed_rename_keeps_old_content_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        // A non-empty directory at the target path makes the final rename fail
        fs::create_dir_all(dir.path().join("activities/2025-03/a.yaml/inner")).unwrap();

        let err = store.write(&path("activities/2025-03/a.yaml"), &activity(1.0)).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. } | StoreError::Permission { .. }));

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("activities/2025-03"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["a.yaml".to_string()]);
        assert!(dir.path().join("activities/2025-03/a.yaml/inner").is_dir());
    }

    #[test]
    fn list_rescans_and_skips_hidden_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write(&path("activities/2025-03/b.yaml"), &activity(1.0)).unwrap();
        store.write(&path("activities/2025-03/a.yaml"), &activity(1.0)).unwrap();
        fs::write(dir.path().join("activities/2025-03/.a.yaml.deadbeef.tmp"), "x").unwrap();

        let listed = store.list("activities/**/*.yaml").unwrap();
        let names: Vec<&str> = listed.iter().map(RecordPath::as_str).collect();
        assert_eq!(names, vec!["activities/2025-03/a.yaml", "activities/2025-03/b.yaml"]);

        store.write(&path("activities/2025-04/c.yaml"), &activity(1.0)).unwrap();
        assert_eq!(store.list("activities/**/*.yaml").unwrap().len(), 3);
        assert!(store.list("missing/*.yaml").unwrap().is_empty());
    }

    #[test]
    fn sweep_removes_only_old_hidden_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.write(&path("activities/2025-03/a.yaml"), &activity(1.0)).unwrap();
        let stray = dir.path().join("activities/2025-03/.a.yaml.k3j2h1.tmp");
        let visible = dir.path().join("activities/2025-03/notes.tmp");
        fs::write(&stray, "partial").unwrap();
        fs::write(&visible, "keep").unwrap();

        assert!(store.sweep_temp_files(Duration::from_secs(3600)).unwrap().is_empty());
        assert!(stray.exists());

        let an_hour_ago = SystemTime::now() - Duration::from_secs(7200);
        for file in [&stray, &visible] {
            fs::File::options().write(true).open(file).unwrap().set_modified(an_hour_ago).unwrap();
        }
        assert_eq!(store.sweep_temp_files(Duration::from_secs(3600)).unwrap(), vec![stray.clone()]);
        assert!(!stray.exists());
        assert!(visible.exists());
        assert!(store.exists(&path("activities/2025-03/a.yaml")));
    }

    #[test]
    fn allocate_appends_suffix_on_collision() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = RecordKey::dated("activity", NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());

        let first = store.allocate(&key).unwrap();
        assert_eq!(first.as_str(), "activities/2025-03/2025-03-09.yaml");
        store.write(&first, &activity(1.0)).unwrap();

        let second = store.allocate(&key).unwrap();
        assert_eq!(second.as_str(), "activities/2025-03/2025-03-09_2.yaml");
        store.write(&second, &activity(2.0)).unwrap();

        assert_eq!(store.allocate(&key).unwrap().file_name(), "2025-03-09_3.yaml");
    }

    #[test]
    fn raw_snapshots_restore_exact_bytes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let target = path("config/profile.yaml");
        assert_eq!(store.read_raw(&target).unwrap(), None);

        fs::create_dir_all(dir.path().join("config")).unwrap();
        let original = b"schema_kind: profile\nformat_version: 1.0.0\nname: Sam # keep\n".to_vec();
        fs::write(dir.path().join("config/profile.yaml"), &original).unwrap();
        let snapshot = store.read_raw(&target).unwrap().unwrap();

        let renamed = Record::new("profile", json!({"name": "Alex"}).as_object().cloned().unwrap());
        store.write(&target, &renamed).unwrap();
        store.restore_raw(&target, &snapshot).unwrap();

        assert_eq!(fs::read(dir.path().join("config/profile.yaml")).unwrap(), original);
        assert!(store.delete(&target).unwrap());
        assert!(!store.delete(&target).unwrap());
    }
}
