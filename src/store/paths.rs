/// Logical key to filesystem path mapping
///
/// Pure functions only: nothing in this module touches the disk. Every record
/// kind registers a layout describing its directory, partitioning, and file
/// format; keys are then mapped deterministically onto relative paths.

use crate::store::error::{StoreError, StoreResult};
use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A normalized, root-relative record path using `/` separators
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RecordPath(String);

impl RecordPath {
    /// Validate and normalize a relative path such as `activities/2025-03/a.yaml`
    pub fn new(raw: impl AsRef<str>) -> StoreResult<Self> {
        let raw = raw.as_ref();
        let normalized = raw.replace('\\', "/");

        if normalized.is_empty() {
            return Err(StoreError::invalid_path(raw, "empty path"));
        }
        if normalized.starts_with('/') || Path::new(raw).is_absolute() {
            return Err(StoreError::invalid_path(raw, "must be relative to the store root"));
        }

        let mut segments = Vec::new();
        for segment in normalized.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(StoreError::invalid_path(raw, "parent components are not allowed")),
                other => segments.push(other),
            }
        }
        if segments.is_empty() {
            return Err(StoreError::invalid_path(raw, "empty path"));
        }

        Ok(Self(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn extension(&self) -> Option<&str> {
        let name = self.file_name();
        name.rfind('.').filter(|idx| *idx > 0).map(|idx| &name[idx + 1..])
    }

    /// Whether this path equals `prefix` or lies beneath it, compared by whole segments
    pub fn is_under(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return true;
        }
        self.0 == prefix
            || (self.0.starts_with(prefix) && self.0.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    /// Sibling path with a numeric suffix before the extension (`a.yaml` -> `a_3.yaml`)
    pub fn with_suffix(&self, n: u32) -> RecordPath {
        let name = self.file_name();
        let (stem, ext) = match name.rfind('.').filter(|idx| *idx > 0) {
            Some(idx) => (&name[..idx], &name[idx..]),
            None => (name, ""),
        };
        let parent_len = self.0.len() - name.len();
        RecordPath(format!("{}{}_{}{}", &self.0[..parent_len], stem, n, ext))
    }
}

impl fmt::Display for RecordPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Serialized text format of a record file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Yaml,
    Json,
}

impl RecordFormat {
    pub fn extension(self) -> &'static str {
        match self {
            RecordFormat::Yaml => "yaml",
            RecordFormat::Json => "json",
        }
    }

    /// Format implied by a path's extension
    pub fn for_path(path: &RecordPath) -> StoreResult<Self> {
        match path.extension() {
            Some("yaml") | Some("yml") => Ok(RecordFormat::Yaml),
            Some("json") => Ok(RecordFormat::Json),
            _ => Err(StoreError::invalid_path(
                path.as_str(),
                "expected a .yaml, .yml or .json extension",
            )),
        }
    }
}

/// How files of one kind are spread over directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// Exactly one file of this kind (e.g. the athlete profile)
    Singleton { file: String },
    /// One file per named key directly under the kind directory
    Flat,
    /// Time-series kinds: one subdirectory per `YYYY-MM`
    Monthly,
}

/// Directory layout registered for a record kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindLayout {
    pub directory: String,
    pub partition: Partition,
    pub format: RecordFormat,
}

impl KindLayout {
    pub fn singleton(directory: impl Into<String>, file: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            partition: Partition::Singleton { file: file.into() },
            format: RecordFormat::Yaml,
        }
    }

    pub fn flat(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            partition: Partition::Flat,
            format: RecordFormat::Yaml,
        }
    }

    pub fn monthly(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            partition: Partition::Monthly,
            format: RecordFormat::Yaml,
        }
    }

    pub fn format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }
}

/// Logical identity of a record: its kind plus whatever distinguishes it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub kind: String,
    pub date: Option<NaiveDate>,
    pub time: Option<NaiveTime>,
    pub name: Option<String>,
}

impl RecordKey {
    /// Key for a singleton kind
    pub fn singleton(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            date: None,
            time: None,
            name: None,
        }
    }

    /// Key for a time-series record on `date`
    pub fn dated(kind: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            date: Some(date),
            ..Self::singleton(kind)
        }
    }

    /// Key for a record identified by name
    pub fn named(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::singleton(kind)
        }
    }

    pub fn at(mut self, time: NaiveTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Maps logical keys to root-relative and absolute paths
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    layouts: HashMap<String, KindLayout>,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layouts: HashMap::new(),
        }
    }

    /// Register (or replace) the layout for `kind`
    pub fn with_layout(mut self, kind: impl Into<String>, layout: KindLayout) -> Self {
        self.layouts.insert(kind.into(), layout);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self, kind: &str) -> Option<&KindLayout> {
        self.layouts.get(kind)
    }

    /// Deterministic path for a logical key
    pub fn resolve(&self, key: &RecordKey) -> StoreResult<RecordPath> {
        let layout = self.layouts.get(&key.kind).ok_or_else(|| {
            StoreError::invalid_path(&key.kind, "no layout registered for this kind")
        })?;
        let ext = layout.format.extension();
        let dir = layout.directory.trim_matches('/');

        let relative = match &layout.partition {
            Partition::Singleton { file } => format!("{dir}/{file}.{ext}"),
            Partition::Flat => {
                let name = key.name.as_deref().ok_or_else(|| {
                    StoreError::invalid_path(&key.kind, "flat kinds need a name in the key")
                })?;
                let mut stem = String::new();
                if let Some(date) = key.date {
                    stem.push_str(&date.format("%Y-%m-%d_").to_string());
                }
                stem.push_str(&slugify(&key.kind, name)?);
                format!("{dir}/{stem}.{ext}")
            }
            Partition::Monthly => {
                let date = key.date.ok_or_else(|| {
                    StoreError::invalid_path(&key.kind, "time-series kinds need a date in the key")
                })?;
                let mut stem = date.format("%Y-%m-%d").to_string();
                if let Some(time) = key.time {
                    stem.push_str(&time.format("_%H%M").to_string());
                }
                if let Some(name) = &key.name {
                    stem.push('_');
                    stem.push_str(&slugify(&key.kind, name)?);
                }
                format!("{dir}/{}/{stem}.{ext}", date.format("%Y-%m"))
            }
        };

        RecordPath::new(relative)
    }

    /// The `attempt`-th candidate for a key's file: the plain path first, then `_2`, `_3`, ...
    pub fn candidate(&self, base: &RecordPath, attempt: u32) -> RecordPath {
        if attempt <= 1 {
            base.clone()
        } else {
            base.with_suffix(attempt)
        }
    }

    pub fn absolute(&self, path: &RecordPath) -> PathBuf {
        path.segments().fold(self.root.clone(), |acc, seg| acc.join(seg))
    }

    /// Map an absolute path found on disk back to a record path under the root
    pub fn relative(&self, absolute: &Path) -> Option<RecordPath> {
        let stripped = absolute.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?.to_string()),
                _ => return None,
            }
        }
        RecordPath::new(parts.join("/")).ok()
    }
}

fn slugify(kind: &str, name: &str) -> StoreResult<String> {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        return Err(StoreError::invalid_path(
            format!("{kind}:{name}"),
            "name has no usable characters",
        ));
    }
    Ok(slug)
}
