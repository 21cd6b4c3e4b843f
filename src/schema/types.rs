/// Schema type definitions
///
/// Describes the shape each record kind must have after migration, and the
/// field-level problems reported when a payload does not match.

use semver::Version;
use serde_json::{Map, Value};
use std::fmt;

/// Header field naming the record kind
pub const KIND_FIELD: &str = "schema_kind";
/// Header field carrying the record's format version
pub const VERSION_FIELD: &str = "format_version";

/// One field-level validation problem
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldIssue {
    /// Dotted field name (e.g. `laps.0.distance_m`)
    pub field: String,
    pub problem: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.problem)
    }
}

/// Why a record's declared version cannot be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionProblem {
    /// The file was written by a newer schema than this reader supports
    NewerThanSupported,
    /// No direct migration edge from the file's version to the current one
    NoMigrationEdge,
    /// A registered migration rejected the payload
    MigrationFailed(String),
    /// Header missing, mismatched, or unparseable
    BadHeader(String),
    /// The kind was never registered with this registry
    UnknownKind,
}

impl fmt::Display for VersionProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionProblem::NewerThanSupported => write!(f, "file is newer than supported"),
            VersionProblem::NoMigrationEdge => write!(f, "no migration edge registered"),
            VersionProblem::MigrationFailed(reason) => write!(f, "migration failed: {reason}"),
            VersionProblem::BadHeader(reason) => write!(f, "bad header: {reason}"),
            VersionProblem::UnknownKind => write!(f, "kind is not registered"),
        }
    }
}

/// Parse a format version, accepting the short forms `"2"` and `"2.1"`.
///
/// Components compare numerically, so `"1.10.0"` sorts after `"1.9.0"`.
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim();
    let dots = trimmed.chars().filter(|c| *c == '.').count();
    let padded = match dots {
        0 => format!("{trimmed}.0.0"),
        1 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };
    Version::parse(&padded)
}

/// Expected type of a single field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// ISO calendar date, `YYYY-MM-DD`
    Date,
    /// RFC 3339 timestamp
    DateTime,
    /// Array whose every element has the given kind
    ArrayOf(Box<FieldKind>),
    /// Array of anything
    Array,
    /// Nested object validated against its own schema
    Object(RecordSchema),
    /// Any JSON object
    Map,
    Any,
}

impl FieldKind {
    fn describe(&self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Integer => "an integer",
            FieldKind::Number => "a number",
            FieldKind::Boolean => "a boolean",
            FieldKind::Date => "a YYYY-MM-DD date",
            FieldKind::DateTime => "an RFC 3339 timestamp",
            FieldKind::ArrayOf(_) | FieldKind::Array => "an array",
            FieldKind::Object(_) | FieldKind::Map => "an object",
            FieldKind::Any => "any value",
        }
    }

    fn check(&self, field: &str, value: &Value, issues: &mut Vec<FieldIssue>) {
        let ok = match (self, value) {
            (FieldKind::Any, _) => true,
            (FieldKind::String, Value::String(_)) => true,
            (FieldKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldKind::Number, Value::Number(_)) => true,
            (FieldKind::Boolean, Value::Bool(_)) => true,
            (FieldKind::Date, Value::String(s)) => {
                chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            (FieldKind::DateTime, Value::String(s)) => {
                chrono::DateTime::parse_from_rfc3339(s).is_ok()
            }
            (FieldKind::Array, Value::Array(_)) => true,
            (FieldKind::ArrayOf(inner), Value::Array(items)) => {
                for (idx, item) in items.iter().enumerate() {
                    inner.check(&format!("{field}.{idx}"), item, issues);
                }
                true
            }
            (FieldKind::Map, Value::Object(_)) => true,
            (FieldKind::Object(schema), Value::Object(map)) => {
                schema.collect_issues(Some(field), map, issues);
                true
            }
            _ => false,
        };

        if !ok {
            issues.push(FieldIssue::new(
                field,
                format!("expected {}, found {}", self.describe(), value_type(value)),
            ));
        }
    }
}

/// One named field in a schema
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Field-level schema for one record kind at its current version
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSchema {
    pub fields: Vec<FieldSpec>,
    /// Report fields the schema does not declare
    pub strict: bool,
}

impl RecordSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field; `null` is accepted for it
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Validate a record body, returning every problem found.
    ///
    /// Header fields are not part of the schema and are ignored here.
    pub fn validate(&self, fields: &Map<String, Value>) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        self.collect_issues(None, fields, &mut issues);
        issues
    }

    fn collect_issues(
        &self,
        prefix: Option<&str>,
        fields: &Map<String, Value>,
        issues: &mut Vec<FieldIssue>,
    ) {
        let qualify = |name: &str| match prefix {
            Some(p) => format!("{p}.{name}"),
            None => name.to_string(),
        };

        for spec in &self.fields {
            let name = qualify(&spec.name);
            match fields.get(&spec.name) {
                None if spec.required => issues.push(FieldIssue::new(name, "missing required field")),
                Some(Value::Null) if spec.required => {
                    issues.push(FieldIssue::new(name, "required field is null"))
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.kind.check(&name, value, issues),
            }
        }

        if self.strict {
            for key in fields.keys() {
                let is_header = prefix.is_none() && (key == KIND_FIELD || key == VERSION_FIELD);
                if !is_header && !self.fields.iter().any(|spec| &spec.name == key) {
                    issues.push(FieldIssue::new(qualify(key), "unknown field"));
                }
            }
        }
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
