/// Record type definitions
///
/// A record is an untyped field map tagged with its kind. The version header
/// is owned by the store: it is stripped on read and stamped on write, so
/// callers only ever see the body at the current version.

use crate::schema::{KIND_FIELD, VERSION_FIELD};
use semver::Version;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

/// A named, schema-versioned payload stored as one file
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: String,
    /// Version the body conforms to; `None` until the record has been read from disk
    version: Option<Version>,
    fields: Map<String, Value>,
}

impl Record {
    /// New record of `kind` with the given body
    pub fn new(kind: impl Into<String>, fields: Map<String, Value>) -> Self {
        let mut fields = fields;
        fields.remove(KIND_FIELD);
        fields.remove(VERSION_FIELD);
        Self {
            kind: kind.into(),
            version: None,
            fields,
        }
    }

    /// Build a record from any serializable struct whose JSON form is an object
    pub fn from_typed<T: Serialize>(kind: impl Into<String>, value: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(value)? {
            Value::Object(fields) => Ok(Self::new(kind, fields)),
            other => Err(serde::ser::Error::custom(format!(
                "record body must serialize to an object, got {other}"
            ))),
        }
    }

    /// Decode the body into a typed structure
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.fields.clone()))
    }

    pub(crate) fn loaded(kind: String, version: Version, mut fields: Map<String, Value>) -> Self {
        fields.remove(KIND_FIELD);
        fields.remove(VERSION_FIELD);
        Self {
            kind,
            version: Some(version),
            fields,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set a body field; header fields cannot be set this way
    pub fn set(&mut self, field: impl Into<String>, value: Value) -> &mut Self {
        let field = field.into();
        if field != KIND_FIELD && field != VERSION_FIELD {
            self.fields.insert(field, value);
        }
        self
    }

    /// On-disk document: header first, then the body
    pub(crate) fn to_document(&self, version: &Version) -> Value {
        let mut doc = Map::with_capacity(self.fields.len() + 2);
        doc.insert(KIND_FIELD.to_string(), Value::String(self.kind.clone()));
        doc.insert(VERSION_FIELD.to_string(), Value::String(version.to_string()));
        for (key, value) in &self.fields {
            doc.insert(key.clone(), value.clone());
        }
        Value::Object(doc)
    }
}
