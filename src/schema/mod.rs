/// Schema Layer
///
/// Decouples on-disk format evolution from readers:
/// - Field schemas and validation issues per record kind
/// - Format version headers and parsing
/// - Registry of kinds and single-hop migration edges

// Field schema and header type definitions
pub mod types;

// Kind registry and migration lookup
pub mod registry;

pub use registry::{KindSpec, MigrationFn, RawRecord, RegistryError, SchemaRegistry};
pub use types::{
    parse_version, FieldIssue, FieldKind, FieldSpec, RecordSchema, VersionProblem, KIND_FIELD,
    VERSION_FIELD,
};
