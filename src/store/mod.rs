/// Record Store Layer
///
/// Durable, validated, atomic single-record I/O:
/// - Logical key to path mapping (pure, no I/O)
/// - Record type with header handling and typed conversion
/// - Temp-file-and-rename writes, migrating/validating reads, glob listings

// Typed errors for every store operation
pub mod error;

// Logical key -> relative path mapping
pub mod paths;

// Record payload and header handling
pub mod record;

// Glob matching for listings
pub mod glob;

// The atomic record store itself
pub mod atomic;

pub use atomic::AtomicRecordStore;
pub use error::{StoreError, StoreResult};
pub use glob::GlobPattern;
pub use paths::{KindLayout, Partition, PathResolver, RecordFormat, RecordKey, RecordPath};
pub use record::Record;
