//! Tessera Core Storage Engine
//!
//! An embedded time-series storage engine implemented in Rust.
//! Measurements are keyed by an entity identity (primary-tag bytes),
//! organized into fixed-capacity column blocks inside memory-mapped
//! partition files, and served through raw and aggregate iterators.

pub mod agg;
pub mod cache;
pub mod context;
pub mod data;
pub mod engine;
pub mod iter;
pub mod payload;
pub mod storage;
pub mod table;
pub mod tag;
pub mod wal;

// Re-export main types
pub use context::OpContext;
pub use data::{AggType, ColumnSchema, ColumnType, DedupRule, EntityId, Schema, TsSpan};
pub use engine::TsEngine;
pub use iter::{BatchIterator, ResultBatch};
pub use storage::EngineOptions;

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum TesseraError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table not found: {0}")]
    TableNotFound(u64),

    #[error("Table already exists: {0}")]
    TableExists(u64),

    #[error("Entity not found")]
    EntityNotFound,

    #[error("Range group not found: {0}")]
    RangeGroupNotFound(u64),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(u64),

    #[error("Column not found: {0}")]
    ColumnNotFound(u32),

    #[error("Column already exists: {0}")]
    ColumnExists(u32),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Mini-transaction conflict: {0}")]
    MtrConflict(String),

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("No space left in object")]
    NoSpace,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<Box<bincode::ErrorKind>> for TesseraError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        TesseraError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
