use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("vector dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("collection '{collection}' uses {existing} distance, requested {requested}")]
    DistanceMismatch {
        collection: String,
        existing: String,
        requested: String,
    },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("index schema version {found} is not supported (expected {expected})")]
    SchemaVersion { found: i64, expected: i64 },
    #[error("stored vector for chunk '{0}' is corrupt")]
    CorruptVector(String),
}
