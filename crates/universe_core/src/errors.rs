use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic or malformed header")]
    BadHeader,

    #[error("Data file format version {0} is not supported")]
    UnsupportedVersion(u16),

    #[error("Data file corrupt: {0}")]
    Corrupt(String),

    #[error("Universe is read-only")]
    ReadOnly,

    #[error("Universe is closed")]
    Closed,

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Illegal migration state: {0}")]
    MigrationState(&'static str),
}

pub type Result<T> = std::result::Result<T, UniverseError>;
