use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main error type for tierlru operations
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Cache file {path:?} belongs to a different key")]
    KeyMismatch { path: PathBuf },

    #[error("Entry of {size} bytes does not fit disk limit of {limit} bytes")]
    ExceedsDiskLimit { size: u64, limit: u64 },

    #[error("Recency queue is empty")]
    EmptyQueue,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Wrap an `std::io::Error` with the path it occurred on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Errors that mean the on-disk entry is unusable and should be dropped
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::KeyMismatch { .. })
    }
}

/// Result type alias for tierlru operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Error returned when internal cache invariants are violated.
///
/// Produced by the debug-only `check_invariants` method on
/// [`TieredCache`](crate::TieredCache).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantError(String);

impl InvariantError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvariantError {}
