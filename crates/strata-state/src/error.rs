//! Error types for strata-state

use thiserror::Error;

/// Errors that can occur in the build state persistence layer
#[derive(Error, Debug)]
pub enum StateError {
    /// Filesystem error while reading or writing a state file
    #[error("state file io failed at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// State file could not be decoded
    #[error("corrupt state file {location}: {reason}")]
    Corrupt { location: String, reason: String },

    /// State file written by an unknown format version
    #[error("unsupported state file format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// A bucket without a content hash cannot be persisted
    #[error("bucket '{tag}' has no content id and cannot be persisted")]
    UnhashedBucket { tag: String },

    /// Root buckets never carry build state
    #[error("root bucket cannot be persisted")]
    RootBucket,
}

impl StateError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Result type for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;
