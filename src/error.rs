//! Error types for the shardsnap library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`ShardsnapError`] enum. The snapshot and restore paths rely on a small,
//! stable taxonomy so that callers can tell retryable failures apart from
//! permanent ones:
//!
//! - [`ShardsnapError::IncompleteSource`] is raised before any file is
//!   uploaded and is never worth retrying.
//! - [`ShardsnapError::GenerationConflict`] is transient; the caller re-reads
//!   the repository generation and retries the finalize.
//! - [`ShardsnapError::SourceOnlyUnsupported`] is a permanent property of a
//!   restored source-only shard, not a transient error.

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for shardsnap operations.
#[derive(Error, Debug)]
pub enum ShardsnapError {
    /// I/O errors (file operations, syncing, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Index- and engine-related errors
    #[error("Index error: {0}")]
    Index(String),

    /// Snapshot task errors
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// The shard's mapping does not retain the complete document source,
    /// so the source-only guarantee cannot be met. Raised before any file
    /// touches the repository and never retried automatically.
    #[error(
        "cannot snapshot source only on an index that has incomplete source, \
         i.e. has source storage disabled or filters the source"
    )]
    IncompleteSource,

    /// A capability requiring search index structures was invoked on a
    /// restored source-only shard. Every such call fails with this error
    /// for the lifetime of the shard.
    #[error("source-only indices cannot be searched or filtered")]
    SourceOnlyUnsupported,

    /// A repository finalize was attempted with a stale generation.
    /// Transient and expected under concurrent snapshots; re-read the
    /// generation and retry.
    #[error("generation conflict: expected generation {expected}, repository is at {actual}")]
    GenerationConflict {
        /// The generation the caller expected to be current.
        expected: u64,
        /// The generation the repository actually holds.
        actual: u64,
    },

    /// A restore or reindex pass failed. The partially built target shard
    /// is discarded and never exposed as usable.
    #[error("Reconstruction error: {0}")]
    Reconstruction(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with ShardsnapError.
pub type Result<T> = std::result::Result<T, ShardsnapError>;

impl ShardsnapError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Storage(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Index(msg.into())
    }

    /// Create a new snapshot error.
    pub fn snapshot<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Snapshot(msg.into())
    }

    /// Create a new reconstruction error.
    pub fn reconstruction<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Reconstruction(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::InvalidOperation(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Other(format!("Invalid argument: {}", msg.into()))
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        ShardsnapError::Other(msg.into())
    }

    /// Whether this error is a generation conflict, i.e. a transient
    /// finalize race that the caller should retry with a fresh generation.
    pub fn is_generation_conflict(&self) -> bool {
        matches!(self, ShardsnapError::GenerationConflict { .. })
    }

    /// Whether a whole-snapshot retry can make progress on this error.
    ///
    /// I/O and storage failures are retryable at the snapshot level because
    /// a retry reuses previously uploaded, unchanged files through the
    /// incremental differ. Precondition and capability violations are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardsnapError::Io(_)
                | ShardsnapError::Storage(_)
                | ShardsnapError::GenerationConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let error = ShardsnapError::storage("Test storage error");
        assert_eq!(error.to_string(), "Storage error: Test storage error");

        let error = ShardsnapError::index("Test index error");
        assert_eq!(error.to_string(), "Index error: Test index error");

        let error = ShardsnapError::reconstruction("replay failed");
        assert_eq!(error.to_string(), "Reconstruction error: replay failed");
    }

    #[test]
    fn test_stable_messages() {
        // Automated retries key off these messages; they must not drift.
        assert_eq!(
            ShardsnapError::IncompleteSource.to_string(),
            "cannot snapshot source only on an index that has incomplete source, \
             i.e. has source storage disabled or filters the source"
        );
        assert_eq!(
            ShardsnapError::SourceOnlyUnsupported.to_string(),
            "source-only indices cannot be searched or filtered"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(!ShardsnapError::IncompleteSource.is_retryable());
        assert!(!ShardsnapError::SourceOnlyUnsupported.is_retryable());
        assert!(ShardsnapError::storage("boom").is_retryable());

        let conflict = ShardsnapError::GenerationConflict {
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_generation_conflict());
        assert!(conflict.is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let error = ShardsnapError::from(io_error);

        match error {
            ShardsnapError::Io(_) => {}
            _ => panic!("Expected IO error variant"),
        }
    }
}
