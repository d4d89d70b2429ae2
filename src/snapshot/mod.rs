//! Source-only incremental snapshot and restore.
//!
//! The snapshot path runs Extractor -> Commit Builder -> Differ ->
//! Repository, observed throughout by the status tracker; the restore path
//! runs Repository -> restricted source-only engine -> Reindexer into a
//! fresh, fully-capable shard.

pub mod differ;
pub mod extract;
pub mod pool;
pub mod reindex;
pub mod repository;
pub mod restore;
pub mod snapshotter;
pub mod source_only;
pub mod status;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use differ::{diff, FileDiff, FileIdentity};
pub use extract::StoredFieldExtractor;
pub use pool::{SnapshotFuture, SnapshotPool};
pub use reindex::reindex;
pub use repository::{
    finalize_with_retry, BlobRepository, FinalizeRequest, IndexMetadata, Repository,
    RepositoryManifest, ShardSnapshotManifest, SnapshotEntry, SnapshotFailure,
};
pub use restore::{restore_shard, SourceOnlyEngine};
pub use snapshotter::{ShardSnapshotRequest, ShardSnapshotter};
pub use source_only::{SourceOnlyCommit, SourceOnlyCommitBuilder, SourceOnlyManifest};
pub use status::{ShardSnapshotStatus, ShardSnapshotStatusCopy, Stage};

/// Identifier of one snapshot operation: a caller-facing name plus a UUID
/// that stays unique even when names are reused. Immutable, created at
/// snapshot invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId {
    /// Caller-facing snapshot name.
    pub name: String,
    /// Unique id of this snapshot operation.
    pub uuid: String,
}

impl SnapshotId {
    /// Create a snapshot id from a name and an existing UUID.
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        SnapshotId {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Create a snapshot id with a freshly generated UUID.
    pub fn with_random_uuid(name: impl Into<String>) -> Self {
        SnapshotId {
            name: name.into(),
            uuid: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_display() {
        let id = SnapshotId::new("nightly", "uuid-1");
        assert_eq!(id.to_string(), "nightly/uuid-1");
    }

    #[test]
    fn test_snapshot_id_uniqueness() {
        let a = SnapshotId::with_random_uuid("nightly");
        let b = SnapshotId::with_random_uuid("nightly");
        assert_ne!(a.uuid, b.uuid);
    }
}
