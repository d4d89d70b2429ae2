//! Shard-local index model: identifiers, segments, commits, and engines.
//!
//! A shard's on-disk state is a set of immutable segment files plus a
//! commit manifest naming them. The snapshot core treats search structures
//! as opaque files; the engines here give it something concrete to capture
//! and restore.

pub mod commit;
pub mod engine;
pub mod segment;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use commit::{CommitManifest, CommitRef};
pub use engine::{Engine, InternalEngine};
pub use segment::SegmentInfo;

/// Stable identifier of an index, surviving index recreation by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexId {
    /// Human-readable index name.
    pub name: String,
    /// Stable UUID distinguishing recreations of the same name.
    pub uuid: String,
}

impl IndexId {
    /// Create an index id from a name and an existing UUID.
    pub fn new(name: impl Into<String>, uuid: impl Into<String>) -> Self {
        IndexId {
            name: name.into(),
            uuid: uuid.into(),
        }
    }

    /// Create an index id with a freshly generated UUID.
    pub fn with_random_uuid(name: impl Into<String>) -> Self {
        IndexId {
            name: name.into(),
            uuid: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.name, self.uuid)
    }
}

/// Identifier of one shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// The owning index.
    pub index: IndexId,
    /// Shard number within the index.
    pub id: u32,
}

impl ShardId {
    /// Create a shard id.
    pub fn new(index: IndexId, id: u32) -> Self {
        ShardId { index, id }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::new(IndexId::new("logs", "abc123"), 2);
        assert_eq!(shard.to_string(), "[logs][2]");
        assert_eq!(shard.index.to_string(), "[logs/abc123]");
    }

    #[test]
    fn test_random_uuid_unique() {
        let a = IndexId::with_random_uuid("idx");
        let b = IndexId::with_random_uuid("idx");
        assert_ne!(a.uuid, b.uuid);
        assert_eq!(a.name, b.name);
    }
}
