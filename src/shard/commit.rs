//! Commit manifests and commit references.
//!
//! A commit is a consistent, point-in-time set of files: the manifest plus
//! every segment file it names. Snapshot tasks pin the commit they work on
//! through a [`CommitRef`] so the view stays stable for the duration of the
//! task; the pin is released on every exit path by `Drop`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardsnapError};
use crate::shard::segment::SegmentInfo;
use crate::storage::traits::{read_all, write_all};
use crate::storage::Storage;

/// Manifest of one commit: the segments it is made of and the highest
/// sequence number it contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitManifest {
    /// Commit generation, increasing by one per commit.
    pub generation: u64,
    /// Highest sequence number of any document in the commit, if any.
    pub max_seq_no: Option<u64>,
    /// Segments in creation order.
    pub segments: Vec<SegmentInfo>,
}

impl CommitManifest {
    /// Manifest file name for a generation.
    pub fn file_name_for(generation: u64) -> String {
        format!("commit_{generation:010}.json")
    }

    /// This manifest's file name.
    pub fn file_name(&self) -> String {
        Self::file_name_for(self.generation)
    }

    /// All files making up the commit, manifest included.
    pub fn files(&self) -> Vec<String> {
        let mut files = vec![self.file_name()];
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files
    }

    /// Persist the manifest.
    pub fn save(&self, storage: &dyn Storage) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_all(storage, &self.file_name(), &data)
    }

    /// Load the manifest of a specific generation.
    pub fn load(storage: &dyn Storage, generation: u64) -> Result<CommitManifest> {
        let data = read_all(storage, &Self::file_name_for(generation))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load the latest committed manifest, if the shard has ever committed.
    pub fn load_latest(storage: &dyn Storage) -> Result<Option<CommitManifest>> {
        let latest = storage
            .list_files()?
            .into_iter()
            .filter(|name| name.starts_with("commit_") && name.ends_with(".json"))
            .max();
        match latest {
            Some(name) => {
                let data = read_all(storage, &name)?;
                Ok(Some(serde_json::from_slice(&data)?))
            }
            None => Ok(None),
        }
    }
}

/// A pinned reference to a commit.
///
/// While any reference is alive the engine must not remove the commit's
/// files. Dropping the reference releases the pin.
#[derive(Debug)]
pub struct CommitRef {
    manifest: Arc<CommitManifest>,
    pins: Arc<AtomicUsize>,
}

impl CommitRef {
    pub(crate) fn new(manifest: Arc<CommitManifest>, pins: Arc<AtomicUsize>) -> Self {
        pins.fetch_add(1, Ordering::SeqCst);
        CommitRef { manifest, pins }
    }

    /// The pinned commit manifest.
    pub fn manifest(&self) -> &CommitManifest {
        &self.manifest
    }
}

impl Drop for CommitRef {
    fn drop(&mut self) {
        self.pins.fetch_sub(1, Ordering::SeqCst);
        debug!("released commit generation {}", self.manifest.generation);
    }
}

/// Error raised when a commit is required but none exists yet.
pub(crate) fn no_commit_error() -> ShardsnapError {
    ShardsnapError::invalid_operation("shard has no commit yet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_manifest_save_load() {
        let storage = MemoryStorage::new();
        let manifest = CommitManifest {
            generation: 3,
            max_seq_no: Some(41),
            segments: vec![SegmentInfo::new("seg_00000001", 42, 1)],
        };
        manifest.save(&storage).unwrap();

        let loaded = CommitManifest::load(&storage, 3).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(
            CommitManifest::load_latest(&storage).unwrap().unwrap(),
            manifest
        );
    }

    #[test]
    fn test_load_latest_picks_highest_generation() {
        let storage = MemoryStorage::new();
        for generation in [1, 3, 2] {
            let manifest = CommitManifest {
                generation,
                max_seq_no: None,
                segments: Vec::new(),
            };
            manifest.save(&storage).unwrap();
        }
        let latest = CommitManifest::load_latest(&storage).unwrap().unwrap();
        assert_eq!(latest.generation, 3);
    }

    #[test]
    fn test_manifest_files_include_segments() {
        let manifest = CommitManifest {
            generation: 1,
            max_seq_no: Some(9),
            segments: vec![
                SegmentInfo::new("seg_00000001", 5, 0),
                SegmentInfo::new("seg_00000002", 5, 1),
            ],
        };
        let files = manifest.files();
        assert!(files.contains(&"commit_0000000001.json".to_string()));
        assert!(files.contains(&"seg_00000001.src".to_string()));
        assert!(files.contains(&"seg_00000002_1.liv".to_string()));
    }

    #[test]
    fn test_commit_ref_pins_and_releases() {
        let pins = Arc::new(AtomicUsize::new(0));
        let manifest = Arc::new(CommitManifest {
            generation: 1,
            max_seq_no: None,
            segments: Vec::new(),
        });

        let commit_ref = CommitRef::new(Arc::clone(&manifest), Arc::clone(&pins));
        assert_eq!(pins.load(Ordering::SeqCst), 1);
        assert_eq!(commit_ref.manifest().generation, 1);

        drop(commit_ref);
        assert_eq!(pins.load(Ordering::SeqCst), 0);
    }
}
