//! Source-only commit construction.
//!
//! A source-only commit is the minimal file set a restore needs: per
//! segment the stored-source file and the current liveness file, plus a
//! fresh manifest. Search structures (term postings) are dropped. Kept
//! segment files are referenced verbatim, byte for byte, so the incremental
//! differ can reuse them across successive snapshots of the same lineage;
//! only the manifest — which embeds the snapshot id — is new every time.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardsnapError};
use crate::shard::commit::CommitManifest;
use crate::shard::segment;
use crate::snapshot::extract::StoredFieldExtractor;
use crate::snapshot::SnapshotId;
use crate::storage::traits::read_all;
use crate::storage::Storage;

/// One segment as seen by a source-only commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOnlySegment {
    /// Segment identifier.
    pub id: String,
    /// Stored-source file name.
    pub src_file: String,
    /// Liveness file name, if the segment has deletions.
    pub live_file: Option<String>,
    /// Documents written into the segment.
    pub doc_count: u32,
    /// Live documents in the segment.
    pub live_doc_count: u64,
}

/// Manifest of a source-only commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOnlyManifest {
    /// The snapshot this commit was built for.
    pub snapshot: SnapshotId,
    /// Generation of the underlying engine commit.
    pub commit_generation: u64,
    /// Highest sequence number in the commit, if any.
    pub max_seq_no: Option<u64>,
    /// Total live documents across all segments.
    pub live_doc_count: u64,
    /// Segments in creation order.
    pub segments: Vec<SourceOnlySegment>,
}

impl SourceOnlyManifest {
    /// The manifest's file name, unique per snapshot.
    pub fn file_name(&self) -> String {
        format!("src_commit_{}.json", self.snapshot.uuid)
    }

    /// Load a source-only manifest from storage.
    pub fn load(storage: &dyn Storage, name: &str) -> Result<SourceOnlyManifest> {
        let data = read_all(storage, name)?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// A built source-only commit: the manifest bytes plus the names of the
/// segment files it references in shard storage.
#[derive(Debug)]
pub struct SourceOnlyCommit {
    /// The parsed manifest.
    pub manifest: SourceOnlyManifest,
    /// Serialized manifest, uploaded as its own file.
    pub manifest_bytes: Vec<u8>,
    /// Referenced segment file names, resolvable in shard storage.
    pub segment_files: Vec<String>,
}

impl SourceOnlyCommit {
    /// Name of the manifest file.
    pub fn manifest_file(&self) -> String {
        self.manifest.file_name()
    }
}

/// Builds source-only commits from engine commits.
pub struct SourceOnlyCommitBuilder<'a> {
    storage: &'a dyn Storage,
    commit: &'a CommitManifest,
}

impl<'a> SourceOnlyCommitBuilder<'a> {
    /// Create a builder over a pinned commit.
    pub fn new(storage: &'a dyn Storage, commit: &'a CommitManifest) -> Self {
        SourceOnlyCommitBuilder { storage, commit }
    }

    /// Build the source-only commit for the given snapshot.
    ///
    /// The live-document count recorded in the manifest is cross-checked
    /// against a full extractor pass; a mismatch means the commit is
    /// internally inconsistent and the snapshot must not proceed.
    pub fn build(&self, snapshot: &SnapshotId) -> Result<SourceOnlyCommit> {
        let mut segments = Vec::with_capacity(self.commit.segments.len());
        let mut segment_files = Vec::new();
        let mut live_doc_count = 0u64;

        for info in &self.commit.segments {
            let live_in_segment = match info.live_file() {
                Some(live_file) => {
                    let live = segment::read_live(self.storage, &live_file)?;
                    live.iter().filter(|bit| *bit).count() as u64
                }
                None => info.doc_count as u64,
            };
            live_doc_count += live_in_segment;
            segment_files.extend(info.source_files());
            segments.push(SourceOnlySegment {
                id: info.id.clone(),
                src_file: info.src_file(),
                live_file: info.live_file(),
                doc_count: info.doc_count,
                live_doc_count: live_in_segment,
            });
        }

        // The extractor walks every stored source; besides confirming the
        // liveness arithmetic this surfaces unreadable or empty sources
        // before anything is uploaded.
        let extracted = StoredFieldExtractor::new(self.storage, self.commit)
            .scan()
            .try_fold(0u64, |count, doc| doc.map(|_| count + 1))?;
        if extracted != live_doc_count {
            return Err(ShardsnapError::internal(format!(
                "extracted {extracted} live documents but liveness files account for {live_doc_count}"
            )));
        }

        let manifest = SourceOnlyManifest {
            snapshot: snapshot.clone(),
            commit_generation: self.commit.generation,
            max_seq_no: self.commit.max_seq_no,
            live_doc_count,
            segments,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;

        Ok(SourceOnlyCommit {
            manifest,
            manifest_bytes,
            segment_files,
        })
    }
}
