//! Restore of source-only shard snapshots.
//!
//! A restored shard opens as a [`SourceOnlyEngine`]: documents can be
//! fetched by id and scanned in sequence number order, but every search
//! operation fails because the search structures were never snapshotted.
//! Full functionality comes back through [`reindex`](crate::snapshot::reindex).

use std::sync::Arc;

use ahash::AHashMap;
use log::info;

use crate::document::SourceDocument;
use crate::error::{Result, ShardsnapError};
use crate::shard::engine::Engine;
use crate::shard::segment;
use crate::shard::ShardId;
use crate::snapshot::source_only::SourceOnlyManifest;
use crate::snapshot::{Repository, SnapshotId};
use crate::storage::Storage;

/// Read-only engine over a restored source-only commit.
///
/// All live documents are materialized at open time, ordered by sequence
/// number. Get and scan behave like the full engine; term search returns
/// an error on every call.
pub struct SourceOnlyEngine {
    manifest: SourceOnlyManifest,
    docs: Vec<SourceDocument>,
    id_map: AHashMap<String, usize>,
    closed: bool,
}

impl SourceOnlyEngine {
    /// Open a source-only engine over restored shard storage.
    ///
    /// Verifies checksums of every segment file, liveness arithmetic
    /// against the manifest, and that sequence numbers are strictly
    /// increasing across the whole commit.
    pub fn open(storage: Arc<dyn Storage>, manifest_file: &str) -> Result<SourceOnlyEngine> {
        let manifest = SourceOnlyManifest::load(storage.as_ref(), manifest_file)?;

        let mut docs = Vec::new();
        for seg in &manifest.segments {
            let segment_docs = segment::read_src(storage.as_ref(), &seg.src_file)?;
            if segment_docs.len() != seg.doc_count as usize {
                return Err(ShardsnapError::snapshot(format!(
                    "segment {} holds {} documents but the manifest records {}",
                    seg.id,
                    segment_docs.len(),
                    seg.doc_count
                )));
            }
            match &seg.live_file {
                Some(live_file) => {
                    let live = segment::read_live(storage.as_ref(), live_file)?;
                    if live.len() != segment_docs.len() {
                        return Err(ShardsnapError::snapshot(format!(
                            "liveness file {live_file} covers {} documents, segment has {}",
                            live.len(),
                            segment_docs.len()
                        )));
                    }
                    docs.extend(
                        segment_docs
                            .into_iter()
                            .zip(live.iter())
                            .filter(|(_, live)| *live)
                            .map(|(doc, _)| doc),
                    );
                }
                None => docs.extend(segment_docs),
            }
        }

        if docs.len() as u64 != manifest.live_doc_count {
            return Err(ShardsnapError::snapshot(format!(
                "restored {} live documents but the manifest records {}",
                docs.len(),
                manifest.live_doc_count
            )));
        }

        let mut id_map = AHashMap::with_capacity(docs.len());
        let mut last_seq = None;
        for (ordinal, doc) in docs.iter().enumerate() {
            if last_seq.is_some_and(|last| doc.seq_no <= last) {
                return Err(ShardsnapError::snapshot(format!(
                    "sequence numbers out of order at seq_no {}",
                    doc.seq_no
                )));
            }
            last_seq = Some(doc.seq_no);
            id_map.insert(doc.id.clone(), ordinal);
        }

        info!(
            "opened source-only engine for snapshot {} with {} live documents",
            manifest.snapshot,
            docs.len()
        );

        Ok(SourceOnlyEngine {
            manifest,
            docs,
            id_map,
            closed: false,
        })
    }

    /// The manifest this engine was opened from.
    pub fn manifest(&self) -> &SourceOnlyManifest {
        &self.manifest
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(ShardsnapError::invalid_operation(
                "engine is closed".to_string(),
            ));
        }
        Ok(())
    }
}

impl Engine for SourceOnlyEngine {
    fn get(&self, id: &str) -> Result<Option<SourceDocument>> {
        self.check_open()?;
        Ok(self.id_map.get(id).map(|ordinal| self.docs[*ordinal].clone()))
    }

    fn scan<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<SourceDocument>> + 'a>> {
        self.check_open()?;
        Ok(Box::new(self.docs.iter().cloned().map(Ok)))
    }

    fn search_term(&self, _field: &str, _term: &str) -> Result<Vec<String>> {
        self.check_open()?;
        Err(ShardsnapError::SourceOnlyUnsupported)
    }

    fn doc_count(&self) -> u64 {
        self.docs.len() as u64
    }

    fn max_seq_no(&self) -> Option<u64> {
        self.manifest.max_seq_no
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl std::fmt::Debug for SourceOnlyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceOnlyEngine")
            .field("snapshot", &self.manifest.snapshot)
            .field("doc_count", &self.docs.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Restore one shard of a snapshot into `target` storage and open it.
///
/// Every blob is checksum-verified during the copy, then the source-only
/// manifest the shard snapshot points at is opened in place.
pub fn restore_shard(
    repository: &dyn Repository,
    snapshot: &SnapshotId,
    shard: &ShardId,
    target: Arc<dyn Storage>,
) -> Result<SourceOnlyEngine> {
    let manifest = repository.shard_snapshot(snapshot, shard)?;
    let restored = repository.restore_shard_files(snapshot, shard, target.as_ref())?;
    info!(
        "restored {restored} files for shard {} of snapshot {snapshot}",
        shard
    );
    SourceOnlyEngine::open(target, &manifest.source_manifest)
}
