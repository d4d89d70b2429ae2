//! Shard snapshot orchestration.
//!
//! One snapshot task per shard: verify the precondition, build the
//! source-only commit from the pinned point-in-time view, diff it against
//! the shard's lineage in the repository, upload only what is new, and
//! record the shard snapshot manifest. The status tracker observes every
//! step, and the commit pin is released on every exit path because the
//! request owns the [`CommitRef`].

use std::sync::Arc;

use log::{debug, info};

use crate::error::Result;
use crate::mapping::MappingConfig;
use crate::shard::commit::CommitRef;
use crate::shard::ShardId;
use crate::snapshot::differ::{self, FileIdentity};
use crate::snapshot::repository::{Repository, ShardSnapshotManifest};
use crate::snapshot::source_only::SourceOnlyCommitBuilder;
use crate::snapshot::status::{now_millis, ShardSnapshotStatus};
use crate::snapshot::SnapshotId;
use crate::storage::Storage;

/// Everything one shard snapshot task needs. Owning the commit reference
/// guarantees the point-in-time view is released whether the task
/// succeeds, fails, or is dropped unrun.
pub struct ShardSnapshotRequest {
    /// Shard storage holding the commit's files.
    pub storage: Arc<dyn Storage>,
    /// The shard's mapping, for the complete-source precondition.
    pub mapping: MappingConfig,
    /// The snapshot being taken.
    pub snapshot: SnapshotId,
    /// The shard being captured.
    pub shard: ShardId,
    /// Pinned point-in-time commit.
    pub commit: CommitRef,
    /// Status tracker owned by this task; observers read copies of it.
    pub status: Arc<ShardSnapshotStatus>,
}

/// Executes shard snapshots against a repository.
pub struct ShardSnapshotter {
    repository: Arc<dyn Repository>,
}

impl ShardSnapshotter {
    /// Create a snapshotter over a repository.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        ShardSnapshotter { repository }
    }

    /// The repository this snapshotter writes to.
    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Snapshot one shard. On any error the status moves to `Failed` with
    /// the captured reason before the error propagates.
    pub fn snapshot_shard(&self, request: ShardSnapshotRequest) -> Result<ShardSnapshotManifest> {
        let status = Arc::clone(&request.status);
        match self.run(request) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                // The status may already be terminal if the failure raced
                // the Done transition; the original error wins either way.
                let _ = status.move_to_failed(now_millis(), e.to_string());
                Err(e)
            }
        }
    }

    fn run(&self, request: ShardSnapshotRequest) -> Result<ShardSnapshotManifest> {
        let ShardSnapshotRequest {
            storage,
            mapping,
            snapshot,
            shard,
            commit,
            status,
        } = request;

        // Precondition: raised before any file is touched.
        mapping.ensure_complete_source()?;

        let start_time = now_millis();
        let source_commit =
            SourceOnlyCommitBuilder::new(storage.as_ref(), commit.manifest()).build(&snapshot)?;

        let manifest_file = source_commit.manifest_file();
        let mut candidate = Vec::with_capacity(source_commit.segment_files.len() + 1);
        for name in &source_commit.segment_files {
            candidate.push(FileIdentity::of(storage.as_ref(), name)?);
        }
        candidate.push(FileIdentity::of_bytes(
            manifest_file.clone(),
            &source_commit.manifest_bytes,
        ));

        let existing = self.repository.shard_file_identities(&shard)?;
        let diff = differ::diff(&candidate, &existing);
        debug!(
            "snapshot {} shard {}: {} of {} file(s) to upload",
            snapshot,
            shard,
            diff.incremental_file_count(),
            diff.total_file_count()
        );

        status.move_to_started(
            start_time,
            diff.incremental_file_count(),
            diff.total_file_count(),
            diff.incremental_size(),
            diff.total_size(),
        )?;

        let segment_uploads: Vec<FileIdentity> = diff
            .to_upload
            .iter()
            .filter(|identity| identity.name != manifest_file)
            .cloned()
            .collect();
        self.repository
            .write_shard_files(&shard, storage.as_ref(), &segment_uploads)?;
        if diff.to_upload.iter().any(|i| i.name == manifest_file) {
            self.repository.write_shard_file_bytes(
                &shard,
                &FileIdentity::of_bytes(manifest_file.clone(), &source_commit.manifest_bytes),
                &source_commit.manifest_bytes,
            )?;
        }

        status.move_to_finalize()?;

        let end_time = now_millis();
        let shard_manifest = ShardSnapshotManifest {
            snapshot: snapshot.clone(),
            shard: shard.clone(),
            source_manifest: manifest_file,
            files: candidate,
            start_time,
            time: end_time.saturating_sub(start_time),
            total_file_count: diff.total_file_count(),
            incremental_file_count: diff.incremental_file_count(),
            total_size: diff.total_size(),
            incremental_size: diff.incremental_size(),
        };
        self.repository.write_shard_snapshot(&shard_manifest)?;

        status.move_to_done(end_time)?;
        info!(
            "snapshot {} of shard {} done: {} live doc(s), {}/{} file(s) uploaded",
            snapshot,
            shard,
            source_commit.manifest.live_doc_count,
            shard_manifest.incremental_file_count,
            shard_manifest.total_file_count
        );
        // `commit` drops here on success; the Drop on early return paths
        // releases the pinned view as well.
        drop(commit);
        Ok(shard_manifest)
    }
}
