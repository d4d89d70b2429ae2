//! Durable, generation-versioned snapshot repository.
//!
//! The repository owns all persisted shard blobs and the cluster-level
//! manifest. Shard blobs are content addressed by their file identity and
//! form a strict union across snapshots of a shard lineage — nothing is
//! ever deleted here; retention is a separate concern. The manifest is
//! guarded by a monotonically increasing generation: finalizing generation
//! N+1 requires having read generation N, and stale writes are rejected as
//! [`ShardsnapError::GenerationConflict`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardsnapError};
use crate::mapping::MappingConfig;
use crate::shard::{IndexId, ShardId};
use crate::snapshot::differ::FileIdentity;
use crate::snapshot::status::now_millis;
use crate::snapshot::SnapshotId;
use crate::storage::traits::{read_all, write_all};
use crate::storage::Storage;

const GENERATION_MARKER: &str = "generation";

/// Failure of one shard recorded in a snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFailure {
    /// Index name.
    pub index: String,
    /// Shard number.
    pub shard: u32,
    /// Failure reason.
    pub reason: String,
}

/// Index metadata embedded in the finalized manifest, enough to rebuild a
/// shard with a matching mapping on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// The index this metadata belongs to.
    pub index: IndexId,
    /// Number of shards of the index.
    pub shard_count: u32,
    /// Mapping configuration at snapshot time.
    pub mapping: MappingConfig,
}

/// Per-shard snapshot metadata, persisted as `snap-<uuid>.json` next to the
/// shard's blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSnapshotManifest {
    /// The snapshot this shard state belongs to.
    pub snapshot: SnapshotId,
    /// The shard.
    pub shard: ShardId,
    /// Name of the source-only commit manifest among `files`.
    pub source_manifest: String,
    /// Every file of the source-only commit, by identity.
    pub files: Vec<FileIdentity>,
    /// Snapshot start time, milliseconds since epoch.
    pub start_time: u64,
    /// Elapsed milliseconds.
    pub time: u64,
    /// Files in the snapshot.
    pub total_file_count: u64,
    /// Files actually uploaded by this snapshot.
    pub incremental_file_count: u64,
    /// Bytes in the snapshot.
    pub total_size: u64,
    /// Bytes actually uploaded by this snapshot.
    pub incremental_size: u64,
}

/// One finalized snapshot in the repository manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Snapshot identifier.
    pub snapshot: SnapshotId,
    /// Indices captured by the snapshot.
    pub indices: Vec<IndexId>,
    /// Snapshot start time, milliseconds since epoch.
    pub start_time: u64,
    /// Finalize time, milliseconds since epoch.
    pub end_time: u64,
    /// Shard failures recorded during the snapshot.
    pub failures: Vec<SnapshotFailure>,
    /// Shard count per index name.
    pub shard_counts: HashMap<String, u32>,
    /// Whether cluster-global state was included.
    pub include_global_state: bool,
    /// Opaque cluster metadata captured at snapshot time.
    pub metadata: Option<serde_json::Value>,
}

/// The cluster-level manifest, persisted as `manifest-<generation>.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryManifest {
    /// Generation of this manifest.
    pub generation: u64,
    /// Finalized snapshots, oldest first.
    pub snapshots: Vec<SnapshotEntry>,
}

impl RepositoryManifest {
    fn file_name_for(generation: u64) -> String {
        format!("manifest-{generation}.json")
    }

    /// Look up a finalized snapshot by id.
    pub fn snapshot(&self, id: &SnapshotId) -> Option<&SnapshotEntry> {
        self.snapshots.iter().find(|entry| &entry.snapshot == id)
    }
}

/// Everything `finalize_snapshot` needs to atomically commit a snapshot.
#[derive(Debug, Clone)]
pub struct FinalizeRequest {
    /// Snapshot being finalized.
    pub snapshot: SnapshotId,
    /// Indices captured.
    pub indices: Vec<IndexId>,
    /// Snapshot start time, milliseconds since epoch.
    pub start_time: u64,
    /// Shard failures to record.
    pub failures: Vec<SnapshotFailure>,
    /// Shard count per index name.
    pub shard_counts: HashMap<String, u32>,
    /// The manifest generation the caller read before finalizing.
    pub expected_generation: u64,
    /// Whether cluster-global state is included.
    pub include_global_state: bool,
    /// Opaque cluster metadata to embed.
    pub metadata: Option<serde_json::Value>,
    /// Index metadata per index UUID.
    pub index_metadata: HashMap<String, IndexMetadata>,
}

/// Durable, generation-versioned store of shard blobs and manifests.
pub trait Repository: Send + Sync {
    /// The current manifest generation; 0 before any finalize.
    fn current_generation(&self) -> Result<u64>;

    /// Read the manifest of a generation. Generation 0 is the implicit
    /// empty manifest.
    fn read_manifest(&self, generation: u64) -> Result<RepositoryManifest>;

    /// Identities of every blob ever persisted for a shard's lineage.
    fn shard_file_identities(&self, shard: &ShardId) -> Result<HashSet<FileIdentity>>;

    /// Upload shard files from shard storage, addressed by identity.
    fn write_shard_files(
        &self,
        shard: &ShardId,
        source: &dyn Storage,
        files: &[FileIdentity],
    ) -> Result<()>;

    /// Upload one shard file from an in-memory buffer.
    fn write_shard_file_bytes(
        &self,
        shard: &ShardId,
        identity: &FileIdentity,
        bytes: &[u8],
    ) -> Result<()>;

    /// Durably write per-shard snapshot metadata.
    fn write_shard_snapshot(&self, manifest: &ShardSnapshotManifest) -> Result<()>;

    /// Read per-shard snapshot metadata.
    fn shard_snapshot(
        &self,
        snapshot: &SnapshotId,
        shard: &ShardId,
    ) -> Result<ShardSnapshotManifest>;

    /// Copy every file of a shard snapshot into target storage under its
    /// original name, verifying checksums. Returns the number of files.
    fn restore_shard_files(
        &self,
        snapshot: &SnapshotId,
        shard: &ShardId,
        target: &dyn Storage,
    ) -> Result<u64>;

    /// Read the index metadata embedded for a snapshot.
    fn snapshot_index_metadata(
        &self,
        snapshot: &SnapshotId,
        index: &IndexId,
    ) -> Result<IndexMetadata>;

    /// Atomically finalize a snapshot: write index metadata, append the
    /// snapshot entry, and advance the generation by exactly one.
    ///
    /// Rejected with [`ShardsnapError::GenerationConflict`] when
    /// `expected_generation` is stale; the caller re-reads the generation
    /// and retries.
    fn finalize_snapshot(&self, request: FinalizeRequest) -> Result<RepositoryManifest>;
}

/// Repository over a [`Storage`] backend.
///
/// Layout:
/// - `generation` — ascii marker holding the current generation
/// - `manifest-<generation>.json` — cluster manifests, one per generation
/// - `indices/<index-uuid>/meta-<snapshot-uuid>.json` — index metadata
/// - `indices/<index-uuid>/<shard>/__<name>-<len>-<crc>` — shard blobs
/// - `indices/<index-uuid>/<shard>/snap-<snapshot-uuid>.json` — shard
///   snapshot metadata
#[derive(Debug)]
pub struct BlobRepository {
    storage: Arc<dyn Storage>,
    /// Serializes the read-check-write window of finalize within this
    /// process; cross-process safety comes from the generation check.
    finalize_lock: Mutex<()>,
}

impl BlobRepository {
    /// Create a repository over the given storage.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        BlobRepository {
            storage,
            finalize_lock: Mutex::new(()),
        }
    }

    fn shard_path(shard: &ShardId) -> String {
        format!("indices/{}/{}", shard.index.uuid, shard.id)
    }

    fn blob_path(shard: &ShardId, identity: &FileIdentity) -> String {
        format!("{}/{}", Self::shard_path(shard), identity.blob_name())
    }

    fn index_metadata_path(index_uuid: &str, snapshot: &SnapshotId) -> String {
        format!("indices/{}/meta-{}.json", index_uuid, snapshot.uuid)
    }

    fn shard_snapshot_path(shard: &ShardId, snapshot: &SnapshotId) -> String {
        format!("{}/snap-{}.json", Self::shard_path(shard), snapshot.uuid)
    }
}

impl Repository for BlobRepository {
    fn current_generation(&self) -> Result<u64> {
        if !self.storage.file_exists(GENERATION_MARKER) {
            return Ok(0);
        }
        let data = read_all(self.storage.as_ref(), GENERATION_MARKER)?;
        let text = String::from_utf8(data)
            .map_err(|_| ShardsnapError::storage("generation marker is not utf-8"))?;
        text.trim()
            .parse()
            .map_err(|_| ShardsnapError::storage(format!("invalid generation marker: {text}")))
    }

    fn read_manifest(&self, generation: u64) -> Result<RepositoryManifest> {
        if generation == 0 {
            return Ok(RepositoryManifest::default());
        }
        let data = read_all(
            self.storage.as_ref(),
            &RepositoryManifest::file_name_for(generation),
        )?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn shard_file_identities(&self, shard: &ShardId) -> Result<HashSet<FileIdentity>> {
        let prefix = format!("{}/", Self::shard_path(shard));
        let mut identities = HashSet::new();
        for name in self.storage.list_files()? {
            if let Some(blob) = name.strip_prefix(&prefix) {
                if let Some(identity) = FileIdentity::parse_blob_name(blob) {
                    identities.insert(identity);
                }
            }
        }
        Ok(identities)
    }

    fn write_shard_files(
        &self,
        shard: &ShardId,
        source: &dyn Storage,
        files: &[FileIdentity],
    ) -> Result<()> {
        for identity in files {
            let data = read_all(source, &identity.name)?;
            let actual = FileIdentity::of_bytes(&identity.name, &data);
            if &actual != identity {
                return Err(ShardsnapError::storage(format!(
                    "file {} changed while uploading: expected {}/{:08x}, got {}/{:08x}",
                    identity.name, identity.length, identity.checksum, actual.length, actual.checksum
                )));
            }
            self.write_shard_file_bytes(shard, identity, &data)?;
        }
        Ok(())
    }

    fn write_shard_file_bytes(
        &self,
        shard: &ShardId,
        identity: &FileIdentity,
        bytes: &[u8],
    ) -> Result<()> {
        let path = Self::blob_path(shard, identity);
        if self.storage.file_exists(&path) {
            // Content addressed: an existing blob is byte-identical.
            debug!("blob {path} already present, skipping upload");
            return Ok(());
        }
        write_all(self.storage.as_ref(), &path, bytes)?;
        debug!("uploaded blob {path} ({} bytes)", bytes.len());
        Ok(())
    }

    fn write_shard_snapshot(&self, manifest: &ShardSnapshotManifest) -> Result<()> {
        let path = Self::shard_snapshot_path(&manifest.shard, &manifest.snapshot);
        let data = serde_json::to_vec_pretty(manifest)?;
        write_all(self.storage.as_ref(), &path, &data)
    }

    fn shard_snapshot(
        &self,
        snapshot: &SnapshotId,
        shard: &ShardId,
    ) -> Result<ShardSnapshotManifest> {
        let path = Self::shard_snapshot_path(shard, snapshot);
        let data = read_all(self.storage.as_ref(), &path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn restore_shard_files(
        &self,
        snapshot: &SnapshotId,
        shard: &ShardId,
        target: &dyn Storage,
    ) -> Result<u64> {
        let manifest = self.shard_snapshot(snapshot, shard)?;
        for identity in &manifest.files {
            let data = read_all(self.storage.as_ref(), &Self::blob_path(shard, identity))?;
            let actual = FileIdentity::of_bytes(&identity.name, &data);
            if &actual != identity {
                return Err(ShardsnapError::storage(format!(
                    "blob for {} is corrupt: expected {}/{:08x}, got {}/{:08x}",
                    identity.name, identity.length, identity.checksum, actual.length, actual.checksum
                )));
            }
            write_all(target, &identity.name, &data)?;
        }
        info!(
            "restored {} file(s) of snapshot {} for shard {}",
            manifest.files.len(),
            snapshot,
            shard
        );
        Ok(manifest.files.len() as u64)
    }

    fn snapshot_index_metadata(
        &self,
        snapshot: &SnapshotId,
        index: &IndexId,
    ) -> Result<IndexMetadata> {
        let path = Self::index_metadata_path(&index.uuid, snapshot);
        let data = read_all(self.storage.as_ref(), &path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn finalize_snapshot(&self, request: FinalizeRequest) -> Result<RepositoryManifest> {
        let _guard = self.finalize_lock.lock();

        let actual = self.current_generation()?;
        if actual != request.expected_generation {
            return Err(ShardsnapError::GenerationConflict {
                expected: request.expected_generation,
                actual,
            });
        }

        for (uuid, metadata) in &request.index_metadata {
            let path = Self::index_metadata_path(uuid, &request.snapshot);
            let data = serde_json::to_vec_pretty(metadata)?;
            write_all(self.storage.as_ref(), &path, &data)?;
        }

        let mut manifest = self.read_manifest(actual)?;
        manifest.generation = actual + 1;
        manifest.snapshots.push(SnapshotEntry {
            snapshot: request.snapshot.clone(),
            indices: request.indices,
            start_time: request.start_time,
            end_time: now_millis(),
            failures: request.failures,
            shard_counts: request.shard_counts,
            include_global_state: request.include_global_state,
            metadata: request.metadata,
        });

        let data = serde_json::to_vec_pretty(&manifest)?;
        write_all(
            self.storage.as_ref(),
            &RepositoryManifest::file_name_for(manifest.generation),
            &data,
        )?;
        write_all(
            self.storage.as_ref(),
            GENERATION_MARKER,
            manifest.generation.to_string().as_bytes(),
        )?;
        info!(
            "finalized snapshot {} at generation {}",
            request.snapshot, manifest.generation
        );
        Ok(manifest)
    }
}

/// Run `finalize_snapshot` with a bounded optimistic-concurrency retry
/// loop: on a generation conflict the current generation is re-read and the
/// request is rebuilt with it.
pub fn finalize_with_retry<F>(
    repository: &dyn Repository,
    max_attempts: usize,
    mut build_request: F,
) -> Result<RepositoryManifest>
where
    F: FnMut(u64) -> FinalizeRequest,
{
    let mut last_conflict = None;
    for _ in 0..max_attempts.max(1) {
        let generation = repository.current_generation()?;
        match repository.finalize_snapshot(build_request(generation)) {
            Err(e) if e.is_generation_conflict() => {
                debug!("finalize lost generation race, retrying: {e}");
                last_conflict = Some(e);
            }
            result => return result,
        }
    }
    Err(last_conflict.unwrap_or_else(|| ShardsnapError::internal("finalize retry loop exhausted")))
}
