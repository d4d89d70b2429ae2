use std::collections::HashMap;
use std::sync::Arc;

use shardsnap::document::IndexOperation;
use shardsnap::error::ShardsnapError;
use shardsnap::mapping::MappingConfig;
use shardsnap::shard::engine::{Engine, InternalEngine};
use shardsnap::shard::{IndexId, ShardId};
use shardsnap::snapshot::{
    finalize_with_retry, reindex, restore_shard, BlobRepository, FinalizeRequest, IndexMetadata,
    Repository, ShardSnapshotRequest, ShardSnapshotStatus, ShardSnapshotStatusCopy,
    ShardSnapshotter, SnapshotId, SnapshotPool, Stage,
};
use shardsnap::storage::{FileStorage, MemoryStorage, Storage};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_with_docs(docs: &[(&str, &str)]) -> InternalEngine {
    let mut engine = InternalEngine::new(
        Arc::new(MemoryStorage::new()),
        MappingConfig::with_complete_source(),
    );
    for (id, body) in docs {
        engine
            .index(IndexOperation::new(
                *id,
                None,
                format!("{{\"body\":\"{body}\"}}").into_bytes(),
            ))
            .unwrap();
    }
    engine.commit().unwrap();
    engine
}

fn shard_id() -> ShardId {
    ShardId::new(IndexId::new("docs", "index-uuid-1"), 0)
}

fn snapshot_request(
    engine: &InternalEngine,
    shard: &ShardId,
    name: &str,
) -> (ShardSnapshotRequest, Arc<ShardSnapshotStatus>) {
    let status = Arc::new(ShardSnapshotStatus::new_initializing());
    let request = ShardSnapshotRequest {
        storage: engine.storage(),
        mapping: engine.mapping().clone(),
        snapshot: SnapshotId::with_random_uuid(name),
        shard: shard.clone(),
        commit: engine.acquire_last_commit().unwrap(),
        status: Arc::clone(&status),
    };
    (request, status)
}

fn take_snapshot(
    snapshotter: &ShardSnapshotter,
    engine: &InternalEngine,
    shard: &ShardId,
    name: &str,
) -> (SnapshotId, ShardSnapshotStatusCopy) {
    let (request, status) = snapshot_request(engine, shard, name);
    let snapshot = request.snapshot.clone();
    snapshotter.snapshot_shard(request).unwrap();
    (snapshot, status.as_copy())
}

#[test]
fn test_snapshot_restore_reindex_cycle() {
    init_logging();
    let engine = engine_with_docs(&[
        ("1", "red apple"),
        ("2", "green pear"),
        ("3", "red plum"),
    ]);
    let shard = shard_id();
    let repository = Arc::new(BlobRepository::new(Arc::new(MemoryStorage::new())));
    let snapshotter = Arc::new(ShardSnapshotter::new(repository.clone()));

    // 1. Run the shard snapshot on the worker pool.
    let pool = SnapshotPool::new(2).unwrap();
    let (request, status) = snapshot_request(&engine, &shard, "nightly");
    let snapshot = request.snapshot.clone();
    let task_snapshotter = Arc::clone(&snapshotter);
    let manifest = pool
        .spawn(move || task_snapshotter.snapshot_shard(request))
        .wait()
        .unwrap();

    let copy = status.as_copy();
    assert_eq!(copy.stage, Stage::Done);
    // One segment file plus the source-only commit manifest.
    assert_eq!(copy.total_file_count, 2);
    assert_eq!(copy.incremental_file_count, 2);
    assert!(copy.total_size > 0);
    assert_eq!(manifest.files.len(), 2);
    assert_eq!(engine.pinned_commits(), 0);

    // 2. Finalize the snapshot at the cluster level.
    let index = shard.index.clone();
    let cluster_manifest = finalize_with_retry(repository.as_ref(), 3, |generation| {
        FinalizeRequest {
            snapshot: snapshot.clone(),
            indices: vec![index.clone()],
            start_time: copy.start_time,
            failures: vec![],
            shard_counts: HashMap::from([(index.name.clone(), 1)]),
            expected_generation: generation,
            include_global_state: false,
            metadata: None,
            index_metadata: HashMap::from([(
                index.uuid.clone(),
                IndexMetadata {
                    index: index.clone(),
                    shard_count: 1,
                    mapping: engine.mapping().clone(),
                },
            )]),
        }
    })
    .unwrap();
    assert_eq!(cluster_manifest.generation, 1);
    assert!(cluster_manifest.snapshot(&snapshot).is_some());
    let metadata = repository.snapshot_index_metadata(&snapshot, &index).unwrap();
    assert!(metadata.mapping.retains_complete_source());

    // 3. Restore into fresh storage and read through the restricted engine.
    let target: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let restored = restore_shard(repository.as_ref(), &snapshot, &shard, target).unwrap();
    assert_eq!(restored.doc_count(), 3);
    assert_eq!(
        restored.get("2").unwrap().unwrap().source,
        engine.get("2").unwrap().unwrap().source
    );
    let err = restored.search_term("body", "red").unwrap_err();
    assert_eq!(
        err.to_string(),
        "source-only indices cannot be searched or filtered"
    );

    // 4. Reindex into an empty shard and search again.
    let rebuilt = reindex(
        &restored,
        InternalEngine::new(
            Arc::new(MemoryStorage::new()),
            MappingConfig::with_complete_source(),
        ),
    )
    .unwrap();
    assert_eq!(rebuilt.search_term("body", "red").unwrap(), vec!["1", "3"]);

    // The rebuilt shard holds byte-identical documents.
    let original: Vec<_> = engine.scan().unwrap().map(|d| d.unwrap()).collect();
    let roundtrip: Vec<_> = rebuilt.scan().unwrap().map(|d| d.unwrap()).collect();
    assert_eq!(original, roundtrip);
}

#[test]
fn test_incremental_counts_across_edits() {
    let mut engine = engine_with_docs(&[("1", "a"), ("2", "b"), ("3", "c")]);
    let shard = shard_id();
    let repository = Arc::new(BlobRepository::new(Arc::new(MemoryStorage::new())));
    let snapshotter = ShardSnapshotter::new(repository);

    // First snapshot uploads the segment and the manifest.
    let (_, first) = take_snapshot(&snapshotter, &engine, &shard, "snap-1");
    assert_eq!(first.total_file_count, 2);
    assert_eq!(first.incremental_file_count, 2);

    // Unchanged shard: only the snapshot-unique manifest transfers.
    let (_, unchanged) = take_snapshot(&snapshotter, &engine, &shard, "snap-1b");
    assert_eq!(unchanged.total_file_count, 2);
    assert_eq!(unchanged.incremental_file_count, 1);

    // Adding a document creates one new segment; only its file and the
    // manifest are uploaded while the old segment is reused.
    engine
        .index(IndexOperation::new("4", None, b"{\"body\":\"d\"}".to_vec()))
        .unwrap();
    engine.commit().unwrap();
    let (_, after_add) = take_snapshot(&snapshotter, &engine, &shard, "snap-2");
    assert_eq!(after_add.total_file_count, 3);
    assert_eq!(after_add.incremental_file_count, 2);

    // A deletion adds one liveness file; segment files stay untouched.
    assert!(engine.delete("2").unwrap());
    engine.commit().unwrap();
    let (_, after_delete) = take_snapshot(&snapshotter, &engine, &shard, "snap-3");
    assert_eq!(after_delete.total_file_count, 4);
    assert_eq!(after_delete.incremental_file_count, 2);
    assert!(after_delete.incremental_size < after_delete.total_size);
}

#[test]
fn test_incomplete_source_snapshot_fails_cleanly() {
    let mut engine = InternalEngine::new(
        Arc::new(MemoryStorage::new()),
        MappingConfig::with_source_disabled(),
    );
    engine
        .index(IndexOperation::new("1", None, b"{\"body\":\"a\"}".to_vec()))
        .unwrap();
    engine.commit().unwrap();

    let shard = shard_id();
    let repository = Arc::new(BlobRepository::new(Arc::new(MemoryStorage::new())));
    let snapshotter = ShardSnapshotter::new(repository.clone());

    let (request, status) = snapshot_request(&engine, &shard, "bad");
    let err = snapshotter.snapshot_shard(request).unwrap_err();
    assert!(matches!(err, ShardsnapError::IncompleteSource));

    let copy = status.as_copy();
    assert_eq!(copy.stage, Stage::Failed);
    assert!(copy.failure.unwrap().contains("incomplete source"));
    // Nothing reached the repository and the point-in-time pin is gone.
    assert!(repository.shard_file_identities(&shard).unwrap().is_empty());
    assert_eq!(engine.pinned_commits(), 0);
}

#[test]
fn test_restore_of_deleted_documents() {
    init_logging();
    let mut engine = engine_with_docs(&[("1", "a"), ("2", "b"), ("3", "c")]);
    assert!(engine.delete("2").unwrap());
    engine.commit().unwrap();

    let shard = shard_id();
    let repository = Arc::new(BlobRepository::new(Arc::new(MemoryStorage::new())));
    let snapshotter = ShardSnapshotter::new(repository.clone());
    let (snapshot, copy) = take_snapshot(&snapshotter, &engine, &shard, "snap");
    assert_eq!(copy.stage, Stage::Done);

    // Restoring onto local disk exercises the file backend end to end.
    let dir = tempfile::tempdir().unwrap();
    let target: Arc<dyn Storage> = Arc::new(FileStorage::new(dir.path()).unwrap());
    let restored = restore_shard(repository.as_ref(), &snapshot, &shard, target).unwrap();
    assert_eq!(restored.doc_count(), 2);
    assert!(restored.get("2").unwrap().is_none());

    let rebuilt = reindex(
        &restored,
        InternalEngine::new(
            Arc::new(MemoryStorage::new()),
            MappingConfig::with_complete_source(),
        ),
    )
    .unwrap();
    assert_eq!(rebuilt.doc_count(), 2);
    assert!(rebuilt.get("2").unwrap().is_none());
    assert!(rebuilt.get("3").unwrap().is_some());
}
