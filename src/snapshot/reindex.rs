//! Rebuilds a fully-capable shard from a restored source-only engine.
//!
//! Every live document is replayed into an empty target shard in sequence
//! number order, then committed. The target re-derives all search
//! structures from the stored sources, so it can serve everything the
//! original shard could. Sequence numbers are reassigned densely during
//! the replay.

use log::info;

use crate::document::IndexOperation;
use crate::error::{Result, ShardsnapError};
use crate::shard::engine::{Engine, InternalEngine};
use crate::snapshot::restore::SourceOnlyEngine;

/// Reindex all live documents of `source` into `target`.
///
/// The target must be empty. On any failure the target is closed and
/// discarded; a partially rebuilt shard is never returned.
pub fn reindex(source: &SourceOnlyEngine, mut target: InternalEngine) -> Result<InternalEngine> {
    match replay(source, &mut target) {
        Ok(count) => {
            info!("reindexed {count} documents from snapshot source");
            Ok(target)
        }
        Err(err) => {
            let _ = target.close();
            Err(ShardsnapError::reconstruction(format!(
                "reindex from source-only shard failed: {err}"
            )))
        }
    }
}

fn replay(source: &SourceOnlyEngine, target: &mut InternalEngine) -> Result<u64> {
    if target.doc_count() != 0 || target.max_seq_no().is_some() {
        return Err(ShardsnapError::invalid_operation(
            "reindex target must be an empty shard".to_string(),
        ));
    }

    let mut replayed = 0u64;
    for doc in source.scan()? {
        target.index(IndexOperation::from(doc?))?;
        replayed += 1;
    }
    target.commit()?;

    if target.doc_count() != replayed {
        return Err(ShardsnapError::internal(format!(
            "replayed {replayed} documents but the target holds {}",
            target.doc_count()
        )));
    }
    if target.max_seq_no() != replayed.checked_sub(1) {
        return Err(ShardsnapError::internal(format!(
            "target max_seq_no {:?} does not match {replayed} replayed documents",
            target.max_seq_no()
        )));
    }
    Ok(replayed)
}
