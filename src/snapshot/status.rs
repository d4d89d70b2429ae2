//! Per-shard snapshot progress tracking.
//!
//! One `ShardSnapshotStatus` is owned by the in-flight snapshot task for
//! exactly one shard. The task drives the stage machine forward; observers
//! never touch the live state and instead take an immutable
//! [`ShardSnapshotStatusCopy`] at any time without blocking the task.

use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Result, ShardsnapError};

/// Stages of a shard snapshot.
///
/// `Init -> Started -> Finalize -> Done`, with `Failed` terminal and
/// reachable from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Snapshot created, nothing enumerated yet.
    Init,
    /// Files are being diffed and uploaded; counters are fixed at entry.
    Started,
    /// All uploads acknowledged; shard manifest write pending.
    Finalize,
    /// Shard manifest durably written.
    Done,
    /// Terminal failure; the reason is retained.
    Failed,
}

impl Stage {
    fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

#[derive(Debug, Clone)]
struct Inner {
    stage: Stage,
    total_file_count: u64,
    incremental_file_count: u64,
    total_size: u64,
    incremental_size: u64,
    start_time: u64,
    /// Elapsed time in milliseconds, recorded at Done or Failed.
    time: u64,
    failure: Option<String>,
}

/// Mutable snapshot progress, exclusively owned by one snapshot task.
#[derive(Debug)]
pub struct ShardSnapshotStatus {
    inner: Mutex<Inner>,
}

impl ShardSnapshotStatus {
    /// Create a status in the `Init` stage.
    pub fn new_initializing() -> Self {
        ShardSnapshotStatus {
            inner: Mutex::new(Inner {
                stage: Stage::Init,
                total_file_count: 0,
                incremental_file_count: 0,
                total_size: 0,
                incremental_size: 0,
                start_time: 0,
                time: 0,
                failure: None,
            }),
        }
    }

    /// Enter `Started`, fixing the file and byte counters. The counters are
    /// write-once: they never change after this transition.
    pub fn move_to_started(
        &self,
        start_time: u64,
        incremental_file_count: u64,
        total_file_count: u64,
        incremental_size: u64,
        total_size: u64,
    ) -> Result<()> {
        if incremental_file_count > total_file_count {
            return Err(ShardsnapError::invalid_operation(format!(
                "incremental file count {incremental_file_count} exceeds total {total_file_count}"
            )));
        }
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Init {
            return Err(unexpected_stage(inner.stage, "Init"));
        }
        inner.stage = Stage::Started;
        inner.start_time = start_time;
        inner.incremental_file_count = incremental_file_count;
        inner.total_file_count = total_file_count;
        inner.incremental_size = incremental_size;
        inner.total_size = total_size;
        Ok(())
    }

    /// Enter `Finalize` once every upload is acknowledged.
    pub fn move_to_finalize(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Started {
            return Err(unexpected_stage(inner.stage, "Started"));
        }
        inner.stage = Stage::Finalize;
        Ok(())
    }

    /// Enter `Done` after the shard manifest is durably written.
    pub fn move_to_done(&self, end_time: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stage != Stage::Finalize {
            return Err(unexpected_stage(inner.stage, "Finalize"));
        }
        inner.stage = Stage::Done;
        inner.time = end_time.saturating_sub(inner.start_time);
        Ok(())
    }

    /// Enter `Failed` from any non-terminal stage, retaining the reason.
    pub fn move_to_failed(&self, end_time: u64, reason: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.stage.is_terminal() {
            return Err(ShardsnapError::invalid_operation(format!(
                "cannot fail snapshot from terminal stage {:?}",
                inner.stage
            )));
        }
        inner.stage = Stage::Failed;
        inner.time = end_time.saturating_sub(inner.start_time);
        inner.failure = Some(reason.into());
        Ok(())
    }

    /// Take an immutable copy of the current state for external observers.
    pub fn as_copy(&self) -> ShardSnapshotStatusCopy {
        let inner = self.inner.lock();
        ShardSnapshotStatusCopy {
            stage: inner.stage,
            total_file_count: inner.total_file_count,
            incremental_file_count: inner.incremental_file_count,
            total_size: inner.total_size,
            incremental_size: inner.incremental_size,
            start_time: inner.start_time,
            time: inner.time,
            failure: inner.failure.clone(),
        }
    }
}

impl Default for ShardSnapshotStatus {
    fn default() -> Self {
        Self::new_initializing()
    }
}

/// A frozen, immutable view of a [`ShardSnapshotStatus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSnapshotStatusCopy {
    /// Stage at the time of the copy.
    pub stage: Stage,
    /// Total number of files in the snapshot.
    pub total_file_count: u64,
    /// Number of files actually uploaded (not reused).
    pub incremental_file_count: u64,
    /// Total size of the snapshot in bytes.
    pub total_size: u64,
    /// Bytes actually uploaded.
    pub incremental_size: u64,
    /// Snapshot start time, milliseconds since epoch.
    pub start_time: u64,
    /// Elapsed milliseconds, recorded at a terminal stage.
    pub time: u64,
    /// Failure reason if the snapshot failed.
    pub failure: Option<String>,
}

fn unexpected_stage(actual: Stage, expected: &str) -> ShardsnapError {
    ShardsnapError::invalid_operation(format!(
        "unexpected snapshot stage {actual:?}, expected {expected}"
    ))
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_lifecycle() {
        let status = ShardSnapshotStatus::new_initializing();
        assert_eq!(status.as_copy().stage, Stage::Init);

        status.move_to_started(100, 3, 5, 30, 50).unwrap();
        let copy = status.as_copy();
        assert_eq!(copy.stage, Stage::Started);
        assert_eq!(copy.incremental_file_count, 3);
        assert_eq!(copy.total_file_count, 5);
        assert_eq!(copy.incremental_size, 30);
        assert_eq!(copy.total_size, 50);
        assert_eq!(copy.start_time, 100);

        status.move_to_finalize().unwrap();
        status.move_to_done(450).unwrap();
        let copy = status.as_copy();
        assert_eq!(copy.stage, Stage::Done);
        assert_eq!(copy.time, 350);
        assert!(copy.failure.is_none());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let status = ShardSnapshotStatus::new_initializing();
        assert!(status.move_to_finalize().is_err());
        assert!(status.move_to_done(1).is_err());

        status.move_to_started(0, 0, 0, 0, 0).unwrap();
        assert!(status.move_to_started(0, 0, 0, 0, 0).is_err());
        assert!(status.move_to_done(1).is_err());
    }

    #[test]
    fn test_incremental_cannot_exceed_total() {
        let status = ShardSnapshotStatus::new_initializing();
        let err = status.move_to_started(0, 6, 5, 0, 0).unwrap_err();
        assert!(err.to_string().contains("exceeds total"));
        // The failed call must not have advanced the stage.
        assert_eq!(status.as_copy().stage, Stage::Init);
    }

    #[test]
    fn test_failed_from_any_non_terminal_stage() {
        let status = ShardSnapshotStatus::new_initializing();
        status.move_to_failed(10, "extraction failed").unwrap();
        let copy = status.as_copy();
        assert_eq!(copy.stage, Stage::Failed);
        assert_eq!(copy.failure.as_deref(), Some("extraction failed"));

        // Terminal stages cannot fail again.
        assert!(status.move_to_failed(11, "again").is_err());

        let status = ShardSnapshotStatus::new_initializing();
        status.move_to_started(0, 1, 1, 1, 1).unwrap();
        status.move_to_finalize().unwrap();
        status.move_to_failed(5, "manifest write failed").unwrap();
        assert_eq!(status.as_copy().stage, Stage::Failed);
    }

    #[test]
    fn test_counters_frozen_after_started() {
        let status = ShardSnapshotStatus::new_initializing();
        status.move_to_started(0, 2, 4, 20, 40).unwrap();
        status.move_to_finalize().unwrap();
        status.move_to_done(9).unwrap();

        let copy = status.as_copy();
        assert_eq!(copy.incremental_file_count, 2);
        assert_eq!(copy.total_file_count, 4);
    }
}
