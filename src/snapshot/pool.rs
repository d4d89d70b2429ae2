//! Dedicated worker pool for snapshot and restore tasks.
//!
//! Long-running file I/O and reindexing run on a bounded pool of named
//! threads, distinct from any request-handling path. Completion is signaled
//! through a single-assignment future backed by a bounded(1) channel: at
//! most one success or one failure is ever recorded, and the caller's
//! `wait` is the sole observation point.

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{Result, ShardsnapError};

/// Bounded pool of snapshot worker threads.
pub struct SnapshotPool {
    pool: ThreadPool,
}

impl SnapshotPool {
    /// Create a pool with the given number of threads; 0 means one thread
    /// per available CPU.
    pub fn new(threads: usize) -> Result<Self> {
        let threads = if threads == 0 {
            num_cpus::get()
        } else {
            threads
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("snapshot-{i}"))
            .build()
            .map_err(|e| ShardsnapError::internal(format!("failed to create thread pool: {e}")))?;
        Ok(SnapshotPool { pool })
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run a task on the pool, returning its completion future.
    pub fn spawn<T, F>(&self, task: F) -> SnapshotFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.pool.spawn(move || {
            // The receiver may have been dropped; the task's side effects
            // stand either way.
            let _ = tx.send(task());
        });
        SnapshotFuture { rx }
    }
}

impl std::fmt::Debug for SnapshotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPool")
            .field("threads", &self.thread_count())
            .finish()
    }
}

/// Single-assignment completion handle for a pool task.
#[derive(Debug)]
pub struct SnapshotFuture<T> {
    rx: Receiver<Result<T>>,
}

impl<T> SnapshotFuture<T> {
    /// Block until the task completes and take its result.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| ShardsnapError::snapshot("snapshot task dropped before completing"))?
    }

    /// Take the result if the task has already completed.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ShardsnapError::snapshot(
                "snapshot task dropped before completing",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_spawn_and_wait() {
        let pool = SnapshotPool::new(2).unwrap();
        let future = pool.spawn(|| Ok(21 * 2));
        assert_eq!(future.wait().unwrap(), 42);
    }

    #[test]
    fn test_failure_is_recorded_once() {
        let pool = SnapshotPool::new(1).unwrap();
        let future: SnapshotFuture<()> =
            pool.spawn(|| Err(ShardsnapError::snapshot("upload failed")));
        let err = future.wait().unwrap_err();
        assert_eq!(err.to_string(), "Snapshot error: upload failed");
    }

    #[test]
    fn test_try_wait() {
        let pool = SnapshotPool::new(1).unwrap();
        let future = pool.spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
            Ok(7)
        });
        // Either still pending or already done; once done the value is 7.
        loop {
            if let Some(result) = future.try_wait() {
                assert_eq!(result.unwrap(), 7);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_threads_are_named() {
        let pool = SnapshotPool::new(1).unwrap();
        let future = pool.spawn(|| {
            Ok(std::thread::current()
                .name()
                .unwrap_or_default()
                .to_string())
        });
        assert_eq!(future.wait().unwrap(), "snapshot-0");
    }

    #[test]
    fn test_default_thread_count() {
        let pool = SnapshotPool::new(0).unwrap();
        assert!(pool.thread_count() >= 1);
    }
}
