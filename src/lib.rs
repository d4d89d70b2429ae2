//! # Shardsnap
//!
//! A source-only incremental snapshot and restore engine for sharded
//! document stores.
//!
//! ## Features
//!
//! - Source-only snapshots keep stored document sources and liveness,
//!   dropping search structures
//! - Incremental uploads reuse unchanged files across snapshots by
//!   (name, length, checksum) identity
//! - Generation-guarded repository finalization with conflict detection
//! - Restore opens a restricted read-only engine; reindexing rebuilds a
//!   fully searchable shard from stored sources
//! - Pluggable storage backends

pub mod document;
pub mod error;
pub mod mapping;
pub mod shard;
pub mod snapshot;
pub mod storage;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
