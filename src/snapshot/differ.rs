//! Incremental file diffing by content identity.
//!
//! Files are matched by (name, length, checksum), never by name alone: a
//! same-named file with a different length or checksum is always treated as
//! new. The diff result feeds the status tracker's incremental vs. total
//! counters.

use std::collections::HashSet;
use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::Storage;

/// Content identity of one persisted file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Shard-relative file name.
    pub name: String,
    /// File length in bytes.
    pub length: u64,
    /// crc32 of the file contents.
    pub checksum: u32,
}

impl FileIdentity {
    /// Compute the identity of a file in storage by streaming its contents.
    pub fn of(storage: &dyn Storage, name: &str) -> Result<FileIdentity> {
        let mut input = storage.open_input(name)?;
        let mut hasher = crc32fast::Hasher::new();
        let mut length = 0u64;
        let mut buf = [0u8; 8192];
        loop {
            let n = input.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            length += n as u64;
        }
        input.close()?;
        Ok(FileIdentity {
            name: name.to_string(),
            length,
            checksum: hasher.finalize(),
        })
    }

    /// Compute the identity of an in-memory buffer.
    pub fn of_bytes(name: impl Into<String>, bytes: &[u8]) -> FileIdentity {
        FileIdentity {
            name: name.into(),
            length: bytes.len() as u64,
            checksum: crc32fast::hash(bytes),
        }
    }

    /// The repository blob name encoding this identity. Blobs are content
    /// addressed: two identical identities share one blob and are never
    /// re-uploaded.
    pub fn blob_name(&self) -> String {
        format!("__{}-{}-{:08x}", self.name, self.length, self.checksum)
    }

    /// Parse an identity back out of a repository blob name.
    pub fn parse_blob_name(blob: &str) -> Option<FileIdentity> {
        let rest = blob.strip_prefix("__")?;
        let mut parts = rest.rsplitn(3, '-');
        let checksum = u32::from_str_radix(parts.next()?, 16).ok()?;
        let length: u64 = parts.next()?.parse().ok()?;
        let name = parts.next()?;
        if name.is_empty() {
            return None;
        }
        Some(FileIdentity {
            name: name.to_string(),
            length,
            checksum,
        })
    }
}

/// Result of diffing a candidate commit against already-persisted files.
#[derive(Debug, Clone)]
pub struct FileDiff {
    /// Files that must be uploaded.
    pub to_upload: Vec<FileIdentity>,
    /// Files already present in the repository for this shard lineage.
    pub reused: Vec<FileIdentity>,
}

impl FileDiff {
    /// Total number of files in the candidate commit.
    pub fn total_file_count(&self) -> u64 {
        (self.to_upload.len() + self.reused.len()) as u64
    }

    /// Number of files that actually transfer.
    pub fn incremental_file_count(&self) -> u64 {
        self.to_upload.len() as u64
    }

    /// Total size of the candidate commit in bytes.
    pub fn total_size(&self) -> u64 {
        self.to_upload.iter().chain(&self.reused).map(|f| f.length).sum()
    }

    /// Size of the files that actually transfer.
    pub fn incremental_size(&self) -> u64 {
        self.to_upload.iter().map(|f| f.length).sum()
    }
}

/// Diff a candidate file list against the identities already persisted for
/// the shard's lineage.
pub fn diff(candidate: &[FileIdentity], existing: &HashSet<FileIdentity>) -> FileDiff {
    let mut to_upload = Vec::new();
    let mut reused = Vec::new();
    for file in candidate {
        if existing.contains(file) {
            reused.push(file.clone());
        } else {
            to_upload.push(file.clone());
        }
    }
    FileDiff { to_upload, reused }
}
