//! Segment file formats.
//!
//! Every segment is written once and never rewritten, so segment files keep
//! a stable (name, length, checksum) identity across commits and the
//! incremental differ can reuse them. Three kinds of files exist:
//!
//! - `<seg>.src` — stored-source records, one per document, in sequence
//!   number order. This is the payload a source-only snapshot keeps.
//! - `<seg>.trm` — term postings, the search structure a source-only
//!   snapshot discards.
//! - `<seg>_<delgen>.liv` — liveness bitmap; deletions write a new file
//!   with a bumped delete generation instead of mutating the old one.

use std::collections::BTreeMap;
use std::io::Cursor;

use bit_vec::BitVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::document::SourceDocument;
use crate::error::{Result, ShardsnapError};
use crate::storage::traits::{read_all, write_all};
use crate::storage::Storage;

const SRC_MAGIC: u32 = 0x5352_4331; // "SRC1"
const LIV_MAGIC: u32 = 0x4C49_5631; // "LIV1"

/// Term postings for one segment: field -> term -> ordinals.
///
/// Serialized as JSON; the snapshot path never looks inside this file.
pub type TermPostings = BTreeMap<String, BTreeMap<String, Vec<u32>>>;

/// Metadata of one immutable segment, as recorded in commit manifests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment identifier, unique within the shard.
    pub id: String,
    /// Number of documents written into the segment (live or not).
    pub doc_count: u32,
    /// Delete generation; 0 means no liveness file exists and every
    /// document is live.
    pub del_gen: u64,
}

impl SegmentInfo {
    /// Create segment metadata.
    pub fn new(id: impl Into<String>, doc_count: u32, del_gen: u64) -> Self {
        SegmentInfo {
            id: id.into(),
            doc_count,
            del_gen,
        }
    }

    /// Name of the stored-source file.
    pub fn src_file(&self) -> String {
        format!("{}.src", self.id)
    }

    /// Name of the term postings file.
    pub fn trm_file(&self) -> String {
        format!("{}.trm", self.id)
    }

    /// Name of the current liveness file, if any deletions were committed.
    pub fn live_file(&self) -> Option<String> {
        if self.del_gen == 0 {
            None
        } else {
            Some(format!("{}_{}.liv", self.id, self.del_gen))
        }
    }

    /// All files belonging to this segment at its current delete generation.
    pub fn files(&self) -> Vec<String> {
        let mut files = vec![self.src_file(), self.trm_file()];
        files.extend(self.live_file());
        files
    }

    /// The files a source-only commit keeps: stored source and liveness,
    /// never the search structures.
    pub fn source_files(&self) -> Vec<String> {
        let mut files = vec![self.src_file()];
        files.extend(self.live_file());
        files
    }
}

/// Write a stored-source file for the given documents.
pub fn write_src(storage: &dyn Storage, name: &str, docs: &[SourceDocument]) -> Result<()> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(SRC_MAGIC)?;
    buf.write_u32::<LittleEndian>(docs.len() as u32)?;
    for doc in docs {
        buf.write_u64::<LittleEndian>(doc.seq_no)?;
        buf.write_u32::<LittleEndian>(doc.id.len() as u32)?;
        buf.extend_from_slice(doc.id.as_bytes());
        match &doc.routing {
            Some(routing) => {
                buf.write_u8(1)?;
                buf.write_u32::<LittleEndian>(routing.len() as u32)?;
                buf.extend_from_slice(routing.as_bytes());
            }
            None => buf.write_u8(0)?,
        }
        buf.write_u32::<LittleEndian>(doc.source.len() as u32)?;
        buf.extend_from_slice(&doc.source);
    }
    let checksum = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;
    write_all(storage, name, &buf)
}

/// Read a stored-source file back into documents, verifying the checksum.
pub fn read_src(storage: &dyn Storage, name: &str) -> Result<Vec<SourceDocument>> {
    let buf = checked_contents(storage, name)?;
    let mut cursor = Cursor::new(&buf);

    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != SRC_MAGIC {
        return Err(ShardsnapError::index(format!(
            "file {name} is not a stored-source file"
        )));
    }
    let doc_count = cursor.read_u32::<LittleEndian>()?;
    let mut docs = Vec::with_capacity(doc_count as usize);
    for _ in 0..doc_count {
        let seq_no = cursor.read_u64::<LittleEndian>()?;
        let id = read_string(&mut cursor, name)?;
        let routing = if cursor.read_u8()? == 1 {
            Some(read_string(&mut cursor, name)?)
        } else {
            None
        };
        let source_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut source = vec![0u8; source_len];
        std::io::Read::read_exact(&mut cursor, &mut source)?;
        docs.push(SourceDocument::new(id, seq_no, routing, source)?);
    }
    Ok(docs)
}

/// Write a liveness bitmap file.
pub fn write_live(storage: &dyn Storage, name: &str, live: &BitVec) -> Result<()> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(LIV_MAGIC)?;
    buf.write_u32::<LittleEndian>(live.len() as u32)?;
    let bytes = live.to_bytes();
    buf.write_u32::<LittleEndian>(bytes.len() as u32)?;
    buf.extend_from_slice(&bytes);
    let checksum = crc32fast::hash(&buf);
    buf.write_u32::<LittleEndian>(checksum)?;
    write_all(storage, name, &buf)
}

/// Read a liveness bitmap file, verifying the checksum.
pub fn read_live(storage: &dyn Storage, name: &str) -> Result<BitVec> {
    let buf = checked_contents(storage, name)?;
    let mut cursor = Cursor::new(&buf);

    let magic = cursor.read_u32::<LittleEndian>()?;
    if magic != LIV_MAGIC {
        return Err(ShardsnapError::index(format!(
            "file {name} is not a liveness file"
        )));
    }
    let bit_len = cursor.read_u32::<LittleEndian>()? as usize;
    let byte_len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; byte_len];
    std::io::Read::read_exact(&mut cursor, &mut bytes)?;
    let mut live = BitVec::from_bytes(&bytes);
    live.truncate(bit_len);
    Ok(live)
}

/// Write the term postings file for a segment.
pub fn write_terms(storage: &dyn Storage, name: &str, postings: &TermPostings) -> Result<()> {
    let data = serde_json::to_vec_pretty(postings)?;
    write_all(storage, name, &data)
}

/// Read a term postings file.
pub fn read_terms(storage: &dyn Storage, name: &str) -> Result<TermPostings> {
    let data = read_all(storage, name)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Read a whole file and strip its trailing crc32, verifying it first.
fn checked_contents(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut buf = read_all(storage, name)?;
    if buf.len() < 8 {
        return Err(ShardsnapError::index(format!(
            "file {name} is truncated ({} bytes)",
            buf.len()
        )));
    }
    let crc_offset = buf.len() - 4;
    let expected = u32::from_le_bytes(buf[crc_offset..].try_into().unwrap());
    let actual = crc32fast::hash(&buf[..crc_offset]);
    if expected != actual {
        return Err(ShardsnapError::index(format!(
            "checksum mismatch in {name}: expected {expected:08x}, got {actual:08x}"
        )));
    }
    buf.truncate(crc_offset);
    Ok(buf)
}

fn read_string(cursor: &mut Cursor<&Vec<u8>>, file: &str) -> Result<String> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    std::io::Read::read_exact(cursor, &mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| ShardsnapError::index(format!("invalid utf-8 string in {file}")))
}
