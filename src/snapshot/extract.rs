//! Stored-field extraction from a point-in-time commit.

use bit_vec::BitVec;

use crate::document::SourceDocument;
use crate::error::{Result, ShardsnapError};
use crate::shard::commit::CommitManifest;
use crate::shard::segment;
use crate::storage::Storage;

/// Reads a commit's live documents in leaf-then-ordinal order, which for
/// this commit format equals ascending sequence number order.
///
/// The extractor is purely read-only. Its scan is lazy per segment, finite,
/// and non-restartable; an empty stored source is surfaced as an error, not
/// skipped, because a document without retained source is unrecoverable.
pub struct StoredFieldExtractor<'a> {
    storage: &'a dyn Storage,
    manifest: &'a CommitManifest,
}

impl<'a> StoredFieldExtractor<'a> {
    /// Create an extractor over a pinned commit.
    pub fn new(storage: &'a dyn Storage, manifest: &'a CommitManifest) -> Self {
        StoredFieldExtractor { storage, manifest }
    }

    /// Start the scan. Consumes the extractor: the sequence is
    /// non-restartable.
    pub fn scan(self) -> SourceScan<'a> {
        SourceScan {
            storage: self.storage,
            segments: self.manifest.segments.clone(),
            next_segment: 0,
            current: Vec::new(),
            position: 0,
            last_seq_no: None,
            failed: false,
        }
    }

    /// Count live documents without materializing their sources.
    pub fn live_doc_count(&self) -> Result<u64> {
        let mut count = 0u64;
        for info in &self.manifest.segments {
            count += match info.live_file() {
                Some(live_file) => {
                    let live = segment::read_live(self.storage, &live_file)?;
                    live.iter().filter(|bit| *bit).count() as u64
                }
                None => info.doc_count as u64,
            };
        }
        Ok(count)
    }
}

/// Lazy iterator over the live documents of a commit.
pub struct SourceScan<'a> {
    storage: &'a dyn Storage,
    segments: Vec<crate::shard::segment::SegmentInfo>,
    next_segment: usize,
    current: Vec<(SourceDocument, bool)>,
    position: usize,
    last_seq_no: Option<u64>,
    failed: bool,
}

impl SourceScan<'_> {
    fn load_next_segment(&mut self) -> Result<bool> {
        if self.next_segment >= self.segments.len() {
            return Ok(false);
        }
        let info = &self.segments[self.next_segment];
        self.next_segment += 1;

        let docs = segment::read_src(self.storage, &info.src_file())?;
        let live = match info.live_file() {
            Some(live_file) => segment::read_live(self.storage, &live_file)?,
            None => BitVec::from_elem(docs.len(), true),
        };
        if live.len() != docs.len() {
            return Err(ShardsnapError::index(format!(
                "liveness bitmap of segment {} covers {} docs, segment has {}",
                info.id,
                live.len(),
                docs.len()
            )));
        }

        self.current = docs
            .into_iter()
            .enumerate()
            .map(|(ordinal, doc)| (doc, live.get(ordinal).unwrap_or(false)))
            .collect();
        self.position = 0;
        Ok(true)
    }
}

impl Iterator for SourceScan<'_> {
    type Item = Result<SourceDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            while self.position < self.current.len() {
                let index = self.position;
                self.position += 1;
                let (doc, live) = &self.current[index];
                if !live {
                    continue;
                }
                if let Some(last) = self.last_seq_no {
                    if doc.seq_no <= last {
                        self.failed = true;
                        return Some(Err(ShardsnapError::index(format!(
                            "sequence numbers out of order: {} after {}",
                            doc.seq_no, last
                        ))));
                    }
                }
                self.last_seq_no = Some(doc.seq_no);
                return Some(Ok(doc.clone()));
            }
            match self.load_next_segment() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
