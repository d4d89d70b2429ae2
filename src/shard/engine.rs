//! Engines over shard data.
//!
//! Engine selection is an explicit, compile-time strategy: the write path
//! uses [`InternalEngine`], the restore path constructs the restricted
//! source-only engine (`snapshot::restore::SourceOnlyEngine`). Both expose
//! the read surface through the [`Engine`] trait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;
use log::debug;

use crate::document::{IndexOperation, SourceDocument};
use crate::error::{Result, ShardsnapError};
use crate::mapping::MappingConfig;
use crate::shard::commit::{no_commit_error, CommitManifest, CommitRef};
use crate::shard::segment::{self, SegmentInfo, TermPostings};
use crate::storage::Storage;

/// Read surface shared by the full engine and the restricted source-only
/// restore engine.
pub trait Engine: Send {
    /// Get a live document by id, or `None` if absent or deleted.
    fn get(&self, id: &str) -> Result<Option<SourceDocument>>;

    /// Ordered full scan of live documents, ascending by sequence number.
    fn scan<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<SourceDocument>> + 'a>>;

    /// Find ids of live documents containing `term` in `field`.
    ///
    /// Requires search index structures; the source-only engine rejects
    /// this deterministically.
    fn search_term(&self, field: &str, term: &str) -> Result<Vec<String>>;

    /// Number of live documents.
    fn doc_count(&self) -> u64;

    /// Highest sequence number assigned in this shard, if any.
    fn max_seq_no(&self) -> Option<u64>;

    /// Close the engine and release resources.
    fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocLocation {
    Buffered(usize),
    Committed { segment: usize, ordinal: usize },
}

#[derive(Debug, Clone)]
struct BufferedDoc {
    doc: SourceDocument,
    live: bool,
}

#[derive(Debug)]
struct SegmentState {
    info: SegmentInfo,
    /// Document ids by ordinal, kept in memory for postings resolution.
    ids: Vec<String>,
    live: BitVec,
    /// Deletions applied since the segment's liveness file was last written.
    dirty: bool,
}

/// The fully-capable write engine.
///
/// Documents are buffered in memory and flushed to an immutable segment on
/// [`InternalEngine::commit`]. Sequence numbers are assigned monotonically
/// at index time; deletions mark liveness bits and surface as a new
/// liveness file at the next commit.
pub struct InternalEngine {
    storage: Arc<dyn Storage>,
    mapping: MappingConfig,
    buffer: Vec<BufferedDoc>,
    buffered_postings: AHashMap<String, AHashMap<String, Vec<u32>>>,
    segments: Vec<SegmentState>,
    postings: AHashMap<String, AHashMap<String, Vec<(usize, usize)>>>,
    id_map: AHashMap<String, DocLocation>,
    next_seq_no: u64,
    next_segment: u64,
    manifest: Option<Arc<CommitManifest>>,
    pins: Arc<AtomicUsize>,
    closed: bool,
}

impl InternalEngine {
    /// Create a fresh engine over empty storage.
    pub fn new(storage: Arc<dyn Storage>, mapping: MappingConfig) -> Self {
        InternalEngine {
            storage,
            mapping,
            buffer: Vec::new(),
            buffered_postings: AHashMap::new(),
            segments: Vec::new(),
            postings: AHashMap::new(),
            id_map: AHashMap::new(),
            next_seq_no: 0,
            next_segment: 1,
            manifest: None,
            pins: Arc::new(AtomicUsize::new(0)),
            closed: false,
        }
    }

    /// The shard storage backing this engine.
    pub fn storage(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.storage)
    }

    /// The mapping configuration of this shard.
    pub fn mapping(&self) -> &MappingConfig {
        &self.mapping
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(ShardsnapError::invalid_operation("engine is closed"))
        } else {
            Ok(())
        }
    }

    /// Apply an index operation with match-any version semantics: a live
    /// document with the same id is deleted and the new document gets a
    /// fresh sequence number. Returns the assigned sequence number.
    pub fn index(&mut self, op: IndexOperation) -> Result<u64> {
        self.check_open()?;

        let seq_no = self.next_seq_no;
        let doc = SourceDocument::new(op.id, seq_no, op.routing, op.source)?;

        self.remove_live(&doc.id);

        let ordinal = self.buffer.len() as u32;
        self.index_terms(ordinal, &doc.source);
        self.id_map
            .insert(doc.id.clone(), DocLocation::Buffered(self.buffer.len()));
        self.buffer.push(BufferedDoc { doc, live: true });
        self.next_seq_no += 1;
        Ok(seq_no)
    }

    /// Delete a live document by id. Returns whether a document was found.
    pub fn delete(&mut self, id: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.remove_live(id))
    }

    fn remove_live(&mut self, id: &str) -> bool {
        match self.id_map.remove(id) {
            Some(DocLocation::Buffered(index)) => {
                self.buffer[index].live = false;
                true
            }
            Some(DocLocation::Committed { segment, ordinal }) => {
                let state = &mut self.segments[segment];
                state.live.set(ordinal, false);
                state.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Index term postings from a JSON source. Non-JSON sources are stored
    /// verbatim but contribute no search terms.
    fn index_terms(&mut self, ordinal: u32, source: &[u8]) {
        let value: serde_json::Value = match serde_json::from_slice(source) {
            Ok(value) => value,
            Err(_) => {
                debug!("source of buffered doc {ordinal} is not JSON, skipping term indexing");
                return;
            }
        };
        let Some(object) = value.as_object() else {
            return;
        };
        for (field, field_value) in object {
            let Some(text) = field_value.as_str() else {
                continue;
            };
            for token in text.split_whitespace() {
                let ordinals = self
                    .buffered_postings
                    .entry(field.clone())
                    .or_default()
                    .entry(token.to_lowercase())
                    .or_default();
                if ordinals.last() != Some(&ordinal) {
                    ordinals.push(ordinal);
                }
            }
        }
    }

    /// Flush buffered documents and dirty liveness bitmaps into a new
    /// commit and persist its manifest. A no-op commit (nothing buffered,
    /// nothing deleted) returns the current manifest unchanged, except for
    /// the very first commit which always writes an empty manifest.
    pub fn commit(&mut self) -> Result<Arc<CommitManifest>> {
        self.check_open()?;

        let mut changed = false;

        if !self.buffer.is_empty() {
            self.flush_segment()?;
            changed = true;
        }

        for state in &mut self.segments {
            if state.dirty {
                state.info.del_gen += 1;
                let name = state
                    .info
                    .live_file()
                    .ok_or_else(|| ShardsnapError::internal("dirty segment without delete generation"))?;
                segment::write_live(self.storage.as_ref(), &name, &state.live)?;
                state.dirty = false;
                changed = true;
            }
        }

        if changed || self.manifest.is_none() {
            let generation = self.manifest.as_ref().map_or(1, |m| m.generation + 1);
            let manifest = CommitManifest {
                generation,
                max_seq_no: self.next_seq_no.checked_sub(1),
                segments: self.segments.iter().map(|s| s.info.clone()).collect(),
            };
            manifest.save(self.storage.as_ref())?;
            debug!(
                "committed generation {generation} with {} segment(s)",
                manifest.segments.len()
            );
            self.manifest = Some(Arc::new(manifest));
        }

        Ok(Arc::clone(self.manifest.as_ref().unwrap()))
    }

    fn flush_segment(&mut self) -> Result<()> {
        let id = format!("seg_{:08x}", self.next_segment);
        self.next_segment += 1;

        let docs: Vec<SourceDocument> = self.buffer.iter().map(|b| b.doc.clone()).collect();
        let mut live = BitVec::from_elem(docs.len(), true);
        let mut has_tombstones = false;
        for (ordinal, buffered) in self.buffer.iter().enumerate() {
            if !buffered.live {
                live.set(ordinal, false);
                has_tombstones = true;
            }
        }

        let del_gen = if has_tombstones { 1 } else { 0 };
        let info = SegmentInfo::new(id, docs.len() as u32, del_gen);

        segment::write_src(self.storage.as_ref(), &info.src_file(), &docs)?;
        segment::write_terms(
            self.storage.as_ref(),
            &info.trm_file(),
            &Self::to_term_postings(&self.buffered_postings),
        )?;
        if let Some(live_file) = info.live_file() {
            segment::write_live(self.storage.as_ref(), &live_file, &live)?;
        }

        let segment_index = self.segments.len();
        for (ordinal, buffered) in self.buffer.iter().enumerate() {
            if buffered.live {
                self.id_map.insert(
                    buffered.doc.id.clone(),
                    DocLocation::Committed {
                        segment: segment_index,
                        ordinal,
                    },
                );
            }
        }
        for (field, terms) in self.buffered_postings.drain() {
            let field_postings = self.postings.entry(field).or_default();
            for (term, ordinals) in terms {
                let entries = field_postings.entry(term).or_default();
                entries.extend(
                    ordinals
                        .into_iter()
                        .map(|ordinal| (segment_index, ordinal as usize)),
                );
            }
        }

        self.segments.push(SegmentState {
            info,
            ids: docs.into_iter().map(|d| d.id).collect(),
            live,
            dirty: false,
        });
        self.buffer.clear();
        Ok(())
    }

    fn to_term_postings(
        buffered: &AHashMap<String, AHashMap<String, Vec<u32>>>,
    ) -> TermPostings {
        let mut postings = TermPostings::new();
        for (field, terms) in buffered {
            let field_entry = postings.entry(field.clone()).or_default();
            for (term, ordinals) in terms {
                field_entry.insert(term.clone(), ordinals.clone());
            }
        }
        postings
    }

    /// Pin the last commit for a snapshot task. Fails if the shard has
    /// never committed.
    pub fn acquire_last_commit(&self) -> Result<CommitRef> {
        self.check_open()?;
        let manifest = self.manifest.as_ref().ok_or_else(no_commit_error)?;
        Ok(CommitRef::new(Arc::clone(manifest), Arc::clone(&self.pins)))
    }

    /// Number of commit references currently pinned.
    pub fn pinned_commits(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }
}

impl Engine for InternalEngine {
    fn get(&self, id: &str) -> Result<Option<SourceDocument>> {
        self.check_open()?;

        match self.id_map.get(id) {
            Some(DocLocation::Buffered(index)) => Ok(Some(self.buffer[*index].doc.clone())),
            Some(DocLocation::Committed { segment, ordinal }) => {
                let state = &self.segments[*segment];
                let docs = segment::read_src(self.storage.as_ref(), &state.info.src_file())?;
                docs.into_iter().nth(*ordinal).map(Some).ok_or_else(|| {
                    ShardsnapError::internal(format!(
                        "ordinal {ordinal} missing from segment {}",
                        state.info.id
                    ))
                })
            }
            None => Ok(None),
        }
    }

    fn scan<'a>(&'a self) -> Result<Box<dyn Iterator<Item = Result<SourceDocument>> + 'a>> {
        self.check_open()?;

        let committed = self.segments.iter().flat_map(move |state| {
            match segment::read_src(self.storage.as_ref(), &state.info.src_file()) {
                Ok(docs) => docs
                    .into_iter()
                    .enumerate()
                    .filter(|(ordinal, _)| state.live.get(*ordinal).unwrap_or(false))
                    .map(|(_, doc)| Ok(doc))
                    .collect::<Vec<_>>()
                    .into_iter(),
                Err(e) => vec![Err(e)].into_iter(),
            }
        });
        let buffered = self
            .buffer
            .iter()
            .filter(|b| b.live)
            .map(|b| Ok(b.doc.clone()));
        Ok(Box::new(committed.chain(buffered)))
    }

    fn search_term(&self, field: &str, term: &str) -> Result<Vec<String>> {
        self.check_open()?;

        let mut ids = Vec::new();
        if let Some(entries) = self.postings.get(field).and_then(|f| f.get(term)) {
            for (segment, ordinal) in entries {
                let state = &self.segments[*segment];
                if state.live.get(*ordinal).unwrap_or(false) {
                    ids.push(state.ids[*ordinal].clone());
                }
            }
        }
        if let Some(ordinals) = self.buffered_postings.get(field).and_then(|f| f.get(term)) {
            for ordinal in ordinals {
                let buffered = &self.buffer[*ordinal as usize];
                if buffered.live {
                    ids.push(buffered.doc.id.clone());
                }
            }
        }
        Ok(ids)
    }

    fn doc_count(&self) -> u64 {
        self.id_map.len() as u64
    }

    fn max_seq_no(&self) -> Option<u64> {
        self.next_seq_no.checked_sub(1)
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

impl std::fmt::Debug for InternalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalEngine")
            .field("segments", &self.segments.len())
            .field("buffered", &self.buffer.len())
            .field("next_seq_no", &self.next_seq_no)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn engine() -> InternalEngine {
        InternalEngine::new(
            Arc::new(MemoryStorage::new()),
            MappingConfig::with_complete_source(),
        )
    }

    fn op(id: &str, body: &str) -> IndexOperation {
        IndexOperation::new(id, None, format!("{{\"body\":\"{body}\"}}").into_bytes())
    }

    #[test]
    fn test_index_assigns_monotonic_seq_nos() {
        let mut engine = engine();
        assert_eq!(engine.index(op("a", "one")).unwrap(), 0);
        assert_eq!(engine.index(op("b", "two")).unwrap(), 1);
        assert_eq!(engine.index(op("c", "three")).unwrap(), 2);
        assert_eq!(engine.max_seq_no(), Some(2));
        assert_eq!(engine.doc_count(), 3);
    }

    #[test]
    fn test_get_before_and_after_commit() {
        let mut engine = engine();
        engine.index(op("a", "hello world")).unwrap();
        assert!(engine.get("a").unwrap().is_some());

        engine.commit().unwrap();
        let doc = engine.get("a").unwrap().unwrap();
        assert_eq!(doc.id, "a");
        assert_eq!(doc.seq_no, 0);
        assert!(engine.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_update_replaces_and_reassigns_seq() {
        let mut engine = engine();
        engine.index(op("a", "old")).unwrap();
        engine.commit().unwrap();

        engine.index(op("a", "new")).unwrap();
        assert_eq!(engine.doc_count(), 1);
        let doc = engine.get("a").unwrap().unwrap();
        assert_eq!(doc.seq_no, 1);
        assert_eq!(doc.source, b"{\"body\":\"new\"}");
    }

    #[test]
    fn test_delete_committed_doc_bumps_del_gen() {
        let mut engine = engine();
        engine.index(op("a", "one")).unwrap();
        engine.index(op("b", "two")).unwrap();
        let first = engine.commit().unwrap();
        assert_eq!(first.segments[0].del_gen, 0);

        assert!(engine.delete("a").unwrap());
        assert!(!engine.delete("a").unwrap());
        let second = engine.commit().unwrap();
        assert_eq!(second.segments[0].del_gen, 1);
        assert!(engine.get("a").unwrap().is_none());
        assert_eq!(engine.doc_count(), 1);
    }

    #[test]
    fn test_search_term_finds_live_docs_only() {
        let mut engine = engine();
        engine.index(op("a", "rust engine")).unwrap();
        engine.index(op("b", "rust snapshot")).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.search_term("body", "rust").unwrap(), vec!["a", "b"]);
        engine.delete("a").unwrap();
        assert_eq!(engine.search_term("body", "rust").unwrap(), vec!["b"]);
        assert!(engine.search_term("body", "missing").unwrap().is_empty());
    }

    #[test]
    fn test_scan_is_ordered_by_seq_no() {
        let mut engine = engine();
        for i in 0..5 {
            engine.index(op(&i.to_string(), "doc")).unwrap();
        }
        engine.commit().unwrap();
        engine.delete("2").unwrap();
        engine.index(op("5", "late")).unwrap();

        let seqs: Vec<u64> = engine
            .scan()
            .unwrap()
            .map(|doc| doc.unwrap().seq_no)
            .collect();
        assert_eq!(seqs, vec![0, 1, 3, 4, 5]);
    }

    #[test]
    fn test_noop_commit_keeps_generation() {
        let mut engine = engine();
        engine.index(op("a", "x")).unwrap();
        let first = engine.commit().unwrap();
        let second = engine.commit().unwrap();
        assert_eq!(first.generation, second.generation);

        engine.index(op("b", "y")).unwrap();
        let third = engine.commit().unwrap();
        assert_eq!(third.generation, first.generation + 1);
    }

    #[test]
    fn test_acquire_last_commit_requires_commit() {
        let engine = engine();
        assert!(engine.acquire_last_commit().is_err());
    }

    #[test]
    fn test_commit_ref_released_on_drop() {
        let mut engine = engine();
        engine.index(op("a", "x")).unwrap();
        engine.commit().unwrap();

        {
            let _commit_ref = engine.acquire_last_commit().unwrap();
            assert_eq!(engine.pinned_commits(), 1);
        }
        assert_eq!(engine.pinned_commits(), 0);
    }

    #[test]
    fn test_closed_engine_rejects_operations() {
        let mut engine = engine();
        engine.close().unwrap();
        assert!(engine.index(op("a", "x")).is_err());
        assert!(engine.get("a").is_err());
        assert!(engine.commit().is_err());
    }
}
