//! Document types flowing through the snapshot and restore paths.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShardsnapError};

/// One stored document as captured by the stored-field extractor.
///
/// A `SourceDocument` carries everything a source-only snapshot retains
/// about a document: its identifier, sequence number, optional routing key,
/// and the raw stored-source bytes. The source bytes are never empty — a
/// document whose source was not retained is an unrecoverable error, not a
/// skippable record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Document identifier, unique among live documents of a shard.
    pub id: String,
    /// Per-shard monotonically increasing operation identifier.
    pub seq_no: u64,
    /// Optional routing key recorded at index time.
    pub routing: Option<String>,
    /// The original document payload, retained verbatim.
    pub source: Vec<u8>,
}

impl SourceDocument {
    /// Create a new source document, rejecting empty source bytes.
    pub fn new(
        id: impl Into<String>,
        seq_no: u64,
        routing: Option<String>,
        source: Vec<u8>,
    ) -> Result<Self> {
        let id = id.into();
        if source.is_empty() {
            return Err(ShardsnapError::index(format!(
                "document '{id}' has no stored source"
            )));
        }
        Ok(SourceDocument {
            id,
            seq_no,
            routing,
            source,
        })
    }
}

/// A standard index operation applied to a fully-capable shard.
///
/// Replayed operations use match-any version semantics: the target shard
/// assigns a fresh sequence number and no version conflict is possible
/// because the target starts empty.
#[derive(Debug, Clone)]
pub struct IndexOperation {
    /// Document identifier.
    pub id: String,
    /// Optional routing key.
    pub routing: Option<String>,
    /// The document payload.
    pub source: Vec<u8>,
}

impl IndexOperation {
    /// Create a new index operation.
    pub fn new(id: impl Into<String>, routing: Option<String>, source: Vec<u8>) -> Self {
        IndexOperation {
            id: id.into(),
            routing,
            source,
        }
    }
}

impl From<SourceDocument> for IndexOperation {
    fn from(doc: SourceDocument) -> Self {
        IndexOperation {
            id: doc.id,
            routing: doc.routing,
            source: doc.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_document_rejects_empty_source() {
        let err = SourceDocument::new("1", 0, None, Vec::new()).unwrap_err();
        assert!(err.to_string().contains("no stored source"));
    }

    #[test]
    fn test_source_document_fields() {
        let doc =
            SourceDocument::new("1", 7, Some("west".to_string()), b"{\"a\":1}".to_vec()).unwrap();
        assert_eq!(doc.id, "1");
        assert_eq!(doc.seq_no, 7);
        assert_eq!(doc.routing.as_deref(), Some("west"));
        assert_eq!(doc.source, b"{\"a\":1}");
    }

    #[test]
    fn test_index_operation_from_source_document() {
        let doc = SourceDocument::new("9", 3, None, b"{}".to_vec()).unwrap();
        let op = IndexOperation::from(doc);
        assert_eq!(op.id, "9");
        assert!(op.routing.is_none());
        assert_eq!(op.source, b"{}");
    }
}
