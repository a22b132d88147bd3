//! Internal document models shared between the indexer and storage.
//!
//! `PreparedDocument` is the post-analysis shape the indexer hands to
//! storage: stored JSON, the analyzed FTS text, term postings and the
//! derived spatial box. `StoredDocument` is what comes back out.

use crate::geo::Bounds;
use serde_json::{Map, Value};

/// Schema mode of an index, fixed at creation (until migration).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaMode {
    /// String primary key, standalone FTS table, CRC32-derived spatial ids.
    Legacy,
    /// Integer `doc_id` rowids with an external-content FTS table.
    ExternalContent,
}

impl SchemaMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaMode::Legacy => "legacy",
            SchemaMode::ExternalContent => "external_content",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "legacy" => Some(SchemaMode::Legacy),
            "external_content" => Some(SchemaMode::ExternalContent),
            _ => None,
        }
    }
}

/// Analyzed FTS text for one document: a single concatenated column or one
/// text per configured FTS column.
#[derive(Debug, Clone, PartialEq)]
pub enum FtsText {
    Single(String),
    /// Parallel to the index's configured FTS column order.
    Multi(Vec<String>),
}

impl FtsText {
    pub fn single(&self) -> String {
        match self {
            FtsText::Single(s) => s.clone(),
            FtsText::Multi(cols) => cols.join(" "),
        }
    }
}

/// A (term, document, field) posting with positions, kept only when the
/// Levenshtein vocabulary table is enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct TermPosting {
    pub term: String,
    pub field: String,
    pub frequency: u64,
    pub positions: Vec<usize>,
}

/// A fully analyzed document ready for a transactional write.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub id: String,
    /// JSON-encoded stored content (store-flagged fields only).
    pub content_json: String,
    pub metadata_json: String,
    pub language: Option<String>,
    pub doc_type: String,
    pub timestamp: i64,
    pub fts_text: FtsText,
    pub terms: Vec<TermPosting>,
    /// Bounding box for the spatial row; a point stores min = max.
    pub spatial: Option<Bounds>,
}

/// A document row read back from storage.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub content: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub language: Option<String>,
    pub doc_type: String,
    pub timestamp: i64,
    pub indexed_at: i64,
}

/// One row of a storage search: the document plus its BM25 rank (negative,
/// smaller is better) and, when a geo context was present, the computed
/// distance in meters and the spatial row's center point.
#[derive(Debug, Clone)]
pub struct SearchRow {
    pub doc: StoredDocument,
    pub rank: f64,
    pub distance: Option<f64>,
    pub point: Option<crate::geo::Point>,
}
