//! Public interface types: documents, queries, results, errors.
//!
//! The `SearchQuery` struct is the normalized query object any DSL parser
//! produces; the engine never inspects raw query-string syntax beyond quoted
//! phrases. Dynamic document values are `serde_json::Value`; JSON
//! encoding/decoding happens only at the storage boundary.

use crate::database::StorageError;
use crate::geo::{Bounds, DistanceUnit, Point};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerretError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("search failed: {0}")]
    Search(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, FerretError>;

// ─────────────────────────────────────────────────────────────────────────────
// Documents
// ─────────────────────────────────────────────────────────────────────────────

/// A document submitted for indexing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub id: String,
    /// Field name → string or nested map of strings.
    pub content: Map<String, Value>,
    /// Arbitrary JSON scalars/arrays, filterable as `metadata.<path>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Epoch seconds; defaults to now at index time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo: Option<Point>,
    /// Overrides `geo` for the spatial row when both are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_bounds: Option<Bounds>,
    /// Pre-supplied chunks; suppresses automatic chunking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkInput>>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    /// Builder-style content field.
    pub fn with_content(mut self, field: &str, value: impl Into<String>) -> Self {
        self.content.insert(field.to_string(), Value::String(value.into()));
        self
    }

    pub fn with_metadata(mut self, field: &str, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(field.to_string(), value);
        self
    }

    pub fn with_geo(mut self, lat: f64, lng: f64) -> Self {
        self.geo = Some(Point::new(lat, lng));
        self
    }
}

/// A caller-supplied chunk: either bare text or text with its own metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChunkInput {
    Text(String),
    Record {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Map<String, Value>>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Queries
// ─────────────────────────────────────────────────────────────────────────────

/// Filter operator over direct columns or `metadata.<path>` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "exists")]
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOp,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Radius filter around a point. The radius is interpreted in
/// [`GeoFilters::units`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoNear {
    pub point: Point,
    pub radius: f64,
}

/// k-nearest-neighbor request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoNearest {
    pub point: Point,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near: Option<GeoNear>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub within: Option<Bounds>,
    /// Sort by computed distance. Combined with an FTS match the engine
    /// re-sorts in memory up to an internal fetch ceiling; ordering past the
    /// ceiling is best-effort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_sort: Option<SortDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest: Option<GeoNearest>,
    /// Bounds R-tree candidates fetched before in-memory distance sorting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_cap: Option<usize>,
    pub units: DistanceUnit,
}

/// Facet request: term counting over a field, or distance buckets from a
/// point (`ranges` are cumulative upper bounds in `units`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FacetRequest {
    Distance {
        from: Point,
        ranges: Vec<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        units: Option<DistanceUnit>,
    },
    Terms {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_count: Option<u64>,
    },
}

impl Default for FacetRequest {
    fn default() -> Self {
        FacetRequest::Terms { limit: None, min_count: None }
    }
}

/// The normalized query object consumed by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchQuery {
    pub query: String,
    pub filters: Vec<Filter>,
    /// Restrict matching to these fields (multi-column FTS only).
    pub fields: Vec<String>,
    /// Sort order; `_score` maps to the BM25 rank.
    pub sort: Vec<SortSpec>,
    pub limit: usize,
    pub offset: usize,
    pub fuzzy: bool,
    /// Optional per-query similarity floor overriding the configured
    /// algorithm threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuzziness: Option<f64>,
    pub highlight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub highlight_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Field weights for two-pass re-scoring.
    pub boost: HashMap<String, f64>,
    pub facets: HashMap<String, FacetRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_filters: Option<GeoFilters>,
    /// Per-query synonym toggle; `None` uses the engine configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synonyms: Option<bool>,
    /// Collapse chunk results sharing a `route` metadata value.
    pub unique_by_route: bool,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            filters: Vec::new(),
            fields: Vec::new(),
            sort: Vec::new(),
            limit: 10,
            offset: 0,
            fuzzy: false,
            fuzziness: None,
            highlight: false,
            highlight_length: None,
            language: None,
            boost: HashMap::new(),
            facets: HashMap::new(),
            geo_filters: None,
            synonyms: None,
            unique_by_route: false,
        }
    }
}

impl SearchQuery {
    pub fn text(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    /// Normalized relevance, 0–100.
    pub score: f64,
    /// Stored content, filtered to `result_fields` when configured.
    pub document: Map<String, Value>,
    pub metadata: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub timestamp: i64,
    /// Field → highlighted snippet, present when highlighting was requested.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub highlights: HashMap<String, String>,
    /// Distance from the query point in the requested units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing_cardinal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResults {
    pub results: Vec<SearchHit>,
    /// Matching documents before pagination.
    pub total: u64,
    /// Wall-clock seconds spent in the engine.
    pub search_time: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub facets: HashMap<String, Vec<FacetValue>>,
    /// "Did you mean" replacement query, when results were empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultiSearchResults {
    pub results: Vec<SearchHit>,
    pub total: u64,
    pub search_time: f64,
    /// Indices that actually ran; failed ones are logged and skipped.
    pub indices_searched: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestOptions {
    pub limit: usize,
    /// Extra weight when a title starts with the typed prefix.
    pub prefix_boost: f64,
    /// Extra weight when a title merely contains it.
    pub title_boost: f64,
}

impl Default for SuggestOptions {
    fn default() -> Self {
        Self { limit: 10, prefix_boost: 2.0, title_boost: 1.5 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub name: String,
    pub document_count: u64,
    pub languages: HashMap<String, u64>,
    pub types: HashMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSummary {
    pub name: String,
    pub document_count: u64,
    pub languages: Vec<String>,
    pub types: Vec<String>,
}
