//! Engine configuration.
//!
//! Every struct deserializes from JSON/TOML-ish config maps and carries the
//! documented defaults, so `FerretConfig::default()` is a working setup with
//! an in-memory database.

use crate::geo::DistanceUnit;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration for a [`crate::Ferret`] instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerretConfig {
    pub storage: StorageConfig,
    pub indexer: IndexerConfig,
    pub analyzer: AnalyzerConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path; `:memory:` for an ephemeral database.
    pub path: String,
    /// Schema mode for newly created indices.
    pub external_content: bool,
    /// SQLite busy timeout, milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            external_content: true,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Per-field indexing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    /// Relative weight in BM25 / field-weighted scoring.
    pub boost: f64,
    /// Stored fields appear in retrieved documents.
    pub store: bool,
    /// Indexed fields contribute to the FTS text.
    pub index: bool,
}

impl Default for FieldConfig {
    fn default() -> Self {
        Self { boost: 1.0, store: true, index: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsConfig {
    /// One FTS column per boosted field instead of a single `content` column.
    pub multi_column: bool,
    /// FTS prefix n-gram lengths; valid values are 2, 3 and 4.
    pub prefix: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Fields longer than this are split into chunks. 0 disables chunking.
    pub chunk_size: usize,
    /// Characters of overlap carried between consecutive chunks.
    pub chunk_overlap: usize,
    /// Flush the write buffer automatically every `batch_size` documents.
    pub auto_flush: bool,
    pub batch_size: usize,
    /// Per-field configuration; unlisted fields get `FieldConfig::default()`.
    pub fields: HashMap<String, FieldConfig>,
    pub fts: FtsConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            chunk_overlap: 100,
            auto_flush: true,
            batch_size: 100,
            fields: HashMap::new(),
            fts: FtsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub min_word_length: usize,
    pub max_word_length: usize,
    pub remove_numbers: bool,
    pub lowercase: bool,
    pub strip_html: bool,
    pub strip_punctuation: bool,
    pub expand_contractions: bool,
    pub custom_stop_words: Vec<String>,
    pub disable_stop_words: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_word_length: 2,
            max_word_length: 50,
            remove_numbers: false,
            lowercase: true,
            strip_html: true,
            strip_punctuation: true,
            expand_contractions: true,
            custom_stop_words: Vec::new(),
            disable_stop_words: false,
        }
    }
}

/// Fuzzy expansion algorithm. Parameters (thresholds, n-gram size) live in
/// [`SearchConfig`]; the variant selects the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuzzyAlgorithm {
    /// Wildcard/deletion/transposition variants, no vocabulary lookup.
    #[default]
    Basic,
    JaroWinkler,
    Trigram,
    Levenshtein,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enable_fuzzy: bool,
    pub fuzzy_algorithm: FuzzyAlgorithm,
    /// Expand only the trailing token of the query (type-ahead mode).
    pub fuzzy_last_token_only: bool,
    /// Append `*` to the trailing token; requires FTS prefix n-grams.
    pub prefix_last_token: bool,
    /// Score penalty factor applied as `(1 - similarity) * penalty`.
    pub fuzzy_score_penalty: f64,
    /// Maximum variants per token.
    pub max_fuzzy_variations: usize,
    /// Global cap on the OR list across all tokens.
    pub fuzzy_total_max_variations: usize,
    /// Minimum term frequency for Levenshtein vocabulary candidates.
    pub min_term_frequency: u64,
    /// Upper bound on the cached vocabulary size.
    pub max_indexed_terms: usize,
    /// Upper bound on cached fuzzy variant entries; ~100 oldest are evicted
    /// past this.
    pub fuzzy_cache_max_entries: usize,
    /// Seconds the in-memory vocabulary stays fresh.
    pub indexed_terms_cache_ttl: u64,
    /// Seconds a cached query result stays valid.
    pub cache_ttl: u64,
    /// Results with |BM25| below this are dropped (pre-normalization).
    pub min_score: f64,
    pub highlight_tag: String,
    pub highlight_tag_close: String,
    pub snippet_length: usize,
    /// Fetch ceiling used for dedup and facet scans.
    pub max_results: usize,
    pub enable_synonyms: bool,
    pub synonyms: HashMap<String, Vec<String>>,
    pub synonyms_max_expansions: usize,
    pub enable_suggestions: bool,
    /// Fields copied into returned documents; empty means all stored fields.
    pub result_fields: Vec<String>,
    pub facet_min_count: u64,
    pub jaro_winkler_threshold: f64,
    pub jaro_winkler_prefix_scale: f64,
    pub trigram_threshold: f64,
    pub trigram_size: usize,
    pub levenshtein_threshold: usize,
    /// Default field weights for two-pass re-scoring; query `boost` overrides.
    pub field_weights: HashMap<String, f64>,
    /// Fields treated as titles by `suggest`; defaults to `["title"]`.
    pub primary_fields: Vec<String>,
    /// Apply field-weight re-scoring even when the query carries no boosts.
    pub two_pass_search: bool,
    /// Default unit for caller-facing distances.
    pub distance_units: DistanceUnit,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enable_fuzzy: true,
            fuzzy_algorithm: FuzzyAlgorithm::default(),
            fuzzy_last_token_only: false,
            prefix_last_token: false,
            fuzzy_score_penalty: 0.5,
            max_fuzzy_variations: 5,
            fuzzy_total_max_variations: 20,
            min_term_frequency: 1,
            max_indexed_terms: 10_000,
            fuzzy_cache_max_entries: 10_000,
            indexed_terms_cache_ttl: 300,
            cache_ttl: 300,
            min_score: 0.0,
            highlight_tag: "<mark>".to_string(),
            highlight_tag_close: "</mark>".to_string(),
            snippet_length: 160,
            max_results: 1_000,
            enable_synonyms: false,
            synonyms: HashMap::new(),
            synonyms_max_expansions: 3,
            enable_suggestions: true,
            result_fields: Vec::new(),
            facet_min_count: 1,
            jaro_winkler_threshold: 0.92,
            jaro_winkler_prefix_scale: 0.1,
            trigram_threshold: 0.4,
            trigram_size: 3,
            levenshtein_threshold: 2,
            field_weights: HashMap::new(),
            primary_fields: vec!["title".to_string()],
            two_pass_search: false,
            distance_units: DistanceUnit::M,
        }
    }
}
