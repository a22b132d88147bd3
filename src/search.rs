//! Query execution pipeline.
//!
//! search() runs: cache lookup → query processing (analysis, fuzzy
//! expansion, synonyms) → storage query → re-scoring → result shaping
//! (min-score, normalization, distance/bearing, field filtering) →
//! highlighting → route deduplication → facets → suggestions → cache store.
//!
//! The result cache is a per-engine LRU keyed by the normalized query hash
//! and the index generation, so any write batch implicitly invalidates it.

use crate::analyzer::Analyzer;
use crate::config::SearchConfig;
use crate::database::{IndexSchema, Storage, StorageQuery};
use crate::fuzzy::FuzzyMatcher;
use crate::geo::{bearing_cardinal, DistanceUnit, Point};
use crate::interface::{
    FacetRequest, FacetValue, FerretError, GeoFilters, GeoNear, Result, SearchHit, SearchQuery,
    SearchResults, SuggestOptions, Suggestion,
};
use crate::models::SearchRow;
use crate::ranking;
use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result cache capacity; the oldest entry is evicted on overflow.
const RESULT_CACHE_CAPACITY: usize = 100;

/// Candidate pool fetched when field-weighted re-scoring reorders results.
const FIELD_WEIGHT_CANDIDATES: usize = 500;

/// Documents scanned per facet.
const FACET_SCAN_LIMIT: usize = 1000;

/// Radius that covers the whole planet, for distance-facet scans.
const WHOLE_EARTH_RADIUS_M: f64 = 21_000_000.0;

struct CachedResult {
    stored_at: Instant,
    results: SearchResults,
}

/// Processed form of the query text.
struct ProcessedQuery {
    /// Assembled FTS MATCH expression; `None` when there is no text.
    match_expr: Option<String>,
    /// Raw (unstemmed) lowercase tokens, for highlighting.
    raw_terms: Vec<String>,
    /// Analyzed tokens, for suggestions.
    tokens: Vec<String>,
}

pub struct SearchEngine {
    storage: Arc<Storage>,
    analyzer: Arc<Analyzer>,
    fuzzy: FuzzyMatcher,
    config: SearchConfig,
    schema: IndexSchema,
    cache: Mutex<LruCache<u64, CachedResult>>,
}

impl SearchEngine {
    pub(crate) fn new(
        storage: Arc<Storage>,
        analyzer: Arc<Analyzer>,
        config: SearchConfig,
        schema: IndexSchema,
    ) -> Self {
        let sidecar_dir = storage.sidecar_dir().cloned();
        let fuzzy = FuzzyMatcher::new(&config, &schema.name, sidecar_dir.as_deref());
        Self {
            storage,
            analyzer,
            fuzzy,
            config,
            schema,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESULT_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.schema.name
    }

    /// Drop all cached results. The write path calls this; the
    /// generation-keyed cache would age them out anyway.
    pub fn invalidate_cache(&self) {
        self.cache.lock().clear();
    }

    // ─────────────────────────────────────────────────────────────────────
    // search
    // ─────────────────────────────────────────────────────────────────────

    pub fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let started = Instant::now();
        let generation = self.storage.generation(&self.schema.name)?;

        let key = cache_key(query, generation);
        {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.get(&key) {
                if hit.stored_at.elapsed() < Duration::from_secs(self.config.cache_ttl) {
                    return Ok(hit.results.clone());
                }
                cache.pop(&key);
            }
        }

        let processed = self.process_query(query, generation);
        let weights = self.effective_weights(query);
        let rescoring = !weights.is_empty() && processed.match_expr.is_some();

        // Dedup and re-scoring both reorder the full candidate set, so
        // pagination moves in memory and the fetch limit is raised.
        let paginate_in_memory = query.unique_by_route || rescoring;
        let mut plan = self.storage_query(query, &processed);
        if query.unique_by_route {
            plan.limit = self.config.max_results;
            plan.offset = 0;
        } else if rescoring {
            plan.limit = FIELD_WEIGHT_CANDIDATES.max(query.limit + query.offset);
            plan.offset = 0;
        }

        let mut rows = self
            .storage
            .search(&self.schema.name, &plan)
            .map_err(|e| FerretError::Search(format!("search failed: {}", e)))?;

        // min_score compares absolute BM25 before normalization.
        if processed.match_expr.is_some() && self.config.min_score > 0.0 {
            rows.retain(|row| row.rank.abs() >= self.config.min_score);
        }

        let parsed = ranking::parse_query(&query.query);
        let mut scored: Vec<(f64, SearchRow)> = rows
            .into_iter()
            .map(|row| {
                let base = if rescoring {
                    let max_field = ranking::max_field_score(&row.doc.content, &weights, &parsed);
                    ranking::rescore(row.rank, max_field)
                } else {
                    row.rank.abs()
                };
                (base, row)
            })
            .collect();
        if rescoring {
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        }

        if query.unique_by_route {
            scored = dedupe_by_route(scored);
        }

        let total = if paginate_in_memory {
            scored.len() as u64
        } else {
            self.storage
                .count(&self.schema.name, &plan)
                .map_err(|e| FerretError::Search(format!("count failed: {}", e)))?
        };

        let max_base = scored.iter().map(|(s, _)| *s).fold(0.0, f64::max);

        if paginate_in_memory {
            let start = query.offset.min(scored.len());
            let end = (start + query.limit).min(scored.len());
            scored = scored[start..end].to_vec();
        }

        let units = query
            .geo_filters
            .as_ref()
            .map(|g| g.units)
            .unwrap_or(self.config.distance_units);
        let origin = query.geo_filters.as_ref().and_then(origin_point);
        let results: Vec<SearchHit> = scored
            .into_iter()
            .map(|(base, row)| self.build_hit(base, max_base, row, query, &processed, units, origin))
            .collect();

        let facets = self.compute_facets(query, &processed);

        let suggestion = if results.is_empty()
            && self.config.enable_suggestions
            && !processed.tokens.is_empty()
        {
            self.build_suggestion(&processed, generation)
        } else {
            None
        };

        let response = SearchResults {
            results,
            total,
            search_time: started.elapsed().as_secs_f64(),
            facets,
            suggestion,
        };

        self.cache.lock().put(
            key,
            CachedResult { stored_at: Instant::now(), results: response.clone() },
        );
        Ok(response)
    }

    /// Matching-document count for a query, ignoring pagination.
    pub fn count(&self, query: &SearchQuery) -> Result<u64> {
        let generation = self.storage.generation(&self.schema.name)?;
        let processed = self.process_query(query, generation);
        let plan = self.storage_query(query, &processed);
        Ok(self.storage.count(&self.schema.name, &plan)?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Query processing
    // ─────────────────────────────────────────────────────────────────────

    fn process_query(&self, query: &SearchQuery, generation: u64) -> ProcessedQuery {
        let raw = query.query.trim();
        if raw.is_empty() {
            return ProcessedQuery { match_expr: None, raw_terms: Vec::new(), tokens: Vec::new() };
        }

        let raw_terms = self.analyzer.tokenize(raw);
        let analyzed = self.analyzer.analyze(raw, query.language.as_deref());
        let tokens: Vec<String> = dedupe_preserving_order(analyzed.tokens);
        if tokens.is_empty() {
            return ProcessedQuery { match_expr: None, raw_terms, tokens };
        }

        let mut parts: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut push = |parts: &mut Vec<String>, seen: &mut HashSet<String>, part: String| {
            if seen.insert(part.clone()) {
                parts.push(part);
            }
        };

        let fuzzy_on = query.fuzzy && self.config.enable_fuzzy;
        let synonyms_on = query.synonyms.unwrap_or(self.config.enable_synonyms);
        let last = tokens.len() - 1;

        // Variants across all tokens share the global cap; the lowest-scoring
        // ones (after the similarity penalty) are discarded first.
        let mut penalized: Vec<(f64, String)> = Vec::new();

        for (i, token) in tokens.iter().enumerate() {
            if self.config.prefix_last_token && i == last {
                push(&mut parts, &mut seen, format!("\"{}\"*", token));
            } else {
                push(&mut parts, &mut seen, format!("\"{}\"", token));
            }

            if synonyms_on {
                if let Some(expansions) = self.config.synonyms.get(token) {
                    for synonym in expansions.iter().take(self.config.synonyms_max_expansions) {
                        push(&mut parts, &mut seen, format!("\"{}\"", synonym.to_lowercase()));
                    }
                }
            }

            let expand_this = fuzzy_on && (!self.config.fuzzy_last_token_only || i == last);
            if expand_this {
                let storage = Arc::clone(&self.storage);
                let index = self.schema.name.clone();
                let max_terms = self.config.max_indexed_terms;
                let variants = self.fuzzy.expand_cached(token, query.fuzziness, generation, || {
                    storage.vocabulary(&index, max_terms).unwrap_or_else(|e| {
                        tracing::debug!(error = %e, "vocabulary fetch failed");
                        Vec::new()
                    })
                });
                for variant in variants {
                    let adjusted =
                        1.0 - (1.0 - variant.score) * self.config.fuzzy_score_penalty;
                    penalized.push((adjusted, variant.term));
                }
            }
        }

        penalized.sort_by(|a, b| b.0.total_cmp(&a.0));
        penalized.truncate(self.config.fuzzy_total_max_variations);
        for (_, term) in penalized {
            let part = match term.strip_suffix('*') {
                Some(stem) => format!("\"{}\"*", stem),
                None => format!("\"{}\"", term),
            };
            push(&mut parts, &mut seen, part);
        }

        let mut expr = parts.join(" OR ");

        // Column restriction only exists in multi-column mode.
        if !query.fields.is_empty() {
            let columns: Vec<String> = query
                .fields
                .iter()
                .filter_map(|f| self.schema.fts_column_for(f))
                .collect();
            if !columns.is_empty() {
                expr = format!("{{{}}} : ({})", columns.join(" "), expr);
            }
        }

        ProcessedQuery { match_expr: Some(expr), raw_terms, tokens }
    }

    fn storage_query(&self, query: &SearchQuery, processed: &ProcessedQuery) -> StorageQuery {
        StorageQuery {
            match_expr: processed.match_expr.clone(),
            filters: query.filters.clone(),
            language: query.language.clone(),
            geo: query.geo_filters.clone(),
            sort: query.sort.clone(),
            limit: if query.limit == 0 { 10 } else { query.limit },
            offset: query.offset,
        }
    }

    fn effective_weights(&self, query: &SearchQuery) -> HashMap<String, f64> {
        if !query.boost.is_empty() {
            query.boost.clone()
        } else if self.config.two_pass_search {
            self.config.field_weights.clone()
        } else {
            HashMap::new()
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Result shaping
    // ─────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    fn build_hit(
        &self,
        base: f64,
        max_base: f64,
        row: SearchRow,
        query: &SearchQuery,
        processed: &ProcessedQuery,
        units: DistanceUnit,
        origin: Option<Point>,
    ) -> SearchHit {
        let score = if max_base > 0.0 { base / max_base * 100.0 } else { 0.0 };

        let document = filter_fields(row.doc.content, &self.config.result_fields);

        let highlights = if query.highlight && !processed.raw_terms.is_empty() {
            let max_len = query.highlight_length.unwrap_or(self.config.snippet_length);
            self.highlight_document(&document, &processed.raw_terms, max_len)
        } else {
            HashMap::new()
        };

        let (bearing, cardinal) = match (origin, row.point) {
            (Some(from), Some(to)) => {
                let b = from.bearing_to(&to);
                (Some(b), Some(bearing_cardinal(b).to_string()))
            }
            _ => (None, None),
        };

        SearchHit {
            id: row.doc.id,
            score,
            document,
            metadata: row.doc.metadata,
            language: row.doc.language,
            doc_type: row.doc.doc_type,
            timestamp: row.doc.timestamp,
            highlights,
            distance: row.distance.map(|meters| units.from_meters(meters)),
            bearing,
            bearing_cardinal: cardinal,
        }
    }

    fn highlight_document(
        &self,
        document: &Map<String, Value>,
        terms: &[String],
        max_len: usize,
    ) -> HashMap<String, String> {
        let mut highlights = HashMap::new();
        for (field, value) in document {
            let Value::String(text) = value else { continue };
            if let Some(snippet) = highlight_field(
                text,
                terms,
                &self.config.highlight_tag,
                &self.config.highlight_tag_close,
                max_len,
            ) {
                highlights.insert(field.clone(), snippet);
            }
        }
        highlights
    }

    // ─────────────────────────────────────────────────────────────────────
    // Facets
    // ─────────────────────────────────────────────────────────────────────

    fn compute_facets(
        &self,
        query: &SearchQuery,
        processed: &ProcessedQuery,
    ) -> HashMap<String, Vec<FacetValue>> {
        let mut facets = HashMap::new();
        for (name, request) in &query.facets {
            match self.compute_facet(name, request, query, processed) {
                Ok(values) => {
                    facets.insert(name.clone(), values);
                }
                Err(e) => {
                    tracing::warn!(facet = %name, error = %e, "facet computation failed");
                }
            }
        }
        facets
    }

    fn compute_facet(
        &self,
        name: &str,
        request: &FacetRequest,
        query: &SearchQuery,
        processed: &ProcessedQuery,
    ) -> Result<Vec<FacetValue>> {
        match request {
            FacetRequest::Terms { limit, min_count } => {
                let mut plan = self.storage_query(query, processed);
                plan.limit = FACET_SCAN_LIMIT;
                plan.offset = 0;
                plan.sort = Vec::new();
                let rows = self.storage.search(&self.schema.name, &plan)?;

                let mut counts: HashMap<String, u64> = HashMap::new();
                for row in &rows {
                    for value in facet_values(row, name) {
                        *counts.entry(value).or_insert(0) += 1;
                    }
                }
                let floor = min_count.unwrap_or(self.config.facet_min_count);
                let mut values: Vec<FacetValue> = counts
                    .into_iter()
                    .filter(|(_, count)| *count >= floor)
                    .map(|(value, count)| FacetValue { value, count })
                    .collect();
                values.sort_by(|a, b| {
                    b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value))
                });
                values.truncate(limit.unwrap_or(10));
                Ok(values)
            }
            FacetRequest::Distance { from, ranges, units } => {
                let units = units.unwrap_or(
                    query
                        .geo_filters
                        .as_ref()
                        .map(|g| g.units)
                        .unwrap_or(self.config.distance_units),
                );
                let mut plan = self.storage_query(query, processed);
                plan.limit = FACET_SCAN_LIMIT;
                plan.offset = 0;
                plan.sort = Vec::new();
                // Whole-earth radius: the scan only needs distances computed.
                plan.geo = Some(GeoFilters {
                    near: Some(GeoNear {
                        point: *from,
                        radius: WHOLE_EARTH_RADIUS_M,
                    }),
                    units: DistanceUnit::M,
                    ..Default::default()
                });
                let rows = self.storage.search(&self.schema.name, &plan)?;

                // Ranges are cumulative upper bounds.
                let values = ranges
                    .iter()
                    .map(|upper| {
                        let upper_m = units.to_meters(*upper);
                        let count = rows
                            .iter()
                            .filter(|row| row.distance.map_or(false, |d| d <= upper_m))
                            .count() as u64;
                        FacetValue { value: format_range(*upper), count }
                    })
                    .collect();
                Ok(values)
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Suggestions
    // ─────────────────────────────────────────────────────────────────────

    /// "Did you mean": replace each token with its first fuzzy variant that
    /// actually matches something.
    fn build_suggestion(&self, processed: &ProcessedQuery, generation: u64) -> Option<String> {
        let mut corrected = Vec::with_capacity(processed.tokens.len());
        let mut changed = false;

        for token in &processed.tokens {
            let storage = Arc::clone(&self.storage);
            let index = self.schema.name.clone();
            let max_terms = self.config.max_indexed_terms;
            let variants = self.fuzzy.expand_cached(token, None, generation, || {
                storage.vocabulary(&index, max_terms).unwrap_or_default()
            });

            let replacement = variants.into_iter().find(|variant| {
                if variant.term.contains('*') {
                    return false;
                }
                let plan = StorageQuery {
                    match_expr: Some(format!("\"{}\"", variant.term)),
                    limit: 1,
                    ..Default::default()
                };
                self.storage.count(&self.schema.name, &plan).map(|n| n > 0).unwrap_or(false)
            });

            match replacement {
                Some(variant) => {
                    corrected.push(variant.term);
                    changed = true;
                }
                None => corrected.push(token.clone()),
            }
        }

        changed.then(|| corrected.join(" "))
    }

    /// Type-ahead suggestions: aggregate titles across fuzzy variants of the
    /// prefix, boosting titles that start with or contain it.
    pub fn suggest(&self, term: &str, options: &SuggestOptions) -> Result<Vec<Suggestion>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }
        let generation = self.storage.generation(&self.schema.name)?;

        let mut probes: Vec<(String, f64)> = vec![(term.clone(), 1.0)];
        let storage = Arc::clone(&self.storage);
        let index = self.schema.name.clone();
        let max_terms = self.config.max_indexed_terms;
        for variant in self.fuzzy.expand_cached(&term, None, generation, || {
            storage.vocabulary(&index, max_terms).unwrap_or_default()
        }) {
            if !variant.term.contains('*') {
                probes.push((variant.term, variant.score));
            }
        }

        let prefix_match = !self.schema.prefix.is_empty();
        let mut aggregated: HashMap<String, f64> = HashMap::new();
        for (probe, similarity) in probes {
            let expr = if prefix_match {
                format!("\"{}\"*", probe)
            } else {
                format!("\"{}\"", probe)
            };
            let plan = StorageQuery {
                match_expr: Some(expr),
                limit: options.limit,
                ..Default::default()
            };
            let rows = match self.storage.search(&self.schema.name, &plan) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::debug!(probe = %probe, error = %e, "suggest probe failed");
                    continue;
                }
            };
            for row in rows {
                let Some(title) = self.title_of(&row) else { continue };
                let title_lower = title.to_lowercase();
                let mut score = row.rank.abs().max(0.1) * similarity;
                if title_lower.starts_with(&probe) {
                    score *= options.prefix_boost;
                } else if title_lower.contains(&probe) {
                    score *= options.title_boost;
                }
                *aggregated.entry(title).or_insert(0.0) += score;
            }
        }

        let mut suggestions: Vec<Suggestion> = aggregated
            .into_iter()
            .map(|(text, score)| Suggestion { text, score })
            .collect();
        suggestions.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.text.cmp(&b.text)));
        suggestions.truncate(options.limit);
        Ok(suggestions)
    }

    /// Title of a document: the first configured primary field present,
    /// falling back to the first string content field.
    fn title_of(&self, row: &SearchRow) -> Option<String> {
        for field in &self.config.primary_fields {
            if let Some(Value::String(s)) = row.doc.content.get(field) {
                return Some(s.clone());
            }
        }
        row.doc.content.values().find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn cache_key(query: &SearchQuery, generation: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(query).unwrap_or_default().hash(&mut hasher);
    generation.hash(&mut hasher);
    hasher.finish()
}

fn dedupe_preserving_order(tokens: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tokens.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

fn origin_point(geo: &GeoFilters) -> Option<Point> {
    geo.near.map(|n| n.point).or_else(|| geo.nearest.map(|n| n.point))
}

/// Keep the best-scoring result per `route` metadata value; results without
/// a route survive untouched. Output is re-sorted by score descending.
fn dedupe_by_route(scored: Vec<(f64, SearchRow)>) -> Vec<(f64, SearchRow)> {
    let mut best_per_route: HashMap<String, (f64, SearchRow)> = HashMap::new();
    let mut routeless: Vec<(f64, SearchRow)> = Vec::new();

    for (score, row) in scored {
        let route = row
            .doc
            .metadata
            .get("route")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        match route {
            Some(route) => {
                let replace =
                    best_per_route.get(&route).map_or(true, |(existing, _)| score > *existing);
                if replace {
                    best_per_route.insert(route, (score, row));
                }
            }
            None => routeless.push((score, row)),
        }
    }

    let mut merged: Vec<(f64, SearchRow)> = best_per_route.into_values().collect();
    merged.extend(routeless);
    merged.sort_by(|a, b| b.0.total_cmp(&a.0));
    merged
}

fn filter_fields(content: Map<String, Value>, result_fields: &[String]) -> Map<String, Value> {
    if result_fields.is_empty() {
        return content;
    }
    content
        .into_iter()
        .filter(|(field, _)| result_fields.iter().any(|f| f == field))
        .collect()
}

/// Values a document contributes to a term facet. Arrays fan out; scalars
/// stringify.
fn facet_values(row: &SearchRow, field: &str) -> Vec<String> {
    let value: Option<&Value> = match field {
        "type" => return vec![row.doc.doc_type.clone()],
        "language" => return row.doc.language.clone().into_iter().collect(),
        _ => {
            if let Some(path) = field.strip_prefix("metadata.") {
                lookup_path(&row.doc.metadata, path)
            } else {
                row.doc.metadata.get(field).or_else(|| row.doc.content.get(field))
            }
        }
    };
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).collect(),
        Some(v) => scalar_string(v).into_iter().collect(),
        None => Vec::new(),
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lookup_path<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn format_range(upper: f64) -> String {
    if upper.fract() == 0.0 {
        format!("<= {}", upper as i64)
    } else {
        format!("<= {}", upper)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Highlighting
// ─────────────────────────────────────────────────────────────────────────────

/// Best snippet of `text` for the query terms, with occurrences (and their
/// plain `s` plurals) wrapped in tags. Returns `None` when no term occurs.
pub(crate) fn highlight_field(
    text: &str,
    terms: &[String],
    tag_open: &str,
    tag_close: &str,
    max_len: usize,
) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let text_lower = text.to_lowercase();
    let lower_chars: Vec<char> = text_lower.chars().collect();

    // Earliest occurrence of any term or its plural wins (score 1/(pos+1)).
    let mut best_pos: Option<usize> = None;
    for term in terms {
        let term_chars: Vec<char> = term.to_lowercase().chars().collect();
        if term_chars.is_empty() {
            continue;
        }
        if let Some(pos) = find_chars(&lower_chars, &term_chars) {
            best_pos = Some(best_pos.map_or(pos, |b| b.min(pos)));
        }
    }
    let match_pos = best_pos?;

    let context_before = max_len / 3;
    let mut start = match_pos.saturating_sub(context_before);
    // Expand to a word boundary: skip forward past a clipped word.
    if start > 0 {
        while start < match_pos && !chars[start - 1].is_whitespace() {
            start += 1;
        }
    }
    let mut end = (start + max_len).min(chars.len());
    // Finish the trailing word.
    while end < chars.len() && !chars[end - 1].is_whitespace() && !chars[end].is_whitespace() {
        end += 1;
    }

    let snippet: String = chars[start..end].iter().collect();
    let wrapped = wrap_terms(&snippet, terms, tag_open, tag_close);

    let mut result = String::new();
    if start > 0 {
        result.push('\u{2026}');
    }
    result.push_str(wrapped.trim());
    if end < chars.len() {
        result.push('\u{2026}');
    }
    Some(result)
}

/// Wrap every occurrence of the terms (longest first, plural-`s` tolerant)
/// in the highlight tags.
fn wrap_terms(snippet: &str, terms: &[String], tag_open: &str, tag_close: &str) -> String {
    let mut patterns: Vec<String> = terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| format!("{}s?", regex::escape(t)))
        .collect();
    if patterns.is_empty() {
        return snippet.to_string();
    }
    // Longer alternatives first so "wars" wins over "war" + plural
    patterns.sort_by_key(|p| std::cmp::Reverse(p.len()));

    let pattern = format!("(?i)({})", patterns.join("|"));
    match Regex::new(&pattern) {
        Ok(re) => re
            .replace_all(snippet, |caps: &regex::Captures| {
                format!("{}{}{}", tag_open, &caps[0], tag_close)
            })
            .into_owned(),
        Err(_) => snippet.to_string(),
    }
}

/// First index of `needle` within `haystack`, both as char slices.
fn find_chars(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| haystack[i..i + needle.len()] == *needle)
}
