//! `Ferret`, the public façade.
//!
//! Owns the shared storage pool and one (indexer, engine) pair per index,
//! created on demand. All operations are synchronous; concurrency comes from
//! the connection pool (WAL readers) and per-index serialization of writes.

use crate::analyzer::Analyzer;
use crate::config::{FerretConfig, FuzzyAlgorithm};
use crate::database::{IndexOptions, Storage};
use crate::indexer::Indexer;
use crate::interface::{
    Document, FerretError, IndexStats, IndexSummary, MultiSearchResults, Result, SearchQuery,
    SearchResults, SuggestOptions, Suggestion,
};
use crate::search::SearchEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
struct IndexHandle {
    indexer: Arc<Indexer>,
    engine: Arc<SearchEngine>,
}

pub struct Ferret {
    config: FerretConfig,
    storage: Arc<Storage>,
    analyzer: Arc<Analyzer>,
    indices: Mutex<HashMap<String, IndexHandle>>,
}

impl Ferret {
    pub fn new(config: FerretConfig) -> Result<Self> {
        let storage = Arc::new(Storage::open(
            &config.storage.path,
            config.storage.busy_timeout_ms,
        )?);
        let analyzer = Arc::new(Analyzer::new(config.analyzer.clone()));
        Ok(Self {
            config,
            storage,
            analyzer,
            indices: Mutex::new(HashMap::new()),
        })
    }

    /// Engine with an ephemeral in-memory database and default options.
    pub fn in_memory() -> Result<Self> {
        Self::new(FerretConfig::default())
    }

    pub fn config(&self) -> &FerretConfig {
        &self.config
    }

    /// Index creation options derived from the engine configuration.
    fn default_index_options(&self) -> IndexOptions {
        let multi_columns = if self.config.indexer.fts.multi_column {
            // Column order must be deterministic; sort boosted fields by name.
            let mut fields: Vec<(String, f64)> = self
                .config
                .indexer
                .fields
                .iter()
                .map(|(name, fc)| (name.clone(), fc.boost))
                .collect();
            fields.sort_by(|a, b| a.0.cmp(&b.0));
            if fields.is_empty() { None } else { Some(fields) }
        } else {
            None
        };
        IndexOptions {
            external_content: self.config.storage.external_content,
            multi_columns,
            prefix: self
                .config
                .indexer
                .fts
                .prefix
                .iter()
                .copied()
                .filter(|p| (2..=4).contains(p))
                .collect(),
            with_terms: self.config.search.fuzzy_algorithm == FuzzyAlgorithm::Levenshtein,
        }
    }

    fn build_handle(&self, schema: crate::database::IndexSchema) -> IndexHandle {
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.analyzer),
            self.config.indexer.clone(),
            schema.clone(),
        ));
        let engine = Arc::new(SearchEngine::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.analyzer),
            self.config.search.clone(),
            schema,
        ));
        IndexHandle { indexer, engine }
    }

    /// Handle for an existing index, created lazily from its stored schema.
    fn handle(&self, name: &str) -> Result<IndexHandle> {
        if let Some(handle) = self.indices.lock().get(name) {
            return Ok(handle.clone());
        }
        let schema = self.storage.schema(name)?;
        let handle = self.build_handle(schema);
        self.indices.lock().insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Index lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create an index (idempotent) and return its indexer.
    pub fn create_index(&self, name: &str) -> Result<Arc<Indexer>> {
        self.create_index_with_options(name, self.default_index_options())
    }

    /// Create an index with explicit schema options.
    pub fn create_index_with_options(
        &self,
        name: &str,
        options: IndexOptions,
    ) -> Result<Arc<Indexer>> {
        let schema = self.storage.create_index(name, &options)?;
        let handle = self.build_handle(schema);
        self.indices.lock().insert(name.to_string(), handle.clone());
        Ok(handle.indexer)
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indices.lock().remove(name);
        Ok(self.storage.drop_index(name)?)
    }

    /// Remove every document from an index, keeping its schema.
    pub fn clear(&self, name: &str) -> Result<()> {
        let handle = self.handle(name)?;
        self.storage.clear(name)?;
        handle.engine.invalidate_cache();
        Ok(())
    }

    pub fn index_exists(&self, name: &str) -> Result<bool> {
        Ok(self.storage.index_exists(name)?)
    }

    pub fn list_indices(&self) -> Result<Vec<IndexSummary>> {
        Ok(self.storage.list_indices()?)
    }

    /// Rebuild FTS structures and refresh planner statistics.
    pub fn optimize(&self, name: &str) -> Result<()> {
        Ok(self.storage.optimize(name)?)
    }

    /// Convert a legacy index to the external-content schema. The handle is
    /// rebuilt so both pipelines see the new schema.
    pub fn migrate_to_external_content(&self, name: &str) -> Result<()> {
        self.indices.lock().remove(name);
        self.storage.migrate_to_external_content(name)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    pub fn index(&self, index: &str, doc: Document) -> Result<()> {
        let handle = self.handle(index)?;
        handle.indexer.insert(doc)?;
        handle.engine.invalidate_cache();
        Ok(())
    }

    pub fn index_batch(&self, index: &str, docs: Vec<Document>) -> Result<()> {
        let handle = self.handle(index)?;
        handle.indexer.insert_many(docs)?;
        handle.engine.invalidate_cache();
        Ok(())
    }

    pub fn update(&self, index: &str, doc: Document) -> Result<()> {
        let handle = self.handle(index)?;
        handle.indexer.update(doc)?;
        handle.engine.invalidate_cache();
        Ok(())
    }

    /// Delete a document (and its chunks). Returns the number of rows
    /// removed.
    pub fn delete(&self, index: &str, id: &str) -> Result<usize> {
        let handle = self.handle(index)?;
        let removed = handle.indexer.delete(id)?;
        handle.engine.invalidate_cache();
        Ok(removed)
    }

    /// Persist any buffered documents for an index.
    pub fn flush(&self, index: &str) -> Result<usize> {
        let handle = self.handle(index)?;
        let written = handle.indexer.flush()?;
        handle.engine.invalidate_cache();
        Ok(written)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn search(&self, index: &str, query: &SearchQuery) -> Result<SearchResults> {
        self.handle(index)?.engine.search(query)
    }

    /// Search several indices; per-index failures are logged and skipped,
    /// and the merged result reports which indices actually ran.
    pub fn search_multiple(
        &self,
        indices: &[&str],
        query: &SearchQuery,
    ) -> Result<MultiSearchResults> {
        if indices.is_empty() {
            return Err(FerretError::InvalidArgument("no indices given".into()));
        }
        let started = Instant::now();
        let mut merged = MultiSearchResults::default();

        for index in indices {
            match self.search(index, query) {
                Ok(results) => {
                    merged.total += results.total;
                    merged.results.extend(results.results);
                    merged.indices_searched.push(index.to_string());
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping index in multi-search");
                }
            }
        }

        merged.results.sort_by(|a, b| b.score.total_cmp(&a.score));
        merged.results.truncate(if query.limit == 0 { 10 } else { query.limit });
        merged.search_time = started.elapsed().as_secs_f64();
        Ok(merged)
    }

    pub fn count(&self, index: &str, query: &SearchQuery) -> Result<u64> {
        self.handle(index)?.engine.count(query)
    }

    pub fn suggest(
        &self,
        index: &str,
        term: &str,
        options: &SuggestOptions,
    ) -> Result<Vec<Suggestion>> {
        self.handle(index)?.engine.suggest(term, options)
    }

    pub fn get_document(
        &self,
        index: &str,
        id: &str,
    ) -> Result<Option<crate::models::StoredDocument>> {
        Ok(self.storage.get_document(index, id)?)
    }

    pub fn get_stats(&self, index: &str) -> Result<IndexStats> {
        Ok(self.storage.get_stats(index)?)
    }
}
