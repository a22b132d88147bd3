//! Indexing pipeline: analysis, chunking, field flags, buffered batching.
//!
//! Documents are buffered and written in one transaction per flush. With
//! `auto_flush` on, the buffer drains every `batch_size` documents; otherwise
//! the caller flushes explicitly. Buffered documents are invisible to search
//! until the flush commits.

use crate::analyzer::Analyzer;
use crate::config::{FieldConfig, IndexerConfig};
use crate::database::{IndexSchema, Storage, StorageError};
use crate::geo::Bounds;
use crate::interface::{ChunkInput, Document, FerretError, IndexStats, Result};
use crate::models::{FtsText, PreparedDocument, TermPosting};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Indexer {
    storage: Arc<Storage>,
    analyzer: Arc<Analyzer>,
    config: IndexerConfig,
    schema: IndexSchema,
    buffer: Mutex<Vec<Document>>,
}

impl Indexer {
    pub(crate) fn new(
        storage: Arc<Storage>,
        analyzer: Arc<Analyzer>,
        config: IndexerConfig,
        schema: IndexSchema,
    ) -> Self {
        Self {
            storage,
            analyzer,
            config,
            schema,
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn index_name(&self) -> &str {
        &self.schema.name
    }

    /// Buffer one document for insertion.
    pub fn insert(&self, doc: Document) -> Result<()> {
        self.insert_many(vec![doc])
    }

    /// Buffer a batch. Triggers auto-flush when the buffer reaches
    /// `batch_size`.
    pub fn insert_many(&self, docs: Vec<Document>) -> Result<()> {
        for doc in &docs {
            if doc.id.is_empty() {
                return Err(FerretError::InvalidArgument("document id must not be empty".into()));
            }
            if doc.id.contains("#chunk") {
                return Err(FerretError::InvalidArgument(format!(
                    "document id '{}' uses the reserved chunk suffix",
                    doc.id
                )));
            }
        }
        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.extend(docs);
            self.config.auto_flush && buffer.len() >= self.config.batch_size
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    /// Replace a document (same id). Identical to `insert`; the write path
    /// atomically swaps all derived rows.
    pub fn update(&self, doc: Document) -> Result<()> {
        self.insert(doc)
    }

    /// Delete a document and its chunks, including any buffered copy.
    pub fn delete(&self, id: &str) -> Result<usize> {
        self.buffer.lock().retain(|d| d.id != id);
        Ok(self.storage.delete_document(&self.schema.name, id)?)
    }

    /// Drain the buffer into one transactional batch write.
    /// Returns the number of rows written (chunks count individually).
    pub fn flush(&self) -> Result<usize> {
        let pending: Vec<Document> = {
            let mut buffer = self.buffer.lock();
            std::mem::take(&mut *buffer)
        };
        if pending.is_empty() {
            return Ok(0);
        }

        // The same id buffered twice collapses to its latest version, so the
        // batch never carries two generations of one chunk family.
        let mut latest: Vec<Document> = Vec::with_capacity(pending.len());
        for doc in pending {
            if let Some(existing) = latest.iter_mut().find(|d| d.id == doc.id) {
                *existing = doc;
            } else {
                latest.push(doc);
            }
        }

        let mut prepared = Vec::with_capacity(latest.len());
        for doc in &latest {
            prepared.extend(self.prepare(doc)?);
        }
        self.storage.upsert_batch(&self.schema.name, &prepared)?;
        tracing::debug!(index = %self.schema.name, rows = prepared.len(), "flushed batch");
        Ok(prepared.len())
    }

    /// Atomically clear the index and re-index the given set, preserving the
    /// schema.
    pub fn rebuild(&self, docs: Vec<Document>) -> Result<usize> {
        self.buffer.lock().clear();
        self.storage.clear(&self.schema.name)?;
        self.insert_many(docs)?;
        self.flush()
    }

    pub fn stats(&self) -> Result<IndexStats> {
        Ok(self.storage.get_stats(&self.schema.name)?)
    }

    /// Documents currently buffered and not yet visible to search.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Document preparation
    // ─────────────────────────────────────────────────────────────────────

    fn field_config(&self, field: &str) -> FieldConfig {
        self.config.fields.get(field).cloned().unwrap_or_default()
    }

    /// Analyze a document into storage rows: either the document itself or
    /// its chunks (supplied chunks win over automatic splitting; a chunked
    /// document is represented entirely by its chunk rows).
    pub(crate) fn prepare(&self, doc: &Document) -> Result<Vec<PreparedDocument>> {
        let chunks = self.collect_chunks(doc);
        if chunks.is_empty() {
            return Ok(vec![self.prepare_single(doc)?]);
        }

        let mut rows = Vec::with_capacity(chunks.len());
        for (ordinal, (text, chunk_meta)) in chunks.into_iter().enumerate() {
            let mut content = Map::new();
            content.insert("content".to_string(), Value::String(text));

            let mut metadata = doc.metadata.clone().unwrap_or_default();
            if let Some(extra) = chunk_meta {
                for (k, v) in extra {
                    metadata.insert(k, v);
                }
            }
            metadata.insert("parent_id".to_string(), Value::String(doc.id.clone()));
            metadata.insert("chunk_index".to_string(), Value::from(ordinal as u64));

            let chunk_doc = Document {
                id: format!("{}#chunk{}", doc.id, ordinal),
                content,
                metadata: Some(metadata),
                language: doc.language.clone(),
                doc_type: doc.doc_type.clone(),
                timestamp: doc.timestamp,
                geo: doc.geo,
                geo_bounds: doc.geo_bounds,
                chunks: None,
            };
            rows.push(self.prepare_single(&chunk_doc)?);
        }
        Ok(rows)
    }

    /// Chunks for a document: supplied ones verbatim, otherwise automatic
    /// splits of any oversized content field.
    fn collect_chunks(&self, doc: &Document) -> Vec<(String, Option<Map<String, Value>>)> {
        if let Some(supplied) = &doc.chunks {
            return supplied
                .iter()
                .map(|chunk| match chunk {
                    ChunkInput::Text(text) => (text.clone(), None),
                    ChunkInput::Record { content, metadata } => {
                        (content.clone(), metadata.clone())
                    }
                })
                .collect();
        }
        if self.config.chunk_size == 0 {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        for value in doc.content.values() {
            let text = extract_text(value);
            if text.chars().count() > self.config.chunk_size {
                for piece in split_text(&text, self.config.chunk_size, self.config.chunk_overlap) {
                    chunks.push((piece, None));
                }
            }
        }
        chunks
    }

    fn prepare_single(&self, doc: &Document) -> Result<PreparedDocument> {
        let language = doc.language.clone();
        let lang_ref = language.as_deref();

        // Stored JSON keeps store-flagged fields; indexed text takes
        // index-flagged fields. The two sets are independent.
        let mut stored = Map::new();
        let mut indexed: BTreeMap<String, String> = BTreeMap::new();
        for (field, value) in &doc.content {
            let field_config = self.field_config(field);
            if field_config.store {
                stored.insert(field.clone(), value.clone());
            }
            if field_config.index {
                let text = extract_text(value);
                if !text.is_empty() {
                    indexed.insert(field.clone(), text);
                }
            }
        }

        let fts_text = match &self.schema.fields {
            Some(columns) => {
                let cols = columns
                    .iter()
                    .map(|(field, _)| {
                        indexed
                            .get(field)
                            .map(|text| self.analyzed_text(text, lang_ref))
                            .unwrap_or_default()
                    })
                    .collect();
                FtsText::Multi(cols)
            }
            None => {
                let joined: Vec<String> = indexed
                    .values()
                    .map(|text| self.analyzed_text(text, lang_ref))
                    .filter(|t| !t.is_empty())
                    .collect();
                FtsText::Single(joined.join(" "))
            }
        };

        let terms = if self.schema.has_terms {
            self.compute_terms(&indexed, lang_ref)
        } else {
            Vec::new()
        };

        let spatial = doc.geo_bounds.or_else(|| {
            doc.geo.map(|p| Bounds::new(p.lat, p.lat, p.lng, p.lng))
        });

        let metadata_json = match &doc.metadata {
            Some(map) => serde_json::to_string(map).map_err(StorageError::from)?,
            None => "{}".to_string(),
        };

        Ok(PreparedDocument {
            id: doc.id.clone(),
            content_json: serde_json::to_string(&stored).map_err(StorageError::from)?,
            metadata_json,
            language,
            doc_type: doc.doc_type.clone().unwrap_or_else(|| "default".to_string()),
            timestamp: doc.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp()),
            fts_text,
            terms,
            spatial,
        })
    }

    fn analyzed_text(&self, text: &str, language: Option<&str>) -> String {
        self.analyzer.analyze(text, language).tokens.join(" ")
    }

    fn compute_terms(
        &self,
        indexed: &BTreeMap<String, String>,
        language: Option<&str>,
    ) -> Vec<TermPosting> {
        let mut postings = Vec::new();
        for (field, text) in indexed {
            let tokens = self.analyzer.analyze(text, language).tokens;
            let mut per_term: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
            for (position, token) in tokens.iter().enumerate() {
                per_term.entry(token.as_str()).or_default().push(position);
            }
            for (term, positions) in per_term {
                postings.push(TermPosting {
                    term: term.to_string(),
                    field: field.clone(),
                    frequency: positions.len() as u64,
                    positions,
                });
            }
        }
        postings
    }
}

/// Flatten a content value to searchable text: strings pass through, nested
/// maps and arrays contribute their string leaves in order.
pub(crate) fn extract_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(extract_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(map) => map
            .values()
            .map(extract_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Split text at natural boundaries: prefer a sentence end inside the tail
/// of the window, then whitespace, then a hard cut. Consecutive chunks
/// overlap by `overlap` characters.
pub(crate) fn split_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size || chunk_size == 0 {
        return vec![text.to_string()];
    }
    let overlap = overlap.min(chunk_size / 2);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if hard_end == chars.len() {
            hard_end
        } else {
            find_boundary(&chars, start, hard_end)
        };

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        if end == chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Best split point in (start, hard_end]: last sentence end in the final
/// third of the window, else last whitespace, else the hard end.
fn find_boundary(chars: &[char], start: usize, hard_end: usize) -> usize {
    let window = &chars[start..hard_end];
    let tail_start = window.len() - window.len() / 3;

    let sentence_end = window
        .iter()
        .enumerate()
        .skip(tail_start)
        .filter(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, _)| i + 1)
        .last();
    if let Some(rel) = sentence_end {
        return start + rel;
    }

    let whitespace = window
        .iter()
        .enumerate()
        .rev()
        .find(|(_, c)| c.is_whitespace())
        .map(|(i, _)| i);
    match whitespace {
        Some(rel) if rel > 0 => start + rel,
        _ => hard_end,
    }
}
