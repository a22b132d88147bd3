//! SQLite storage layer: schema, writes, and search SQL assembly.
//!
//! One r2d2 pool per engine instance shares the database file; WAL mode keeps
//! readers concurrent while write transactions serialize. Every pooled
//! connection gets the pragma set and a `haversine()` scalar function, so the
//! SQL distance path always computes great-circle meters.
//!
//! Each index `N` owns: docs table `N`, FTS5 table `N_fts`, R-tree
//! `N_spatial` (when supported), `N_terms` (Levenshtein vocabulary mode),
//! `N_id_map` (legacy mode) and `N_meta`. In external-content mode the docs
//! table carries the analyzed text in `search_text`/`ft_*` columns so the
//! FTS5 external-content 'delete' command can replay old values.

use crate::geo::Point;
use crate::interface::{
    Filter, FilterOp, GeoFilters, IndexStats, IndexSummary, SortDirection, SortSpec,
};
use crate::models::{
    FtsText, PreparedDocument, SchemaMode, SearchRow, StoredDocument, TermPosting,
};
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid index name: {0}")]
    InvalidIndexName(String),
    #[error("index not found: {0}")]
    IndexNotFound(String),
    #[error("invalid filter field: {0}")]
    InvalidFilterField(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Fetch ceiling for the in-memory distance re-sort when an FTS match and a
/// distance sort are combined.
fn distance_fetch_ceiling(limit: usize) -> usize {
    1000.min((limit * 10).max(100))
}

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

// ─────────────────────────────────────────────────────────────────────────────
// Index schema descriptors
// ─────────────────────────────────────────────────────────────────────────────

/// Options fixed at index creation time.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub external_content: bool,
    /// Multi-column FTS: ordered (field, boost) pairs. `None` keeps the
    /// single concatenated column.
    pub multi_columns: Option<Vec<(String, f64)>>,
    /// FTS prefix n-gram lengths (subset of {2, 3, 4}).
    pub prefix: Vec<usize>,
    /// Create the `N_terms` posting table (Levenshtein vocabulary).
    pub with_terms: bool,
}

/// Cached per-index schema facts, loaded from `N_meta`.
#[derive(Debug, Clone)]
pub struct IndexSchema {
    pub name: String,
    pub mode: SchemaMode,
    /// Multi-column logical fields with boosts, in FTS column order.
    pub fields: Option<Vec<(String, f64)>>,
    pub prefix: Vec<usize>,
    pub has_terms: bool,
}

impl IndexSchema {
    pub fn multi_column(&self) -> bool {
        self.fields.is_some()
    }

    /// Actual FTS column names, in declaration order.
    pub fn fts_columns(&self) -> Vec<String> {
        match (&self.fields, self.mode) {
            (Some(fields), SchemaMode::ExternalContent) => {
                fields.iter().map(|(f, _)| format!("ft_{}", f)).collect()
            }
            (Some(fields), SchemaMode::Legacy) => {
                fields.iter().map(|(f, _)| f.clone()).collect()
            }
            (None, SchemaMode::ExternalContent) => vec!["search_text".to_string()],
            (None, SchemaMode::Legacy) => vec!["content".to_string()],
        }
    }

    /// FTS column name for a logical field, for MATCH column restriction.
    pub fn fts_column_for(&self, field: &str) -> Option<String> {
        let fields = self.fields.as_ref()?;
        fields.iter().any(|(f, _)| f == field).then(|| match self.mode {
            SchemaMode::ExternalContent => format!("ft_{}", field),
            SchemaMode::Legacy => field.to_string(),
        })
    }

    /// `bm25()` call with per-column weights from the boost table.
    fn rank_expr(&self) -> String {
        let fts = format!("\"{}_fts\"", self.name);
        match &self.fields {
            None => format!("bm25({})", fts),
            Some(fields) => {
                let weights: Vec<String> =
                    fields.iter().map(|(_, boost)| format!("{:.2}", boost)).collect();
                match self.mode {
                    // Legacy tables lead with an unindexed id column.
                    SchemaMode::Legacy => format!("bm25({}, 0.0, {})", fts, weights.join(", ")),
                    SchemaMode::ExternalContent => format!("bm25({}, {})", fts, weights.join(", ")),
                }
            }
        }
    }
}

/// Ensure a name is usable as a bare SQL identifier. Index names are
/// interpolated into DDL/DML, so anything else is rejected outright.
fn validate_index_name(name: &str) -> StorageResult<()> {
    let mut chars = name.chars();
    let valid_first = chars.next().map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    if valid_first && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(StorageError::InvalidIndexName(name.to_string()))
    }
}

/// Metadata paths land inside `json_extract('$.path')`; restrict to dotted
/// identifiers.
fn validate_metadata_path(path: &str) -> StorageResult<()> {
    if !path.is_empty()
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        Ok(())
    } else {
        Err(StorageError::InvalidFilterField(path.to_string()))
    }
}

/// Legacy numeric id: CRC32 of the external id. Collisions are tolerated;
/// the docs join keeps the string id authoritative.
pub fn legacy_numeric_id(id: &str) -> i64 {
    crc32fast::hash(id.as_bytes()) as i64
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage query plan
// ─────────────────────────────────────────────────────────────────────────────

/// The storage-level query produced by the search engine: the FTS MATCH
/// expression is already assembled (fuzzy variants, synonyms, column
/// restrictions), everything else is structural.
#[derive(Debug, Clone, Default)]
pub struct StorageQuery {
    pub match_expr: Option<String>,
    pub filters: Vec<Filter>,
    pub language: Option<String>,
    pub geo: Option<GeoFilters>,
    pub sort: Vec<SortSpec>,
    pub limit: usize,
    pub offset: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage
// ─────────────────────────────────────────────────────────────────────────────

pub struct Storage {
    pool: Pool<SqliteConnectionManager>,
    /// Directory holding the database file; `None` for in-memory databases.
    dir: Option<PathBuf>,
    rtree_supported: bool,
    schemas: Mutex<HashMap<String, IndexSchema>>,
}

impl Storage {
    /// Open (or create) the database at `path`; `:memory:` yields a private
    /// shared-cache in-memory database that lives as long as the pool.
    pub fn open(path: &str, busy_timeout_ms: u64) -> StorageResult<Self> {
        let manager = if path == ":memory:" {
            let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
            let uri = format!("file:ferret_mem_{}?mode=memory&cache=shared", seq);
            SqliteConnectionManager::file(uri)
        } else {
            SqliteConnectionManager::file(path)
        };
        let manager = manager.with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA journal_mode = WAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA cache_size = -20000;
                 PRAGMA mmap_size = 268435456;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = {};",
                busy_timeout_ms
            ))?;
            register_haversine(conn)
        });

        let pool = Pool::builder().max_size(8).build(manager)?;

        let rtree_supported = {
            let conn = pool.get()?;
            probe_rtree(&conn)
        };
        if !rtree_supported {
            tracing::warn!("R-tree module unavailable; spatial features disabled");
        }

        let dir = if path == ":memory:" {
            None
        } else {
            let p = PathBuf::from(path);
            Some(p.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")))
        };

        tracing::debug!(path, rtree = rtree_supported, "storage opened");

        Ok(Self {
            pool,
            dir,
            rtree_supported,
            schemas: Mutex::new(HashMap::new()),
        })
    }

    pub fn rtree_supported(&self) -> bool {
        self.rtree_supported
    }

    /// Directory for sidecar files (fuzzy variant cache), `None` in memory.
    pub fn sidecar_dir(&self) -> Option<&PathBuf> {
        self.dir.as_ref()
    }

    fn conn(&self) -> StorageResult<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Schema lifecycle
    // ─────────────────────────────────────────────────────────────────────

    pub fn create_index(&self, name: &str, options: &IndexOptions) -> StorageResult<IndexSchema> {
        validate_index_name(name)?;
        let mode = if options.external_content {
            SchemaMode::ExternalContent
        } else {
            SchemaMode::Legacy
        };
        let schema = IndexSchema {
            name: name.to_string(),
            mode,
            fields: options.multi_columns.clone(),
            prefix: options.prefix.clone(),
            has_terms: options.with_terms,
        };

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let fts_cols = schema.fts_columns();
        let extra_doc_cols: String = if mode == SchemaMode::ExternalContent {
            fts_cols
                .iter()
                .map(|c| format!(", \"{}\" TEXT NOT NULL DEFAULT ''", c))
                .collect()
        } else {
            String::new()
        };

        match mode {
            SchemaMode::ExternalContent => tx.execute_batch(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{n}" (
                       doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
                       id TEXT NOT NULL UNIQUE,
                       content TEXT NOT NULL DEFAULT '{{}}',
                       metadata TEXT NOT NULL DEFAULT '{{}}',
                       language TEXT,
                       type TEXT NOT NULL DEFAULT 'default',
                       timestamp INTEGER NOT NULL,
                       indexed_at INTEGER NOT NULL{extra}
                   );"#,
                n = name,
                extra = extra_doc_cols,
            ))?,
            SchemaMode::Legacy => tx.execute_batch(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{n}" (
                       id TEXT PRIMARY KEY,
                       content TEXT NOT NULL DEFAULT '{{}}',
                       metadata TEXT NOT NULL DEFAULT '{{}}',
                       language TEXT,
                       type TEXT NOT NULL DEFAULT 'default',
                       timestamp INTEGER NOT NULL,
                       indexed_at INTEGER NOT NULL
                   );
                   CREATE TABLE IF NOT EXISTS "{n}_id_map" (
                       string_id TEXT PRIMARY KEY,
                       numeric_id INTEGER NOT NULL
                   );
                   CREATE INDEX IF NOT EXISTS "idx_{n}_id_map_numeric"
                       ON "{n}_id_map"(numeric_id);"#,
                n = name,
            ))?,
        }

        tx.execute_batch(&format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{n}_language" ON "{n}"(language);
               CREATE INDEX IF NOT EXISTS "idx_{n}_type" ON "{n}"(type);
               CREATE INDEX IF NOT EXISTS "idx_{n}_timestamp" ON "{n}"(timestamp);"#,
            n = name,
        ))?;

        let prefix_opt = if schema.prefix.is_empty() {
            String::new()
        } else {
            let grams: Vec<String> = schema.prefix.iter().map(|p| p.to_string()).collect();
            format!(", prefix='{}'", grams.join(" "))
        };
        let fts_ddl = match mode {
            SchemaMode::ExternalContent => format!(
                r#"CREATE VIRTUAL TABLE IF NOT EXISTS "{n}_fts" USING fts5(
                       {cols}, content='{n}', content_rowid='doc_id',
                       tokenize='unicode61'{prefix}
                   )"#,
                n = name,
                cols = fts_cols.join(", "),
                prefix = prefix_opt,
            ),
            SchemaMode::Legacy => format!(
                r#"CREATE VIRTUAL TABLE IF NOT EXISTS "{n}_fts" USING fts5(
                       id UNINDEXED, {cols}, tokenize='unicode61'{prefix}
                   )"#,
                n = name,
                cols = fts_cols.join(", "),
                prefix = prefix_opt,
            ),
        };
        tx.execute_batch(&fts_ddl)?;

        if self.rtree_supported {
            tx.execute_batch(&format!(
                r#"CREATE VIRTUAL TABLE IF NOT EXISTS "{n}_spatial"
                       USING rtree(id, minLat, maxLat, minLng, maxLng)"#,
                n = name,
            ))?;
        }

        if options.with_terms {
            tx.execute_batch(&format!(
                r#"CREATE TABLE IF NOT EXISTS "{n}_terms" (
                       term TEXT NOT NULL,
                       document_id TEXT NOT NULL,
                       field TEXT NOT NULL,
                       frequency INTEGER NOT NULL,
                       positions TEXT NOT NULL,
                       PRIMARY KEY (term, document_id, field)
                   );
                   CREATE INDEX IF NOT EXISTS "idx_{n}_terms_doc"
                       ON "{n}_terms"(document_id);"#,
                n = name,
            ))?;
        }

        tx.execute_batch(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{n}_meta" (
                   key TEXT PRIMARY KEY,
                   value TEXT NOT NULL
               )"#,
            n = name,
        ))?;
        let meta_upsert =
            format!(r#"INSERT OR IGNORE INTO "{}_meta"(key, value) VALUES (?1, ?2)"#, name);
        tx.execute(&meta_upsert, params!["schema_mode", mode.as_str()])?;
        tx.execute(
            &meta_upsert,
            params!["fts_fields", serde_json::to_string(&schema.fields)?],
        )?;
        tx.execute(
            &meta_upsert,
            params!["fts_prefix", serde_json::to_string(&schema.prefix)?],
        )?;
        tx.execute(&meta_upsert, params!["has_terms", if options.with_terms { "1" } else { "0" }])?;
        tx.execute(&meta_upsert, params!["generation", "0"])?;
        tx.commit()?;

        tracing::info!(index = name, mode = mode.as_str(), "index created");
        self.schemas.lock().insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    /// Load (and cache) the schema descriptor for an existing index.
    pub fn schema(&self, name: &str) -> StorageResult<IndexSchema> {
        if let Some(schema) = self.schemas.lock().get(name) {
            return Ok(schema.clone());
        }
        validate_index_name(name)?;
        if !self.index_exists(name)? {
            return Err(StorageError::IndexNotFound(name.to_string()));
        }
        let conn = self.conn()?;
        let get = |key: &str| -> StorageResult<Option<String>> {
            Ok(conn
                .query_row(
                    &format!(r#"SELECT value FROM "{}_meta" WHERE key = ?1"#, name),
                    [key],
                    |row| row.get(0),
                )
                .optional()?)
        };
        let mode = get("schema_mode")?
            .and_then(|s| SchemaMode::parse(&s))
            .unwrap_or(SchemaMode::ExternalContent);
        let fields: Option<Vec<(String, f64)>> = match get("fts_fields")? {
            Some(json) => serde_json::from_str(&json)?,
            None => None,
        };
        let prefix: Vec<usize> = match get("fts_prefix")? {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };
        let has_terms = get("has_terms")?.as_deref() == Some("1");

        let schema = IndexSchema { name: name.to_string(), mode, fields, prefix, has_terms };
        self.schemas.lock().insert(name.to_string(), schema.clone());
        Ok(schema)
    }

    pub fn index_exists(&self, name: &str) -> StorageResult<bool> {
        validate_index_name(name)?;
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn drop_index(&self, name: &str) -> StorageResult<()> {
        let schema = self.schema(name)?;
        let conn = self.conn()?;
        // Virtual tables drop with plain DROP TABLE; the vocab table must go
        // before the FTS table it shadows.
        for suffix in ["_fts_vocab", "_fts", "_spatial", "_terms", "_id_map", "_meta", ""] {
            conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{}{}""#, name, suffix))?;
        }
        self.schemas.lock().remove(name);
        tracing::info!(index = name, mode = schema.mode.as_str(), "index dropped");
        Ok(())
    }

    /// Remove every document but keep the schema. Bumps the generation.
    pub fn clear(&self, name: &str) -> StorageResult<()> {
        let schema = self.schema(name)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match schema.mode {
            SchemaMode::ExternalContent => {
                // Rebuilding an empty external-content index is cheaper and
                // safer than replaying per-row deletes.
                tx.execute(&format!(r#"DELETE FROM "{}""#, name), [])?;
                tx.execute(
                    &format!(r#"INSERT INTO "{n}_fts"("{n}_fts") VALUES('rebuild')"#, n = name),
                    [],
                )?;
            }
            SchemaMode::Legacy => {
                tx.execute(&format!(r#"DELETE FROM "{}""#, name), [])?;
                tx.execute(&format!(r#"DELETE FROM "{}_fts""#, name), [])?;
                tx.execute(&format!(r#"DELETE FROM "{}_id_map""#, name), [])?;
            }
        }
        if self.rtree_supported {
            tx.execute(&format!(r#"DELETE FROM "{}_spatial""#, name), [])?;
        }
        if schema.has_terms {
            tx.execute(&format!(r#"DELETE FROM "{}_terms""#, name), [])?;
        }
        bump_generation_tx(&tx, name)?;
        tx.commit()?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    /// Insert or replace one document.
    pub fn upsert_document(&self, index: &str, doc: &PreparedDocument) -> StorageResult<()> {
        self.upsert_batch(index, std::slice::from_ref(doc))
    }

    /// Insert or replace a batch inside one transaction. Replacing an id
    /// replaces its whole family: stale sibling chunk rows (or the bare row,
    /// when the document is now chunked) are deleted first. `synchronous` is
    /// relaxed to OFF for the duration of the bulk load and restored after.
    /// Any failure rolls the whole batch back.
    pub fn upsert_batch(&self, index: &str, docs: &[PreparedDocument]) -> StorageResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let schema = self.schema(index)?;
        let mut conn = self.conn()?;

        conn.pragma_update(None, "synchronous", "OFF")?;
        let result = (|| -> StorageResult<()> {
            let tx = conn.transaction()?;
            delete_stale_family_rows_tx(&tx, &schema, docs, self.rtree_supported)?;
            for doc in docs {
                write_document_tx(&tx, &schema, doc, self.rtree_supported)?;
            }
            bump_generation_tx(&tx, index)?;
            tx.commit()?;
            Ok(())
        })();
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        result
    }

    /// Delete a document and its chunks. Returns the number of rows removed.
    pub fn delete_document(&self, index: &str, id: &str) -> StorageResult<usize> {
        let schema = self.schema(index)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(&format!(
                r#"SELECT id FROM "{}" WHERE id = ?1 OR id LIKE ?1 || '#chunk%'"#,
                index
            ))?;
            let rows = stmt.query_map([id], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>()?
        };

        for doc_id in &ids {
            delete_document_tx(&tx, &schema, doc_id, self.rtree_supported)?;
        }
        if !ids.is_empty() {
            bump_generation_tx(&tx, index)?;
        }
        tx.commit()?;
        Ok(ids.len())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────

    pub fn get_document(&self, index: &str, id: &str) -> StorageResult<Option<StoredDocument>> {
        let _schema = self.schema(index)?;
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    r#"SELECT id, content, metadata, language, type, timestamp, indexed_at
                       FROM "{}" WHERE id = ?1"#,
                    index
                ),
                [id],
                row_to_document,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_stats(&self, index: &str) -> StorageResult<IndexStats> {
        let _schema = self.schema(index)?;
        let conn = self.conn()?;
        let document_count: u64 = conn.query_row(
            &format!(r#"SELECT COUNT(*) FROM "{}""#, index),
            [],
            |row| row.get::<_, i64>(0).map(|n| n as u64),
        )?;

        let histogram = |column: &str| -> StorageResult<HashMap<String, u64>> {
            let mut stmt = conn.prepare(&format!(
                r#"SELECT COALESCE({col}, ''), COUNT(*) FROM "{idx}" GROUP BY {col}"#,
                col = column,
                idx = index
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            let mut map = HashMap::new();
            for row in rows {
                let (key, count) = row?;
                if !key.is_empty() {
                    map.insert(key, count);
                }
            }
            Ok(map)
        };

        Ok(IndexStats {
            name: index.to_string(),
            document_count,
            languages: histogram("language")?,
            types: histogram("type")?,
        })
    }

    pub fn list_indices(&self) -> StorageResult<Vec<IndexSummary>> {
        let names: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name LIKE '%_meta' ORDER BY name",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut summaries = Vec::new();
        for meta_name in names {
            let Some(name) = meta_name.strip_suffix("_meta") else { continue };
            if validate_index_name(name).is_err() || !self.index_exists(name)? {
                continue;
            }
            let stats = self.get_stats(name)?;
            let mut languages: Vec<String> = stats.languages.keys().cloned().collect();
            let mut types: Vec<String> = stats.types.keys().cloned().collect();
            languages.sort();
            types.sort();
            summaries.push(IndexSummary {
                name: name.to_string(),
                document_count: stats.document_count,
                languages,
                types,
            });
        }
        Ok(summaries)
    }

    /// Current write-batch generation of an index.
    pub fn generation(&self, index: &str) -> StorageResult<u64> {
        let _schema = self.schema(index)?;
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                &format!(r#"SELECT value FROM "{}_meta" WHERE key = 'generation'"#, index),
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Vocabulary for fuzzy expansion: the terms table when present,
    /// otherwise the FTS5 row vocabulary, materialized on demand.
    pub fn vocabulary(&self, index: &str, max_terms: usize) -> StorageResult<Vec<(String, u64)>> {
        let schema = self.schema(index)?;
        let conn = self.conn()?;
        let sql = if schema.has_terms {
            format!(
                r#"SELECT term, SUM(frequency) AS freq FROM "{}_terms"
                   GROUP BY term ORDER BY freq DESC LIMIT ?1"#,
                index
            )
        } else {
            conn.execute_batch(&format!(
                r#"CREATE VIRTUAL TABLE IF NOT EXISTS "{n}_fts_vocab"
                       USING fts5vocab('{n}_fts', 'row')"#,
                n = index
            ))?;
            format!(
                r#"SELECT term, doc FROM "{}_fts_vocab" ORDER BY doc DESC LIMIT ?1"#,
                index
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([max_terms as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Rebuild FTS internals and refresh planner statistics.
    pub fn optimize(&self, index: &str) -> StorageResult<()> {
        let _schema = self.schema(index)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(r#"INSERT INTO "{n}_fts"("{n}_fts") VALUES('optimize')"#, n = index),
            [],
        )?;
        conn.execute_batch("ANALYZE")?;
        tracing::debug!(index, "optimize complete");
        Ok(())
    }

    pub fn database_size(&self) -> StorageResult<i64> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        Ok(page_count * page_size)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Search
    // ─────────────────────────────────────────────────────────────────────

    /// Run an assembled storage query, returning paginated rows with BM25
    /// rank and distance (meters).
    pub fn search(&self, index: &str, query: &StorageQuery) -> StorageResult<Vec<SearchRow>> {
        let schema = self.schema(index)?;
        let geo_active = query.geo.as_ref().map_or(false, |g| {
            g.near.is_some() || g.within.is_some() || g.nearest.is_some()
        });
        if geo_active && !self.rtree_supported {
            // Spatial predicates cannot be answered at all without R-tree.
            return Ok(Vec::new());
        }

        let plan = build_search_sql(&schema, query, SqlShape::Rows)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&plan.sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(plan.params.iter()), |row| {
            let doc = row_to_document(row)?;
            let rank: f64 = row.get("rank")?;
            let (distance, point) = if plan.has_distance {
                let lat: f64 = row.get("_lat")?;
                let lng: f64 = row.get("_lng")?;
                (row.get("distance")?, Some(Point::new(lat, lng)))
            } else {
                (None, None)
            };
            Ok(SearchRow { doc, rank, distance, point })
        })?;
        let mut results: Vec<SearchRow> = rows.collect::<Result<Vec<_>, _>>()?;

        if plan.post_sort_distance {
            let descending = matches!(
                query.geo.as_ref().and_then(|g| g.distance_sort),
                Some(SortDirection::Desc)
            );
            results.sort_by(|a, b| {
                let da = a.distance.unwrap_or(f64::INFINITY);
                let db = b.distance.unwrap_or(f64::INFINITY);
                if descending { db.total_cmp(&da) } else { da.total_cmp(&db) }
            });
        }
        if let Some(k) = plan.knn_k {
            results.truncate(k);
        }
        if plan.paginate_in_memory {
            let start = query.offset.min(results.len());
            let end = (start + query.limit).min(results.len());
            results = results[start..end].to_vec();
        }

        Ok(results)
    }

    /// Count matching documents (no pagination, no sort).
    pub fn count(&self, index: &str, query: &StorageQuery) -> StorageResult<u64> {
        let schema = self.schema(index)?;
        let geo_active = query.geo.as_ref().map_or(false, |g| {
            g.near.is_some() || g.within.is_some() || g.nearest.is_some()
        });
        if geo_active && !self.rtree_supported {
            return Ok(0);
        }
        let plan = build_search_sql(&schema, query, SqlShape::Count)?;
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            &plan.sql,
            rusqlite::params_from_iter(plan.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Migration
    // ─────────────────────────────────────────────────────────────────────

    /// Convert a legacy index to the external-content schema in place.
    pub fn migrate_to_external_content(&self, index: &str) -> StorageResult<()> {
        let schema = self.schema(index)?;
        if schema.mode == SchemaMode::ExternalContent {
            return Ok(());
        }

        let new_schema = IndexSchema {
            name: schema.name.clone(),
            mode: SchemaMode::ExternalContent,
            fields: schema.fields.clone(),
            prefix: schema.prefix.clone(),
            has_terms: schema.has_terms,
        };
        let old_cols = schema.fts_columns();
        let new_cols = new_schema.fts_columns();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute_batch(&format!(r#"ALTER TABLE "{n}" RENAME TO "{n}_migrating""#, n = index))?;

        let extra_doc_cols: String = new_cols
            .iter()
            .map(|c| format!(", \"{}\" TEXT NOT NULL DEFAULT ''", c))
            .collect();
        tx.execute_batch(&format!(
            r#"CREATE TABLE "{n}" (
                   doc_id INTEGER PRIMARY KEY AUTOINCREMENT,
                   id TEXT NOT NULL UNIQUE,
                   content TEXT NOT NULL DEFAULT '{{}}',
                   metadata TEXT NOT NULL DEFAULT '{{}}',
                   language TEXT,
                   type TEXT NOT NULL DEFAULT 'default',
                   timestamp INTEGER NOT NULL,
                   indexed_at INTEGER NOT NULL{extra}
               )"#,
            n = index,
            extra = extra_doc_cols,
        ))?;

        // Indexed text lives in the legacy FTS table; carry it across.
        let select_fts: String = old_cols
            .iter()
            .map(|c| format!(", COALESCE(f.\"{}\", '')", c))
            .collect();
        let insert_fts: String = new_cols.iter().map(|c| format!(", \"{}\"", c)).collect();
        tx.execute(
            &format!(
                r#"INSERT INTO "{n}" (id, content, metadata, language, type, timestamp, indexed_at{insert_fts})
                   SELECT d.id, d.content, d.metadata, d.language, d.type, d.timestamp, d.indexed_at{select_fts}
                   FROM "{n}_migrating" d
                   LEFT JOIN "{n}_fts" f ON f.id = d.id"#,
                n = index,
                insert_fts = insert_fts,
                select_fts = select_fts,
            ),
            [],
        )?;

        tx.execute_batch(&format!(r#"DROP TABLE "{n}_fts""#, n = index))?;
        let prefix_opt = if new_schema.prefix.is_empty() {
            String::new()
        } else {
            let grams: Vec<String> = new_schema.prefix.iter().map(|p| p.to_string()).collect();
            format!(", prefix='{}'", grams.join(" "))
        };
        tx.execute_batch(&format!(
            r#"CREATE VIRTUAL TABLE "{n}_fts" USING fts5(
                   {cols}, content='{n}', content_rowid='doc_id',
                   tokenize='unicode61'{prefix}
               )"#,
            n = index,
            cols = new_cols.join(", "),
            prefix = prefix_opt,
        ))?;
        tx.execute(
            &format!(r#"INSERT INTO "{n}_fts"("{n}_fts") VALUES('rebuild')"#, n = index),
            [],
        )?;

        // Spatial rows move from CRC ids to doc_ids via the id map.
        if self.rtree_supported {
            let has_spatial: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [format!("{}_spatial", index)],
                    |row| row.get(0),
                )
                .optional()?;
            if has_spatial.is_some() {
                tx.execute_batch(&format!(
                    r#"CREATE TEMPORARY TABLE spatial_carry AS
                           SELECT d.doc_id AS id, s.minLat, s.maxLat, s.minLng, s.maxLng
                           FROM "{n}" d
                           JOIN "{n}_id_map" m ON m.string_id = d.id
                           JOIN "{n}_spatial" s ON s.id = m.numeric_id;
                       DELETE FROM "{n}_spatial";
                       INSERT INTO "{n}_spatial" SELECT * FROM spatial_carry;
                       DROP TABLE spatial_carry;"#,
                    n = index,
                ))?;
            }
        }

        // Secondary indices followed the renamed table; recreate them on the
        // new one after the old table (and its indices) are gone.
        tx.execute_batch(&format!(
            r#"DROP TABLE IF EXISTS "{n}_id_map";
               DROP TABLE "{n}_migrating";
               CREATE INDEX IF NOT EXISTS "idx_{n}_language" ON "{n}"(language);
               CREATE INDEX IF NOT EXISTS "idx_{n}_type" ON "{n}"(type);
               CREATE INDEX IF NOT EXISTS "idx_{n}_timestamp" ON "{n}"(timestamp);"#,
            n = index,
        ))?;
        tx.execute(
            &format!(r#"UPDATE "{n}_meta" SET value = ?1 WHERE key = 'schema_mode'"#, n = index),
            params![SchemaMode::ExternalContent.as_str()],
        )?;
        bump_generation_tx(&tx, index)?;
        tx.commit()?;

        self.schemas.lock().insert(index.to_string(), new_schema);
        tracing::info!(index, "migrated to external-content schema");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection setup
// ─────────────────────────────────────────────────────────────────────────────

fn register_haversine(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "haversine",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a = Point::new(ctx.get::<f64>(0)?, ctx.get::<f64>(1)?);
            let b = Point::new(ctx.get::<f64>(2)?, ctx.get::<f64>(3)?);
            Ok(a.haversine_distance(&b))
        },
    )
}

/// One-shot capability probe: create and drop a trial R-tree table.
/// Virtual tables cannot live in the temp schema, so this briefly touches
/// the main database.
fn probe_rtree(conn: &Connection) -> bool {
    let result = conn.execute_batch(
        "CREATE VIRTUAL TABLE IF NOT EXISTS _rtree_probe USING rtree(id, minX, maxX);
         DROP TABLE _rtree_probe;",
    );
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "rtree probe failed");
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write helpers (inside a transaction)
// ─────────────────────────────────────────────────────────────────────────────

fn bump_generation_tx(tx: &Connection, index: &str) -> rusqlite::Result<()> {
    tx.execute(
        &format!(
            r#"UPDATE "{}_meta" SET value = CAST(value AS INTEGER) + 1 WHERE key = 'generation'"#,
            index
        ),
        [],
    )?;
    Ok(())
}

/// Column texts for a document, padded/truncated to the index's FTS arity.
fn fts_texts(schema: &IndexSchema, text: &FtsText) -> Vec<String> {
    let expected = schema.fts_columns().len();
    let mut texts = match text {
        FtsText::Multi(cols) => cols.clone(),
        single => vec![single.single()],
    };
    texts.resize(expected, String::new());
    texts
}

/// Base document id of a row: chunk rows map back to their parent.
fn base_document_id(id: &str) -> &str {
    id.find("#chunk").map_or(id, |pos| &id[..pos])
}

/// Replacing a document replaces its whole family. Any previously written
/// row under a base id in this batch (the bare row or a sibling chunk) that
/// the batch does not re-write is deleted before the new rows land, the
/// same fan-out `delete_document` does for explicit deletes.
fn delete_stale_family_rows_tx(
    tx: &Connection,
    schema: &IndexSchema,
    docs: &[PreparedDocument],
    rtree: bool,
) -> StorageResult<()> {
    let incoming: HashSet<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    let mut bases: Vec<&str> = docs.iter().map(|d| base_document_id(&d.id)).collect();
    bases.sort_unstable();
    bases.dedup();

    let mut stmt = tx.prepare(&format!(
        r#"SELECT id FROM "{}" WHERE id = ?1 OR id LIKE ?1 || '#chunk%'"#,
        schema.name
    ))?;
    for base in bases {
        let existing: Vec<String> = stmt
            .query_map([base], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for id in existing {
            if !incoming.contains(id.as_str()) {
                delete_document_tx(tx, schema, &id, rtree)?;
            }
        }
    }
    Ok(())
}

fn write_document_tx(
    tx: &Connection,
    schema: &IndexSchema,
    doc: &PreparedDocument,
    rtree: bool,
) -> StorageResult<()> {
    let n = &schema.name;
    let now = chrono::Utc::now().timestamp();
    let cols = schema.fts_columns();
    let texts = fts_texts(schema, &doc.fts_text);

    match schema.mode {
        SchemaMode::ExternalContent => {
            let existing: Option<i64> = tx
                .query_row(
                    &format!(r#"SELECT doc_id FROM "{}" WHERE id = ?1"#, n),
                    [&doc.id],
                    |row| row.get(0),
                )
                .optional()?;

            let doc_id = match existing {
                Some(doc_id) => {
                    // Replay the old indexed text into the FTS delete command
                    // before the docs row changes underneath it.
                    let col_list: String = cols.iter().map(|c| format!(", \"{}\"", c)).collect();
                    tx.execute(
                        &format!(
                            r#"INSERT INTO "{n}_fts"("{n}_fts", rowid{cols})
                               SELECT 'delete', doc_id{cols} FROM "{n}" WHERE doc_id = ?1"#,
                            n = n,
                            cols = col_list,
                        ),
                        [doc_id],
                    )?;
                    let set_fts: String = cols
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!(", \"{}\" = ?{}", c, i + 7))
                        .collect();
                    let mut params: Vec<rusqlite::types::Value> = vec![
                        doc.content_json.clone().into(),
                        doc.metadata_json.clone().into(),
                        doc.language.clone().map_or(rusqlite::types::Value::Null, Into::into),
                        doc.doc_type.clone().into(),
                        doc.timestamp.into(),
                        now.into(),
                    ];
                    for text in &texts {
                        params.push(text.clone().into());
                    }
                    params.push(doc_id.into());
                    tx.execute(
                        &format!(
                            r#"UPDATE "{n}" SET content = ?1, metadata = ?2, language = ?3,
                                   type = ?4, timestamp = ?5, indexed_at = ?6{set_fts}
                               WHERE doc_id = ?{last}"#,
                            n = n,
                            set_fts = set_fts,
                            last = 7 + cols.len(),
                        ),
                        rusqlite::params_from_iter(params.iter()),
                    )?;
                    doc_id
                }
                None => {
                    let col_names: String = cols.iter().map(|c| format!(", \"{}\"", c)).collect();
                    let col_binds: String =
                        (0..cols.len()).map(|i| format!(", ?{}", i + 8)).collect();
                    let mut params: Vec<rusqlite::types::Value> = vec![
                        doc.id.clone().into(),
                        doc.content_json.clone().into(),
                        doc.metadata_json.clone().into(),
                        doc.language.clone().map_or(rusqlite::types::Value::Null, Into::into),
                        doc.doc_type.clone().into(),
                        doc.timestamp.into(),
                        now.into(),
                    ];
                    for text in &texts {
                        params.push(text.clone().into());
                    }
                    tx.execute(
                        &format!(
                            r#"INSERT INTO "{n}" (id, content, metadata, language, type,
                                   timestamp, indexed_at{col_names})
                               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7{col_binds})"#,
                            n = n,
                            col_names = col_names,
                            col_binds = col_binds,
                        ),
                        rusqlite::params_from_iter(params.iter()),
                    )?;
                    tx.last_insert_rowid()
                }
            };

            // Fresh FTS entry reads column values from this insert.
            let col_names: String = cols.iter().map(|c| format!(", \"{}\"", c)).collect();
            let col_binds: String = (0..cols.len()).map(|i| format!(", ?{}", i + 2)).collect();
            let mut params: Vec<rusqlite::types::Value> = vec![doc_id.into()];
            for text in &texts {
                params.push(text.clone().into());
            }
            tx.execute(
                &format!(
                    r#"INSERT INTO "{n}_fts"(rowid{col_names}) VALUES (?1{col_binds})"#,
                    n = n,
                    col_names = col_names,
                    col_binds = col_binds,
                ),
                rusqlite::params_from_iter(params.iter()),
            )?;

            write_spatial_tx(tx, schema, doc, doc_id, rtree)?;
        }
        SchemaMode::Legacy => {
            tx.execute(
                &format!(
                    r#"INSERT INTO "{n}" (id, content, metadata, language, type, timestamp, indexed_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                       ON CONFLICT(id) DO UPDATE SET
                           content = excluded.content, metadata = excluded.metadata,
                           language = excluded.language, type = excluded.type,
                           timestamp = excluded.timestamp, indexed_at = excluded.indexed_at"#,
                    n = n,
                ),
                params![
                    doc.id,
                    doc.content_json,
                    doc.metadata_json,
                    doc.language,
                    doc.doc_type,
                    doc.timestamp,
                    now,
                ],
            )?;

            tx.execute(&format!(r#"DELETE FROM "{n}_fts" WHERE id = ?1"#, n = n), [&doc.id])?;
            let col_names: String = cols.iter().map(|c| format!(", \"{}\"", c)).collect();
            let col_binds: String = (0..cols.len()).map(|i| format!(", ?{}", i + 2)).collect();
            let mut params: Vec<rusqlite::types::Value> = vec![doc.id.clone().into()];
            for text in &texts {
                params.push(text.clone().into());
            }
            tx.execute(
                &format!(
                    r#"INSERT INTO "{n}_fts"(id{col_names}) VALUES (?1{col_binds})"#,
                    n = n,
                    col_names = col_names,
                    col_binds = col_binds,
                ),
                rusqlite::params_from_iter(params.iter()),
            )?;

            let numeric_id = legacy_numeric_id(&doc.id);
            tx.execute(
                &format!(
                    r#"INSERT INTO "{n}_id_map"(string_id, numeric_id) VALUES (?1, ?2)
                       ON CONFLICT(string_id) DO UPDATE SET numeric_id = excluded.numeric_id"#,
                    n = n,
                ),
                params![doc.id, numeric_id],
            )?;

            write_spatial_tx(tx, schema, doc, numeric_id, rtree)?;
        }
    }

    if schema.has_terms {
        write_terms_tx(tx, &schema.name, &doc.id, &doc.terms)?;
    }

    Ok(())
}

fn write_spatial_tx(
    tx: &Connection,
    schema: &IndexSchema,
    doc: &PreparedDocument,
    spatial_id: i64,
    rtree: bool,
) -> StorageResult<()> {
    if !rtree {
        return Ok(());
    }
    let n = &schema.name;
    tx.execute(&format!(r#"DELETE FROM "{n}_spatial" WHERE id = ?1"#, n = n), [spatial_id])?;
    if let Some(bounds) = &doc.spatial {
        tx.execute(
            &format!(
                r#"INSERT INTO "{n}_spatial"(id, minLat, maxLat, minLng, maxLng)
                   VALUES (?1, ?2, ?3, ?4, ?5)"#,
                n = n,
            ),
            params![spatial_id, bounds.south, bounds.north, bounds.west, bounds.east],
        )?;
    }
    Ok(())
}

fn write_terms_tx(
    tx: &Connection,
    index: &str,
    doc_id: &str,
    terms: &[TermPosting],
) -> StorageResult<()> {
    tx.execute(
        &format!(r#"DELETE FROM "{}_terms" WHERE document_id = ?1"#, index),
        [doc_id],
    )?;
    let mut stmt = tx.prepare(&format!(
        r#"INSERT INTO "{}_terms"(term, document_id, field, frequency, positions)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(term, document_id, field) DO UPDATE SET
               frequency = excluded.frequency, positions = excluded.positions"#,
        index
    ))?;
    for posting in terms {
        stmt.execute(params![
            posting.term,
            doc_id,
            posting.field,
            posting.frequency as i64,
            serde_json::to_string(&posting.positions)?,
        ])?;
    }
    Ok(())
}

fn delete_document_tx(
    tx: &Connection,
    schema: &IndexSchema,
    id: &str,
    rtree: bool,
) -> StorageResult<()> {
    let n = &schema.name;
    match schema.mode {
        SchemaMode::ExternalContent => {
            let doc_id: Option<i64> = tx
                .query_row(&format!(r#"SELECT doc_id FROM "{}" WHERE id = ?1"#, n), [id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(doc_id) = doc_id else { return Ok(()) };
            let col_list: String =
                schema.fts_columns().iter().map(|c| format!(", \"{}\"", c)).collect();
            tx.execute(
                &format!(
                    r#"INSERT INTO "{n}_fts"("{n}_fts", rowid{cols})
                       SELECT 'delete', doc_id{cols} FROM "{n}" WHERE doc_id = ?1"#,
                    n = n,
                    cols = col_list,
                ),
                [doc_id],
            )?;
            tx.execute(&format!(r#"DELETE FROM "{}" WHERE doc_id = ?1"#, n), [doc_id])?;
            if rtree {
                tx.execute(&format!(r#"DELETE FROM "{}_spatial" WHERE id = ?1"#, n), [doc_id])?;
            }
        }
        SchemaMode::Legacy => {
            tx.execute(&format!(r#"DELETE FROM "{}" WHERE id = ?1"#, n), [id])?;
            tx.execute(&format!(r#"DELETE FROM "{}_fts" WHERE id = ?1"#, n), [id])?;
            let numeric_id = legacy_numeric_id(id);
            // Another string id may collide into the same numeric id; only
            // drop the map/spatial rows when this mapping owns them.
            let owner: Option<String> = tx
                .query_row(
                    &format!(
                        r#"SELECT string_id FROM "{}_id_map" WHERE numeric_id = ?1"#,
                        n
                    ),
                    [numeric_id],
                    |row| row.get(0),
                )
                .optional()?;
            if owner.as_deref() == Some(id) {
                tx.execute(&format!(r#"DELETE FROM "{}_id_map" WHERE string_id = ?1"#, n), [id])?;
                if rtree {
                    tx.execute(
                        &format!(r#"DELETE FROM "{}_spatial" WHERE id = ?1"#, n),
                        [numeric_id],
                    )?;
                }
            }
        }
    }
    if schema.has_terms {
        tx.execute(&format!(r#"DELETE FROM "{}_terms" WHERE document_id = ?1"#, n), [id])?;
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Search SQL assembly
// ─────────────────────────────────────────────────────────────────────────────

enum SqlShape {
    Rows,
    Count,
}

struct SqlPlan {
    sql: String,
    params: Vec<rusqlite::types::Value>,
    has_distance: bool,
    /// Rows must be re-sorted by distance in memory (FTS + distance sort).
    post_sort_distance: bool,
    /// Offset/limit must be applied after the in-memory sort.
    paginate_in_memory: bool,
    knn_k: Option<usize>,
}

fn json_to_sql(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

fn build_search_sql(
    schema: &IndexSchema,
    query: &StorageQuery,
    shape: SqlShape,
) -> StorageResult<SqlPlan> {
    let n = &schema.name;
    let fts = format!("\"{}_fts\"", n);
    let has_match = query.match_expr.as_deref().map_or(false, |m| !m.trim().is_empty());

    let geo = query.geo.as_ref();
    let near = geo.and_then(|g| g.near);
    let within = geo.and_then(|g| g.within);
    let nearest = geo.and_then(|g| g.nearest);
    let units = geo.map(|g| g.units).unwrap_or_default();
    let geo_active = near.is_some() || within.is_some() || nearest.is_some();
    let distance_origin: Option<Point> =
        near.map(|f| f.point).or_else(|| nearest.map(|f| f.point));
    let wants_distance_sort =
        geo.and_then(|g| g.distance_sort).is_some() || nearest.is_some();

    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    let mut bind = |params: &mut Vec<rusqlite::types::Value>, v: rusqlite::types::Value| {
        params.push(v);
        format!("?{}", params.len())
    };

    // Distance expression over the spatial row's center (points store
    // min = max, so the center is the point itself). COUNT queries only
    // need it when a WHERE clause references it; binding unused parameters
    // is an error.
    let count_needs_distance =
        near.is_some() || nearest.map_or(false, |n| n.max_distance.is_some());
    let distance_origin = match shape {
        SqlShape::Rows => distance_origin,
        SqlShape::Count if count_needs_distance => distance_origin,
        SqlShape::Count => None,
    };
    let distance_expr = distance_origin.map(|origin| {
        let lat = bind(&mut params, origin.lat.into());
        let lng = bind(&mut params, origin.lng.into());
        format!(
            "haversine({lat}, {lng}, (s.minLat + s.maxLat) / 2.0, (s.minLng + s.maxLng) / 2.0)",
            lat = lat,
            lng = lng,
        )
    });

    let rank_expr = if has_match { schema.rank_expr() } else { "0.0".to_string() };

    // FROM / JOIN clauses
    let mut joins = String::new();
    if has_match {
        match schema.mode {
            SchemaMode::ExternalContent => {
                joins.push_str(&format!(" INNER JOIN {fts} ON {fts}.rowid = d.doc_id"));
            }
            SchemaMode::Legacy => {
                joins.push_str(&format!(" INNER JOIN {fts} ON {fts}.id = d.id"));
            }
        }
    }
    if geo_active {
        match schema.mode {
            SchemaMode::ExternalContent => {
                joins.push_str(&format!(r#" INNER JOIN "{n}_spatial" s ON s.id = d.doc_id"#));
            }
            SchemaMode::Legacy => {
                joins.push_str(&format!(
                    r#" INNER JOIN "{n}_id_map" m ON m.string_id = d.id
                        INNER JOIN "{n}_spatial" s ON s.id = m.numeric_id"#
                ));
            }
        }
    }

    // WHERE clauses
    let mut wheres: Vec<String> = Vec::new();
    if let Some(expr) = query.match_expr.as_deref() {
        if has_match {
            let p = bind(&mut params, expr.to_string().into());
            wheres.push(format!("{fts} MATCH {p}"));
        }
    }
    if let Some(language) = &query.language {
        let p = bind(&mut params, language.clone().into());
        wheres.push(format!("d.language = {p}"));
    }

    // Bounding-box prefilter + exact refinement for radius queries.
    let mut bbox_clause = |params: &mut Vec<rusqlite::types::Value>,
                           bounds: &crate::geo::Bounds| {
        let south = bind(params, bounds.south.into());
        let north = bind(params, bounds.north.into());
        let mut clause = format!("s.maxLat >= {south} AND s.minLat <= {north}");
        if bounds.crosses_antimeridian() {
            let west = bind(params, bounds.west.into());
            let east = bind(params, bounds.east.into());
            clause.push_str(&format!(" AND (s.maxLng >= {west} OR s.minLng <= {east})"));
        } else {
            let west = bind(params, bounds.west.into());
            let east = bind(params, bounds.east.into());
            clause.push_str(&format!(" AND s.maxLng >= {west} AND s.minLng <= {east}"));
        }
        clause
    };

    if let Some(near) = near {
        let radius_m = units.to_meters(near.radius);
        let bbox = near.point.bounding_box(radius_m);
        wheres.push(bbox_clause(&mut params, &bbox));
        let dist = distance_expr.clone().expect("near implies an origin");
        let r = bind(&mut params, radius_m.into());
        wheres.push(format!("{dist} <= {r}"));
    }
    if let Some(bounds) = within {
        wheres.push(bbox_clause(&mut params, &bounds));
    }
    if let Some(nearest) = nearest {
        if let Some(max_distance) = nearest.max_distance {
            let max_m = units.to_meters(max_distance);
            let dist = distance_expr.clone().expect("nearest implies an origin");
            let p = bind(&mut params, max_m.into());
            wheres.push(format!("{dist} <= {p}"));
        }
    }

    for filter in &query.filters {
        wheres.push(filter_clause(filter, &mut params, &mut bind)?);
    }

    let where_sql = if wheres.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", wheres.join(" AND "))
    };

    if matches!(shape, SqlShape::Count) {
        let sql = format!(r#"SELECT COUNT(*) FROM "{n}" d{joins}{where_sql}"#);
        return Ok(SqlPlan {
            sql,
            params,
            has_distance: false,
            post_sort_distance: false,
            paginate_in_memory: false,
            knn_k: None,
        });
    }

    let mut select = format!(
        r#"SELECT d.id, d.content, d.metadata, d.language, d.type, d.timestamp, d.indexed_at,
               {rank_expr} AS rank"#
    );
    if let Some(dist) = &distance_expr {
        select.push_str(&format!(", {dist} AS distance"));
        select.push_str(
            ", (s.minLat + s.maxLat) / 2.0 AS _lat, (s.minLng + s.maxLng) / 2.0 AS _lng",
        );
    }

    // Sort resolution. Distance sorts combined with an FTS MATCH are
    // re-sorted in memory; SQL ORDER BY over the computed distance together
    // with MATCH is unreliable on the backing engine.
    let mut post_sort_distance = false;
    let mut paginate_in_memory = false;
    let mut knn_k = None;
    let order_limit;
    if wants_distance_sort && has_match {
        post_sort_distance = true;
        paginate_in_memory = true;
        let cap = nearest
            .and_then(|_| geo.and_then(|g| g.candidate_cap))
            .unwrap_or_else(|| distance_fetch_ceiling(query.limit));
        if let Some(near) = nearest {
            knn_k = Some(near.k);
        }
        let p = bind(&mut params, (cap as i64).into());
        order_limit = format!(" ORDER BY rank ASC LIMIT {p}");
    } else if wants_distance_sort {
        let direction = match geo.and_then(|g| g.distance_sort) {
            Some(SortDirection::Desc) => "DESC",
            _ => "ASC",
        };
        if let Some(near) = nearest {
            knn_k = Some(near.k);
            paginate_in_memory = true;
            let cap = geo
                .and_then(|g| g.candidate_cap)
                .map_or(near.k, |cap| cap.max(near.k));
            let p = bind(&mut params, (cap as i64).into());
            order_limit = format!(" ORDER BY distance {direction} LIMIT {p}");
        } else {
            let l = bind(&mut params, (query.limit as i64).into());
            let o = bind(&mut params, (query.offset as i64).into());
            order_limit = format!(" ORDER BY distance {direction} LIMIT {l} OFFSET {o}");
        }
    } else {
        let order = if query.sort.is_empty() {
            if has_match {
                "rank ASC".to_string()
            } else {
                "d.timestamp DESC".to_string()
            }
        } else {
            let clauses: Vec<String> = query
                .sort
                .iter()
                .map(|spec| sort_clause(spec))
                .collect::<StorageResult<Vec<_>>>()?;
            clauses.join(", ")
        };
        let l = bind(&mut params, (query.limit as i64).into());
        let o = bind(&mut params, (query.offset as i64).into());
        order_limit = format!(" ORDER BY {order} LIMIT {l} OFFSET {o}");
    }

    let sql = format!(r#"{select} FROM "{n}" d{joins}{where_sql}{order_limit}"#);
    Ok(SqlPlan {
        sql,
        params,
        has_distance: distance_expr.is_some(),
        post_sort_distance,
        paginate_in_memory,
        knn_k,
    })
}

/// Translate one filter to SQL. Direct columns compare natively; metadata
/// paths go through `json_extract` with a numeric cast for ordered
/// comparisons on numbers.
fn filter_clause(
    filter: &Filter,
    params: &mut Vec<rusqlite::types::Value>,
    bind: &mut impl FnMut(&mut Vec<rusqlite::types::Value>, rusqlite::types::Value) -> String,
) -> StorageResult<String> {
    let target = if let Some(path) = filter.field.strip_prefix("metadata.") {
        validate_metadata_path(path)?;
        let extract = format!("json_extract(d.metadata, '$.{}')", path);
        if filter.value.is_number()
            && matches!(
                filter.operator,
                FilterOp::Gt | FilterOp::Lt | FilterOp::Gte | FilterOp::Lte
            )
        {
            format!("CAST({} AS REAL)", extract)
        } else {
            extract
        }
    } else {
        match filter.field.as_str() {
            "id" | "type" | "language" | "timestamp" => format!("d.\"{}\"", filter.field),
            other => return Err(StorageError::InvalidFilterField(other.to_string())),
        }
    };

    let clause = match filter.operator {
        FilterOp::Eq => format!("{} = {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::Ne => format!("{} != {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::Gt => format!("{} > {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::Lt => format!("{} < {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::Gte => format!("{} >= {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::Lte => format!("{} <= {}", target, bind(params, json_to_sql(&filter.value))),
        FilterOp::In => {
            let values: Vec<&Value> = match &filter.value {
                Value::Array(items) => items.iter().collect(),
                single => vec![single],
            };
            let binds: Vec<String> =
                values.into_iter().map(|v| bind(params, json_to_sql(v))).collect();
            format!("{} IN ({})", target, binds.join(", "))
        }
        FilterOp::Contains => {
            let needle = match &filter.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{} LIKE {}", target, bind(params, format!("%{}%", needle).into()))
        }
        FilterOp::Exists => format!("{} IS NOT NULL", target),
    };
    Ok(clause)
}

fn sort_clause(spec: &SortSpec) -> StorageResult<String> {
    let direction = match spec.direction {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    };
    let clause = match spec.field.as_str() {
        // BM25 is negative: a descending relevance sort is ascending rank.
        "_score" => match spec.direction {
            SortDirection::Desc => "rank ASC".to_string(),
            SortDirection::Asc => "rank DESC".to_string(),
        },
        "timestamp" | "id" | "type" | "language" => {
            format!("d.\"{}\" {}", spec.field, direction)
        }
        other => {
            if let Some(path) = other.strip_prefix("metadata.") {
                validate_metadata_path(path)?;
                format!("json_extract(d.metadata, '$.{}') {}", path, direction)
            } else {
                return Err(StorageError::InvalidFilterField(other.to_string()));
            }
        }
    };
    Ok(clause)
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<StoredDocument> {
    let content_json: String = row.get("content")?;
    let metadata_json: String = row.get("metadata")?;
    let parse = |json: &str| -> Map<String, Value> {
        serde_json::from_str(json).unwrap_or_default()
    };
    Ok(StoredDocument {
        id: row.get("id")?,
        content: parse(&content_json),
        metadata: parse(&metadata_json),
        language: row.get("language")?,
        doc_type: row.get("type")?,
        timestamp: row.get("timestamp")?,
        indexed_at: row.get("indexed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Bounds;

    fn memory_storage() -> Storage {
        Storage::open(":memory:", 5_000).unwrap()
    }

    fn prepared(id: &str, text: &str) -> PreparedDocument {
        PreparedDocument {
            id: id.to_string(),
            content_json: serde_json::json!({ "title": text }).to_string(),
            metadata_json: "{}".to_string(),
            language: Some("en".to_string()),
            doc_type: "default".to_string(),
            timestamp: 1_700_000_000,
            fts_text: FtsText::Single(text.to_lowercase()),
            terms: Vec::new(),
            spatial: None,
        }
    }

    fn prepared_geo(id: &str, text: &str, lat: f64, lng: f64) -> PreparedDocument {
        let mut doc = prepared(id, text);
        doc.spatial = Some(Bounds::new(lat, lat, lng, lng));
        doc
    }

    fn default_options() -> IndexOptions {
        IndexOptions { external_content: true, ..Default::default() }
    }

    fn match_query(expr: &str, limit: usize) -> StorageQuery {
        StorageQuery {
            match_expr: Some(expr.to_string()),
            limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_index_and_exists() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        assert!(storage.index_exists("movies").unwrap());
        assert!(!storage.index_exists("books").unwrap());
    }

    #[test]
    fn test_invalid_index_name_rejected() {
        let storage = memory_storage();
        let err = storage.create_index("bad-name; DROP", &default_options());
        assert!(matches!(err, Err(StorageError::InvalidIndexName(_))));
    }

    #[test]
    fn test_upsert_and_get_document() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();

        let doc = storage.get_document("movies", "1").unwrap().unwrap();
        assert_eq!(doc.id, "1");
        assert_eq!(doc.content["title"], "Star Wars");
        assert!(storage.get_document("movies", "missing").unwrap().is_none());
    }

    #[test]
    fn test_fts_match_returns_document() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();
        storage.upsert_document("movies", &prepared("2", "Alien")).unwrap();

        let rows = storage.search("movies", &match_query("star", 10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "1");
        assert!(rows[0].rank < 0.0, "bm25 rank is negative, got {}", rows[0].rank);
    }

    #[test]
    fn test_replace_document_updates_fts() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();
        storage.upsert_document("movies", &prepared("1", "Blade Runner")).unwrap();

        assert!(storage.search("movies", &match_query("star", 10)).unwrap().is_empty());
        let rows = storage.search("movies", &match_query("blade", 10)).unwrap();
        assert_eq!(rows.len(), 1);
        // Still a single docs row
        assert_eq!(storage.get_stats("movies").unwrap().document_count, 1);
    }

    #[test]
    fn test_delete_document_removes_all_rows() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared_geo("1", "Star Wars", 45.0, -122.0)).unwrap();

        let deleted = storage.delete_document("movies", "1").unwrap();
        assert_eq!(deleted, 1);
        assert!(storage.get_document("movies", "1").unwrap().is_none());
        assert!(storage.search("movies", &match_query("star", 10)).unwrap().is_empty());
        assert_eq!(storage.get_stats("movies").unwrap().document_count, 0);
    }

    #[test]
    fn test_replace_removes_stale_chunk_rows() {
        let storage = memory_storage();
        storage.create_index("docs", &default_options()).unwrap();
        storage.upsert_document("docs", &prepared("b", "bystander")).unwrap();
        storage
            .upsert_batch(
                "docs",
                &[
                    prepared("a#chunk0", "part one"),
                    prepared("a#chunk1", "part two"),
                    prepared("a#chunk2", "part three"),
                ],
            )
            .unwrap();
        assert_eq!(storage.get_stats("docs").unwrap().document_count, 4);

        // Re-index with fewer chunks: the third row must go
        storage
            .upsert_batch(
                "docs",
                &[
                    prepared("a#chunk0", "part one revised"),
                    prepared("a#chunk1", "part two revised"),
                ],
            )
            .unwrap();
        assert_eq!(storage.get_stats("docs").unwrap().document_count, 3);
        assert!(storage.search("docs", &match_query("three", 10)).unwrap().is_empty());

        // Re-index as a single unchunked row: every chunk row must go
        storage.upsert_batch("docs", &[prepared("a", "whole document")]).unwrap();
        assert_eq!(storage.get_stats("docs").unwrap().document_count, 2);
        assert!(storage.search("docs", &match_query("revised", 10)).unwrap().is_empty());
        assert_eq!(storage.search("docs", &match_query("whole", 10)).unwrap().len(), 1);

        // Back to chunks: the bare row must go
        storage
            .upsert_batch("docs", &[prepared("a#chunk0", "chunked again")])
            .unwrap();
        assert_eq!(storage.get_stats("docs").unwrap().document_count, 2);
        assert!(storage.search("docs", &match_query("whole", 10)).unwrap().is_empty());
        // The unrelated document never moved
        assert_eq!(storage.search("docs", &match_query("bystander", 10)).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_parent_removes_chunks() {
        let storage = memory_storage();
        storage.create_index("docs", &default_options()).unwrap();
        // A chunk family always lands in one batch
        storage
            .upsert_batch(
                "docs",
                &[
                    prepared("a#chunk0", "part one"),
                    prepared("a#chunk1", "part two"),
                    prepared("a#chunk2", "part three"),
                ],
            )
            .unwrap();
        storage.upsert_document("docs", &prepared("b", "unrelated")).unwrap();

        let deleted = storage.delete_document("docs", "a").unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(storage.get_stats("docs").unwrap().document_count, 1);
    }

    #[test]
    fn test_language_filter() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        let mut fr = prepared("1", "Etoile");
        fr.language = Some("fr".to_string());
        storage.upsert_document("movies", &fr).unwrap();
        storage.upsert_document("movies", &prepared("2", "Etoile")).unwrap();

        let q = StorageQuery {
            match_expr: Some("etoile".to_string()),
            language: Some("fr".to_string()),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("movies", &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "1");
    }

    #[test]
    fn test_metadata_filters() {
        let storage = memory_storage();
        storage.create_index("products", &default_options()).unwrap();
        for (id, price, category) in
            [("1", 100, "electronics"), ("2", 700, "electronics"), ("3", 50, "audio")]
        {
            let mut doc = prepared(id, "widget");
            doc.metadata_json =
                serde_json::json!({ "price": price, "category": category }).to_string();
            storage.upsert_document("products", &doc).unwrap();
        }

        let q = StorageQuery {
            match_expr: Some("widget".to_string()),
            filters: vec![Filter {
                field: "metadata.price".to_string(),
                operator: FilterOp::Lt,
                value: serde_json::json!(500),
            }],
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("products", &q).unwrap();
        let mut ids: Vec<&str> = rows.iter().map(|r| r.doc.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "3"]);

        let q = StorageQuery {
            match_expr: Some("widget".to_string()),
            filters: vec![Filter {
                field: "metadata.category".to_string(),
                operator: FilterOp::In,
                value: serde_json::json!(["audio"]),
            }],
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("products", &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "3");

        let q = StorageQuery {
            filters: vec![Filter {
                field: "metadata.category".to_string(),
                operator: FilterOp::Exists,
                value: Value::Null,
            }],
            limit: 10,
            ..Default::default()
        };
        assert_eq!(storage.count("products", &q).unwrap(), 3);
    }

    #[test]
    fn test_unknown_filter_field_rejected() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        let q = StorageQuery {
            filters: vec![Filter {
                field: "nope; DROP TABLE".to_string(),
                operator: FilterOp::Eq,
                value: serde_json::json!(1),
            }],
            limit: 10,
            ..Default::default()
        };
        assert!(matches!(
            storage.search("movies", &q),
            Err(StorageError::InvalidFilterField(_))
        ));
    }

    #[test]
    fn test_radius_search_filters_by_distance() {
        let storage = memory_storage();
        storage.create_index("shops", &default_options()).unwrap();
        storage
            .upsert_document("shops", &prepared_geo("pdx", "coffee shop", 45.5152, -122.6734))
            .unwrap();
        storage
            .upsert_document("shops", &prepared_geo("sea", "coffee shop", 47.6145, -122.3278))
            .unwrap();

        let q = StorageQuery {
            match_expr: Some("coffee".to_string()),
            geo: Some(GeoFilters {
                near: Some(crate::interface::GeoNear {
                    point: Point::new(45.5152, -122.6784),
                    radius: 5.0,
                }),
                units: crate::geo::DistanceUnit::Km,
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("shops", &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "pdx");
        assert!(rows[0].distance.unwrap() <= 5_000.0);
    }

    #[test]
    fn test_within_bounds_across_antimeridian() {
        let storage = memory_storage();
        storage.create_index("points", &default_options()).unwrap();
        storage.upsert_document("points", &prepared_geo("east", "island", 0.0, 179.0)).unwrap();
        storage.upsert_document("points", &prepared_geo("west", "island", 0.0, -179.0)).unwrap();
        storage.upsert_document("points", &prepared_geo("far", "island", 0.0, 0.0)).unwrap();

        let q = StorageQuery {
            match_expr: Some("island".to_string()),
            geo: Some(GeoFilters {
                within: Some(Bounds::new(10.0, -10.0, -170.0, 170.0)),
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("points", &q).unwrap();
        let mut ids: Vec<&str> = rows.iter().map(|r| r.doc.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["east", "west"]);
    }

    #[test]
    fn test_knn_returns_k_nearest_sorted() {
        let storage = memory_storage();
        storage.create_index("cities", &default_options()).unwrap();
        storage.upsert_document("cities", &prepared_geo("a", "city", 45.0, -122.0)).unwrap();
        storage.upsert_document("cities", &prepared_geo("b", "city", 45.5, -122.0)).unwrap();
        storage.upsert_document("cities", &prepared_geo("c", "city", 46.5, -122.0)).unwrap();
        storage.upsert_document("cities", &prepared_geo("d", "city", 48.0, -122.0)).unwrap();

        let q = StorageQuery {
            geo: Some(GeoFilters {
                nearest: Some(crate::interface::GeoNearest {
                    point: Point::new(45.1, -122.0),
                    k: 2,
                    max_distance: None,
                }),
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("cities", &q).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc.id, "a");
        assert_eq!(rows[1].doc.id, "b");
        assert!(rows[0].distance.unwrap() <= rows[1].distance.unwrap());
    }

    #[test]
    fn test_distance_sort_with_match_post_sorts() {
        let storage = memory_storage();
        storage.create_index("shops", &default_options()).unwrap();
        storage.upsert_document("shops", &prepared_geo("far", "coffee", 47.6, -122.3)).unwrap();
        storage.upsert_document("shops", &prepared_geo("close", "coffee", 45.52, -122.68)).unwrap();

        let q = StorageQuery {
            match_expr: Some("coffee".to_string()),
            geo: Some(GeoFilters {
                near: Some(crate::interface::GeoNear {
                    point: Point::new(45.5152, -122.6784),
                    radius: 500.0,
                }),
                distance_sort: Some(SortDirection::Asc),
                units: crate::geo::DistanceUnit::Km,
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("shops", &q).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc.id, "close");
        assert!(rows[0].distance.unwrap() <= rows[1].distance.unwrap());
    }

    #[test]
    fn test_count_matches_search_total() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        for i in 0..25 {
            storage.upsert_document("movies", &prepared(&format!("m{}", i), "space opera")).unwrap();
        }
        let q = match_query("space", 10);
        assert_eq!(storage.count("movies", &q).unwrap(), 25);
        assert_eq!(storage.search("movies", &q).unwrap().len(), 10);
    }

    #[test]
    fn test_sort_by_metadata_and_score() {
        let storage = memory_storage();
        storage.create_index("products", &default_options()).unwrap();
        for (id, price) in [("a", 30), ("b", 10), ("c", 20)] {
            let mut doc = prepared(id, "widget");
            doc.metadata_json = serde_json::json!({ "price": price }).to_string();
            storage.upsert_document("products", &doc).unwrap();
        }
        let q = StorageQuery {
            match_expr: Some("widget".to_string()),
            sort: vec![SortSpec {
                field: "metadata.price".to_string(),
                direction: SortDirection::Asc,
            }],
            limit: 10,
            ..Default::default()
        };
        let ids: Vec<String> =
            storage.search("products", &q).unwrap().into_iter().map(|r| r.doc.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_generation_bumps_on_writes() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        let g0 = storage.generation("movies").unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();
        let g1 = storage.generation("movies").unwrap();
        assert!(g1 > g0);
        storage.delete_document("movies", "1").unwrap();
        assert!(storage.generation("movies").unwrap() > g1);
    }

    #[test]
    fn test_vocabulary_from_fts() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "gladiator arena")).unwrap();
        storage.upsert_document("movies", &prepared("2", "gladiator sequel")).unwrap();

        let vocab = storage.vocabulary("movies", 100).unwrap();
        let gladiator = vocab.iter().find(|(t, _)| t == "gladiator").unwrap();
        assert_eq!(gladiator.1, 2, "row vocabulary counts documents");
    }

    #[test]
    fn test_vocabulary_from_terms_table() {
        let storage = memory_storage();
        let options = IndexOptions { with_terms: true, ..default_options() };
        storage.create_index("movies", &options).unwrap();
        let mut doc = prepared("1", "gladiator");
        doc.terms = vec![TermPosting {
            term: "gladiator".to_string(),
            field: "title".to_string(),
            frequency: 3,
            positions: vec![0],
        }];
        storage.upsert_document("movies", &doc).unwrap();

        let vocab = storage.vocabulary("movies", 100).unwrap();
        assert_eq!(vocab, vec![("gladiator".to_string(), 3)]);
    }

    #[test]
    fn test_clear_keeps_schema() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();
        storage.clear("movies").unwrap();
        assert!(storage.index_exists("movies").unwrap());
        assert_eq!(storage.get_stats("movies").unwrap().document_count, 0);
        assert!(storage.search("movies", &match_query("star", 10)).unwrap().is_empty());
    }

    #[test]
    fn test_drop_index_removes_tables() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.drop_index("movies").unwrap();
        assert!(!storage.index_exists("movies").unwrap());
    }

    #[test]
    fn test_list_indices() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.create_index("books", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();

        let indices = storage.list_indices().unwrap();
        let names: Vec<&str> = indices.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["books", "movies"]);
        let movies = indices.iter().find(|i| i.name == "movies").unwrap();
        assert_eq!(movies.document_count, 1);
        assert_eq!(movies.languages, vec!["en"]);
    }

    #[test]
    fn test_legacy_mode_roundtrip() {
        let storage = memory_storage();
        let options = IndexOptions { external_content: false, ..Default::default() };
        storage.create_index("legacy_idx", &options).unwrap();
        storage
            .upsert_document("legacy_idx", &prepared_geo("doc-1", "old school", 45.0, -122.0))
            .unwrap();

        let rows = storage.search("legacy_idx", &match_query("school", 10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "doc-1");

        // Geo search goes through the id map
        let q = StorageQuery {
            match_expr: Some("school".to_string()),
            geo: Some(GeoFilters {
                near: Some(crate::interface::GeoNear {
                    point: Point::new(45.0, -122.0),
                    radius: 1.0,
                }),
                units: crate::geo::DistanceUnit::Km,
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        assert_eq!(storage.search("legacy_idx", &q).unwrap().len(), 1);

        storage.delete_document("legacy_idx", "doc-1").unwrap();
        assert!(storage.search("legacy_idx", &match_query("school", 10)).unwrap().is_empty());
    }

    #[test]
    fn test_migrate_legacy_to_external_content() {
        let storage = memory_storage();
        let options = IndexOptions { external_content: false, ..Default::default() };
        storage.create_index("mig", &options).unwrap();
        storage.upsert_document("mig", &prepared_geo("1", "migrating data", 45.0, -122.0)).unwrap();
        storage.upsert_document("mig", &prepared("2", "plain doc")).unwrap();

        storage.migrate_to_external_content("mig").unwrap();

        let schema = storage.schema("mig").unwrap();
        assert_eq!(schema.mode, SchemaMode::ExternalContent);
        // FTS still answers
        let rows = storage.search("mig", &match_query("migrating", 10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "1");
        // Spatial row carried over to the new doc_id
        let q = StorageQuery {
            match_expr: None,
            geo: Some(GeoFilters {
                near: Some(crate::interface::GeoNear {
                    point: Point::new(45.0, -122.0),
                    radius: 1.0,
                }),
                units: crate::geo::DistanceUnit::Km,
                ..Default::default()
            }),
            limit: 10,
            ..Default::default()
        };
        let rows = storage.search("mig", &q).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "1");
        // Writes keep working after migration
        storage.upsert_document("mig", &prepared("3", "post migration")).unwrap();
        assert_eq!(storage.search("mig", &match_query("post", 10)).unwrap().len(), 1);
    }

    #[test]
    fn test_multi_column_fts_with_weights() {
        let storage = memory_storage();
        let options = IndexOptions {
            external_content: true,
            multi_columns: Some(vec![("title".to_string(), 3.0), ("body".to_string(), 1.0)]),
            ..Default::default()
        };
        storage.create_index("articles", &options).unwrap();

        let mut title_hit = prepared("t", "ignored");
        title_hit.fts_text =
            FtsText::Multi(vec!["rust ownership".to_string(), "a long body".to_string()]);
        let mut body_hit = prepared("b", "ignored");
        body_hit.fts_text =
            FtsText::Multi(vec!["other things".to_string(), "rust mentioned in body".to_string()]);
        storage.upsert_document("articles", &title_hit).unwrap();
        storage.upsert_document("articles", &body_hit).unwrap();

        let rows = storage.search("articles", &match_query("rust", 10)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc.id, "t", "title match outranks body match");

        // Column-restricted match
        let rows = storage.search("articles", &match_query("ft_title: rust", 10)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].doc.id, "t");
    }

    #[test]
    fn test_optimize_runs() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        storage.upsert_document("movies", &prepared("1", "Star Wars")).unwrap();
        storage.optimize("movies").unwrap();
    }

    #[test]
    fn test_batch_rolls_back_on_failure() {
        let storage = memory_storage();
        storage.create_index("movies", &default_options()).unwrap();
        let good = prepared("ok", "fine document");
        let mut bad = prepared("ok2", "fine too");
        // Force a failure: spatial insert against a dropped table
        bad.spatial = Some(Bounds::new(1.0, 0.0, 1.0, 0.0));
        {
            let conn = storage.conn().unwrap();
            conn.execute_batch(r#"DROP TABLE "movies_spatial""#).unwrap();
        }
        let result = storage.upsert_batch("movies", &[good, bad]);
        assert!(result.is_err());
        assert_eq!(storage.get_stats("movies").unwrap().document_count, 0, "batch rolled back");
    }
}
