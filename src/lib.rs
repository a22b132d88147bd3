//! Ferret: embeddable full-text and geospatial search over SQLite.
//!
//! Documents with arbitrary fields (and optional point/bounds geometry) are
//! indexed into named indices backed by FTS5 and R-tree virtual tables.
//! Queries combine free text, typo-tolerant expansion, metadata filters,
//! geospatial predicates, faceting and pagination, ranked by BM25 with
//! optional field-weighted re-scoring.
//!
//! ```no_run
//! use ferret::{Document, Ferret, SearchQuery};
//!
//! let ferret = Ferret::in_memory()?;
//! ferret.create_index("movies")?;
//! ferret.index("movies", Document::new("1").with_content("title", "Star Wars"))?;
//! ferret.flush("movies")?;
//! let results = ferret.search("movies", &SearchQuery::text("star wars"))?;
//! # Ok::<(), ferret::FerretError>(())
//! ```

pub mod analyzer;
pub mod config;
pub mod database;
pub mod fuzzy;
pub mod geo;
mod indexer;
pub mod interface;
mod models;
pub mod ranking;
mod search;
mod store;

pub use config::{FerretConfig, FuzzyAlgorithm};
pub use geo::{Bounds, DistanceUnit, Point};
pub use indexer::Indexer;
pub use interface::*;
pub use models::StoredDocument;
pub use search::SearchEngine;
pub use store::Ferret;
