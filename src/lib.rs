//! # kbsearch
//!
//! In-process full-text search core for mainframe knowledge bases.
//!
//! The crate couples a positional inverted index, a Lucene-flavoured query
//! language, Porter-style stemming with domain overrides, multi-algorithm
//! fuzzy matching, BM25-family ranking, and a tiered cache behind one
//! orchestrator with a hard per-search deadline.
//!
//! ## Example
//!
//! ```no_run
//! use kbsearch::config::SearchConfig;
//! use kbsearch::engine::SearchEngine;
//! use kbsearch::models::SearchOptions;
//!
//! # async fn run(docs: Vec<kbsearch::models::Document>) -> Result<(), kbsearch::errors::SearchError> {
//! let engine = SearchEngine::new(SearchConfig::default());
//! engine.initialize(docs).await?;
//!
//! let response = engine.search("S0C7 abend", &SearchOptions::default()).await?;
//! println!("{} results in {} ms", response.total, response.metrics.query_time_ms);
//!
//! let suggestions = engine.suggest("vs", 5);
//! let corrections = engine.correct("databse");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`text`] - normalize, tokenize, classify, and stem field text
//! - [`fuzzy`] - Levenshtein/Damerau/Jaro/Jaro-Winkler/Soundex/Metaphone
//!   matching with a weighted combiner
//! - [`index`] - the positional inverted index with incremental updates and
//!   versioned snapshots
//! - [`query`] - recursive-descent parser for the query language
//! - [`ranking`] - BM25 / TF-IDF / combined / domain-custom scoring with
//!   auditable explanations
//! - [`cache`] - L1/L2/optional-L3 tiered cache with pluggable eviction
//! - [`engine`] - the orchestrator: pipeline, deadline, concurrency cap,
//!   in-flight deduplication, metrics

pub mod cache;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod fuzzy;
pub mod index;
pub mod models;
pub mod query;
pub mod ranking;
pub mod text;

pub use config::SearchConfig;
pub use engine::SearchEngine;
pub use errors::SearchError;
pub use models::{Document, SearchOptions, SearchResponse};
