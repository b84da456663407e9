//! Directory search engine for filekit.
//!
//! This crate finds files by name, metadata and content, and ranks entries
//! for quick lookups.
//!
//! # Overview
//!
//! - **Batched async traversal** with cancellation and a result limit
//! - **Name filters**: wildcards, `*.{a,b}` extension lists, substrings, regex
//! - **Content search** with binary detection, size caps and context lines
//! - **Quick search and a flat JSON index** scored by name/path relevance
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use filekit_core::{AppConfig, NoopSink};
//! use filekit_search::{SearchEngine, SearchQuery};
//!
//! # async fn demo() -> Result<(), filekit_core::FsError> {
//! let engine = SearchEngine::new(Arc::new(AppConfig::default()));
//! let query = SearchQuery::builder("/var/log")
//!     .content_pattern("error")
//!     .build()
//!     .expect("valid query");
//! let report = engine.search(&query, Arc::new(NoopSink)).await?;
//! println!("{} files matched", report.hits.len());
//! # Ok(())
//! # }
//! ```

mod binary;
mod engine;
mod grep;
mod index;
mod matcher;
mod query;
mod rank;

pub use binary::{SAMPLE_SIZE, is_binary};
pub use engine::SearchEngine;
pub use grep::{ContentPattern, GrepOptions, GrepOutcome, SkipReason, grep_path, scan_lines};
pub use index::{
    INDEX_FILE_NAME, IndexEntry, IndexStats, build_index, load_index, search_with_index,
};
pub use matcher::{ExcludeSet, NameMatcher};
pub use query::{
    DEFAULT_MAX_CONTENT_SIZE, LineMatch, RankedEntry, SearchHits, SearchMatch, SearchQuery,
    SearchQueryBuilder, SearchReport, SearchState,
};
pub use rank::{query_terms, rank, score};
