//! Search request and result types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use derive_builder::Builder;
use filekit_core::FileEntry;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Content size cap used when a query does not set one.
pub const DEFAULT_MAX_CONTENT_SIZE: u64 = 10 * filekit_core::MIB;

/// An immutable search request.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Root directory of the traversal.
    pub directory: PathBuf,

    /// Optional name pattern: wildcard, `*.{a,b}` extension list, substring or regex.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub name_pattern: Option<String>,

    /// Extension allow-list (`jpg` or `.jpg`). Empty means every file.
    #[builder(default)]
    #[serde(default)]
    pub extensions: Vec<String>,

    /// When set, results are per-file line matches instead of entries.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub content_pattern: Option<String>,

    #[builder(default = "false")]
    #[serde(default)]
    pub case_sensitive: bool,

    /// Treat patterns as regular expressions instead of literal text.
    #[builder(default = "false")]
    #[serde(default)]
    pub use_regex: bool,

    /// Glob patterns; matching entries are skipped and not descended into.
    #[builder(default)]
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Largest file whose content is searched.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_file_size: Option<u64>,

    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Stop once this many results were collected.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_results: Option<usize>,

    /// Deepest level to enter; capped by configuration.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_depth: Option<usize>,

    /// Lines of context around each content hit.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub context_lines: Option<usize>,

    /// Also report directories whose name matches.
    #[builder(default = "false")]
    #[serde(default)]
    pub include_directories: bool,

    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub min_size: Option<u64>,

    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_size: Option<u64>,

    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub modified_after: Option<DateTime<Utc>>,

    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub modified_before: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl SearchQueryBuilder {
    fn validate(&self) -> Result<(), String> {
        match self.directory {
            Some(ref dir) if dir.as_os_str().is_empty() => {
                Err("Search directory cannot be empty".to_string())
            }
            None => Err("Search directory is required".to_string()),
            _ => Ok(()),
        }
    }
}

impl SearchQuery {
    /// Start building a query rooted at `directory`.
    pub fn builder(directory: impl Into<PathBuf>) -> SearchQueryBuilder {
        let mut builder = SearchQueryBuilder::default();
        builder.directory(directory);
        builder
    }

    /// Whether any filter needs file metadata.
    pub(crate) fn needs_metadata(&self) -> bool {
        self.min_size.is_some()
            || self.max_size.is_some()
            || self.modified_after.is_some()
            || self.modified_before.is_some()
    }
}

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineMatch {
    /// 1-based line number.
    pub line: usize,
    pub content: String,
    /// Surrounding lines; the hit itself is prefixed with `>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<String>>,
}

/// All hits inside one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchMatch {
    pub file_path: PathBuf,
    pub file_name: CompactString,
    pub line_matches: Vec<LineMatch>,
}

/// Hits of a search: entries for name searches, line matches for grep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "items", rename_all = "camelCase")]
pub enum SearchHits {
    Files(Vec<FileEntry>),
    Matches(Vec<SearchMatch>),
}

impl SearchHits {
    pub fn len(&self) -> usize {
        match self {
            Self::Files(files) => files.len(),
            Self::Matches(matches) => matches.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SearchState {
    Idle,
    Traversing,
    Cancelled,
    Completed,
    Errored,
}

/// Result of [`SearchEngine::search`](crate::SearchEngine::search).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchReport {
    pub hits: SearchHits,
    /// Traversal stopped early; `hits` holds what was found until then.
    pub cancelled: bool,
    /// Entries looked at.
    pub visited: u64,
    /// Files skipped by content search (binary, oversized or unreadable).
    pub skipped_files: u64,
}

/// A ranked name/path hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedEntry {
    pub path: PathBuf,
    pub name: CompactString,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<PathBuf>,
    pub is_directory: bool,
    pub score: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let query = SearchQuery::builder("/data").build().unwrap();
        assert!(query.recursive);
        assert!(!query.case_sensitive);
        assert!(query.content_pattern.is_none());
        assert!(!query.needs_metadata());
    }

    #[test]
    fn test_builder_requires_directory() {
        assert!(SearchQueryBuilder::default().build().is_err());
        assert!(SearchQuery::builder("").build().is_err());
    }

    #[test]
    fn test_hits_serialization_is_tagged() {
        let hits = SearchHits::Files(vec![FileEntry::file("/a/b.txt")]);
        let json = serde_json::to_value(&hits).unwrap();
        assert_eq!(json["kind"], "files");
        assert_eq!(json["items"][0]["fileName"], "b.txt");
    }
}
