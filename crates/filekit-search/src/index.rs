//! Flat JSON index cache.
//!
//! The index is a plain list of entries written next to the indexed tree. It
//! only saves a traversal; lookups still score every entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use filekit_core::{FsError, OperationKind};
use jwalk::{Parallelism, WalkDir};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::matcher::ExcludeSet;
use crate::query::RankedEntry;
use crate::rank;

/// File name of the index inside the indexed directory.
pub const INDEX_FILE_NAME: &str = ".file_index.json";

/// One indexed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    pub path: PathBuf,
    pub name: CompactString,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

/// Summary of a built index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Length of the compact JSON encoding, in bytes.
    pub index_size: u64,
    pub file_count: u64,
    pub directory_count: u64,
}

/// Walk `directory` and write [`INDEX_FILE_NAME`] into it.
pub fn build_index(
    directory: &Path,
    excludes: &ExcludeSet,
    max_depth: usize,
) -> Result<(IndexStats, PathBuf), FsError> {
    let root = directory
        .canonicalize()
        .map_err(|e| FsError::io(directory, OperationKind::List, e))?;
    if !root.is_dir() {
        return Err(FsError::invalid_path(&root, "not a directory"));
    }

    let excludes = Arc::new(excludes.clone());
    let walker = WalkDir::new(&root)
        .parallelism(Parallelism::RayonDefaultPool {
            busy_timeout: std::time::Duration::from_millis(100),
        })
        .skip_hidden(false)
        .follow_links(false)
        .min_depth(1)
        .max_depth(max_depth)
        .sort(true)
        .process_read_dir(move |_depth, _path, _state, children| {
            children.retain(|child| match child {
                Ok(entry) => {
                    let path = entry.path();
                    entry.file_name() != INDEX_FILE_NAME && !excludes.is_excluded(&path)
                }
                Err(_) => true,
            });
        });

    let mut entries = Vec::new();
    let mut stats = IndexStats {
        index_size: 0,
        file_count: 0,
        directory_count: 0,
    };

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry while indexing");
                continue;
            }
        };
        let file_type = entry.file_type();
        let path = entry.path();
        let name = CompactString::from(entry.file_name().to_string_lossy());

        if file_type.is_dir() {
            stats.directory_count += 1;
            entries.push(IndexEntry {
                path,
                name,
                is_directory: true,
                size: None,
                modified: None,
            });
        } else if file_type.is_file() {
            stats.file_count += 1;
            let metadata = entry.metadata().ok();
            entries.push(IndexEntry {
                path,
                name,
                is_directory: false,
                size: metadata.as_ref().map(|m| m.len()),
                modified: metadata
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }
    }

    let compact = serde_json::to_vec(&entries).map_err(|e| FsError::Unknown {
        message: format!("failed to encode index: {e}"),
    })?;
    stats.index_size = compact.len() as u64;

    let pretty = serde_json::to_vec_pretty(&entries).map_err(|e| FsError::Unknown {
        message: format!("failed to encode index: {e}"),
    })?;
    let index_path = root.join(INDEX_FILE_NAME);
    std::fs::write(&index_path, pretty)
        .map_err(|e| FsError::io(&index_path, OperationKind::Write, e))?;

    debug!(
        path = %index_path.display(),
        files = stats.file_count,
        dirs = stats.directory_count,
        "Index written"
    );
    Ok((stats, index_path))
}

/// Load an index file.
pub fn load_index(index_path: &Path) -> Result<Vec<IndexEntry>, FsError> {
    let data =
        std::fs::read(index_path).map_err(|e| FsError::io(index_path, OperationKind::Read, e))?;
    serde_json::from_slice(&data).map_err(|e| FsError::InvalidPath {
        path: index_path.to_path_buf(),
        reason: format!("not a valid index: {e}"),
    })
}

/// Score every indexed entry against `query` and return the best `max_results`.
pub fn search_with_index(
    index_path: &Path,
    query: &str,
    max_results: usize,
) -> Result<Vec<RankedEntry>, FsError> {
    let terms = rank::query_terms(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }
    let entries = load_index(index_path)?;

    let mut results: Vec<RankedEntry> = entries
        .into_par_iter()
        .filter_map(|entry| {
            let name = entry.name.to_lowercase();
            let path = entry.path.to_string_lossy().to_lowercase();
            let score = rank::score(&name, &path, &terms);
            (score > 0).then(|| RankedEntry {
                path: entry.path,
                name: entry.name,
                relative_path: None,
                is_directory: entry.is_directory,
                score,
            })
        })
        .collect();

    rank::rank(&mut results, max_results);
    Ok(results)
}
