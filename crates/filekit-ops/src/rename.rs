//! Rename preview and commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Local;
use compact_str::CompactString;
use filekit_core::{
    AppConfig, FileEntry, FsError, OperationError, OperationKind, OperationResult, PathGuard,
    ProgressSink, ProgressTracker, details, file_name_of, lock,
};
use filekit_exec::{CancellationToken, ConcurrencyController, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::rule::{RenameRule, RuleInput, validate_name};

/// An entry a rule is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameCandidate {
    pub path: PathBuf,
    pub name: CompactString,
    pub is_directory: bool,
}

impl RenameCandidate {
    pub fn new(path: impl Into<PathBuf>, is_directory: bool) -> Self {
        let path = path.into();
        Self {
            name: file_name_of(&path),
            path,
            is_directory,
        }
    }
}

impl From<FileEntry> for RenameCandidate {
    fn from(entry: FileEntry) -> Self {
        Self {
            path: entry.full_path,
            name: entry.file_name,
            is_directory: entry.is_directory,
        }
    }
}

/// What a rule would do to one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenamePreviewEntry {
    pub path: PathBuf,
    pub name: CompactString,
    pub new_name: String,
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// A rename to commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameItem {
    pub path: PathBuf,
    pub new_name: String,
}

fn parent_name(path: &Path) -> String {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Apply `rule` to every candidate, in order.
pub fn apply_rule(
    candidates: &[RenameCandidate],
    rule: &RenameRule,
) -> Result<Vec<String>, FsError> {
    let compiled = rule.compile()?;
    let now = Local::now();
    Ok(candidates
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            let parent = parent_name(&candidate.path);
            compiled.apply(&RuleInput {
                name: &candidate.name,
                parent: &parent,
                index,
                now,
            })
        })
        .collect())
}

/// Whether `a` and `b` name the same file, e.g. a case-only rename on a
/// case-insensitive filesystem.
fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Why renaming `path` to `new_name` cannot work, judged from the filesystem.
fn conflict_reason(path: &Path, new_path: &Path) -> Option<String> {
    if std::fs::symlink_metadata(new_path).is_ok() && !same_file(path, new_path) {
        let name = new_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Some(format!("'{name}' already exists"));
    }
    None
}

/// Compute what `rule` would do to each candidate without touching anything.
///
/// Entries get an error when the new name is invalid, when it collides with
/// an existing file, or when two candidates would end up at the same path.
pub fn preview_rename(
    candidates: &[RenameCandidate],
    rule: &RenameRule,
) -> Result<Vec<RenamePreviewEntry>, FsError> {
    let new_names = apply_rule(candidates, rule)?;

    let mut targets: HashMap<PathBuf, usize> = HashMap::new();
    for (candidate, new_name) in candidates.iter().zip(&new_names) {
        if new_name != candidate.name.as_str() {
            *targets.entry(sibling(&candidate.path, new_name)).or_default() += 1;
        }
    }

    Ok(candidates
        .iter()
        .zip(new_names)
        .map(|(candidate, new_name)| {
            let error = if new_name == candidate.name.as_str() {
                None
            } else if let Err(reason) = validate_name(&new_name) {
                Some(reason)
            } else {
                let new_path = sibling(&candidate.path, &new_name);
                if targets.get(&new_path).copied().unwrap_or(0) > 1 {
                    Some(format!("'{new_name}' is produced for more than one entry"))
                } else {
                    conflict_reason(&candidate.path, &new_path)
                }
            };

            RenamePreviewEntry {
                path: candidate.path.clone(),
                name: candidate.name.clone(),
                new_name,
                has_error: error.is_some(),
                error_message: error,
            }
        })
        .collect())
}

fn sibling(path: &Path, new_name: &str) -> PathBuf {
    path.parent().unwrap_or(Path::new("")).join(new_name)
}

/// Applies rename rules and commits renames in batches.
pub struct RenameEngine {
    config: RwLock<Arc<AppConfig>>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for RenameEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenameEngine").finish_non_exhaustive()
    }
}

impl RenameEngine {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config: RwLock::new(config),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn reconfigure(&self, config: Arc<AppConfig>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> Arc<AppConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop running commits before their next group of items.
    pub fn cancel(&self) {
        let mut token = lock(&self.cancel);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Preview on a blocking thread. Safe to call as often as needed.
    pub async fn preview(
        &self,
        candidates: Vec<RenameCandidate>,
        rule: RenameRule,
    ) -> Result<Vec<RenamePreviewEntry>, FsError> {
        tokio::task::spawn_blocking(move || preview_rename(&candidates, &rule))
            .await
            .map_err(|e| FsError::Unknown {
                message: format!("preview task failed: {e}"),
            })?
    }

    /// Apply `rule` and commit the result.
    pub async fn rename_batch(
        &self,
        candidates: &[RenameCandidate],
        rule: &RenameRule,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<OperationResult, FsError> {
        let new_names = apply_rule(candidates, rule)?;
        let items: Vec<RenameItem> = candidates
            .iter()
            .zip(new_names)
            .map(|(candidate, new_name)| RenameItem {
                path: candidate.path.clone(),
                new_name,
            })
            .collect();
        self.rename_files(&items, sink).await
    }

    /// Commit a list of renames.
    ///
    /// Each target is checked again right before its rename; an item whose
    /// target appeared since the preview fails on its own. Renaming to the
    /// current name succeeds without a filesystem call.
    pub async fn rename_files(
        &self,
        items: &[RenameItem],
        sink: Arc<dyn ProgressSink>,
    ) -> Result<OperationResult, FsError> {
        if items.is_empty() {
            return Err(FsError::InvalidRequest {
                message: "at least one item is required".to_string(),
            });
        }

        let config = self.config();
        let guard = PathGuard::new(&config.security);
        let retry = RetryPolicy::from(&config.retry);
        let cancel = lock(&self.cancel).child_token();
        let tracker = ProgressTracker::new(items.len() as u64, sink);
        tracker.start();

        // Later items aiming at a path an earlier item already claimed fail.
        let mut claimed: HashMap<PathBuf, usize> = HashMap::new();
        let duplicates: Vec<bool> = items
            .iter()
            .enumerate()
            .map(|(index, item)| {
                let target = sibling(&item.path, &item.new_name);
                *claimed.entry(target).or_insert(index) != index
            })
            .collect();

        let controller = ConcurrencyController::new(config.batch.concurrency);
        let tasks = items.iter().zip(duplicates).map(|(item, duplicate)| {
            let (guard, retry, tracker) = (&guard, &retry, &tracker);
            async move {
                let outcome = if duplicate {
                    Err(FsError::AlreadyExists {
                        path: sibling(&item.path, &item.new_name),
                    })
                } else {
                    rename_one(item, guard, retry).await
                };
                tracker.update(
                    1,
                    Some("renaming"),
                    Some(details([("currentFile", item.path.display().to_string())])),
                );
                outcome.map_err(|e| OperationError::new(&item.path, OperationKind::Rename, &e))
            }
        });

        let run = controller
            .run_in_batches_cancellable(tasks, config.batch.size, &cancel)
            .await?;

        let mut result = OperationResult::new(OperationKind::Rename);
        for outcome in run.results {
            match outcome {
                Ok(()) => result.record_success(),
                Err(error) => {
                    debug!(error = %error, "Rename failed");
                    result.record_failure(error);
                }
            }
        }
        result.cancelled = run.cancelled;

        tracker.complete(
            result.cancelled.then_some("cancelled"),
            Some(details([("success", result.success), ("failed", result.failed)])),
        );
        info!(
            success = result.success,
            failed = result.failed,
            cancelled = result.cancelled,
            "Rename batch finished"
        );
        Ok(result)
    }
}

async fn rename_one(item: &RenameItem, guard: &PathGuard, retry: &RetryPolicy) -> Result<(), FsError> {
    guard.check(&item.path)?;
    let current = file_name_of(&item.path);
    if current.as_str() == item.new_name {
        return Ok(());
    }
    validate_name(&item.new_name).map_err(|reason| FsError::invalid_path(&item.path, reason))?;

    let new_path = sibling(&item.path, &item.new_name);
    guard.check(&new_path)?;

    retry
        .run("rename", || {
            let (from, to) = (item.path.clone(), new_path.clone());
            async move {
                tokio::task::spawn_blocking(move || {
                    std::fs::symlink_metadata(&from)
                        .map_err(|e| FsError::io(&from, OperationKind::Rename, e))?;
                    if conflict_reason(&from, &to).is_some() {
                        return Err(FsError::AlreadyExists { path: to });
                    }
                    std::fs::rename(&from, &to).map_err(|e| FsError::io(&from, OperationKind::Rename, e))
                })
                .await
                .map_err(|e| FsError::Unknown {
                    message: format!("rename task failed: {e}"),
                })?
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn candidates(dir: &Path, names: &[&str]) -> Vec<RenameCandidate> {
        names
            .iter()
            .map(|n| {
                let path = dir.join(n);
                fs::write(&path, "").unwrap();
                RenameCandidate::new(path, false)
            })
            .collect()
    }

    #[test]
    fn test_preview_is_side_effect_free() {
        let temp = TempDir::new().unwrap();
        let list = candidates(temp.path(), &["IMG_001.JPG", "notes.txt"]);
        let rule = RenameRule::Regex {
            pattern: r"IMG_(\d+)".into(),
            replacement: "Photo_$1".into(),
            global: true,
            case_insensitive: false,
        };

        let first = preview_rename(&list, &rule).unwrap();
        let second = preview_rename(&list, &rule).unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].new_name, "Photo_001.JPG");
        assert!(!first[0].has_error);
        assert_eq!(first[1].new_name, "notes.txt");
        assert!(temp.path().join("IMG_001.JPG").exists());
    }

    #[test]
    fn test_preview_flags_conflicts_and_duplicates() {
        let temp = TempDir::new().unwrap();
        let list = candidates(temp.path(), &["a.txt", "b.txt", "c.log"]);
        fs::write(temp.path().join("taken.log"), "").unwrap();

        let rule = RenameRule::Replace {
            search: "c".into(),
            replace: "taken".into(),
            use_regex: false,
            case_insensitive: false,
        };
        let preview = preview_rename(&list, &rule).unwrap();
        assert!(preview[2].has_error);
        assert!(preview[2].error_message.as_deref().unwrap().contains("exists"));

        let rule = RenameRule::Template {
            template: "same.{ext}".into(),
        };
        let preview = preview_rename(&list, &rule).unwrap();
        assert!(preview[0].has_error && preview[1].has_error);
        assert!(!preview[2].has_error);
    }

    #[test]
    fn test_preview_flags_invalid_names() {
        let temp = TempDir::new().unwrap();
        let list = candidates(temp.path(), &["a.txt"]);
        let rule = RenameRule::Prefix {
            prefix: "dir/".into(),
        };
        let preview = preview_rename(&list, &rule).unwrap();
        assert!(preview[0].has_error);
    }
}
