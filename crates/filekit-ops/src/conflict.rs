//! Conflict detection and resolution for file operations.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use filekit_core::{FsError, OperationKind, lock};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What to do when an operation's target already exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConflictStrategy {
    /// Leave the existing target alone and count the item as skipped.
    #[default]
    Skip,
    /// Replace the existing target. Directories are merged entry by entry.
    Overwrite,
    /// Pick a free name such as `file (1).txt`.
    Rename,
    /// Hand the decision back to the caller.
    Ask,
}

/// How one item proceeds after conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write to this path.
    Proceed(PathBuf),
    /// Both sides are directories: resolve each entry inside on its own.
    Merge(PathBuf),
    /// Leave the item out.
    Skip,
    /// The target exists and the caller must decide.
    Unresolved,
}

/// Destinations already taken by the running batch.
///
/// A target written by an earlier item of the same batch counts as existing
/// even before that item has touched the disk.
#[derive(Debug, Clone, Default)]
pub struct Claims(Arc<Mutex<HashSet<PathBuf>>>);

impl Claims {
    /// Reserve `path`. Returns `false` when another item already holds it.
    pub fn claim(&self, path: &Path) -> bool {
        lock(&self.0).insert(path.to_path_buf())
    }
}

/// Resolve `target` for `source` under `strategy`.
///
/// `claimed_elsewhere` marks a target another item of the batch writes to; it
/// conflicts like an existing file. A directory landing on a directory is
/// never replaced as a whole: the result is [`Resolution::Merge`] and the
/// strategy applies to each entry. With [`ConflictStrategy::Overwrite`] an
/// existing file is removed first, but a target claimed by a sibling is an
/// [`FsError::AlreadyExists`] failure rather than a race on its output.
pub fn resolve(
    strategy: ConflictStrategy,
    source: &Path,
    target: &Path,
    operation: OperationKind,
    claims: &Claims,
    claimed_elsewhere: bool,
) -> Result<Resolution, FsError> {
    let existing = match std::fs::symlink_metadata(target) {
        Ok(metadata) => Some(metadata),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(FsError::io(target, operation, e)),
    };
    if existing.is_none() && !claimed_elsewhere {
        return Ok(Resolution::Proceed(target.to_path_buf()));
    }

    let target_is_dir = existing.as_ref().is_none_or(|m| m.is_dir());
    if source != target && target_is_dir && source.is_dir() {
        return Ok(Resolution::Merge(target.to_path_buf()));
    }

    match strategy {
        ConflictStrategy::Skip => Ok(Resolution::Skip),
        ConflictStrategy::Ask => Ok(Resolution::Unresolved),
        ConflictStrategy::Rename => Ok(Resolution::Proceed(unique_path(target, claims))),
        ConflictStrategy::Overwrite if claimed_elsewhere => Err(FsError::AlreadyExists {
            path: target.to_path_buf(),
        }),
        ConflictStrategy::Overwrite => {
            if let Some(existing) = existing {
                let removed = if existing.is_dir() {
                    std::fs::remove_dir_all(target)
                } else {
                    std::fs::remove_file(target)
                };
                removed.map_err(|e| FsError::io(target, operation, e))?;
            }
            Ok(Resolution::Proceed(target.to_path_buf()))
        }
    }
}

/// Whether `target` lies inside `source` (moving a directory into itself).
pub fn is_nested_in(source: &Path, target: &Path) -> bool {
    target != source && target.starts_with(source)
}

/// Generate and claim a free path next to `path`.
///
/// For "file.txt", tries "file (1).txt", "file (2).txt", etc. A name is free
/// when nothing exists on disk under it and no other item has claimed it.
pub fn unique_path(path: &Path, claims: &Claims) -> PathBuf {
    let mut taken = lock(&claims.0);
    let parent = path.parent().unwrap_or(Path::new(""));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, extension) = split_extension(&name);

    for i in 1..10_000 {
        let new_name = match extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };

        let new_path = parent.join(&new_name);
        if !taken.contains(&new_path) && std::fs::symlink_metadata(&new_path).is_err() {
            taken.insert(new_path.clone());
            return new_path;
        }
    }

    // Fallback: use timestamp
    let timestamp = chrono::Utc::now().timestamp_millis();
    let new_name = match extension {
        Some(ext) => format!("{stem}_{timestamp}.{ext}"),
        None => format!("{stem}_{timestamp}"),
    };
    let new_path = parent.join(new_name);
    taken.insert(new_path.clone());
    new_path
}

/// Split `name` into stem and extension. A leading dot does not start an extension.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(i) => (&name[..i], Some(&name[i + 1..])),
    }
}
