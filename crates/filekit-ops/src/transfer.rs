//! Blocking filesystem primitives behind copy, move and delete.
//!
//! Everything here runs on a blocking thread, either through
//! `spawn_blocking` or on a worker of the transfer pool.

use std::fs;
use std::path::{Path, PathBuf};

use filekit_core::{FsError, OperationKind, PendingConflict, is_cross_device};
use filekit_exec::RetryPolicy;
use tracing::{debug, warn};

use crate::conflict::{self, Claims, ConflictStrategy, Resolution};

/// One unit of work for a blocking thread.
#[derive(Debug, Clone)]
pub enum TransferJob {
    Copy {
        source: PathBuf,
        target: PathBuf,
    },
    Move {
        source: PathBuf,
        target: PathBuf,
    },
    Delete {
        path: PathBuf,
    },
    /// Copy or move a directory into `target`, resolving every entry on its own.
    Merge {
        source: PathBuf,
        target: PathBuf,
        operation: OperationKind,
        policy: EntryPolicy,
    },
}

/// How the entries of a merged directory are resolved and written.
#[derive(Debug, Clone)]
pub struct EntryPolicy {
    pub strategy: ConflictStrategy,
    /// Destinations taken by the batch, shared with every other item.
    pub claims: Claims,
    /// Applied to each entry, not to the merge as a whole.
    pub retry: RetryPolicy,
}

/// What a job did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transferred {
    pub bytes: u64,
    /// Files and directories written, or removed by a delete.
    pub entries: usize,
    /// Entries left alone under `skip`.
    pub skipped: Vec<PathBuf>,
    /// Entries left alone under `ask`.
    pub conflicts: Vec<PendingConflict>,
}

impl Transferred {
    fn written(bytes: u64) -> Self {
        Self {
            bytes,
            entries: 1,
            ..Self::default()
        }
    }
}

/// Run a job on the current thread.
pub fn run_job(job: TransferJob) -> Result<Transferred, FsError> {
    match job {
        TransferJob::Copy { source, target } => {
            copy_tree(&source, &target, OperationKind::Copy).map(Transferred::written)
        }
        TransferJob::Move { source, target } => {
            move_path(&source, &target).map(Transferred::written)
        }
        TransferJob::Delete { path } => delete_path(&path).map(Transferred::written),
        TransferJob::Merge {
            source,
            target,
            operation,
            policy,
        } => merge_tree(&source, &target, operation, &policy),
    }
}

/// Merge the directory `source` into the directory `target`.
///
/// Every entry is resolved against the policy's strategy: files follow it,
/// subdirectories present on both sides are merged in turn. Skipped and
/// undecided entries are reported, not failed. After a move, source
/// directories left empty are removed; anything skipped stays where it was.
pub fn merge_tree(
    source: &Path,
    target: &Path,
    operation: OperationKind,
    policy: &EntryPolicy,
) -> Result<Transferred, FsError> {
    let mut outcome = Transferred::default();
    merge_into(source, target, operation, policy, &mut outcome)?;
    Ok(outcome)
}

fn merge_into(
    source: &Path,
    target: &Path,
    operation: OperationKind,
    policy: &EntryPolicy,
    outcome: &mut Transferred,
) -> Result<(), FsError> {
    fs::create_dir_all(target).map_err(|e| FsError::io(target, OperationKind::CreateDir, e))?;

    // Listed up front so entries renamed into `target` are never revisited.
    let entries = fs::read_dir(source)
        .and_then(|dir| dir.map(|entry| entry.map(|e| e.path())).collect::<Result<Vec<_>, _>>())
        .map_err(|e| FsError::io(source, OperationKind::List, e))?;

    let label = operation.to_string();
    for entry in entries {
        let Some(name) = entry.file_name() else {
            continue;
        };
        let entry_target = target.join(name);
        let claimed_elsewhere = !policy.claims.claim(&entry_target);
        let resolution = conflict::resolve(
            policy.strategy,
            &entry,
            &entry_target,
            operation,
            &policy.claims,
            claimed_elsewhere,
        )?;

        match resolution {
            Resolution::Proceed(destination) => {
                let bytes = policy.retry.run_blocking(&label, || match operation {
                    OperationKind::Move => move_path(&entry, &destination),
                    _ => copy_tree(&entry, &destination, operation),
                })?;
                outcome.bytes += bytes;
                outcome.entries += 1;
            }
            Resolution::Merge(destination) => {
                merge_into(&entry, &destination, operation, policy, outcome)?;
            }
            Resolution::Skip => {
                debug!(path = %entry.display(), "Entry exists, skipped");
                outcome.skipped.push(entry);
            }
            Resolution::Unresolved => outcome.conflicts.push(PendingConflict {
                source: entry,
                destination: entry_target,
            }),
        }
    }

    if operation == OperationKind::Move && is_empty_dir(source) {
        fs::remove_dir(source).map_err(|e| FsError::io(source, OperationKind::Delete, e))?;
    }
    Ok(())
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}

/// Copy a file or directory tree onto `target`.
///
/// Existing files under `target` are replaced and existing directories are
/// merged into.
pub fn copy_tree(source: &Path, target: &Path, operation: OperationKind) -> Result<u64, FsError> {
    let metadata = fs::metadata(source).map_err(|e| FsError::io(source, operation, e))?;
    if !metadata.is_dir() {
        return copy_file(source, target, operation);
    }

    match fs::symlink_metadata(target) {
        Ok(existing) if !existing.is_dir() => {
            fs::remove_file(target).map_err(|e| FsError::io(target, operation, e))?;
        }
        _ => {}
    }
    fs::create_dir_all(target).map_err(|e| FsError::io(target, OperationKind::CreateDir, e))?;

    let mut total_bytes = 0u64;
    let entries = fs::read_dir(source).map_err(|e| FsError::io(source, OperationKind::List, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| FsError::io(source, OperationKind::List, e))?;
        total_bytes += copy_tree(&entry.path(), &target.join(entry.file_name()), operation)?;
    }

    Ok(total_bytes)
}

fn copy_file(source: &Path, target: &Path, operation: OperationKind) -> Result<u64, FsError> {
    if fs::symlink_metadata(target).is_ok_and(|m| m.is_dir()) {
        fs::remove_dir_all(target).map_err(|e| FsError::io(target, operation, e))?;
    }
    fs::copy(source, target).map_err(|e| FsError::io(source, operation, e))
}

/// Move `source` to `target`.
///
/// Tries an atomic rename first and falls back to copy and delete across
/// devices. The move only succeeds once the source is gone.
pub fn move_path(source: &Path, target: &Path) -> Result<u64, FsError> {
    let size = total_size(source);
    match fs::rename(source, target) {
        Ok(()) => Ok(size),
        Err(e) if is_cross_device(&e) => {
            debug!(
                source = %source.display(),
                target = %target.display(),
                "Rename crosses devices, copying instead"
            );
            copy_then_remove(source, target)
        }
        Err(e) => Err(FsError::io(source, OperationKind::Move, e)),
    }
}

fn copy_then_remove(source: &Path, target: &Path) -> Result<u64, FsError> {
    let copied = copy_tree(source, target, OperationKind::Move)?;
    if let Err(e) = remove_path(source) {
        warn!(
            source = %source.display(),
            target = %target.display(),
            error = %e,
            "Copied but could not remove the source; both copies remain"
        );
        return Err(FsError::io(source, OperationKind::Delete, e));
    }
    Ok(copied)
}

/// Delete a file or a directory tree, children before parents.
pub fn delete_path(path: &Path) -> Result<u64, FsError> {
    let size = total_size(path);
    remove_path(path).map_err(|e| FsError::io(path, OperationKind::Delete, e))?;
    Ok(size)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Number of files and total bytes under `path`.
pub fn measure(path: &Path) -> (u64, u64) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return (0, 0);
    };
    if !metadata.is_dir() {
        return (1, metadata.len());
    }

    let mut files = 0;
    let mut bytes = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            let (f, b) = measure(&entry.path());
            files += f;
            bytes += b;
        }
    }
    (files, bytes)
}

fn total_size(path: &Path) -> u64 {
    measure(path).1
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::write(root.join("top.txt"), "12345").unwrap();
        fs::write(root.join("sub/mid.txt"), "abc").unwrap();
        fs::write(root.join("sub/deeper/low.txt"), "z").unwrap();
    }

    #[test]
    fn test_copy_tree_recurses() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        tree(&source);

        let bytes = copy_tree(&source, &temp.path().join("dst"), OperationKind::Copy).unwrap();
        assert_eq!(bytes, 9);
        assert_eq!(
            fs::read_to_string(temp.path().join("dst/sub/deeper/low.txt")).unwrap(),
            "z"
        );
        assert!(source.join("top.txt").exists());
    }

    #[test]
    fn test_copy_tree_merges_and_replaces() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("dst");
        tree(&source);
        fs::create_dir_all(target.join("sub")).unwrap();
        fs::write(target.join("sub/mid.txt"), "old contents").unwrap();
        fs::write(target.join("extra.txt"), "kept").unwrap();

        copy_tree(&source, &target, OperationKind::Copy).unwrap();
        assert_eq!(fs::read_to_string(target.join("sub/mid.txt")).unwrap(), "abc");
        assert!(target.join("extra.txt").exists());
    }

    #[test]
    fn test_move_and_delete() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        tree(&source);

        let target = temp.path().join("moved");
        assert_eq!(move_path(&source, &target).unwrap(), 9);
        assert!(!source.exists());
        assert!(target.join("sub/mid.txt").exists());

        assert_eq!(measure(&target), (3, 9));
        assert_eq!(delete_path(&target).unwrap(), 9);
        assert!(!target.exists());
    }

    fn policy(strategy: ConflictStrategy) -> EntryPolicy {
        EntryPolicy {
            strategy,
            claims: Claims::default(),
            retry: RetryPolicy::none(),
        }
    }

    #[test]
    fn test_merge_skips_existing_entries_only() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("dst");
        tree(&source);
        fs::create_dir_all(target.join("sub")).unwrap();
        fs::write(target.join("sub/mid.txt"), "old").unwrap();

        let outcome =
            merge_tree(&source, &target, OperationKind::Copy, &policy(ConflictStrategy::Skip))
                .unwrap();
        assert_eq!(outcome.skipped, vec![source.join("sub/mid.txt")]);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(fs::read_to_string(target.join("sub/mid.txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(target.join("top.txt")).unwrap(), "12345");
        assert_eq!(
            fs::read_to_string(target.join("sub/deeper/low.txt")).unwrap(),
            "z"
        );
    }

    #[test]
    fn test_merge_move_keeps_skipped_sources() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("dst");
        tree(&source);
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("top.txt"), "old").unwrap();
        fs::write(target.join("other.txt"), "").unwrap();

        let outcome =
            merge_tree(&source, &target, OperationKind::Move, &policy(ConflictStrategy::Ask))
                .unwrap();
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].destination, target.join("top.txt"));
        assert!(target.join("sub/mid.txt").exists());
        assert!(target.join("other.txt").exists());
        assert!(!source.join("sub").exists());
        assert!(source.join("top.txt").exists());
    }

    #[test]
    fn test_merge_move_removes_emptied_source() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("src");
        let target = temp.path().join("dst");
        tree(&source);
        fs::create_dir_all(target.join("sub")).unwrap();
        fs::write(target.join("sub/mid.txt"), "old").unwrap();

        let outcome = merge_tree(
            &source,
            &target,
            OperationKind::Move,
            &policy(ConflictStrategy::Rename),
        )
        .unwrap();
        assert!(outcome.skipped.is_empty());
        assert!(!source.exists());
        assert_eq!(fs::read_to_string(target.join("sub/mid.txt")).unwrap(), "old");
        assert_eq!(fs::read_to_string(target.join("sub/mid (1).txt")).unwrap(), "abc");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_kept_when_source_cannot_be_removed() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir_all(&locked).unwrap();
        let source = locked.join("a.txt");
        fs::write(&source, "data").unwrap();
        let target = temp.path().join("a.txt");

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(locked.join("writable"), "").is_ok() {
            // Running with privileges that ignore directory permissions.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = copy_then_remove(&source, &target);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let err = result.unwrap_err();
        assert!(matches!(&err, FsError::PermissionDenied { path } if *path == source));
        assert_eq!(fs::read_to_string(&target).unwrap(), "data");
        assert!(source.exists());
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let temp = TempDir::new().unwrap();
        let job = TransferJob::Delete {
            path: temp.path().join("ghost"),
        };
        assert!(matches!(run_job(job), Err(FsError::NotFound { .. })));
    }
}
