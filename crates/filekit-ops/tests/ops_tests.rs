use filekit_core::{
    AppConfig, ErrorCategory, FileEntry, FsError, NoopSink, OperationKind, ProgressEvent,
    ProgressSink,
};
use filekit_ops::{
    BatchOperationRequest, ConflictStrategy, OperationManager, RenameCandidate, RenameEngine,
    RenameItem, RenameRule, preview_rename,
};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

fn manager() -> OperationManager {
    OperationManager::new(Arc::new(AppConfig::default()))
}

fn noop() -> Arc<dyn ProgressSink> {
    Arc::new(NoopSink)
}

fn file(path: &Path, contents: &str) -> FileEntry {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
    FileEntry::file(path)
}

#[tokio::test]
async fn test_move_conflict_rename() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source/report.txt");
    let dest = temp.path().join("dest");
    let item = file(&source, "new report");
    file(&dest.join("report.txt"), "old report");

    let request = BatchOperationRequest::builder(OperationKind::Move, vec![item])
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Rename)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!((result.success, result.failed, result.skipped), (1, 0, 0));
    assert!(!source.exists());
    assert_eq!(
        fs::read_to_string(dest.join("report (1).txt")).unwrap(),
        "new report"
    );
    assert_eq!(fs::read_to_string(dest.join("report.txt")).unwrap(), "old report");
}

#[tokio::test]
async fn test_conflict_strategies_are_exclusive() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("dest");
    let manager = manager();

    for strategy in [
        ConflictStrategy::Skip,
        ConflictStrategy::Overwrite,
        ConflictStrategy::Ask,
    ] {
        let item = file(&temp.path().join("in/data.csv"), "fresh");
        file(&dest.join("data.csv"), "stale");

        let request = BatchOperationRequest::builder(OperationKind::Copy, vec![item])
            .target_path(&dest)
            .conflict_strategy(strategy)
            .build()
            .unwrap();
        let result = manager.batch_operate(&request, noop()).await.unwrap();
        let contents = fs::read_to_string(dest.join("data.csv")).unwrap();

        match strategy {
            ConflictStrategy::Skip => {
                assert_eq!((result.success, result.failed, result.skipped), (0, 0, 1));
                assert_eq!(contents, "stale");
            }
            ConflictStrategy::Overwrite => {
                assert_eq!((result.success, result.failed, result.skipped), (1, 0, 0));
                assert_eq!(contents, "fresh");
            }
            ConflictStrategy::Ask => {
                assert_eq!((result.success, result.failed, result.skipped), (0, 1, 0));
                assert_eq!(result.conflicts.len(), 1);
                assert_eq!(result.errors[0].kind, ErrorCategory::ConflictUnresolved);
                assert_eq!(contents, "stale");
            }
            ConflictStrategy::Rename => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_forbidden_item_is_rejected_before_mutation() {
    let temp = TempDir::new().unwrap();
    let blocked = file(&temp.path().join("app/node_modules/pkg/index.js"), "x");
    let allowed = file(&temp.path().join("app/main.js"), "y");

    let request = BatchOperationRequest::builder(OperationKind::Delete, vec![blocked, allowed])
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.success, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].kind, ErrorCategory::ForbiddenPath);
    assert!(temp.path().join("app/node_modules/pkg/index.js").exists());
    assert!(!temp.path().join("app/main.js").exists());
}

#[tokio::test]
async fn test_forbidden_target_aborts_batch() {
    let temp = TempDir::new().unwrap();
    let item = file(&temp.path().join("a.txt"), "");
    let request = BatchOperationRequest::builder(OperationKind::Copy, vec![item])
        .target_path(temp.path().join(".git/objects"))
        .build()
        .unwrap();

    let err = manager().batch_operate(&request, noop()).await.unwrap_err();
    assert!(matches!(err, FsError::ForbiddenPath { .. }));
    assert!(!temp.path().join(".git").exists());
}

#[tokio::test]
async fn test_result_conservation_with_missing_item() {
    let temp = TempDir::new().unwrap();
    let items = vec![
        file(&temp.path().join("one.txt"), "1"),
        FileEntry::file(temp.path().join("ghost.txt")),
        file(&temp.path().join("two.txt"), "2"),
    ];
    let request = BatchOperationRequest::builder(OperationKind::Copy, items)
        .target_path(temp.path().join("out"))
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.processed(), 3);
    assert_eq!((result.success, result.failed), (2, 1));
    assert_eq!(result.errors[0].kind, ErrorCategory::NotFound);
    assert!(result.errors[0].to_string().starts_with("copy "));
}

#[tokio::test]
async fn test_directory_copy_preserving_structure() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("photos");
    let items = vec![
        file(&root.join("2023/a.jpg"), "a"),
        file(&root.join("2024/trip/b.jpg"), "b"),
    ];
    let dest = temp.path().join("backup");

    let request = BatchOperationRequest::builder(OperationKind::Copy, items)
        .target_path(&dest)
        .preserve_structure(true)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.success, 2);
    assert!(dest.join("2023/a.jpg").exists());
    assert!(dest.join("2024/trip/b.jpg").exists());
}

#[tokio::test]
async fn test_move_directory_into_itself_fails() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("folder");
    file(&dir.join("inner.txt"), "");

    let request =
        BatchOperationRequest::builder(OperationKind::Move, vec![FileEntry::directory(&dir)])
            .target_path(dir.join("nested"))
            .build()
            .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.errors[0].kind, ErrorCategory::InvalidPath);
    assert!(dir.join("inner.txt").exists());
}

#[tokio::test]
async fn test_recursive_delete() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("old");
    file(&dir.join("a/b/c.txt"), "");
    file(&dir.join("d.txt"), "");

    let request =
        BatchOperationRequest::builder(OperationKind::Delete, vec![FileEntry::directory(&dir)])
            .build()
            .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();
    assert!(result.is_success());
    assert!(!dir.exists());
}

#[tokio::test]
async fn test_large_files_go_through_worker_pool() {
    let temp = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.performance.worker_threshold = 16;
    let manager = OperationManager::new(Arc::new(config));

    let items = vec![
        file(&temp.path().join("big.bin"), &"x".repeat(256)),
        file(&temp.path().join("small.txt"), "tiny"),
    ];
    let request = BatchOperationRequest::builder(OperationKind::Move, items)
        .target_path(temp.path().join("dest"))
        .build()
        .unwrap();
    let result = manager.batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.success, 2);
    assert_eq!(
        fs::metadata(temp.path().join("dest/big.bin")).unwrap().len(),
        256
    );
    assert!(!manager.has_worker_pool());

    manager.cleanup().await;
    manager.cleanup().await;
}

struct CancelAt {
    manager: OnceLock<Arc<OperationManager>>,
    threshold: u64,
}

impl ProgressSink for CancelAt {
    fn emit(&self, event: ProgressEvent) {
        if event.current >= self.threshold {
            if let Some(manager) = self.manager.get() {
                manager.cancel();
            }
        }
    }
}

#[tokio::test]
async fn test_cancel_stops_before_next_batch() {
    let temp = TempDir::new().unwrap();
    let items: Vec<FileEntry> = (0..6)
        .map(|i| file(&temp.path().join(format!("f{i}.txt")), "x"))
        .collect();

    let mut config = AppConfig::default();
    config.batch.size = 2;
    let manager = Arc::new(OperationManager::new(Arc::new(config)));
    let sink = Arc::new(CancelAt {
        manager: OnceLock::new(),
        threshold: 2,
    });
    let _ = sink.manager.set(Arc::clone(&manager));

    let request = BatchOperationRequest::builder(OperationKind::Delete, items)
        .build()
        .unwrap();
    let result = manager.batch_operate(&request, sink).await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.processed(), 2);
    assert_eq!(result.success, 2);
    let remaining = fs::read_dir(temp.path()).unwrap().count();
    assert_eq!(remaining, 4);
}

#[tokio::test]
async fn test_rename_batch_and_noop() {
    let temp = TempDir::new().unwrap();
    let engine = RenameEngine::new(Arc::new(AppConfig::default()));
    let candidates: Vec<RenameCandidate> = ["IMG_001.JPG", "IMG_002.JPG", "notes.txt"]
        .iter()
        .map(|n| RenameCandidate::from(file(&temp.path().join(n), "")))
        .collect();
    let rule = RenameRule::Regex {
        pattern: r"IMG_(\d+)".into(),
        replacement: "Photo_$1".into(),
        global: true,
        case_insensitive: false,
    };

    let preview = engine.preview(candidates.clone(), rule.clone()).await.unwrap();
    assert!(preview.iter().all(|p| !p.has_error));

    let result = engine.rename_batch(&candidates, &rule, noop()).await.unwrap();
    assert_eq!((result.success, result.failed), (3, 0));
    assert!(temp.path().join("Photo_001.JPG").exists());
    assert!(temp.path().join("Photo_002.JPG").exists());
    assert!(temp.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_rename_rechecks_targets_at_commit() {
    let temp = TempDir::new().unwrap();
    let engine = RenameEngine::new(Arc::new(AppConfig::default()));
    file(&temp.path().join("a.txt"), "a");
    file(&temp.path().join("b.txt"), "b");

    let candidates = vec![
        RenameCandidate::new(temp.path().join("a.txt"), false),
        RenameCandidate::new(temp.path().join("b.txt"), false),
    ];
    let rule = RenameRule::Prefix {
        prefix: "new_".into(),
    };
    let preview = preview_rename(&candidates, &rule).unwrap();
    assert!(preview.iter().all(|p| !p.has_error));

    // Something else takes one of the names after the preview.
    fs::write(temp.path().join("new_b.txt"), "intruder").unwrap();

    let items: Vec<RenameItem> = preview
        .into_iter()
        .map(|p| RenameItem {
            path: p.path,
            new_name: p.new_name,
        })
        .collect();
    let result = engine.rename_files(&items, noop()).await.unwrap();

    assert_eq!((result.success, result.failed), (1, 1));
    assert_eq!(result.errors[0].kind, ErrorCategory::AlreadyExists);
    assert!(temp.path().join("new_a.txt").exists());
    assert!(temp.path().join("b.txt").exists());
    assert_eq!(
        fs::read_to_string(temp.path().join("new_b.txt")).unwrap(),
        "intruder"
    );
}

#[tokio::test]
async fn test_invalid_rename_pattern_is_an_error() {
    let temp = TempDir::new().unwrap();
    let engine = RenameEngine::new(Arc::new(AppConfig::default()));
    let candidates = vec![RenameCandidate::from(file(&temp.path().join("x.txt"), ""))];
    let rule = RenameRule::Regex {
        pattern: "[".into(),
        replacement: String::new(),
        global: true,
        case_insensitive: false,
    };

    let err = engine.rename_batch(&candidates, &rule, noop()).await.unwrap_err();
    assert!(matches!(err, FsError::InvalidPattern { .. }));
    assert!(temp.path().join("x.txt").exists());
}

fn same_name_items(temp: &TempDir) -> Vec<FileEntry> {
    vec![
        file(&temp.path().join("a/x.txt"), "A"),
        file(&temp.path().join("b/x.txt"), "B"),
    ]
}

#[tokio::test]
async fn test_same_destination_skip_keeps_first_item() {
    for _ in 0..10 {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let request = BatchOperationRequest::builder(OperationKind::Move, same_name_items(&temp))
            .target_path(&dest)
            .conflict_strategy(ConflictStrategy::Skip)
            .build()
            .unwrap();
        let result = manager().batch_operate(&request, noop()).await.unwrap();

        assert_eq!((result.success, result.failed, result.skipped), (1, 0, 1));
        assert_eq!(fs::read_to_string(dest.join("x.txt")).unwrap(), "A");
        assert!(!temp.path().join("a/x.txt").exists());
        assert!(temp.path().join("b/x.txt").exists());
    }
}

#[tokio::test]
async fn test_same_destination_rename_keeps_both() {
    for _ in 0..10 {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");
        let request = BatchOperationRequest::builder(OperationKind::Copy, same_name_items(&temp))
            .target_path(&dest)
            .conflict_strategy(ConflictStrategy::Rename)
            .build()
            .unwrap();
        let result = manager().batch_operate(&request, noop()).await.unwrap();

        assert_eq!(result.success, 2);
        assert_eq!(fs::read_to_string(dest.join("x.txt")).unwrap(), "A");
        assert_eq!(fs::read_to_string(dest.join("x (1).txt")).unwrap(), "B");
    }
}

#[tokio::test]
async fn test_same_destination_overwrite_fails_later_item() {
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("dest");
    let request = BatchOperationRequest::builder(OperationKind::Copy, same_name_items(&temp))
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Overwrite)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!((result.success, result.failed), (1, 1));
    assert_eq!(result.errors[0].kind, ErrorCategory::AlreadyExists);
    assert_eq!(result.errors[0].path, temp.path().join("b/x.txt"));
    assert_eq!(fs::read_to_string(dest.join("x.txt")).unwrap(), "A");
}

/// `proj/{x.txt,y.txt,lib/z.txt}` copied into a destination already holding `proj/x.txt`.
fn existing_project(temp: &TempDir) -> (FileEntry, std::path::PathBuf) {
    let proj = temp.path().join("src/proj");
    file(&proj.join("x.txt"), "new x");
    file(&proj.join("y.txt"), "new y");
    file(&proj.join("lib/z.txt"), "new z");
    let dest = temp.path().join("dest");
    file(&dest.join("proj/x.txt"), "old x");
    (FileEntry::directory(&proj), dest)
}

#[tokio::test]
async fn test_directory_copy_skips_existing_entries() {
    let temp = TempDir::new().unwrap();
    let (item, dest) = existing_project(&temp);

    let request = BatchOperationRequest::builder(OperationKind::Copy, vec![item])
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Skip)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!((result.success, result.failed, result.skipped), (1, 0, 0));
    assert_eq!(result.skipped_entries, 1);
    assert_eq!(fs::read_to_string(dest.join("proj/x.txt")).unwrap(), "old x");
    assert_eq!(fs::read_to_string(dest.join("proj/y.txt")).unwrap(), "new y");
    assert_eq!(fs::read_to_string(dest.join("proj/lib/z.txt")).unwrap(), "new z");
}

#[tokio::test]
async fn test_directory_copy_asks_per_entry() {
    let temp = TempDir::new().unwrap();
    let (item, dest) = existing_project(&temp);

    let request = BatchOperationRequest::builder(OperationKind::Copy, vec![item])
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Ask)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].destination, dest.join("proj/x.txt"));
    assert_eq!(result.errors[0].kind, ErrorCategory::ConflictUnresolved);
    assert_eq!(fs::read_to_string(dest.join("proj/x.txt")).unwrap(), "old x");
    assert_eq!(fs::read_to_string(dest.join("proj/y.txt")).unwrap(), "new y");
}

#[tokio::test]
async fn test_directory_move_renames_existing_entries() {
    let temp = TempDir::new().unwrap();
    let (item, dest) = existing_project(&temp);
    let proj = item.full_path.clone();

    let request = BatchOperationRequest::builder(OperationKind::Move, vec![item])
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Rename)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!((result.success, result.failed), (1, 0));
    assert_eq!(fs::read_to_string(dest.join("proj/x.txt")).unwrap(), "old x");
    assert_eq!(fs::read_to_string(dest.join("proj/x (1).txt")).unwrap(), "new x");
    assert!(dest.join("proj/lib/z.txt").exists());
    assert!(!proj.exists());
}

#[tokio::test]
async fn test_directory_move_with_skip_leaves_skipped_entries() {
    let temp = TempDir::new().unwrap();
    let (item, dest) = existing_project(&temp);
    let proj = item.full_path.clone();

    let request = BatchOperationRequest::builder(OperationKind::Move, vec![item])
        .target_path(&dest)
        .conflict_strategy(ConflictStrategy::Skip)
        .build()
        .unwrap();
    let result = manager().batch_operate(&request, noop()).await.unwrap();

    assert_eq!(result.success, 1);
    assert_eq!(result.skipped_entries, 1);
    assert_eq!(fs::read_to_string(proj.join("x.txt")).unwrap(), "new x");
    assert!(!proj.join("y.txt").exists());
    assert_eq!(fs::read_to_string(dest.join("proj/y.txt")).unwrap(), "new y");
}
