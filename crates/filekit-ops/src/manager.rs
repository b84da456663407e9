//! Batch copy, move and delete.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use filekit_core::{
    AppConfig, FileEntry, FsError, OperationError, OperationKind, OperationResult, PathGuard,
    ProgressSink, ProgressTracker, details, lock, normalize,
};
use filekit_exec::{CancellationToken, ConcurrencyController, JobHandler, RetryPolicy, WorkerPool};
use tracing::{debug, info};

use crate::conflict::{self, Claims, ConflictStrategy, Resolution};
use crate::request::BatchOperationRequest;
use crate::transfer::{self, EntryPolicy, TransferJob, Transferred};

type TransferPool = WorkerPool<TransferJob, Transferred>;

/// Terminal state of one batch item.
#[derive(Debug)]
enum ItemOutcome {
    Done,
    Skipped,
    Failed(OperationError),
    Conflict { source: PathBuf, target: PathBuf },
    Merged { item: PathBuf, done: Transferred },
}

/// Where an item writes, decided before any item runs.
#[derive(Debug, Default, Clone, Copy)]
struct Slot {
    /// An earlier item of the batch owns the same destination.
    claimed_elsewhere: bool,
    /// More than one item of the batch targets the destination.
    shared: bool,
}

/// Settings shared by every item of one batch.
struct BatchContext {
    operation: OperationKind,
    strategy: ConflictStrategy,
    target: Option<PathBuf>,
    common_root: Option<PathBuf>,
    guard: PathGuard,
    retry: RetryPolicy,
    worker_threshold: u64,
    pool: Option<TransferPool>,
    claims: Claims,
    handler: JobHandler<TransferJob, Transferred>,
}

/// Executes copy, move and delete batches.
///
/// One failing item never stops its siblings; every batch ends with a full
/// [`OperationResult`]. Large files are handed to a worker pool that is created
/// on demand and torn down when the last running batch ends.
pub struct OperationManager {
    config: RwLock<Arc<AppConfig>>,
    cancel: Mutex<CancellationToken>,
    pool: Mutex<Option<TransferPool>>,
    active_batches: AtomicUsize,
    handler: JobHandler<TransferJob, Transferred>,
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("active_batches", &self.active_batches.load(Ordering::SeqCst))
            .field("pool", &*lock(&self.pool))
            .finish_non_exhaustive()
    }
}

impl OperationManager {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config: RwLock::new(config),
            cancel: Mutex::new(CancellationToken::new()),
            pool: Mutex::new(None),
            active_batches: AtomicUsize::new(0),
            handler: Arc::new(transfer::run_job),
        }
    }

    /// Replace the configuration used by batches started from now on.
    pub fn reconfigure(&self, config: Arc<AppConfig>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> Arc<AppConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Stop every running batch before its next group of items.
    pub fn cancel(&self) {
        let mut token = lock(&self.cancel);
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Cancel outstanding work and shut the worker pool down. Idempotent.
    pub async fn cleanup(&self) {
        self.cancel();
        let pool = lock(&self.pool).take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }

    /// Whether a worker pool currently exists.
    pub fn has_worker_pool(&self) -> bool {
        lock(&self.pool).is_some()
    }

    fn worker_pool(&self, max_workers: usize) -> TransferPool {
        lock(&self.pool)
            .get_or_insert_with(|| {
                debug!(max_workers, "Starting transfer worker pool");
                let handler = Arc::clone(&self.handler);
                WorkerPool::new(max_workers, move |job| handler(job))
            })
            .clone()
    }

    async fn release_pool(&self) {
        if self.active_batches.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let pool = lock(&self.pool).take();
        if let Some(pool) = pool {
            debug!("Shutting down transfer worker pool");
            pool.shutdown().await;
        }
    }

    /// Run a copy, move or delete batch.
    ///
    /// Returns an error only when the batch as a whole cannot start: invalid
    /// request, forbidden or unusable target directory. Per-item problems are
    /// recorded in the result.
    ///
    /// Destinations are claimed in item order before anything runs, so when two
    /// items land on the same path the first one owns it and the later ones
    /// meet a conflict. A directory copied or moved onto an existing directory
    /// is merged: the strategy applies to every entry inside, and the item is
    /// counted once (see [`OperationResult::record_merge`]).
    pub async fn batch_operate(
        &self,
        request: &BatchOperationRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<OperationResult, FsError> {
        request.validate()?;
        let config = self.config();
        let guard = PathGuard::new(&config.security);

        let target = match (&request.target_path, request.operation) {
            (Some(path), OperationKind::Copy | OperationKind::Move) => {
                Some(prepare_target(path, &guard).await?)
            }
            _ => None,
        };

        let cancel = lock(&self.cancel).child_token();
        let sources: Vec<PathBuf> = request.items.iter().map(|i| normalize(&i.full_path)).collect();

        let totals_for = sources.clone();
        let threshold = config.performance.worker_threshold;
        let (total_files, total_bytes, has_large) = tokio::task::spawn_blocking(move || {
            preflight(&totals_for, threshold)
        })
        .await
        .map_err(|e| FsError::Unknown {
            message: format!("preflight task failed: {e}"),
        })?;

        self.active_batches.fetch_add(1, Ordering::SeqCst);
        let pool = has_large.then(|| self.worker_pool(config.performance.max_workers));

        let context = BatchContext {
            operation: request.operation,
            strategy: request.conflict_strategy,
            common_root: request
                .preserve_structure
                .then(|| common_root(&sources))
                .flatten(),
            target,
            guard,
            retry: RetryPolicy::from(&config.retry),
            worker_threshold: threshold,
            pool,
            claims: Claims::default(),
            handler: Arc::clone(&self.handler),
        };

        let plans: Vec<Result<Option<PathBuf>, FsError>> =
            sources.iter().map(|source| plan(&context, source)).collect();
        let slots = claim_destinations(&plans, &context.claims);

        let tracker = ProgressTracker::new(request.items.len() as u64, sink);
        tracker.start();
        tracker.update(
            0,
            None,
            Some(details([("totalFiles", total_files), ("totalBytes", total_bytes)])),
        );

        let concurrency = if request.parallel {
            request.max_parallel.unwrap_or(config.batch.concurrency)
        } else {
            1
        };
        let controller = ConcurrencyController::new(concurrency);
        let status = status_for(request.operation);

        let tasks = request
            .items
            .iter()
            .zip(&sources)
            .zip(plans.into_iter().zip(slots))
            .map(|((item, source), (plan, slot))| {
                let context = &context;
                let tracker = &tracker;
                async move {
                    let outcome = process_item(context, item, source, plan, slot).await;
                    tracker.update(
                        1,
                        Some(status),
                        Some(details([("currentFile", source.display().to_string())])),
                    );
                    outcome
                }
            });

        let run = controller
            .run_in_batches_cancellable(tasks, config.batch.size, &cancel)
            .await;
        self.release_pool().await;
        let run = run?;

        let mut result = OperationResult::new(request.operation);
        for outcome in run.results {
            match outcome {
                ItemOutcome::Done => result.record_success(),
                ItemOutcome::Skipped => result.record_skip(),
                ItemOutcome::Failed(error) => result.record_failure(error),
                ItemOutcome::Conflict { source, target } => result.record_conflict(source, target),
                ItemOutcome::Merged { item, done } => {
                    result.record_merge(item, done.entries, done.skipped.len(), done.conflicts);
                }
            }
        }
        result.cancelled = run.cancelled;

        let summary = details([
            ("success", result.success),
            ("failed", result.failed),
            ("skipped", result.skipped),
            ("skippedEntries", result.skipped_entries),
        ]);
        tracker.complete(result.cancelled.then_some("cancelled"), Some(summary));
        info!(
            operation = %request.operation,
            success = result.success,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "Batch finished"
        );
        Ok(result)
    }
}

fn status_for(operation: OperationKind) -> &'static str {
    match operation {
        OperationKind::Copy => "copying",
        OperationKind::Move => "moving",
        OperationKind::Delete => "deleting",
        _ => "processing",
    }
}

/// Check and create the destination directory.
async fn prepare_target(path: &Path, guard: &PathGuard) -> Result<PathBuf, FsError> {
    let target = normalize(path);
    guard.check(&target)?;
    tokio::fs::create_dir_all(&target)
        .await
        .map_err(|e| FsError::io(&target, OperationKind::CreateDir, e))?;
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|e| FsError::io(&target, OperationKind::Read, e))?;
    if !metadata.is_dir() {
        return Err(FsError::invalid_path(&target, "target is not a directory"));
    }
    Ok(target)
}

/// Count files and bytes and report whether any single file crosses `threshold`.
fn preflight(sources: &[PathBuf], threshold: u64) -> (u64, u64, bool) {
    let mut files = 0;
    let mut bytes = 0;
    let mut has_large = false;
    for source in sources {
        let (f, b) = transfer::measure(source);
        files += f;
        bytes += b;
        if source.is_file() && b > threshold {
            has_large = true;
        }
    }
    (files, bytes, has_large)
}

/// Deepest directory containing every item.
fn common_root(sources: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = sources.iter().filter_map(|s| s.parent());
    let mut root = parents.next()?.to_path_buf();
    for parent in parents {
        while !parent.starts_with(&root) {
            if !root.pop() {
                return None;
            }
        }
    }
    Some(root)
}

fn destination_for(context: &BatchContext, source: &Path) -> Result<PathBuf, FsError> {
    let target = context
        .target
        .as_deref()
        .ok_or_else(|| FsError::InvalidRequest {
            message: "a target directory is required".to_string(),
        })?;

    if let Some(root) = &context.common_root {
        if let Ok(relative) = source.strip_prefix(root) {
            return Ok(target.join(relative));
        }
    }
    let name = source
        .file_name()
        .ok_or_else(|| FsError::invalid_path(source, "path has no file name"))?;
    Ok(target.join(name))
}

/// Check an item and work out its destination. `None` for deletes.
fn plan(context: &BatchContext, source: &Path) -> Result<Option<PathBuf>, FsError> {
    context.guard.check(source)?;
    match context.operation {
        OperationKind::Delete => Ok(None),
        OperationKind::Copy | OperationKind::Move => {
            let target = destination_for(context, source)?;
            context.guard.check(&target)?;
            if conflict::is_nested_in(source, &target) {
                return Err(FsError::invalid_path(
                    &target,
                    "cannot copy or move a directory into itself",
                ));
            }
            if target == source && context.strategy != ConflictStrategy::Rename {
                return Err(FsError::invalid_path(
                    &target,
                    "source and destination are the same",
                ));
            }
            Ok(Some(target))
        }
        other => Err(FsError::InvalidRequest {
            message: format!("'{other}' is not a batch operation"),
        }),
    }
}

/// Claim every planned destination in item order.
fn claim_destinations(plans: &[Result<Option<PathBuf>, FsError>], claims: &Claims) -> Vec<Slot> {
    let mut counts: HashMap<&Path, usize> = HashMap::new();
    for target in plans.iter().filter_map(|plan| plan.as_ref().ok()?.as_deref()) {
        *counts.entry(target).or_default() += 1;
    }

    plans
        .iter()
        .map(|plan| match plan {
            Ok(Some(target)) => Slot {
                claimed_elsewhere: !claims.claim(target),
                shared: counts.get(target.as_path()).is_some_and(|&n| n > 1),
            },
            _ => Slot::default(),
        })
        .collect()
}

async fn process_item(
    context: &BatchContext,
    item: &FileEntry,
    source: &Path,
    plan: Result<Option<PathBuf>, FsError>,
    slot: Slot,
) -> ItemOutcome {
    let operation = context.operation;
    let failed = |error: FsError| {
        debug!(path = %source.display(), %operation, error = %error, "Item failed");
        ItemOutcome::Failed(OperationError::new(&item.full_path, operation, &error))
    };

    let target = match plan {
        Ok(target) => target,
        Err(e) => return failed(e),
    };

    let job = match target {
        None => TransferJob::Delete {
            path: source.to_path_buf(),
        },
        Some(target) => {
            let resolution = {
                let strategy = context.strategy;
                let claims = context.claims.clone();
                let (src, dst) = (source.to_path_buf(), target.clone());
                let claimed_elsewhere = slot.claimed_elsewhere;
                tokio::task::spawn_blocking(move || {
                    conflict::resolve(strategy, &src, &dst, operation, &claims, claimed_elsewhere)
                })
                .await
            };
            let (target, merge) = match resolution {
                Ok(Ok(Resolution::Proceed(target))) => {
                    // Items sharing a directory destination all merge entry by entry.
                    let merge = slot.shared && is_dir(source).await;
                    (target, merge)
                }
                Ok(Ok(Resolution::Merge(target))) => (target, true),
                Ok(Ok(Resolution::Skip)) => return ItemOutcome::Skipped,
                Ok(Ok(Resolution::Unresolved)) => {
                    return ItemOutcome::Conflict {
                        source: item.full_path.clone(),
                        target,
                    };
                }
                Ok(Err(e)) => return failed(e),
                Err(e) => {
                    return failed(FsError::Unknown {
                        message: format!("conflict task failed: {e}"),
                    });
                }
            };

            if let Some(parent) = target.parent() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return failed(FsError::io(parent, OperationKind::CreateDir, e));
                }
            }

            let source = source.to_path_buf();
            if merge {
                TransferJob::Merge {
                    source,
                    target,
                    operation,
                    policy: EntryPolicy {
                        strategy: context.strategy,
                        claims: context.claims.clone(),
                        retry: context.retry,
                    },
                }
            } else if operation == OperationKind::Copy {
                TransferJob::Copy { source, target }
            } else {
                TransferJob::Move { source, target }
            }
        }
    };

    // A merge retries each entry itself; repeating it whole would re-resolve
    // entries it already wrote.
    let merged = matches!(job, TransferJob::Merge { .. });
    let retry = if merged { RetryPolicy::none() } else { context.retry };
    let large = is_large(source, context.worker_threshold).await;
    let pool = if large { context.pool.clone() } else { None };
    let label = operation.to_string();
    let result = retry
        .run(&label, || {
            let job = job.clone();
            let pool = pool.clone();
            let handler = Arc::clone(&context.handler);
            async move { execute(job, pool, handler).await }
        })
        .await;

    match result {
        Ok(done) => {
            debug!(path = %source.display(), %operation, bytes = done.bytes, "Item done");
            if merged {
                ItemOutcome::Merged {
                    item: item.full_path.clone(),
                    done,
                }
            } else {
                ItemOutcome::Done
            }
        }
        Err(e) => failed(e),
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir())
}

async fn is_large(path: &Path, threshold: u64) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|m| m.is_file() && m.len() > threshold)
}

async fn execute(
    job: TransferJob,
    pool: Option<TransferPool>,
    handler: JobHandler<TransferJob, Transferred>,
) -> Result<Transferred, FsError> {
    match pool {
        Some(pool) => pool.execute(job).await,
        None => tokio::task::spawn_blocking(move || handler(job))
            .await
            .map_err(|e| FsError::Unknown {
                message: format!("transfer task failed: {e}"),
            })?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{self, ErrorKind};

    use filekit_core::NoopSink;
    use tempfile::TempDir;

    /// A manager whose jobs fail with `Interrupted` until `failures` calls have been made.
    fn flaky_manager(failures: usize, calls: Arc<AtomicUsize>) -> OperationManager {
        let mut config = AppConfig::default();
        config.retry.attempts = 3;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;

        let handler: JobHandler<TransferJob, Transferred> = Arc::new(move |job: TransferJob| {
            if calls.fetch_add(1, Ordering::SeqCst) < failures {
                let interrupted = io::Error::from(ErrorKind::Interrupted);
                return Err(FsError::io("/flaky", OperationKind::Copy, interrupted));
            }
            transfer::run_job(job)
        });
        OperationManager {
            handler,
            ..OperationManager::new(Arc::new(config))
        }
    }

    fn copy_request(temp: &TempDir) -> BatchOperationRequest {
        let source = temp.path().join("a.txt");
        fs::write(&source, "data").unwrap();
        BatchOperationRequest::builder(OperationKind::Copy, vec![FileEntry::file(&source)])
            .target_path(temp.path().join("out"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_transient_failure_retried_within_batch() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = flaky_manager(2, Arc::clone(&calls));

        let result = manager
            .batch_operate(&copy_request(&temp), Arc::new(NoopSink))
            .await
            .unwrap();
        assert_eq!((result.success, result.failed), (1, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(fs::read_to_string(temp.path().join("out/a.txt")).unwrap(), "data");
    }

    #[tokio::test]
    async fn test_retries_are_bounded_within_batch() {
        let temp = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = flaky_manager(usize::MAX, Arc::clone(&calls));

        let result = manager
            .batch_operate(&copy_request(&temp), Arc::new(NoopSink))
            .await
            .unwrap();
        assert_eq!((result.success, result.failed), (0, 1));
        assert_eq!(result.errors[0].kind, filekit_core::ErrorCategory::OperationFailed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(!temp.path().join("out/a.txt").exists());
    }

    #[test]
    fn test_first_item_owns_a_shared_destination() {
        let claims = Claims::default();
        let plans = vec![
            Ok(Some(PathBuf::from("/out/x.txt"))),
            Ok(None),
            Ok(Some(PathBuf::from("/out/x.txt"))),
            Ok(Some(PathBuf::from("/out/y.txt"))),
            Err(FsError::Cancelled),
        ];
        let slots = claim_destinations(&plans, &claims);
        let flags: Vec<_> = slots.iter().map(|s| (s.claimed_elsewhere, s.shared)).collect();
        assert_eq!(
            flags,
            vec![
                (false, true),
                (false, false),
                (true, true),
                (false, false),
                (false, false)
            ]
        );
    }

    #[test]
    fn test_common_root() {
        let sources = vec![
            PathBuf::from("/data/photos/2023/a.jpg"),
            PathBuf::from("/data/photos/2024/b.jpg"),
            PathBuf::from("/data/photos/c.jpg"),
        ];
        assert_eq!(common_root(&sources), Some(PathBuf::from("/data/photos")));
        assert_eq!(
            common_root(&[PathBuf::from("/x/y/z.txt")]),
            Some(PathBuf::from("/x/y"))
        );
        assert_eq!(common_root(&[]), None);
    }

    #[test]
    fn test_destination_layout() {
        let mut context = BatchContext {
            operation: OperationKind::Copy,
            strategy: ConflictStrategy::Skip,
            target: Some(PathBuf::from("/backup")),
            common_root: None,
            guard: PathGuard::default(),
            retry: RetryPolicy::none(),
            worker_threshold: u64::MAX,
            pool: None,
            claims: Claims::default(),
            handler: Arc::new(transfer::run_job),
        };
        let source = Path::new("/data/photos/2024/b.jpg");
        assert_eq!(
            destination_for(&context, source).unwrap(),
            PathBuf::from("/backup/b.jpg")
        );

        context.common_root = Some(PathBuf::from("/data/photos"));
        assert_eq!(
            destination_for(&context, source).unwrap(),
            PathBuf::from("/backup/2024/b.jpg")
        );
    }
}
