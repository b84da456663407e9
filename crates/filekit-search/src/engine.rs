//! The search engine: batched async traversal with name filters, grep and ranking.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use compact_str::CompactString;
use filekit_core::{
    AppConfig, FileEntry, FsError, OperationKind, ProgressSink, ProgressTracker, details, lock,
};
use filekit_exec::{CancellationToken, ConcurrencyController};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::{debug, info, warn};

use crate::grep::{ContentPattern, GrepOptions, GrepOutcome, grep_path};
use crate::index::{self, IndexStats};
use crate::matcher::{ExcludeSet, NameMatcher};
use crate::query::{
    DEFAULT_MAX_CONTENT_SIZE, RankedEntry, SearchHits, SearchMatch, SearchQuery, SearchReport,
    SearchState,
};
use crate::rank;

/// Cancellable search over a directory tree.
///
/// Each call takes a snapshot of the configuration when it starts.
/// [`cancel`](Self::cancel) stops every search that is running at that moment.
pub struct SearchEngine {
    config: RwLock<Arc<AppConfig>>,
    state: Mutex<SearchState>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SearchEngine {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(SearchState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Replace the configuration used by searches started from now on.
    pub fn reconfigure(&self, config: Arc<AppConfig>) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
    }

    fn config(&self) -> Arc<AppConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// State of the most recent search.
    pub fn state(&self) -> SearchState {
        *lock(&self.state)
    }

    fn set_state(&self, state: SearchState) {
        *lock(&self.state) = state;
    }

    /// Request cancellation. Returns as soon as the flag is set; traversals
    /// stop before their next directory or batch.
    pub fn cancel(&self) {
        let mut token = lock(&self.cancel);
        token.cancel();
        *token = CancellationToken::new();
    }

    fn begin(&self) -> CancellationToken {
        self.set_state(SearchState::Traversing);
        lock(&self.cancel).child_token()
    }

    fn finish<T>(&self, result: Result<T, FsError>, cancelled: bool) -> Result<T, FsError> {
        self.set_state(match (&result, cancelled) {
            (Err(_), _) => SearchState::Errored,
            (Ok(_), true) => SearchState::Cancelled,
            (Ok(_), false) => SearchState::Completed,
        });
        result
    }

    /// Run a name or content search.
    ///
    /// Without a content pattern the report holds matching entries; with one it
    /// holds per-file line matches. Unreadable directories and files are skipped.
    /// Fails only for invalid patterns or an unusable root directory.
    pub async fn search(
        &self,
        query: &SearchQuery,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<SearchReport, FsError> {
        let config = self.config();
        let cancel = self.begin();
        let tracker = ProgressTracker::new(1, sink);

        let result = self.run_search(query, &config, &cancel, &tracker).await;
        match &result {
            Ok(report) => {
                let summary = details([
                    ("found", report.hits.len() as u64),
                    ("visited", report.visited),
                    ("skippedFiles", report.skipped_files),
                ]);
                let status = report.cancelled.then_some("cancelled");
                tracker.complete(status, Some(summary));
                info!(
                    directory = %query.directory.display(),
                    found = report.hits.len(),
                    visited = report.visited,
                    cancelled = report.cancelled,
                    "Search finished"
                );
            }
            Err(e) => tracker.fail(&e.to_string(), None),
        }
        let cancelled = result.as_ref().is_ok_and(|r| r.cancelled);
        self.finish(result, cancelled)
    }

    async fn run_search(
        &self,
        query: &SearchQuery,
        config: &AppConfig,
        cancel: &CancellationToken,
        tracker: &ProgressTracker,
    ) -> Result<SearchReport, FsError> {
        let names = NameMatcher::new(
            &query.extensions,
            query.name_pattern.as_deref(),
            query.use_regex,
            query.case_sensitive,
        )?;
        let excludes = ExcludeSet::new(&query.exclude_patterns)?;
        let content = query
            .content_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| ContentPattern::new(p, query.use_regex, query.case_sensitive))
            .transpose()?;

        let root = query.directory.clone();
        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| FsError::io(&root, OperationKind::List, e))?;
        if !metadata.is_dir() {
            return Err(FsError::invalid_path(&root, "not a directory"));
        }

        let max_depth = query
            .max_depth
            .map_or(config.search.max_depth, |d| d.min(config.search.max_depth));
        let grep = GrepOptions {
            max_file_size: query
                .max_file_size
                .unwrap_or(DEFAULT_MAX_CONTENT_SIZE)
                .min(config.search.max_file_size),
            stream_threshold: config.performance.stream_threshold,
            context_lines: query.context_lines.unwrap_or(config.search.context_lines),
        };

        tracker.start();
        let walk = Walk {
            query,
            names,
            excludes,
            content,
            grep,
            tracker,
            cancel,
            batch_size: config.search.walk_batch_size.max(1),
            max_depth,
            limit: query.max_results.unwrap_or(usize::MAX),
            visited: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            found: AtomicUsize::new(0),
            files: Mutex::new(Vec::new()),
            matches: Mutex::new(Vec::new()),
        };

        walk.walk_dir(root, 0).await;
        Ok(walk.into_report())
    }

    /// Grep an explicit list of files in batches, reporting progress per file.
    pub async fn grep_files(
        &self,
        files: &[PathBuf],
        pattern: &str,
        case_sensitive: bool,
        use_regex: bool,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<SearchReport, FsError> {
        let config = self.config();
        let cancel = self.begin();
        let result = match ContentPattern::new(pattern, use_regex, case_sensitive) {
            Ok(pattern) => self.run_grep_files(files, pattern, &config, &cancel, sink).await,
            Err(e) => Err(e),
        };
        let cancelled = result.as_ref().is_ok_and(|r| r.cancelled);
        self.finish(result, cancelled)
    }

    async fn run_grep_files(
        &self,
        files: &[PathBuf],
        pattern: ContentPattern,
        config: &AppConfig,
        cancel: &CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<SearchReport, FsError> {
        let options = GrepOptions {
            max_file_size: DEFAULT_MAX_CONTENT_SIZE.min(config.search.max_file_size),
            stream_threshold: config.performance.stream_threshold,
            context_lines: config.search.context_lines,
        };
        let tracker = ProgressTracker::new(files.len() as u64, sink);
        tracker.start();

        let skipped = AtomicU64::new(0);
        let controller = ConcurrencyController::new(config.batch.concurrency);
        let tasks = files.iter().map(|path| {
            let pattern = pattern.clone();
            let tracker = &tracker;
            let skipped = &skipped;
            async move {
                tracker.update(
                    1,
                    Some("searching"),
                    Some(details([("currentFile", path.display().to_string())])),
                );
                let file = path.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || grep_path(&file, &pattern, &options)).await;
                match outcome {
                    Ok(Ok(GrepOutcome::Matched(line_matches))) => Some(SearchMatch {
                        file_path: path.clone(),
                        file_name: filekit_core::file_name_of(path),
                        line_matches,
                    }),
                    Ok(Ok(GrepOutcome::NoMatch)) => None,
                    Ok(Ok(GrepOutcome::Skipped(reason))) => {
                        debug!(path = %path.display(), ?reason, "Skipped file");
                        skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Ok(Err(e)) => {
                        debug!(path = %path.display(), error = %e, "Unreadable file");
                        skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Grep task failed");
                        skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
        });

        let run = controller
            .run_in_batches_cancellable(tasks, config.batch.size, cancel)
            .await?;
        let visited = run.results.len() as u64;
        let matches: Vec<SearchMatch> = run.results.into_iter().flatten().collect();
        let status = run.cancelled.then_some("cancelled");
        tracker.complete(status, Some(details([("found", matches.len() as u64)])));

        Ok(SearchReport {
            hits: SearchHits::Matches(matches),
            cancelled: run.cancelled,
            visited,
            skipped_files: skipped.load(Ordering::Relaxed),
        })
    }

    /// Ranked name/path search over a live traversal.
    pub async fn quick_search(
        &self,
        directory: &Path,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RankedEntry>, FsError> {
        let terms = rank::query_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let config = self.config();
        let cancel = self.begin();
        let root = directory.to_path_buf();
        let token = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            quick_walk(&root, &terms, max_results, config.search.max_depth, &token)
        })
        .await
        .map_err(|e| FsError::Unknown {
            message: format!("quick search task failed: {e}"),
        })
        .and_then(|r| r);

        self.finish(result, cancel.is_cancelled())
    }

    /// Write a flat index of `directory`.
    pub async fn build_index(
        &self,
        directory: &Path,
        exclude_patterns: &[String],
    ) -> Result<(IndexStats, PathBuf), FsError> {
        let excludes = ExcludeSet::new(exclude_patterns)?;
        let max_depth = self.config().search.max_depth;
        let dir = directory.to_path_buf();
        tokio::task::spawn_blocking(move || index::build_index(&dir, &excludes, max_depth))
            .await
            .map_err(|e| FsError::Unknown {
                message: format!("index task failed: {e}"),
            })?
    }

    /// Rank entries of an index file against `query`.
    pub async fn search_with_index(
        &self,
        index_path: &Path,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RankedEntry>, FsError> {
        let path = index_path.to_path_buf();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || index::search_with_index(&path, &query, max_results))
            .await
            .map_err(|e| FsError::Unknown {
                message: format!("index search task failed: {e}"),
            })?
    }
}

fn quick_walk(
    root: &Path,
    terms: &[String],
    max_results: usize,
    max_depth: usize,
    cancel: &CancellationToken,
) -> Result<Vec<RankedEntry>, FsError> {
    let metadata = std::fs::metadata(root).map_err(|e| FsError::io(root, OperationKind::List, e))?;
    if !metadata.is_dir() {
        return Err(FsError::invalid_path(root, "not a directory"));
    }

    let walker = jwalk::WalkDir::new(root)
        .skip_hidden(false)
        .follow_links(false)
        .min_depth(1)
        .max_depth(max_depth);

    let mut results = Vec::new();
    for entry in walker {
        if cancel.is_cancelled() {
            break;
        }
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let name = entry.file_name().to_string_lossy();
        let score = rank::score(
            &name.to_lowercase(),
            &relative.to_string_lossy().to_lowercase(),
            terms,
        );
        if score == 0 {
            continue;
        }

        results.push(RankedEntry {
            name: CompactString::from(name),
            relative_path: Some(relative),
            is_directory: entry.file_type().is_dir(),
            path,
            score,
        });
        if results.len() >= max_results.saturating_mul(2) {
            rank::rank(&mut results, max_results);
        }
    }

    rank::rank(&mut results, max_results);
    Ok(results)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    Directory,
    File,
    Other,
}

#[derive(Debug)]
struct Child {
    path: PathBuf,
    name: String,
    kind: ChildKind,
}

async fn read_children(dir: &Path) -> std::io::Result<Vec<Child>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let kind = match entry.file_type().await {
            Ok(ft) if ft.is_dir() => ChildKind::Directory,
            Ok(ft) if ft.is_file() => ChildKind::File,
            _ => ChildKind::Other,
        };
        children.push(Child {
            path: entry.path(),
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
        });
    }
    children.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(children)
}

/// State shared by every task of one traversal.
struct Walk<'a> {
    query: &'a SearchQuery,
    names: NameMatcher,
    excludes: ExcludeSet,
    content: Option<ContentPattern>,
    grep: GrepOptions,
    tracker: &'a ProgressTracker,
    cancel: &'a CancellationToken,
    batch_size: usize,
    max_depth: usize,
    limit: usize,
    visited: AtomicU64,
    skipped: AtomicU64,
    found: AtomicUsize,
    files: Mutex<Vec<FileEntry>>,
    matches: Mutex<Vec<SearchMatch>>,
}

impl<'a> Walk<'a> {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.found.load(Ordering::SeqCst) >= self.limit
    }

    /// Visit `dir`, whose children sit at `depth + 1`.
    fn walk_dir<'s>(&'s self, dir: PathBuf, depth: usize) -> BoxFuture<'s, ()>
    where
        'a: 's,
    {
        async move {
            if self.should_stop() {
                return;
            }

            let children = match read_children(&dir).await {
                Ok(children) => children,
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Skipping unreadable directory");
                    return;
                }
            };
            // The directory itself was already counted by its parent.
            self.tracker
                .grow_total(children.len().saturating_sub(1) as u64);

            for batch in children.chunks(self.batch_size) {
                if self.should_stop() {
                    break;
                }
                join_all(batch.iter().map(|child| self.visit(child, depth + 1))).await;
            }
        }
        .boxed()
    }

    async fn visit(&self, child: &Child, depth: usize) {
        if self.should_stop() {
            return;
        }
        self.visited.fetch_add(1, Ordering::Relaxed);
        self.tracker.update(
            1,
            Some("searching"),
            Some(details([("currentPath", child.path.display().to_string())])),
        );

        if self.excludes.is_excluded(&child.path) {
            return;
        }

        match child.kind {
            ChildKind::Directory => {
                if self.query.include_directories
                    && self.content.is_none()
                    && self.names.matches(&child.name, true)
                {
                    self.push_entry(FileEntry::directory(&child.path));
                }
                if self.query.recursive && depth < self.max_depth {
                    self.walk_dir(child.path.clone(), depth).await;
                }
            }
            ChildKind::File => self.visit_file(child).await,
            ChildKind::Other => {}
        }
    }

    async fn visit_file(&self, child: &Child) {
        if !self.names.matches(&child.name, false) {
            return;
        }

        if self.query.needs_metadata() {
            match tokio::fs::metadata(&child.path).await {
                Ok(metadata) if self.passes_filters(&metadata) => {}
                Ok(_) => return,
                Err(e) => {
                    debug!(path = %child.path.display(), error = %e, "Cannot stat file");
                    return;
                }
            }
        }

        let Some(pattern) = self.content.clone() else {
            self.push_entry(FileEntry::file(&child.path));
            return;
        };

        let path = child.path.clone();
        let options = self.grep;
        let outcome = tokio::task::spawn_blocking(move || grep_path(&path, &pattern, &options)).await;
        match outcome {
            Ok(Ok(GrepOutcome::Matched(line_matches))) => self.push_match(SearchMatch {
                file_path: child.path.clone(),
                file_name: CompactString::from(child.name.as_str()),
                line_matches,
            }),
            Ok(Ok(GrepOutcome::NoMatch)) => {}
            Ok(Ok(GrepOutcome::Skipped(reason))) => {
                debug!(path = %child.path.display(), ?reason, "Skipped file");
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!(path = %child.path.display(), error = %e, "Unreadable file");
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(path = %child.path.display(), error = %e, "Grep task failed");
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn passes_filters(&self, metadata: &std::fs::Metadata) -> bool {
        let size = metadata.len();
        if self.query.min_size.is_some_and(|min| size < min) {
            return false;
        }
        if self.query.max_size.is_some_and(|max| size > max) {
            return false;
        }

        if self.query.modified_after.is_none() && self.query.modified_before.is_none() {
            return true;
        }
        let Some(modified) = metadata.modified().ok().map(DateTime::<Utc>::from) else {
            return false;
        };
        if self.query.modified_after.is_some_and(|after| modified < after) {
            return false;
        }
        if self.query.modified_before.is_some_and(|before| modified > before) {
            return false;
        }
        true
    }

    fn push_entry(&self, entry: FileEntry) {
        let mut files = lock(&self.files);
        if self.found.load(Ordering::SeqCst) < self.limit {
            files.push(entry);
            self.found.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn push_match(&self, found: SearchMatch) {
        let mut matches = lock(&self.matches);
        if self.found.load(Ordering::SeqCst) < self.limit {
            matches.push(found);
            self.found.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn into_report(self) -> SearchReport {
        let cancelled = self.cancel.is_cancelled();
        let hits = if self.content.is_some() {
            let mut matches = self.matches.into_inner().unwrap_or_else(|e| e.into_inner());
            matches.sort_by(|a, b| a.file_path.cmp(&b.file_path));
            SearchHits::Matches(matches)
        } else {
            let mut files = self.files.into_inner().unwrap_or_else(|e| e.into_inner());
            files.sort_by(|a, b| a.full_path.cmp(&b.full_path));
            SearchHits::Files(files)
        };
        SearchReport {
            hits,
            cancelled,
            visited: self.visited.into_inner(),
            skipped_files: self.skipped.into_inner(),
        }
    }
}
