//! filekit: batch file toolbox.
//!
//! [`FileService`] is the single entry point. It owns one engine per concern
//! and tags the progress of each with a [`ProgressChannel`] so a front end can
//! follow everything through one [`FileService::subscribe`] stream.
//!
//! ```no_run
//! use std::sync::Arc;
//! use filekit::{AppConfig, FileService, SearchQuery};
//!
//! # async fn run() -> Result<(), filekit::FsError> {
//! let service = FileService::new(Arc::new(AppConfig::default()));
//! let query = SearchQuery::builder("/var/log")
//!     .content_pattern("timeout")
//!     .build()
//!     .expect("valid query");
//! let report = service.search(&query).await?;
//! println!("{} files matched", report.hits.len());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::debug;

pub use filekit_core::*;
pub use filekit_exec as exec;
pub use filekit_ops::*;
pub use filekit_search::*;

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Search, batch operations and renames behind one handle.
pub struct FileService {
    config: RwLock<Arc<AppConfig>>,
    events: broadcast::Sender<ChannelEvent>,
    search: SearchEngine,
    operations: OperationManager,
    renames: RenameEngine,
}

impl std::fmt::Debug for FileService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileService")
            .field("config", &self.config())
            .field("subscribers", &self.events.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for FileService {
    fn default() -> Self {
        Self::new(Arc::new(AppConfig::default()))
    }
}

impl FileService {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            search: SearchEngine::new(Arc::clone(&config)),
            operations: OperationManager::new(Arc::clone(&config)),
            renames: RenameEngine::new(Arc::clone(&config)),
            config: RwLock::new(config),
            events,
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Validate and install a new configuration.
    ///
    /// Operations already running keep the snapshot they started with.
    pub fn reconfigure(&self, config: AppConfig) -> Result<(), FsError> {
        config.validate()?;
        let config = Arc::new(config);
        self.search.reconfigure(Arc::clone(&config));
        self.operations.reconfigure(Arc::clone(&config));
        self.renames.reconfigure(Arc::clone(&config));
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        debug!("Configuration replaced");
        Ok(())
    }

    /// Receive progress events from every channel.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    fn sink(&self, channel: ProgressChannel) -> Arc<dyn ProgressSink> {
        Arc::new(ChannelSink::new(channel, self.events.clone()))
    }

    /// Name search, or content search when the query carries a content pattern.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchReport, FsError> {
        let channel = if query.content_pattern.is_some() {
            ProgressChannel::ContentSearch
        } else {
            ProgressChannel::Search
        };
        self.search.search(query, self.sink(channel)).await
    }

    /// Ask the running search to stop. Returns as soon as the request is recorded.
    pub fn cancel_search(&self) {
        self.search.cancel();
    }

    pub fn search_state(&self) -> SearchState {
        self.search.state()
    }

    pub async fn grep_files(
        &self,
        files: &[PathBuf],
        pattern: &str,
        case_sensitive: bool,
        use_regex: bool,
    ) -> Result<SearchReport, FsError> {
        self.search
            .grep_files(
                files,
                pattern,
                case_sensitive,
                use_regex,
                self.sink(ProgressChannel::ContentSearch),
            )
            .await
    }

    pub async fn quick_search(
        &self,
        directory: &Path,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RankedEntry>, FsError> {
        self.search.quick_search(directory, query, max_results).await
    }

    /// Write a flat index file into `directory`.
    pub async fn build_index(
        &self,
        directory: &Path,
        exclude_patterns: &[String],
    ) -> Result<(IndexStats, PathBuf), FsError> {
        self.search.build_index(directory, exclude_patterns).await
    }

    pub async fn search_with_index(
        &self,
        index_path: &Path,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<RankedEntry>, FsError> {
        self.search
            .search_with_index(index_path, query, max_results)
            .await
    }

    /// Copy, move or delete a batch of entries.
    pub async fn batch_operate(
        &self,
        request: &BatchOperationRequest,
    ) -> Result<OperationResult, FsError> {
        self.operations
            .batch_operate(request, self.sink(ProgressChannel::Operation))
            .await
    }

    /// What `rule` would do, without touching the filesystem.
    pub async fn preview_rename(
        &self,
        candidates: Vec<RenameCandidate>,
        rule: RenameRule,
    ) -> Result<Vec<RenamePreviewEntry>, FsError> {
        self.renames.preview(candidates, rule).await
    }

    /// Apply `rule` to the candidates and commit the new names.
    pub async fn rename_batch(
        &self,
        candidates: &[RenameCandidate],
        rule: &RenameRule,
    ) -> Result<OperationResult, FsError> {
        self.renames
            .rename_batch(candidates, rule, self.sink(ProgressChannel::Rename))
            .await
    }

    /// Commit an already computed list of renames.
    pub async fn rename_files(&self, items: &[RenameItem]) -> Result<OperationResult, FsError> {
        self.renames
            .rename_files(items, self.sink(ProgressChannel::Rename))
            .await
    }

    /// Stop running batch operations and renames before their next batch.
    pub fn cancel_operation(&self) {
        self.operations.cancel();
        self.renames.cancel();
    }

    /// Cancel outstanding work and shut down the worker pool.
    ///
    /// Safe to call at any time, any number of times.
    pub async fn cleanup(&self) {
        self.search.cancel();
        self.cancel_operation();
        self.operations.cleanup().await;
        debug!("File service cleaned up");
    }
}
