//! Core types for filekit.
//!
//! This crate provides the configuration, error taxonomy, data model and
//! progress plumbing shared by the search, operation and rename engines.

mod config;
mod entry;
mod error;
mod guard;
mod progress;
mod result;

pub use config::{
    AppConfig, AppConfigBuilder, BatchConfig, BatchConfigBuilder, MIB, PerformanceConfig,
    PerformanceConfigBuilder, RetryConfig, RetryConfigBuilder, SearchConfig, SearchConfigBuilder,
    SecurityConfig, SecurityConfigBuilder,
};
pub use entry::{FileEntry, file_name_of};
pub use error::{ErrorCategory, FsError, OperationKind, is_cross_device, is_transient_io};
pub use guard::{PathGuard, normalize};
pub use progress::{
    ChannelEvent, ChannelSink, Details, NoopSink, ProgressChannel, ProgressEvent, ProgressSink,
    ProgressTracker, details, lock,
};
pub use result::{OperationError, OperationResult, PendingConflict};

/// Convenience alias for results carrying [`FsError`].
pub type Result<T, E = FsError> = std::result::Result<T, E>;
