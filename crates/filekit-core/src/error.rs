//! Error types shared by every filekit component.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

/// The filesystem action an error or event refers to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OperationKind {
    Copy,
    Move,
    Delete,
    Rename,
    Read,
    Write,
    List,
    CreateDir,
}

/// Errors produced by filekit operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path not found.
    #[error("Path not found: {path}")]
    NotFound { path: PathBuf },

    /// Permission denied for a path.
    #[error("Permission denied: {path}")]
    PermissionDenied { path: PathBuf },

    /// Target already exists.
    #[error("Already exists: {path}")]
    AlreadyExists { path: PathBuf },

    /// Path or name is not usable.
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Path contains a forbidden directory segment.
    #[error("Access to forbidden directory '{segment}' in {path}")]
    ForbiddenPath { path: PathBuf, segment: String },

    /// Generic I/O failure.
    #[error("{operation} failed at {path}: {source}")]
    OperationFailed {
        path: PathBuf,
        operation: OperationKind,
        #[source]
        source: std::io::Error,
    },

    /// A user-supplied pattern did not compile.
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Target exists and the `ask` strategy needs a caller decision.
    #[error("Conflict needs a decision: {destination} already exists")]
    ConflictUnresolved {
        from: PathBuf,
        destination: PathBuf,
    },

    /// Request violates a batch-level precondition.
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Worker died while running a job.
    #[error("Worker crashed: {message}")]
    WorkerCrashed { message: String },

    /// The worker pool has been shut down.
    #[error("Worker pool is shut down")]
    PoolShutdown,

    /// Work stopped because the caller cancelled it.
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything else.
    #[error("{message}")]
    Unknown { message: String },
}

impl FsError {
    /// Create an I/O error with path and action context.
    pub fn io(path: impl Into<PathBuf>, operation: OperationKind, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            ErrorKind::NotFound => Self::NotFound { path },
            ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            ErrorKind::AlreadyExists => Self::AlreadyExists { path },
            ErrorKind::InvalidInput => Self::InvalidPath {
                path,
                reason: source.to_string(),
            },
            _ => Self::OperationFailed {
                path,
                operation,
                source,
            },
        }
    }

    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_pattern(pattern: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidPattern {
            pattern: pattern.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::OperationFailed { source, .. } => is_transient_io(source),
            _ => false,
        }
    }

    /// Coarse classification used in per-item reports.
    pub fn kind(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::PermissionDenied { .. } => ErrorCategory::PermissionDenied,
            Self::AlreadyExists { .. } => ErrorCategory::AlreadyExists,
            Self::InvalidPath { .. } => ErrorCategory::InvalidPath,
            Self::ForbiddenPath { .. } => ErrorCategory::ForbiddenPath,
            Self::OperationFailed { .. } | Self::WorkerCrashed { .. } | Self::PoolShutdown => {
                ErrorCategory::OperationFailed
            }
            Self::InvalidPattern { .. } => ErrorCategory::InvalidPattern,
            Self::ConflictUnresolved { .. } => ErrorCategory::ConflictUnresolved,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::InvalidRequest { .. } | Self::InvalidConfig { .. } | Self::Unknown { .. } => {
                ErrorCategory::Unknown
            }
        }
    }
}

/// Whether an I/O error is worth retrying.
pub fn is_transient_io(err: &std::io::Error) -> bool {
    if matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ResourceBusy
    ) {
        return true;
    }

    // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
    #[cfg(windows)]
    if matches!(err.raw_os_error(), Some(32) | Some(33)) {
        return true;
    }

    false
}

/// Whether an I/O error means source and target live on different devices.
pub fn is_cross_device(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::CrossesDevices
}

/// Serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCategory {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidPath,
    ForbiddenPath,
    OperationFailed,
    InvalidPattern,
    ConflictUnresolved,
    Cancelled,
    Unknown,
}
