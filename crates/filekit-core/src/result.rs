//! Batch outcome accounting.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, FsError, OperationKind};

/// A per-item failure, kept with enough context to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    /// The path that failed.
    pub path: PathBuf,
    /// What was being attempted.
    pub operation: OperationKind,
    /// Error classification.
    pub kind: ErrorCategory,
    /// Human-readable message.
    pub message: String,
}

impl OperationError {
    pub fn new(path: impl Into<PathBuf>, operation: OperationKind, error: &FsError) -> Self {
        Self {
            path: path.into(),
            operation,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.path.display(), self.message)
    }
}

/// A target that already existed while the strategy was `ask`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// Aggregated result of a batch.
///
/// Counts only ever grow while the batch runs. For a batch of `n` items that
/// was not cancelled, `success + failed + skipped == n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// What the batch did.
    pub operation: OperationKind,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: Vec<OperationError>,
    /// Items left undecided by the `ask` strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<PendingConflict>,
    /// Entries inside merged directories left alone under `skip`. They do
    /// not count as items.
    #[serde(default)]
    pub skipped_entries: usize,
    /// The batch stopped early on request.
    #[serde(default)]
    pub cancelled: bool,
}

impl OperationResult {
    pub fn new(operation: OperationKind) -> Self {
        Self {
            operation,
            success: 0,
            failed: 0,
            skipped: 0,
            errors: Vec::new(),
            conflicts: Vec::new(),
            skipped_entries: 0,
            cancelled: false,
        }
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Count a failed item and keep its error.
    pub fn record_failure(&mut self, error: OperationError) {
        self.failed += 1;
        self.errors.push(error);
    }

    /// Count an item that needs a caller decision.
    pub fn record_conflict(&mut self, source: PathBuf, destination: PathBuf) {
        let error = FsError::ConflictUnresolved {
            from: source.clone(),
            destination: destination.clone(),
        };
        self.record_failure(OperationError::new(&source, self.operation, &error));
        self.conflicts.push(PendingConflict {
            source,
            destination,
        });
    }

    /// Count a directory that was merged entry by entry.
    ///
    /// Undecided entries fail the item once and are each listed in
    /// `conflicts`. Without them, an item whose entries were all skipped counts
    /// as skipped and anything else as a success.
    pub fn record_merge(
        &mut self,
        item: PathBuf,
        written: usize,
        skipped: usize,
        conflicts: Vec<PendingConflict>,
    ) {
        self.skipped_entries += skipped;
        if !conflicts.is_empty() {
            self.record_failure(OperationError {
                path: item,
                operation: self.operation,
                kind: ErrorCategory::ConflictUnresolved,
                message: format!("{} entries already exist and need a decision", conflicts.len()),
            });
            self.conflicts.extend(conflicts);
        } else if written == 0 && skipped > 0 {
            self.record_skip();
        } else {
            self.record_success();
        }
    }

    /// Number of items with a terminal outcome.
    pub fn processed(&self) -> usize {
        self.success + self.failed + self.skipped
    }

    /// Check if every processed item succeeded or was skipped.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Error messages as display strings.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    /// Get a human-readable summary of the batch.
    pub fn summary(&self) -> String {
        let action = match self.operation {
            OperationKind::Copy => "Copied",
            OperationKind::Move => "Moved",
            OperationKind::Delete => "Deleted",
            OperationKind::Rename => "Renamed",
            OperationKind::CreateDir => "Created",
            OperationKind::Read | OperationKind::Write | OperationKind::List => "Processed",
        };

        let mut summary = format!("{} {} items", action, self.success);
        if self.skipped > 0 {
            summary.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.skipped_entries > 0 {
            summary.push_str(&format!(", {} existing entries kept", self.skipped_entries));
        }
        if self.failed > 0 {
            summary.push_str(&format!(", {} failed", self.failed));
        }
        if self.cancelled {
            summary.push_str(" (cancelled)");
        }
        summary
    }
}
