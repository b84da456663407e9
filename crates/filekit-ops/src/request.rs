//! Batch operation requests.

use std::path::PathBuf;

use derive_builder::Builder;
use filekit_core::{FileEntry, FsError, OperationKind};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategy;

/// A copy, move or delete over a list of entries.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationRequest {
    /// [`OperationKind::Copy`], [`OperationKind::Move`] or [`OperationKind::Delete`].
    pub operation: OperationKind,

    /// Entries to process. Never empty.
    pub items: Vec<FileEntry>,

    /// Destination directory; required for copy and move, ignored for delete.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub target_path: Option<PathBuf>,

    #[builder(default)]
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,

    /// Recreate each item's position relative to the common root of the batch
    /// instead of placing everything directly in the target.
    #[builder(default = "false")]
    #[serde(default)]
    pub preserve_structure: bool,

    /// Run items of a batch concurrently.
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Concurrency override for this request.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl BatchOperationRequestBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.items.as_ref().is_some_and(|items| items.is_empty()) {
            return Err("At least one item is required".to_string());
        }
        if self.max_parallel == Some(Some(0)) {
            return Err("max_parallel must be at least 1".to_string());
        }
        Ok(())
    }
}

impl BatchOperationRequest {
    /// Start building a request for `operation` over `items`.
    pub fn builder(
        operation: OperationKind,
        items: Vec<FileEntry>,
    ) -> BatchOperationRequestBuilder {
        let mut builder = BatchOperationRequestBuilder::default();
        builder.operation(operation).items(items);
        builder
    }

    /// Check batch-level preconditions.
    pub fn validate(&self) -> Result<(), FsError> {
        let invalid = |message: &str| {
            Err(FsError::InvalidRequest {
                message: message.to_string(),
            })
        };

        if self.items.is_empty() {
            return invalid("at least one item is required");
        }
        if self.max_parallel == Some(0) {
            return invalid("max_parallel must be at least 1");
        }
        match self.operation {
            OperationKind::Copy | OperationKind::Move if self.target_path.is_none() => {
                invalid("a target directory is required")
            }
            OperationKind::Copy | OperationKind::Move | OperationKind::Delete => Ok(()),
            other => Err(FsError::InvalidRequest {
                message: format!("'{other}' is not a batch operation"),
            }),
        }
    }
}
