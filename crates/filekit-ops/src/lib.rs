//! File operations engine for filekit.
//!
//! This crate runs batch copy, move and delete with conflict policies, and
//! rule-based batch renames with a side-effect-free preview. Progress goes to
//! a [`filekit_core::ProgressSink`]; every batch ends with an
//! [`filekit_core::OperationResult`].

mod conflict;
mod manager;
mod rename;
mod request;
mod rule;
mod transfer;

pub use conflict::{
    Claims, ConflictStrategy, Resolution, is_nested_in, resolve, split_extension, unique_path,
};
pub use manager::OperationManager;
pub use rename::{
    RenameCandidate, RenameEngine, RenameItem, RenamePreviewEntry, apply_rule, preview_rename,
};
pub use request::{BatchOperationRequest, BatchOperationRequestBuilder};
pub use rule::{CaseMode, CompiledRule, RenameRule, RuleInput, validate_name};
pub use transfer::{
    EntryPolicy, TransferJob, Transferred, copy_tree, delete_path, measure, merge_tree, move_path,
    run_job,
};
