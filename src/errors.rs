//! Error types for the Tract crate.
//!
//! This module defines a unified error enumeration used across hashing,
//! storage, the commit engine, navigation, merge/rebase, compression and
//! the hook system. It integrates with `thiserror` to provide rich
//! `Display` implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - Validation and not-found variants are raised before any state change.

use thiserror::Error;

/// Unified error enumeration for the Tract library.
///
/// - Used across content validation, commit creation, ref navigation,
///   merge/rebase/import, compression, gc and hooks.
/// - Implements `std::error::Error` via `thiserror`.
#[derive(Error, Debug)]
pub enum TractError {
    /// Content payload does not match its declared variant.
    #[error("Content validation failed: {0}")]
    ContentValidation(String),

    /// Commit hash, prefix or ref lookup failed.
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    /// Blob lookup failed for a referenced content hash.
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    /// An edit targets a missing commit or another edit.
    #[error("Invalid edit target: {0}")]
    EditTarget(String),

    /// A hash prefix matched more than one commit.
    #[error("Ambiguous prefix `{prefix}`: {matches} commits match")]
    AmbiguousPrefix { prefix: String, matches: usize },

    /// A ref write collided with an existing ref.
    #[error("Ref already exists: {0}")]
    DuplicateRef(String),

    /// Branch creation collided with an existing branch.
    #[error("Branch already exists: {0}")]
    BranchExists(String),

    /// Branch lookup failed.
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// Branch name violates git-style naming rules.
    #[error("Invalid branch name `{name}`: {reason}")]
    InvalidBranchName { name: String, reason: String },

    /// Branch deletion refused: tip not reachable from the current branch.
    #[error("Branch `{0}` is not fully merged (use force to delete anyway)")]
    UnmergedBranch(String),

    /// Operation requires an attached HEAD.
    #[error("HEAD is detached: {0}")]
    DetachedHead(String),

    /// Merge source is already reachable from the target.
    #[error("Nothing to merge: {0}")]
    NothingToMerge(String),

    /// Merge produced unresolved conflicts.
    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    /// Rebase failed; the branch was restored to its original tip.
    #[error("Rebase failed: {0}")]
    Rebase(String),

    /// Single-commit import failed.
    #[error("Import failed: {0}")]
    ImportCommit(String),

    /// An operation would break a semantic safety rule.
    #[error("Semantic safety violation: {0}")]
    SemanticSafety(String),

    /// Compression planning or execution failed.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// Garbage collection failed.
    #[error("GC failed: {0}")]
    Gc(String),

    /// Token budget exceeded under the `reject` action.
    #[error("Token budget exceeded: {current} tokens (max: {max})")]
    BudgetExceeded { current: usize, max: usize },

    /// A policy action failed during execution.
    #[error("Policy execution failed: {0}")]
    PolicyExecution(String),

    /// A policy was configured with invalid parameters.
    #[error("Policy configuration invalid: {0}")]
    PolicyConfig(String),

    /// A validate-and-retry loop exhausted its attempts.
    #[error("Retry exhausted after {attempts} attempts: {last_diagnosis}")]
    RetryExhausted {
        attempts: usize,
        last_diagnosis: String,
        last_result: Option<String>,
    },

    /// A hook or pending object was used outside its lifecycle.
    #[error("Hook error: {0}")]
    Hook(String),

    /// Dynamic operation spec registration or execution failed.
    #[error("Operation spec error: {0}")]
    OperationSpec(String),

    /// Error reported by the injected LLM client.
    #[error("LLM client error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    /// Underlying SQLite failure.
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the sidecar directory (specs, scripted hooks).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic failure for miscellaneous conditions.
    #[error("{0}")]
    Other(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TractError>;
