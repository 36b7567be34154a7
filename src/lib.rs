//! Tract is a version-control engine for the conversational context
//! consumed by large language models.
//!
//! Every message, instruction, tool invocation and reasoning trace is an
//! immutable, content-addressed commit in a DAG, exactly analogous to a
//! source-control system; branches, merges, rebases, compression and
//! garbage collection operate over that graph, and `compile` projects a
//! commit chain into the linear message list an LLM API expects.
//!
//! ```no_run
//! use tract::{Priority, Tract};
//!
//! # fn main() -> tract::Result<()> {
//! let t = Tract::in_memory()?;
//! let system = t.system("You are helpful.")?;
//! t.user("Hi")?;
//! t.assistant("Hello!")?;
//! t.annotate(&system.commit_hash, Priority::Pinned)?;
//!
//! let context = t.compile()?;
//! assert_eq!(context.messages.len(), 3);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod hash;
pub mod hooks;
pub mod internal;
pub mod llm;
pub mod storage;
pub mod tokens;

mod tract;

pub use config::{BudgetAction, TokenBudget, TractConfig};
pub use errors::{Result, TractError};
pub use hooks::{
    ActionSpec, HookEvent, HookOutcome, HookPosition, HookRejection, OperationOutput,
    OperationSpec, Pending, PendingKind, PendingStatus, RejectionSource, RetryOutcome,
    RetryResult, ValidationResult, auto_retry, retry_with_steering,
};
pub use internal::annotations::{
    AnnotationCounts, MatchMode, Priority, PriorityAnnotation, RetentionCriteria,
};
pub use internal::branch::BranchInfo;
pub use internal::commit::{CommitInfo, CommitOperation};
pub use internal::compiler::{
    CompileOptions, CompiledContext, ReorderWarning, WarningSeverity,
};
pub use internal::compress::{CompressOptions, CompressResult, GuidanceSource};
pub use internal::content::{Content, DialogueRole, SessionType, ToolIoRole};
pub use internal::gc::{GcOptions, GcResult};
pub use internal::history::{DiffResult, DiffStat, StatusInfo};
pub use internal::import::{ImportIssue, ImportResult};
pub use internal::merge::{ConflictInfo, ConflictKind, MergeResult, MergeType};
pub use internal::navigation::ResetMode;
pub use internal::rebase::{RebaseResult, RebaseWarning};
pub use llm::{
    ChatChoice, ChatRequest, ChatResponse, LlmClient, LlmConfig, LlmError, Message, TokenUsage,
};
pub use tokens::{NullTokenCounter, TiktokenCounter, TokenCounter};
pub use tract::{ChatReply, CommitArgs, Tract};
