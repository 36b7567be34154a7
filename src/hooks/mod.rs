//! The hook system.
//!
//! Every operation that destroys history (gc), transforms it
//! (compression, rebase), or requires judgment (merge resolution, tool
//! results, policy and trigger proposals) runs in two phases: a plan
//! phase that produces a [`Pending`], and an execute phase triggered
//! only by approval.
//!
//! Routing is three-tiered: a review-mode call returns the pending to
//! the caller; otherwise registered handlers fire in order until one
//! resolves it; with no handlers (or only pass-throughs) the operation
//! auto-approves. A recursion guard auto-approves hookable operations
//! triggered from inside a handler so middleware can never loop.

pub mod dynamic;
pub mod event;
pub mod pending;
pub mod registry;
pub mod retry;
pub mod validation;

pub use dynamic::{ActionSpec, OperationRegistry, OperationSpec, ScriptDecision};
pub use event::{HookEvent, HookEventLog};
pub use pending::{
    CompressPending, DynamicPending, GcPending, MergePending, OperationOutput, Pending,
    PendingKind, PendingStatus, PolicyPending, RebasePending, ToolResultPending, TriggerPending,
};
pub use registry::{CATCH_ALL, HookHandler, HookPosition, HookRegistry, NamedHandler};
pub use retry::{RetryOutcome, RetryResult, auto_retry, retry_with_steering};
pub use validation::{HookRejection, RejectionSource, ValidationResult};

/// How a routed hookable operation concluded.
#[derive(Debug)]
pub enum HookOutcome<T> {
    /// The operation executed; here is its result.
    Completed(T),
    /// Review mode: the caller owns the pending.
    Pending(Box<Pending>),
    /// A handler or validation rejected the operation.
    Rejected(HookRejection),
}

impl<T> HookOutcome<T> {
    /// Unwrap the completed result, failing on pending/rejected.
    pub fn completed(self) -> crate::errors::Result<T> {
        match self {
            HookOutcome::Completed(result) => Ok(result),
            HookOutcome::Pending(pending) => Err(crate::errors::TractError::Hook(format!(
                "operation '{}' is awaiting review",
                pending.operation
            ))),
            HookOutcome::Rejected(rejection) => Err(crate::errors::TractError::Hook(format!(
                "operation rejected: {rejection}"
            ))),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, HookOutcome::Completed(_))
    }
}
