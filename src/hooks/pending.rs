//! Pending operations: the plan-phase objects of the hook system.
//!
//! Every hookable operation runs in two phases. The plan phase computes
//! everything needed to execute without side effects and packages it
//! into a [`Pending`]; the execute phase is triggered only by
//! `approve()`. Handlers (and agents, through the whitelisted tool
//! surface) may mutate the plan in between: edit summaries, supply
//! conflict resolutions, exclude commits, rewrite tool results.
//!
//! One `Pending` struct carries the common lifecycle; the
//! operation-specific plan lives in [`PendingKind`]. Agent access goes
//! through `execute_tool`/`apply_decision`, gated on each kind's action
//! whitelist so private helpers stay private.

use serde_json::{Value, json};

use crate::errors::{Result, TractError};
use crate::hooks::validation::ValidationResult;
use crate::internal::commit::CommitInfo;
use crate::internal::compress::{CompressPlan, CompressResult, GuidanceSource, validate_summaries};
use crate::internal::gc::{GcPlan, GcResult};
use crate::internal::merge::{MergePlan, MergeResult};
use crate::internal::rebase::{RebasePlan, RebaseResult};
use crate::tract::Tract;

/// Lifecycle state of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
}

impl PendingStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Approved => "approved",
            PendingStatus::Rejected => "rejected",
        }
    }
}

/// What an executed operation produced.
#[derive(Debug, Clone)]
pub enum OperationOutput {
    Compress(CompressResult),
    Gc(GcResult),
    Rebase(RebaseResult),
    Merge(MergeResult),
    Commit(CommitInfo),
    Value(Value),
}

impl OperationOutput {
    pub fn into_compress(self) -> Option<CompressResult> {
        match self {
            OperationOutput::Compress(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_gc(self) -> Option<GcResult> {
        match self {
            OperationOutput::Gc(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_rebase(self) -> Option<RebaseResult> {
        match self {
            OperationOutput::Rebase(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_merge(self) -> Option<MergeResult> {
        match self {
            OperationOutput::Merge(result) => Some(result),
            _ => None,
        }
    }

    pub fn into_commit(self) -> Option<CommitInfo> {
        match self {
            OperationOutput::Commit(commit) => Some(commit),
            _ => None,
        }
    }

    fn summary_json(&self) -> Value {
        match self {
            OperationOutput::Compress(r) => json!({
                "compression_id": r.compression_id,
                "new_head": r.new_head,
                "summary_commits": r.summary_commits,
            }),
            OperationOutput::Gc(r) => json!({
                "commits_removed": r.commits_removed,
                "blobs_removed": r.blobs_removed,
                "tokens_freed": r.tokens_freed,
            }),
            OperationOutput::Rebase(r) => json!({
                "new_head": r.new_head,
                "replayed": r.replayed.len(),
            }),
            OperationOutput::Merge(r) => json!({
                "merge_type": r.merge_type,
                "new_head": r.new_head,
            }),
            OperationOutput::Commit(c) => json!({"commit_hash": c.commit_hash}),
            OperationOutput::Value(v) => v.clone(),
        }
    }
}

/// Compression plan state.
#[derive(Debug, Clone)]
pub struct CompressPending {
    pub plan: CompressPlan,
    /// One editable summary per group.
    pub summaries: Vec<String>,
    pub guidance: Option<String>,
    pub guidance_source: Option<GuidanceSource>,
}

/// Garbage-collection plan state.
#[derive(Debug, Clone)]
pub struct GcPending {
    pub plan: GcPlan,
}

/// Rebase plan state.
#[derive(Debug, Clone)]
pub struct RebasePending {
    pub plan: RebasePlan,
    /// Commits excluded from the plan by a handler.
    pub excluded: Vec<String>,
}

/// Merge-conflict plan state.
#[derive(Debug, Clone)]
pub struct MergePending {
    pub plan: MergePlan,
    pub no_ff: bool,
    pub guidance: Option<String>,
    /// target_hash -> reasoning recorded by an LLM resolver.
    pub resolution_reasoning: std::collections::BTreeMap<String, String>,
}

/// Tool-result middleware state.
#[derive(Debug, Clone)]
pub struct ToolResultPending {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    /// First pre-edit content, preserved for provenance.
    pub original_content: Option<String>,
    pub is_error: bool,
    pub token_count: usize,
}

/// Policy-proposal state.
#[derive(Debug, Clone)]
pub struct PolicyPending {
    pub policy_name: String,
    /// The hookable operation the policy proposes (`compress`, `gc`, ...).
    pub action: String,
    pub params: Value,
    pub proposal_reason: Option<String>,
}

/// Trigger-proposal state.
#[derive(Debug, Clone)]
pub struct TriggerPending {
    pub trigger_name: String,
    pub condition: String,
    /// The hookable operation the trigger fires.
    pub operation: String,
    pub params: Value,
}

/// Dynamically-registered operation state.
#[derive(Debug, Clone)]
pub struct DynamicPending {
    pub spec: crate::hooks::dynamic::OperationSpec,
    pub fields: serde_json::Map<String, Value>,
}

/// The operation-specific plan of a pending.
#[derive(Debug, Clone)]
pub enum PendingKind {
    Compress(CompressPending),
    Gc(GcPending),
    Rebase(RebasePending),
    Merge(MergePending),
    ToolResult(ToolResultPending),
    Policy(PolicyPending),
    Trigger(TriggerPending),
    Dynamic(DynamicPending),
}

/// A hookable operation between its plan and execute phases.
pub struct Pending {
    pub operation: String,
    pub pending_id: String,
    pub status: PendingStatus,
    pub rejection_reason: Option<String>,
    pub kind: PendingKind,
    pub(crate) tract: Tract,
    /// Set by `pass_through`; read and cleared by the router.
    pub(crate) passed_through: bool,
    pub(crate) result: Option<OperationOutput>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("operation", &self.operation)
            .field("pending_id", &self.pending_id)
            .field("status", &self.status.as_str())
            .finish_non_exhaustive()
    }
}

impl Pending {
    pub(crate) fn new(tract: Tract, operation: impl Into<String>, kind: PendingKind) -> Self {
        Self {
            operation: operation.into(),
            pending_id: uuid::Uuid::now_v7().to_string(),
            status: PendingStatus::Pending,
            rejection_reason: None,
            kind,
            tract,
            passed_through: false,
            result: None,
        }
    }

    fn require_pending(&self) -> Result<()> {
        match self.status {
            PendingStatus::Pending => Ok(()),
            other => Err(TractError::Hook(format!(
                "pending {} already resolved ({})",
                self.pending_id,
                other.as_str()
            ))),
        }
    }

    // -- Lifecycle -------------------------------------------------------

    /// Execute the planned operation. Consumes the pending's plan-phase
    /// state; afterwards `status` is `Approved` and `result()` holds the
    /// output.
    pub fn approve(&mut self) -> Result<OperationOutput> {
        self.require_pending()?;
        let tract = self.tract.clone();
        let output = tract.execute_pending(self)?;
        self.status = PendingStatus::Approved;
        self.result = Some(output.clone());
        Ok(output)
    }

    /// Reject the operation, leaving the tract untouched.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<()> {
        self.require_pending()?;
        self.status = PendingStatus::Rejected;
        self.rejection_reason = Some(reason.into());
        Ok(())
    }

    /// Middleware no-op: this handler has no opinion; the next handler in
    /// the chain decides (auto-approval if everyone passes).
    pub fn pass_through(&mut self) {
        self.passed_through = true;
    }

    pub fn result(&self) -> Option<&OperationOutput> {
        self.result.as_ref()
    }

    pub(crate) fn take_result(&mut self) -> Option<OperationOutput> {
        self.result.take()
    }

    // -- Typed plan access ----------------------------------------------

    pub fn as_compress(&self) -> Option<&CompressPending> {
        match &self.kind {
            PendingKind::Compress(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_gc(&self) -> Option<&GcPending> {
        match &self.kind {
            PendingKind::Gc(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_rebase(&self) -> Option<&RebasePending> {
        match &self.kind {
            PendingKind::Rebase(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_merge(&self) -> Option<&MergePending> {
        match &self.kind {
            PendingKind::Merge(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_tool_result(&self) -> Option<&ToolResultPending> {
        match &self.kind {
            PendingKind::ToolResult(state) => Some(state),
            _ => None,
        }
    }

    pub fn as_dynamic(&self) -> Option<&DynamicPending> {
        match &self.kind {
            PendingKind::Dynamic(state) => Some(state),
            _ => None,
        }
    }

    fn wrong_kind(&self, wanted: &str) -> TractError {
        TractError::Hook(format!(
            "operation '{}' does not support {wanted}",
            self.operation
        ))
    }

    // -- Compression editing --------------------------------------------

    /// Replace the summary text for one group.
    pub fn edit_summary(&mut self, index: usize, text: impl Into<String>) -> Result<()> {
        self.require_pending()?;
        let PendingKind::Compress(state) = &mut self.kind else {
            return Err(self.wrong_kind("edit_summary"));
        };
        let slot = state.summaries.get_mut(index).ok_or_else(|| {
            TractError::Hook(format!("no summary at index {index}"))
        })?;
        *slot = text.into();
        Ok(())
    }

    /// Replace the guidance text. The guidance source becomes `user`, or
    /// `user+llm` when LLM guidance existed before.
    pub fn edit_guidance(&mut self, text: impl Into<String>) -> Result<()> {
        self.require_pending()?;
        match &mut self.kind {
            PendingKind::Compress(state) => {
                state.guidance_source = Some(match state.guidance_source {
                    Some(GuidanceSource::Llm) | Some(GuidanceSource::UserPlusLlm) => {
                        GuidanceSource::UserPlusLlm
                    }
                    _ => GuidanceSource::User,
                });
                state.guidance = Some(text.into());
                Ok(())
            }
            PendingKind::Merge(state) => {
                state.guidance = Some(text.into());
                Ok(())
            }
            _ => Err(self.wrong_kind("edit_guidance")),
        }
    }

    /// Ask the LLM for fresh guidance (two-stage compression).
    pub fn regenerate_guidance(&mut self) -> Result<String> {
        self.require_pending()?;
        let tract = self.tract.clone();
        let PendingKind::Compress(state) = &mut self.kind else {
            return Err(self.wrong_kind("regenerate_guidance"));
        };
        let guidance = tract.generate_compress_guidance(&state.plan)?;
        state.guidance = Some(guidance.clone());
        state.guidance_source = Some(GuidanceSource::Llm);
        Ok(guidance)
    }

    /// Re-run one group's summarization with extra steering guidance.
    pub fn retry_summary(&mut self, index: usize, guidance: &str) -> Result<String> {
        self.require_pending()?;
        let tract = self.tract.clone();
        let PendingKind::Compress(state) = &mut self.kind else {
            return Err(self.wrong_kind("retry"));
        };
        if index >= state.summaries.len() {
            return Err(TractError::Hook(format!("no summary at index {index}")));
        }
        let combined = match &state.guidance {
            Some(existing) => format!("{existing}\n{guidance}"),
            None => guidance.to_string(),
        };
        let summary = tract.summarize_compress_group(&state.plan, index, Some(&combined))?;
        state.summaries[index] = summary.clone();
        Ok(summary)
    }

    // -- Merge editing ---------------------------------------------------

    /// Supply the resolution text for one conflicted target.
    pub fn set_resolution(&mut self, target_hash: &str, text: impl Into<String>) -> Result<()> {
        self.require_pending()?;
        let PendingKind::Merge(state) = &mut self.kind else {
            return Err(self.wrong_kind("set_resolution"));
        };
        if !state
            .plan
            .conflicts
            .iter()
            .any(|c| c.target_hash == target_hash)
        {
            return Err(TractError::Hook(format!(
                "no conflict over target {target_hash}"
            )));
        }
        state
            .plan
            .resolutions
            .insert(target_hash.to_string(), text.into());
        Ok(())
    }

    /// Alias of [`Pending::set_resolution`]; reads naturally when
    /// adjusting an existing resolution.
    pub fn edit_resolution(&mut self, target_hash: &str, text: impl Into<String>) -> Result<()> {
        self.set_resolution(target_hash, text)
    }

    /// Re-resolve every conflict through the LLM resolver, with optional
    /// extra guidance.
    pub fn retry_resolutions(&mut self, guidance: &str) -> Result<()> {
        self.require_pending()?;
        let tract = self.tract.clone();
        let PendingKind::Merge(state) = &mut self.kind else {
            return Err(self.wrong_kind("retry"));
        };
        let combined = match &state.guidance {
            Some(existing) => format!("{existing}\n{guidance}"),
            None => guidance.to_string(),
        };
        for conflict in &state.plan.conflicts {
            let (text, reasoning) = tract.resolve_conflict_with_llm(conflict, Some(&combined))?;
            state
                .plan
                .resolutions
                .insert(conflict.target_hash.clone(), text);
            if let Some(reasoning) = reasoning {
                state
                    .resolution_reasoning
                    .insert(conflict.target_hash.clone(), reasoning);
            }
        }
        Ok(())
    }

    // -- GC / rebase editing --------------------------------------------

    /// Exclude a commit from a gc removal plan or a rebase replay plan.
    pub fn exclude(&mut self, commit_hash: &str) -> Result<()> {
        self.require_pending()?;
        match &mut self.kind {
            PendingKind::Gc(state) => {
                let position = state
                    .plan
                    .commits_to_remove
                    .iter()
                    .position(|h| h == commit_hash)
                    .ok_or_else(|| {
                        TractError::Hook(format!(
                            "commit {commit_hash} is not in the removal list"
                        ))
                    })?;
                state.plan.commits_to_remove.remove(position);
                state.plan.archived.remove(commit_hash);
                Ok(())
            }
            PendingKind::Rebase(state) => {
                let position = state
                    .plan
                    .replay_plan
                    .iter()
                    .position(|h| h == commit_hash)
                    .ok_or_else(|| {
                        TractError::Hook(format!(
                            "commit {commit_hash} is not in the replay plan"
                        ))
                    })?;
                state.plan.replay_plan.remove(position);
                state.excluded.push(commit_hash.to_string());
                Ok(())
            }
            _ => Err(self.wrong_kind("exclude")),
        }
    }

    // -- Tool-result editing --------------------------------------------

    /// Replace the tool result content; the first call preserves the
    /// original for provenance.
    pub fn edit_result(&mut self, new_content: impl Into<String>) -> Result<()> {
        self.require_pending()?;
        let PendingKind::ToolResult(state) = &mut self.kind else {
            return Err(self.wrong_kind("edit_result"));
        };
        if state.original_content.is_none() {
            state.original_content = Some(state.content.clone());
        }
        state.content = new_content.into();
        Ok(())
    }

    /// Summarize the tool result through the LLM, optionally giving the
    /// model the compiled conversation as filtering context.
    pub fn summarize(&mut self, instructions: Option<&str>, include_context: bool) -> Result<()> {
        self.require_pending()?;
        let tract = self.tract.clone();
        let PendingKind::ToolResult(state) = &mut self.kind else {
            return Err(self.wrong_kind("summarize"));
        };
        if state.original_content.is_none() {
            state.original_content = Some(state.content.clone());
        }
        state.content = tract.summarize_tool_content(
            &state.tool_name,
            &state.content,
            instructions,
            include_context,
        )?;
        Ok(())
    }

    // -- Validation ------------------------------------------------------

    /// Validate the current plan state without executing.
    pub fn validate(&self) -> Result<ValidationResult> {
        match &self.kind {
            PendingKind::Compress(state) => {
                let failures = validate_summaries(&state.plan, &state.summaries)?;
                Ok(match failures.first() {
                    None => ValidationResult::pass(),
                    Some(failure) => ValidationResult::fail(
                        format!(
                            "summary is missing required fragment(s): {}",
                            failure.missing_patterns.join(", ")
                        ),
                        Some(failure.group_index),
                    ),
                })
            }
            PendingKind::Merge(state) => {
                let unresolved = state.plan.unresolved();
                Ok(if unresolved.is_empty() {
                    ValidationResult::pass()
                } else {
                    ValidationResult::fail(
                        format!("{} conflict(s) lack a resolution", unresolved.len()),
                        None,
                    )
                })
            }
            _ => Ok(ValidationResult::pass()),
        }
    }

    // -- Agent surface ---------------------------------------------------

    /// Method names an agent may invoke through `execute_tool`.
    pub fn public_actions(&self) -> Vec<&'static str> {
        match &self.kind {
            PendingKind::Compress(_) => vec![
                "approve",
                "reject",
                "edit_summary",
                "edit_guidance",
                "regenerate_guidance",
                "retry",
                "validate",
            ],
            PendingKind::Gc(_) | PendingKind::Rebase(_) => {
                vec!["approve", "reject", "exclude"]
            }
            PendingKind::Merge(_) => vec![
                "approve",
                "reject",
                "set_resolution",
                "edit_resolution",
                "edit_guidance",
                "retry",
                "validate",
            ],
            PendingKind::ToolResult(_) => {
                vec!["approve", "reject", "edit_result", "summarize"]
            }
            PendingKind::Policy(_) | PendingKind::Trigger(_) | PendingKind::Dynamic(_) => {
                vec!["approve", "reject"]
            }
        }
    }

    /// Every invocable action name, including dynamic ones.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .public_actions()
            .into_iter()
            .map(String::from)
            .collect();
        if let PendingKind::Dynamic(state) = &self.kind {
            names.extend(state.spec.actions.iter().map(|a| a.name.clone()));
        }
        names
    }

    /// Serialize the pending for LLM consumption.
    pub fn to_json(&self) -> Value {
        let mut value = json!({
            "operation": self.operation,
            "pending_id": self.pending_id,
            "status": self.status.as_str(),
            "rejection_reason": self.rejection_reason,
            "actions": self.action_names(),
        });
        let details = match &self.kind {
            PendingKind::Compress(state) => json!({
                "summaries": state.summaries,
                "guidance": state.guidance,
                "guidance_source": state.guidance_source.map(|g| g.as_str()),
                "source_commits": state.plan.source_commit_hashes(),
                "preserved_commits": state.plan.preserved_commit_hashes(),
                "original_tokens": state.plan.original_tokens,
            }),
            PendingKind::Gc(state) => json!({
                "commits_to_remove": state.plan.commits_to_remove,
                "tokens_to_free": state.plan.tokens_to_free,
            }),
            PendingKind::Rebase(state) => json!({
                "replay_plan": state.plan.replay_plan,
                "target_base": state.plan.target_base,
                "warnings": state.plan.warnings,
                "excluded": state.excluded,
            }),
            PendingKind::Merge(state) => json!({
                "source_branch": state.plan.source_branch,
                "conflicts": state
                    .plan
                    .conflicts
                    .iter()
                    .map(|c| json!({
                        "conflict_type": c.conflict_type.as_str(),
                        "target_hash": c.target_hash,
                        "content_a": c.content_a_text,
                        "content_b": c.content_b_text,
                        "ancestor": c.ancestor_content_text,
                    }))
                    .collect::<Vec<_>>(),
                "resolutions": state.plan.resolutions,
            }),
            PendingKind::ToolResult(state) => json!({
                "tool_call_id": state.tool_call_id,
                "tool_name": state.tool_name,
                "content": state.content,
                "original_content": state.original_content,
                "is_error": state.is_error,
                "token_count": state.token_count,
            }),
            PendingKind::Policy(state) => json!({
                "policy_name": state.policy_name,
                "action": state.action,
                "params": state.params,
                "proposal_reason": state.proposal_reason,
            }),
            PendingKind::Trigger(state) => json!({
                "trigger_name": state.trigger_name,
                "condition": state.condition,
                "fires": state.operation,
                "params": state.params,
            }),
            PendingKind::Dynamic(state) => json!({
                "spec": state.spec.name,
                "description": state.spec.description,
                "fields": state.fields,
            }),
        };
        value["details"] = details;
        value
    }

    /// JSON-schema tool definitions for the whitelisted actions, in the
    /// chat-completions function-call shape.
    pub fn to_tools(&self) -> Vec<Value> {
        self.action_names()
            .iter()
            .map(|name| {
                let (description, parameters) = self.action_schema(name);
                json!({
                    "type": "function",
                    "function": {
                        "name": name,
                        "description": description,
                        "parameters": parameters,
                    },
                })
            })
            .collect()
    }

    fn action_schema(&self, action: &str) -> (String, Value) {
        let object = |properties: Value, required: &[&str]| {
            json!({"type": "object", "properties": properties, "required": required})
        };
        match action {
            "approve" => (
                format!("Execute the planned {} operation.", self.operation),
                object(json!({}), &[]),
            ),
            "reject" => (
                "Reject the operation, leaving history unchanged.".into(),
                object(json!({"reason": {"type": "string"}}), &[]),
            ),
            "edit_summary" => (
                "Replace the summary text at an index.".into(),
                object(
                    json!({"index": {"type": "integer"}, "text": {"type": "string"}}),
                    &["index", "text"],
                ),
            ),
            "edit_guidance" => (
                "Replace the guidance steering the summaries or resolutions.".into(),
                object(json!({"text": {"type": "string"}}), &["text"]),
            ),
            "regenerate_guidance" => (
                "Ask the LLM for fresh guidance.".into(),
                object(json!({}), &[]),
            ),
            "retry" => (
                "Re-run generation with extra guidance.".into(),
                object(
                    json!({"index": {"type": "integer"}, "guidance": {"type": "string"}}),
                    &["guidance"],
                ),
            ),
            "validate" => (
                "Check the plan against its invariants without executing.".into(),
                object(json!({}), &[]),
            ),
            "exclude" => (
                "Remove a commit from the plan.".into(),
                object(json!({"commit_hash": {"type": "string"}}), &["commit_hash"]),
            ),
            "set_resolution" | "edit_resolution" => (
                "Provide resolution text for a conflicted target.".into(),
                object(
                    json!({"target_hash": {"type": "string"}, "text": {"type": "string"}}),
                    &["target_hash", "text"],
                ),
            ),
            "edit_result" => (
                "Replace the tool result content.".into(),
                object(json!({"text": {"type": "string"}}), &["text"]),
            ),
            "summarize" => (
                "Summarize the tool result via the LLM.".into(),
                object(
                    json!({
                        "instructions": {"type": "string"},
                        "include_context": {"type": "boolean"},
                    }),
                    &[],
                ),
            ),
            _ => {
                if let PendingKind::Dynamic(state) = &self.kind {
                    if let Some(spec) = state.spec.actions.iter().find(|a| a.name == action) {
                        let mut properties = serde_json::Map::new();
                        for param in &spec.params {
                            properties.insert(param.clone(), json!({"type": "string"}));
                        }
                        let required: Vec<&str> =
                            spec.required.iter().map(String::as_str).collect();
                        return (
                            spec.description.clone().unwrap_or_else(|| {
                                format!("Run the '{action}' action.")
                            }),
                            object(Value::Object(properties), &required),
                        );
                    }
                }
                (format!("Run the '{action}' action."), object(json!({}), &[]))
            }
        }
    }

    /// Markdown documentation of the agent-visible API.
    pub fn describe_api(&self) -> String {
        let mut out = format!(
            "## Pending `{}` ({})\n\nStatus: {}\n\n### Actions\n\n",
            self.operation,
            self.pending_id,
            self.status.as_str()
        );
        for name in self.action_names() {
            let (description, parameters) = self.action_schema(&name);
            out.push_str(&format!("- **{name}** — {description}"));
            if let Some(properties) = parameters["properties"].as_object() {
                if !properties.is_empty() {
                    let params: Vec<&str> = properties.keys().map(String::as_str).collect();
                    out.push_str(&format!(" Parameters: `{}`.", params.join("`, `")));
                }
            }
            out.push('\n');
        }
        out
    }

    /// Dispatch a decision object `{action, args}` through the whitelist.
    pub fn apply_decision(&mut self, decision: &Value) -> Result<Value> {
        let action = decision
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| TractError::Hook("decision requires an 'action' field".into()))?
            .to_string();
        let args = decision.get("args").cloned().unwrap_or_else(|| json!({}));
        self.execute_tool(&action, &args)
    }

    /// Invoke a whitelisted action by name with JSON arguments.
    pub fn execute_tool(&mut self, name: &str, args: &Value) -> Result<Value> {
        if !self.action_names().iter().any(|a| a == name) {
            return Err(TractError::Hook(format!(
                "action '{name}' is not available on '{}'",
                self.operation
            )));
        }
        let str_arg = |key: &str| -> Result<String> {
            args.get(key)
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| TractError::Hook(format!("missing '{key}' argument")))
        };

        match name {
            "approve" => {
                let output = self.approve()?;
                Ok(json!({"status": "approved", "result": output.summary_json()}))
            }
            "reject" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.reject(reason)?;
                Ok(json!({"status": "rejected"}))
            }
            "edit_summary" => {
                let index = args
                    .get("index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| TractError::Hook("missing 'index' argument".into()))?;
                self.edit_summary(index as usize, str_arg("text")?)?;
                Ok(json!({"status": "ok"}))
            }
            "edit_guidance" => {
                self.edit_guidance(str_arg("text")?)?;
                Ok(json!({"status": "ok"}))
            }
            "regenerate_guidance" => {
                let guidance = self.regenerate_guidance()?;
                Ok(json!({"status": "ok", "guidance": guidance}))
            }
            "retry" => {
                let guidance = str_arg("guidance")?;
                match &self.kind {
                    PendingKind::Merge(_) => {
                        self.retry_resolutions(&guidance)?;
                        Ok(json!({"status": "ok"}))
                    }
                    _ => {
                        let index = args.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let summary = self.retry_summary(index as usize, &guidance)?;
                        Ok(json!({"status": "ok", "summary": summary}))
                    }
                }
            }
            "validate" => {
                let result = self.validate()?;
                Ok(json!({
                    "passed": result.passed,
                    "diagnosis": result.diagnosis,
                    "index": result.index,
                }))
            }
            "exclude" => {
                self.exclude(&str_arg("commit_hash")?)?;
                Ok(json!({"status": "ok"}))
            }
            "set_resolution" | "edit_resolution" => {
                self.set_resolution(&str_arg("target_hash")?, str_arg("text")?)?;
                Ok(json!({"status": "ok"}))
            }
            "edit_result" => {
                self.edit_result(str_arg("text")?)?;
                Ok(json!({"status": "ok"}))
            }
            "summarize" => {
                let instructions = args.get("instructions").and_then(Value::as_str);
                let include_context = args
                    .get("include_context")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.summarize(instructions, include_context)?;
                Ok(json!({"status": "ok"}))
            }
            dynamic_action => {
                self.require_pending()?;
                let tract = self.tract.clone();
                let PendingKind::Dynamic(state) = &mut self.kind else {
                    return Err(TractError::Hook(format!(
                        "action '{dynamic_action}' is not implemented"
                    )));
                };
                tract.run_dynamic_action(&state.spec, &mut state.fields, dynamic_action, args)
            }
        }
    }
}
