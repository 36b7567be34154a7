//! The user-facing tract: one versioned context (one DAG, one set of
//! branches, one HEAD) over one backing database.
//!
//! `Tract` composes the storage layer, the commit engine, the compiler
//! and the hook system behind a git-shaped surface: `commit`, `branch`,
//! `switch`, `merge`, `rebase`, `compress`, `gc`, plus the LLM-facing
//! sugar (`system`/`user`/`assistant`/`chat`).
//!
//! A tract is cheap to clone (it is a handle) but deliberately
//! single-threaded: one instance owns one SQLite connection and
//! serializes all writes. Callers wanting parallelism open separate
//! tracts over distinct databases.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{BudgetAction, TractConfig};
use crate::errors::{Result, TractError};
use crate::hooks::dynamic::{
    OperationRegistry, OperationSpec, ScriptDecision, Sidecar, TractScriptApi, run_action,
    run_handler_script,
};
use crate::hooks::{
    CompressPending, DynamicPending, GcPending, HookEvent, HookEventLog, HookHandler, HookOutcome,
    HookPosition, HookRegistry, HookRejection, MergePending, OperationOutput, Pending, PendingKind,
    PendingStatus, PolicyPending, RebasePending, RejectionSource, ToolResultPending,
    TriggerPending,
};
use crate::internal::annotations::{
    AnnotationCounts, Priority, PriorityAnnotation, RetentionCriteria,
};
use crate::internal::branch::{BranchInfo, create_branch, delete_branch, list_branches};
use crate::internal::commit::{CommitInfo, CommitOperation};
use crate::internal::compiler::{
    CompileCache, CompileOptions, CompiledContext, compile, empty_context, resolve_anchor,
};
use crate::internal::compress::{
    CompressOptions, CompressPlan, CompressResult, GuidanceSource, execute_compress,
    generate_guidance, initial_summaries, plan_compress, summarize_group,
};
use crate::internal::content::{Content, DialogueRole, SessionType, ToolIoRole};
use crate::internal::dag::{is_ancestor, merge_base};
use crate::internal::engine::{CommitRequest, create_commit, load_content, storage_now};
use crate::internal::gc::{GcOptions, GcResult, execute_gc, plan_gc};
use crate::internal::history::{DiffResult, StatusInfo, diff_contexts, edit_history, log};
use crate::internal::import::{ImportResult, import_commit};
use crate::internal::merge::{
    ConflictInfo, MergeResult, execute_merge, plan_merge, resolve_conflict_prompt,
};
use crate::internal::navigation::{ResetMode, checkout, reset, resolve_commit};
use crate::internal::rebase::{RebaseResult, execute_rebase, plan_rebase};
use crate::llm::{ChatRequest, ChatResponse, LlmClient, LlmConfig, Message, TokenUsage};
use crate::storage::Store;
use crate::tokens::{TiktokenCounter, TokenCounter};

/// Additional parameters for `commit_with`.
#[derive(Default)]
pub struct CommitArgs {
    pub operation: Option<CommitOperation>,
    pub edit_target: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<LlmConfig>,
}

/// Reply returned by [`Tract::chat`].
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub user_commit: CommitInfo,
    pub assistant_commit: CommitInfo,
    pub usage: TokenUsage,
}

struct TractInner {
    tract_id: String,
    config: TractConfig,
    store: RefCell<Store>,
    cache: RefCell<CompileCache>,
    hooks: RefCell<HookRegistry>,
    hook_log: RefCell<HookEventLog>,
    in_handler: Cell<bool>,
    llm: RefCell<Option<Box<dyn LlmClient>>>,
    counter: RefCell<Rc<dyn TokenCounter>>,
    operations: RefCell<OperationRegistry>,
    sidecar: Option<Sidecar>,
}

/// Handle to one open tract. Clones share the same underlying state.
#[derive(Clone)]
pub struct Tract {
    inner: Rc<TractInner>,
}

impl Tract {
    // -- Construction ----------------------------------------------------

    /// Open (or create) a tract stored in `path`, with a `.tract/`
    /// sidecar directory next to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, TractConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: TractConfig) -> Result<Self> {
        let path = path.as_ref();
        let store = Store::open(path)?;
        let sidecar_root: PathBuf = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join(".tract");
        Self::from_store(store, config, Some(Sidecar::new(sidecar_root)))
    }

    /// Open an in-memory tract (no persistence, no sidecar).
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with(TractConfig::default())
    }

    pub fn in_memory_with(config: TractConfig) -> Result<Self> {
        Self::from_store(Store::open_in_memory()?, config, None)
    }

    fn from_store(store: Store, config: TractConfig, sidecar: Option<Sidecar>) -> Result<Self> {
        let tract_id = match store.get_meta("default_tract_id")? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                store.set_meta("default_tract_id", &id)?;
                id
            }
        };
        let cache_size = config.compile_cache_size;
        let tract = Self {
            inner: Rc::new(TractInner {
                tract_id,
                config,
                store: RefCell::new(store),
                cache: RefCell::new(CompileCache::new(cache_size)),
                hooks: RefCell::new(HookRegistry::default()),
                hook_log: RefCell::new(HookEventLog::default()),
                in_handler: Cell::new(false),
                llm: RefCell::new(None),
                counter: RefCell::new(Rc::new(TiktokenCounter::o200k())),
                operations: RefCell::new(OperationRegistry::default()),
                sidecar,
            }),
        };
        tract.load_sidecar()?;
        Ok(tract)
    }

    fn load_sidecar(&self) -> Result<()> {
        // Specs saved in the database first, then on-disk files win.
        {
            let specs = self.inner.store.borrow().list_specs()?;
            let mut registry = self.inner.operations.borrow_mut();
            for (_, raw) in specs {
                if let Ok(spec) = serde_json::from_str::<OperationSpec>(&raw) {
                    let _ = registry.register(spec);
                }
            }
        }
        let Some(sidecar) = &self.inner.sidecar else {
            return Ok(());
        };
        for spec in sidecar.load_specs()? {
            let mut registry = self.inner.operations.borrow_mut();
            if !registry.is_registered(&spec.name) {
                registry.register(spec)?;
            }
        }
        for (operation, name, code) in sidecar.load_handler_scripts()? {
            self.register_scripted_handler(&operation, &name, code)?;
        }
        Ok(())
    }

    // -- Injection -------------------------------------------------------

    pub fn set_llm_client(&self, client: Box<dyn LlmClient>) {
        *self.inner.llm.borrow_mut() = Some(client);
    }

    pub fn set_token_counter(&self, counter: Rc<dyn TokenCounter>) {
        *self.inner.counter.borrow_mut() = counter;
    }

    pub fn tract_id(&self) -> &str {
        &self.inner.tract_id
    }

    pub fn config(&self) -> &TractConfig {
        &self.inner.config
    }

    fn counter(&self) -> Rc<dyn TokenCounter> {
        self.inner.counter.borrow().clone()
    }

    fn llm_config_for(&self, operation: &str) -> LlmConfig {
        let defaults = &self.inner.config.llm_defaults;
        match self.inner.config.operation_configs.get(operation) {
            Some(op_config) => op_config.merged_over(defaults),
            None => defaults.clone(),
        }
    }

    fn with_llm<T>(
        &self,
        f: impl FnOnce(&dyn LlmClient) -> Result<T>,
    ) -> Result<T> {
        let borrow = self.inner.llm.borrow();
        let client = borrow
            .as_deref()
            .ok_or_else(|| TractError::Llm(crate::llm::LlmError::Config(
                "no LLM client configured".into(),
            )))?;
        f(client)
    }

    fn with_tx<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.inner.store.borrow_mut().begin()?;
        match f() {
            Ok(value) => {
                self.inner.store.borrow_mut().commit_tx()?;
                Ok(value)
            }
            Err(error) => {
                self.inner.store.borrow_mut().rollback_tx()?;
                // Rolled-back writes may have seeded the in-memory cache.
                self.inner.cache.borrow_mut().clear();
                Err(error)
            }
        }
    }

    /// Group several operations into one atomic unit: all commits land
    /// or none do.
    pub fn batch<T>(&self, f: impl FnOnce(&Tract) -> Result<T>) -> Result<T> {
        self.with_tx(|| f(self))
    }

    // -- Commits ---------------------------------------------------------

    pub fn commit(&self, content: Content) -> Result<CommitInfo> {
        self.commit_with(content, CommitArgs::default())
    }

    pub fn commit_with(&self, content: Content, args: CommitArgs) -> Result<CommitInfo> {
        let operation = args.operation.unwrap_or(match args.edit_target {
            Some(_) => CommitOperation::Edit,
            None => CommitOperation::Append,
        });
        self.with_tx(|| {
            let counter = self.counter();
            let commit = {
                let store = self.inner.store.borrow();
                create_commit(
                    &store,
                    &self.inner.tract_id,
                    &self.inner.config.default_branch,
                    &*counter,
                    CommitRequest {
                        content: &content,
                        operation,
                        edit_target: args.edit_target.clone(),
                        message: args.message.clone(),
                        metadata: args.metadata.clone(),
                        generation_config: args.generation_config.clone(),
                        parent_override: None,
                        update_head: true,
                    },
                )?
            };
            if let Some(target) = &commit.edit_target {
                self.invalidate_commit_caches(target)?;
            }
            self.check_budget()?;
            Ok(commit)
        })
    }

    fn check_budget(&self) -> Result<()> {
        let Some(budget) = &self.inner.config.token_budget else {
            return Ok(());
        };
        let Some(max) = budget.max_tokens else {
            return Ok(());
        };
        let current = self.compile()?.token_count;
        if current <= max {
            return Ok(());
        }
        match budget.action {
            BudgetAction::Warn => {
                warn!(current, max, "token budget exceeded");
                Ok(())
            }
            BudgetAction::Reject => Err(TractError::BudgetExceeded { current, max }),
            BudgetAction::Callback => {
                if let Some(callback) = &budget.callback {
                    callback(current, max);
                }
                Ok(())
            }
        }
    }

    // -- Commit sugar ----------------------------------------------------

    pub fn system(&self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::Instruction { text: text.into() })
    }

    pub fn user(&self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::Dialogue {
            role: DialogueRole::User,
            text: text.into(),
            name: None,
        })
    }

    pub fn assistant(&self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::Dialogue {
            role: DialogueRole::Assistant,
            text: text.into(),
            name: None,
        })
    }

    pub fn reasoning(&self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::Reasoning {
            text: text.into(),
            format: "text".into(),
        })
    }

    pub fn output(&self, text: impl Into<String>) -> Result<CommitInfo> {
        self.commit(Content::Output { text: text.into() })
    }

    pub fn session(
        &self,
        session_type: SessionType,
        summary: impl Into<String>,
    ) -> Result<CommitInfo> {
        self.commit(Content::Session {
            session_type,
            summary: summary.into(),
            decisions: Vec::new(),
            failed_approaches: Vec::new(),
            next_steps: Vec::new(),
        })
    }

    /// Record an assistant tool call.
    pub fn tool_call(
        &self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Result<CommitInfo> {
        let name = name.into();
        let tool_call_id = tool_call_id.into();
        self.commit_with(
            Content::ToolIo {
                role: ToolIoRole::ToolCall,
                name: name.clone(),
                arguments: Some(arguments),
                result: None,
                tool_call_id: tool_call_id.clone(),
            },
            CommitArgs {
                metadata: Some(json!({"name": name, "tool_call_id": tool_call_id})),
                ..Default::default()
            },
        )
    }

    /// Record a tool result. Hookable: registered `tool_result` handlers
    /// may edit, summarize or reject the content before it is committed.
    pub fn tool_result(
        &self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<HookOutcome<CommitInfo>> {
        let pending = self.plan_tool_result(tool_call_id.into(), name.into(), content.into(), false);
        convert_outcome(self.route(pending)?, OperationOutput::into_commit)
    }

    /// Review-mode tool result: the caller owns the pending.
    pub fn tool_result_review(
        &self,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Pending> {
        Ok(self.plan_tool_result(tool_call_id.into(), name.into(), content.into(), false))
    }

    fn plan_tool_result(
        &self,
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    ) -> Pending {
        let token_count = self.counter().count_text(&content);
        Pending::new(
            self.clone(),
            "tool_result",
            PendingKind::ToolResult(ToolResultPending {
                tool_call_id,
                tool_name,
                content,
                original_content: None,
                is_error,
                token_count,
            }),
        )
    }

    /// Edit an earlier commit in place.
    pub fn edit(&self, target: &str, content: Content) -> Result<CommitInfo> {
        let target = self.resolve(target)?;
        self.commit_with(content, CommitArgs {
            operation: Some(CommitOperation::Edit),
            edit_target: Some(target),
            ..Default::default()
        })
    }

    // -- Chat ------------------------------------------------------------

    /// Commit the prompt, send the compiled context to the injected LLM,
    /// and commit the assistant reply with generation provenance.
    pub fn chat(&self, prompt: impl Into<String>) -> Result<ChatReply> {
        let user_commit = self.user(prompt)?;
        let context = self.compile()?;
        let config = self.llm_config_for("chat");
        let response: ChatResponse = self.with_llm(|llm| {
            llm.chat(ChatRequest::new(context.messages.clone()).with_config(config.clone()))
                .map_err(TractError::Llm)
        })?;
        let text = response.first_content()?.to_string();
        let assistant_commit = self.commit_with(
            Content::Dialogue {
                role: DialogueRole::Assistant,
                text: text.clone(),
                name: None,
            },
            CommitArgs {
                generation_config: Some(config),
                metadata: Some(json!({
                    "usage": response.usage,
                    "model": response.model,
                })),
                ..Default::default()
            },
        )?;
        Ok(ChatReply {
            text,
            user_commit,
            assistant_commit,
            usage: response.usage,
        })
    }

    // -- Compile & history ----------------------------------------------

    pub fn compile(&self) -> Result<CompiledContext> {
        self.compile_with(CompileOptions::default())
    }

    pub fn compile_with(&self, options: CompileOptions) -> Result<CompiledContext> {
        let counter = self.counter();
        let store = self.inner.store.borrow();
        let Some(head) = store.get_head(&self.inner.tract_id)? else {
            return Ok(empty_context(&*counter));
        };
        let Some(anchor) = resolve_anchor(&store, &head, &options)? else {
            return Ok(empty_context(&*counter));
        };
        let mut cache = self.inner.cache.borrow_mut();
        compile(
            &store,
            &mut cache,
            &self.inner.tract_id,
            &anchor,
            &options,
            &*counter,
        )
    }

    /// Compile as of a past commit.
    pub fn compile_at(&self, at_commit: &str) -> Result<CompiledContext> {
        let anchor = self.resolve(at_commit)?;
        self.compile_with(CompileOptions {
            at_commit: Some(anchor),
            ..Default::default()
        })
    }

    /// Compile as of a past instant.
    pub fn compile_at_time(&self, at_time: DateTime<Utc>) -> Result<CompiledContext> {
        self.compile_with(CompileOptions {
            at_time: Some(at_time),
            ..Default::default()
        })
    }

    pub fn log(&self) -> Result<Vec<CommitInfo>> {
        self.log_limited(None)
    }

    pub fn log_limited(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        let store = self.inner.store.borrow();
        match store.get_head(&self.inner.tract_id)? {
            Some(head) => log(&store, &head, limit),
            None => Ok(Vec::new()),
        }
    }

    /// All revisions of an append commit (original first).
    pub fn edit_history(&self, target: &str) -> Result<Vec<CommitInfo>> {
        let target = self.resolve(target)?;
        edit_history(&self.inner.store.borrow(), &target)
    }

    /// Message-level diff between two refs (older, newer).
    pub fn diff(&self, older: &str, newer: &str) -> Result<DiffResult> {
        let older = self.compile_at(older)?;
        let newer = self.compile_at(newer)?;
        Ok(diff_contexts(&older, &newer))
    }

    pub fn status(&self) -> Result<StatusInfo> {
        let context = self.compile()?;
        let store = self.inner.store.borrow();
        let head_hash = store.get_head(&self.inner.tract_id)?;
        let branch_name = store.current_branch(&self.inner.tract_id)?;
        let is_detached = store.head_is_detached(&self.inner.tract_id)?;
        let recent_commits = match &head_hash {
            Some(head) => log(&store, head, Some(3))?,
            None => Vec::new(),
        };
        Ok(StatusInfo {
            head_hash,
            branch_name,
            is_detached,
            commit_count: context.commit_count,
            token_count: context.token_count,
            token_budget_max: self
                .inner
                .config
                .token_budget
                .as_ref()
                .and_then(|b| b.max_tokens),
            token_source: context.token_source,
            recent_commits,
        })
    }

    pub fn get_commit(&self, reference: &str) -> Result<CommitInfo> {
        let hash = self.resolve(reference)?;
        self.inner.store.borrow().require_commit(&hash)
    }

    /// Load the typed content payload of a commit.
    pub fn get_content(&self, reference: &str) -> Result<Content> {
        let commit = self.get_commit(reference)?;
        load_content(&self.inner.store.borrow(), &commit)
    }

    // -- Annotations -----------------------------------------------------

    pub fn annotate(&self, target: &str, priority: Priority) -> Result<PriorityAnnotation> {
        self.annotate_with(target, priority, None, None)
    }

    pub fn annotate_with(
        &self,
        target: &str,
        priority: Priority,
        reason: Option<String>,
        retention: Option<RetentionCriteria>,
    ) -> Result<PriorityAnnotation> {
        let target = self.resolve(target)?;
        let annotation = PriorityAnnotation {
            id: None,
            tract_id: self.inner.tract_id.clone(),
            target_hash: target.clone(),
            priority,
            reason,
            retention,
            created_at: storage_now(),
        };
        let id = self.inner.store.borrow().insert_annotation(&annotation)?;
        self.invalidate_commit_caches(&target)?;
        Ok(PriorityAnnotation {
            id: Some(id),
            ..annotation
        })
    }

    pub fn annotation_counts(&self) -> Result<AnnotationCounts> {
        self.inner
            .store
            .borrow()
            .annotation_counts(&self.inner.tract_id)
    }

    pub fn annotation_history(&self, target: &str) -> Result<Vec<PriorityAnnotation>> {
        let target = self.resolve(target)?;
        self.inner.store.borrow().annotation_history(&target)
    }

    // -- Branches & navigation ------------------------------------------

    /// Create a branch at HEAD and switch onto it.
    pub fn branch(&self, name: &str) -> Result<String> {
        let store = self.inner.store.borrow();
        create_branch(&store, &self.inner.tract_id, name, None, true)
    }

    /// Create a branch without switching, optionally at a given source.
    pub fn branch_at(&self, name: &str, source: Option<&str>, switch: bool) -> Result<String> {
        let source = source.map(|s| self.resolve(s)).transpose()?;
        let store = self.inner.store.borrow();
        create_branch(
            &store,
            &self.inner.tract_id,
            name,
            source.as_deref(),
            switch,
        )
    }

    /// Switch HEAD onto an existing branch.
    pub fn switch(&self, name: &str) -> Result<String> {
        let store = self.inner.store.borrow();
        let tip = store
            .get_branch(&self.inner.tract_id, name)?
            .ok_or_else(|| TractError::BranchNotFound(name.to_string()))?;
        store.attach_head(&self.inner.tract_id, name)?;
        Ok(tip)
    }

    pub fn delete_branch(&self, name: &str, force: bool) -> Result<()> {
        let store = self.inner.store.borrow();
        delete_branch(&store, &self.inner.tract_id, name, force)
    }

    pub fn branches(&self) -> Result<Vec<BranchInfo>> {
        list_branches(&self.inner.store.borrow(), &self.inner.tract_id)
    }

    pub fn current_branch(&self) -> Result<Option<String>> {
        self.inner
            .store
            .borrow()
            .current_branch(&self.inner.tract_id)
    }

    pub fn head(&self) -> Result<Option<String>> {
        self.inner.store.borrow().get_head(&self.inner.tract_id)
    }

    /// Resolve a ref, branch name, full hash or >=4-char prefix.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let store = self.inner.store.borrow();
        if reference == "HEAD" {
            return store
                .get_head(&self.inner.tract_id)?
                .ok_or_else(|| TractError::CommitNotFound("HEAD".into()));
        }
        if let Some(hash) = store.get_ref(&self.inner.tract_id, reference)? {
            return Ok(hash);
        }
        resolve_commit(&store, &self.inner.tract_id, reference)
    }

    /// Move HEAD to a target, recording `ORIG_HEAD`. `Hard` requires
    /// `force` (the verb reads like git; there is no working tree).
    pub fn reset(&self, target: &str, mode: ResetMode, force: bool) -> Result<String> {
        if mode == ResetMode::Hard && !force {
            return Err(TractError::SemanticSafety(
                "hard reset requires force=true".into(),
            ));
        }
        let target = self.resolve(target)?;
        let store = self.inner.store.borrow();
        reset(&store, &self.inner.tract_id, &target, mode)
    }

    /// Checkout a branch, commit, prefix, or `-` for the previous
    /// position. Returns `(hash, is_detached)`.
    pub fn checkout(&self, target: &str) -> Result<(String, bool)> {
        let store = self.inner.store.borrow();
        checkout(&store, &self.inner.tract_id, target)
    }

    // -- Merge -----------------------------------------------------------

    /// Merge a branch into the current HEAD. Fast-forward and clean
    /// merges execute immediately; conflicted merges route through the
    /// hook system as a `merge` pending.
    pub fn merge(&self, source_branch: &str, no_ff: bool) -> Result<HookOutcome<MergeResult>> {
        let plan = {
            let store = self.inner.store.borrow();
            plan_merge(&store, &self.inner.tract_id, source_branch, no_ff)?
        };
        if !plan.has_conflicts() {
            let result = self.with_tx(|| {
                let counter = self.counter();
                let store = self.inner.store.borrow();
                execute_merge(
                    &store,
                    &self.inner.tract_id,
                    &self.inner.config.default_branch,
                    &*counter,
                    &plan,
                    no_ff,
                )
            })?;
            self.inner.cache.borrow_mut().clear();
            return Ok(HookOutcome::Completed(result));
        }
        let pending = Pending::new(
            self.clone(),
            "merge",
            PendingKind::Merge(MergePending {
                plan,
                no_ff,
                guidance: None,
                resolution_reasoning: BTreeMap::new(),
            }),
        );
        convert_outcome(self.route(pending)?, OperationOutput::into_merge)
    }

    /// Review-mode merge: always returns the pending (even without
    /// conflicts the caller may inspect the plan before approving).
    pub fn merge_review(&self, source_branch: &str, no_ff: bool) -> Result<Pending> {
        let store = self.inner.store.borrow();
        let plan = plan_merge(&store, &self.inner.tract_id, source_branch, no_ff)?;
        drop(store);
        Ok(Pending::new(
            self.clone(),
            "merge",
            PendingKind::Merge(MergePending {
                plan,
                no_ff,
                guidance: None,
                resolution_reasoning: BTreeMap::new(),
            }),
        ))
    }

    pub fn merge_base(&self, a: &str, b: &str) -> Result<Option<String>> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;
        merge_base(&self.inner.store.borrow(), &a, &b)
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let ancestor = self.resolve(ancestor)?;
        let descendant = self.resolve(descendant)?;
        is_ancestor(&self.inner.store.borrow(), &ancestor, &descendant)
    }

    // -- Rebase ----------------------------------------------------------

    pub fn rebase(&self, onto_branch: &str) -> Result<HookOutcome<RebaseResult>> {
        let pending = self.plan_rebase_pending(onto_branch)?;
        convert_outcome(self.route(pending)?, OperationOutput::into_rebase)
    }

    pub fn rebase_review(&self, onto_branch: &str) -> Result<Pending> {
        self.plan_rebase_pending(onto_branch)
    }

    fn plan_rebase_pending(&self, onto_branch: &str) -> Result<Pending> {
        let store = self.inner.store.borrow();
        let plan = plan_rebase(&store, &self.inner.tract_id, onto_branch)?;
        drop(store);
        Ok(Pending::new(
            self.clone(),
            "rebase",
            PendingKind::Rebase(RebasePending {
                plan,
                excluded: Vec::new(),
            }),
        ))
    }

    // -- Import ----------------------------------------------------------

    /// Cherry-pick a single commit onto the current HEAD.
    pub fn import_commit(&self, reference: &str) -> Result<ImportResult> {
        let source = self.resolve(reference)?;
        self.with_tx(|| {
            let counter = self.counter();
            let store = self.inner.store.borrow();
            import_commit(
                &store,
                &self.inner.tract_id,
                &self.inner.config.default_branch,
                &*counter,
                &source,
            )
        })
    }

    // -- Compression -----------------------------------------------------

    pub fn compress(&self, options: CompressOptions) -> Result<HookOutcome<CompressResult>> {
        let pending = self.plan_compress_pending(options)?;
        convert_outcome(self.route(pending)?, OperationOutput::into_compress)
    }

    pub fn compress_review(&self, options: CompressOptions) -> Result<Pending> {
        self.plan_compress_pending(options)
    }

    fn plan_compress_pending(&self, mut options: CompressOptions) -> Result<Pending> {
        if let Some(from) = &options.from {
            options.from = Some(self.resolve(from)?);
        }
        if let Some(to) = &options.to {
            options.to = Some(self.resolve(to)?);
        }
        let mut preserve = Vec::new();
        for reference in &options.preserve {
            preserve.push(self.resolve(reference)?);
        }
        options.preserve = preserve;

        let plan = {
            let store = self.inner.store.borrow();
            plan_compress(&store, &self.inner.tract_id, options)?
        };

        let config = self.llm_config_for("compress");
        let (guidance, guidance_source) = if plan.options.two_stage {
            let guidance =
                self.with_llm(|llm| generate_guidance(llm, &config, &plan))?;
            (Some(guidance), Some(GuidanceSource::Llm))
        } else {
            (None, None)
        };

        let summaries = if plan.options.content.is_some() {
            initial_summaries(&plan, None, &config, guidance.as_deref())?
        } else {
            self.with_llm(|llm| {
                initial_summaries(&plan, Some(llm), &config, guidance.as_deref())
            })?
        };

        Ok(Pending::new(
            self.clone(),
            "compress",
            PendingKind::Compress(CompressPending {
                plan,
                summaries,
                guidance,
                guidance_source,
            }),
        ))
    }

    // -- Garbage collection ---------------------------------------------

    pub fn gc(&self, options: Option<GcOptions>) -> Result<HookOutcome<GcResult>> {
        let pending = self.plan_gc_pending(options)?;
        convert_outcome(self.route(pending)?, OperationOutput::into_gc)
    }

    pub fn gc_review(&self, options: Option<GcOptions>) -> Result<Pending> {
        self.plan_gc_pending(options)
    }

    fn plan_gc_pending(&self, options: Option<GcOptions>) -> Result<Pending> {
        let options = options.unwrap_or(GcOptions {
            orphan_retention_days: self.inner.config.orphan_retention_days,
            archive_retention_days: self.inner.config.archive_retention_days,
        });
        let store = self.inner.store.borrow();
        let plan = plan_gc(&store, &self.inner.tract_id, &options)?;
        drop(store);
        Ok(Pending::new(
            self.clone(),
            "gc",
            PendingKind::Gc(GcPending { plan }),
        ))
    }

    // -- Policies & triggers --------------------------------------------

    /// Propose a policy action through the hook system.
    pub fn propose_policy(
        &self,
        policy_name: &str,
        action: &str,
        params: Value,
        reason: Option<String>,
    ) -> Result<HookOutcome<Value>> {
        let pending = Pending::new(
            self.clone(),
            "policy",
            PendingKind::Policy(PolicyPending {
                policy_name: policy_name.to_string(),
                action: action.to_string(),
                params,
                proposal_reason: reason,
            }),
        );
        convert_outcome(self.route(pending)?, |output| match output {
            OperationOutput::Value(value) => Some(value),
            _ => None,
        })
    }

    /// Fire a trigger proposal through the hook system.
    pub fn fire_trigger(
        &self,
        trigger_name: &str,
        condition: &str,
        operation: &str,
        params: Value,
    ) -> Result<HookOutcome<Value>> {
        let pending = Pending::new(
            self.clone(),
            "trigger",
            PendingKind::Trigger(TriggerPending {
                trigger_name: trigger_name.to_string(),
                condition: condition.to_string(),
                operation: operation.to_string(),
                params,
            }),
        );
        convert_outcome(self.route(pending)?, |output| match output {
            OperationOutput::Value(value) => Some(value),
            _ => None,
        })
    }

    // -- Dynamic operations ---------------------------------------------

    /// Register a dynamic operation. The spec persists in the database
    /// and, when a sidecar exists, as `operations/<name>.json`.
    pub fn register_operation(&self, spec: OperationSpec) -> Result<()> {
        self.inner.operations.borrow_mut().register(spec.clone())?;
        self.inner
            .store
            .borrow()
            .save_spec(&spec.name, &serde_json::to_string(&spec)?)?;
        if let Some(sidecar) = &self.inner.sidecar {
            sidecar.save_spec(&spec)?;
        }
        Ok(())
    }

    pub fn unregister_operation(&self, name: &str) -> Result<bool> {
        let removed = self.inner.operations.borrow_mut().unregister(name);
        if removed {
            self.inner.store.borrow().delete_spec(name)?;
            if let Some(sidecar) = &self.inner.sidecar {
                sidecar.remove_spec(name)?;
            }
        }
        Ok(removed)
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.inner.operations.borrow().names()
    }

    /// Fire a registered dynamic operation with field overrides.
    pub fn operation(
        &self,
        name: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<HookOutcome<Value>> {
        let pending = self.plan_operation_pending(name, fields)?;
        convert_outcome(self.route(pending)?, |output| match output {
            OperationOutput::Value(value) => Some(value),
            _ => None,
        })
    }

    pub fn operation_review(
        &self,
        name: &str,
        fields: serde_json::Map<String, Value>,
    ) -> Result<Pending> {
        self.plan_operation_pending(name, fields)
    }

    fn plan_operation_pending(
        &self,
        name: &str,
        overrides: serde_json::Map<String, Value>,
    ) -> Result<Pending> {
        let registry = self.inner.operations.borrow();
        let spec = registry
            .get(name)
            .ok_or_else(|| TractError::OperationSpec(format!("unknown operation '{name}'")))?
            .clone();
        drop(registry);
        let mut fields = spec.fields.clone();
        for (key, value) in overrides {
            fields.insert(key, value);
        }
        Ok(Pending::new(
            self.clone(),
            spec.name.clone(),
            PendingKind::Dynamic(DynamicPending { spec, fields }),
        ))
    }

    // -- Hook registration ----------------------------------------------

    /// Register a handler for an operation name (or `"*"` for all).
    pub fn on(
        &self,
        operation: &str,
        handler: impl Fn(&mut Pending) + 'static,
        name: Option<&str>,
    ) -> Result<String> {
        self.on_with(operation, handler, name, HookPosition::Append)
    }

    pub fn on_with(
        &self,
        operation: &str,
        handler: impl Fn(&mut Pending) + 'static,
        name: Option<&str>,
        position: HookPosition,
    ) -> Result<String> {
        self.inner.hooks.borrow_mut().on(
            operation,
            Rc::new(handler) as HookHandler,
            name.map(String::from),
            position,
        )
    }

    /// Remove one handler by name, or all handlers for the operation.
    pub fn off(&self, operation: &str, name: Option<&str>) -> usize {
        self.inner.hooks.borrow_mut().off(operation, name)
    }

    pub fn hook_names(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.hooks.borrow().hook_names()
    }

    pub fn print_hooks(&self) -> String {
        self.inner.hooks.borrow().describe()
    }

    pub fn hook_log(&self) -> Vec<HookEvent> {
        self.inner.hook_log.borrow().events()
    }

    fn register_scripted_handler(&self, operation: &str, name: &str, code: String) -> Result<()> {
        let tract = self.clone();
        let handler = move |pending: &mut Pending| {
            let api = tract.script_api();
            match run_handler_script(api, pending.to_json(), &code) {
                Ok(ScriptDecision::Approve) => {
                    if let Err(error) = pending.approve() {
                        warn!(%error, "scripted handler approve failed");
                    }
                }
                Ok(ScriptDecision::Reject(reason)) => {
                    let _ = pending.reject(reason);
                }
                Ok(ScriptDecision::PassThrough) | Ok(ScriptDecision::None) => {
                    pending.pass_through();
                }
                Err(error) => {
                    warn!(%error, "scripted handler failed; passing through");
                    pending.pass_through();
                }
            }
        };
        self.on(operation, handler, Some(name))?;
        Ok(())
    }

    // -- Routing ---------------------------------------------------------

    fn log_event(&self, operation: &str, handler: &str, resolved: bool, result: &str) {
        self.inner
            .hook_log
            .borrow_mut()
            .record(operation, handler, resolved, result);
    }

    /// Route a planned pending through the hook tiers.
    fn route(&self, mut pending: Pending) -> Result<HookOutcome<OperationOutput>> {
        let operation = pending.operation.clone();

        // Recursion guard: hookable operations triggered from inside a
        // handler auto-approve without firing handlers again.
        if self.inner.in_handler.get() {
            let output = pending.approve()?;
            self.log_event(&operation, "(recursion-guard)", true, "auto-approved");
            return Ok(HookOutcome::Completed(output));
        }

        let handlers = self.inner.hooks.borrow().handlers_for(&operation);
        if handlers.is_empty() {
            let output = pending.approve()?;
            self.log_event(&operation, "(auto)", true, "auto-approved");
            return Ok(HookOutcome::Completed(output));
        }

        self.inner.in_handler.set(true);
        let mut fired = 0usize;
        for named in &handlers {
            fired += 1;
            (named.handler)(&mut pending);
            let result = match pending.status {
                PendingStatus::Approved => "approved",
                PendingStatus::Rejected => "rejected",
                PendingStatus::Pending if pending.passed_through => {
                    pending.passed_through = false;
                    "pass_through"
                }
                PendingStatus::Pending => "unresolved",
            };
            let resolved = pending.status != PendingStatus::Pending;
            self.log_event(&operation, &named.name, resolved, result);
            if resolved {
                break;
            }
        }
        self.inner.in_handler.set(false);
        for named in handlers.iter().skip(fired) {
            self.log_event(&operation, &named.name, false, "skipped");
        }

        match pending.status {
            PendingStatus::Approved => {
                let output = pending
                    .take_result()
                    .ok_or_else(|| TractError::Hook("approved pending lost its result".into()))?;
                Ok(HookOutcome::Completed(output))
            }
            PendingStatus::Rejected => {
                let reason = pending
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".into());
                Ok(HookOutcome::Rejected(HookRejection {
                    reason,
                    rejection_source: RejectionSource::Hook,
                    metadata: None,
                    pending: Box::new(pending),
                }))
            }
            PendingStatus::Pending => {
                warn!(operation, "no handler resolved the pending; auto-approving");
                let output = pending.approve()?;
                self.log_event(&operation, "(auto)", true, "auto-approved");
                Ok(HookOutcome::Completed(output))
            }
        }
    }

    // -- Execution (called by Pending::approve) --------------------------

    pub(crate) fn execute_pending(&self, pending: &mut Pending) -> Result<OperationOutput> {
        match &mut pending.kind {
            PendingKind::Compress(state) => {
                let result = self.with_tx(|| {
                    let counter = self.counter();
                    let store = self.inner.store.borrow();
                    execute_compress(
                        &store,
                        &self.inner.tract_id,
                        &self.inner.config.default_branch,
                        &*counter,
                        &state.plan,
                        &state.summaries,
                        state.guidance_source,
                    )
                })?;
                self.inner.cache.borrow_mut().clear();
                Ok(OperationOutput::Compress(result))
            }
            PendingKind::Gc(state) => {
                let result = self.with_tx(|| {
                    let store = self.inner.store.borrow();
                    execute_gc(&store, &self.inner.tract_id, &state.plan)
                })?;
                self.inner.cache.borrow_mut().clear();
                Ok(OperationOutput::Gc(result))
            }
            PendingKind::Rebase(state) => {
                let excluded = state.excluded.clone();
                let result = self.with_tx(|| {
                    let counter = self.counter();
                    let store = self.inner.store.borrow();
                    execute_rebase(
                        &store,
                        &self.inner.tract_id,
                        &self.inner.config.default_branch,
                        &*counter,
                        &state.plan,
                        excluded,
                    )
                })?;
                self.inner.cache.borrow_mut().clear();
                Ok(OperationOutput::Rebase(result))
            }
            PendingKind::Merge(state) => {
                let no_ff = state.no_ff;
                let result = self.with_tx(|| {
                    let counter = self.counter();
                    let store = self.inner.store.borrow();
                    execute_merge(
                        &store,
                        &self.inner.tract_id,
                        &self.inner.config.default_branch,
                        &*counter,
                        &state.plan,
                        no_ff,
                    )
                })?;
                self.inner.cache.borrow_mut().clear();
                Ok(OperationOutput::Merge(result))
            }
            PendingKind::ToolResult(state) => {
                let mut metadata = json!({
                    "name": state.tool_name,
                    "tool_call_id": state.tool_call_id,
                    "is_error": state.is_error,
                });
                if let Some(original) = &state.original_content {
                    metadata["original_content"] = json!(original);
                }
                let content = Content::ToolIo {
                    role: ToolIoRole::ToolResult,
                    name: state.tool_name.clone(),
                    arguments: None,
                    result: Some(state.content.clone()),
                    tool_call_id: state.tool_call_id.clone(),
                };
                let commit = self.commit_with(content, CommitArgs {
                    metadata: Some(metadata),
                    ..Default::default()
                })?;
                Ok(OperationOutput::Commit(commit))
            }
            PendingKind::Policy(state) => {
                let action = state.action.clone();
                let params = state.params.clone();
                let value = self
                    .dispatch_proposal(&action, &params)
                    .map_err(|e| TractError::PolicyExecution(e.to_string()))?;
                Ok(OperationOutput::Value(value))
            }
            PendingKind::Trigger(state) => {
                let operation = state.operation.clone();
                let params = state.params.clone();
                let value = self.dispatch_proposal(&operation, &params)?;
                Ok(OperationOutput::Value(value))
            }
            PendingKind::Dynamic(state) => {
                if state.spec.action("approve").is_some() {
                    let spec = state.spec.clone();
                    let value =
                        self.run_dynamic_action(&spec, &mut state.fields, "approve", &json!({}))?;
                    Ok(OperationOutput::Value(value))
                } else {
                    Ok(OperationOutput::Value(Value::Object(state.fields.clone())))
                }
            }
        }
    }

    /// Execute a policy/trigger proposal by dispatching to the named
    /// operation. Nested hookable operations auto-approve while this
    /// runs from inside a handler (recursion guard).
    fn dispatch_proposal(&self, operation: &str, params: &Value) -> Result<Value> {
        match operation {
            "compress" => {
                let options = CompressOptions {
                    target_tokens: params
                        .get("target_tokens")
                        .and_then(Value::as_u64)
                        .map(|n| n as usize),
                    instructions: params
                        .get("instructions")
                        .and_then(Value::as_str)
                        .map(String::from),
                    content: params
                        .get("content")
                        .and_then(Value::as_str)
                        .map(String::from),
                    ..Default::default()
                };
                let result = self.compress(options)?.completed()?;
                Ok(json!({
                    "operation": "compress",
                    "new_head": result.new_head,
                    "compression_ratio": result.compression_ratio,
                }))
            }
            "gc" => {
                let options = GcOptions {
                    orphan_retention_days: params
                        .get("orphan_retention_days")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32)
                        .unwrap_or(self.inner.config.orphan_retention_days),
                    archive_retention_days: params
                        .get("archive_retention_days")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32)
                        .unwrap_or(self.inner.config.archive_retention_days),
                };
                let result = self.gc(Some(options))?.completed()?;
                Ok(json!({
                    "operation": "gc",
                    "commits_removed": result.commits_removed,
                    "tokens_freed": result.tokens_freed,
                }))
            }
            "annotate" => {
                let target = params
                    .get("target")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TractError::PolicyConfig("annotate requires 'target'".into()))?;
                let priority = params
                    .get("priority")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TractError::PolicyConfig("annotate requires 'priority'".into()))?;
                let annotation = self.annotate_with(
                    target,
                    Priority::parse(priority)?,
                    params
                        .get("reason")
                        .and_then(Value::as_str)
                        .map(String::from),
                    None,
                )?;
                Ok(json!({
                    "operation": "annotate",
                    "target": annotation.target_hash,
                    "priority": annotation.priority.as_str(),
                }))
            }
            other => Err(TractError::PolicyConfig(format!(
                "unsupported proposal operation '{other}'"
            ))),
        }
    }

    // -- LLM helpers used by pendings ------------------------------------

    pub(crate) fn generate_compress_guidance(&self, plan: &CompressPlan) -> Result<String> {
        let config = self.llm_config_for("compress");
        self.with_llm(|llm| generate_guidance(llm, &config, plan))
    }

    pub(crate) fn summarize_compress_group(
        &self,
        plan: &CompressPlan,
        index: usize,
        guidance: Option<&str>,
    ) -> Result<String> {
        let config = self.llm_config_for("compress");
        let group = plan
            .groups
            .get(index)
            .ok_or_else(|| TractError::Compression(format!("no group at index {index}")))?;
        self.with_llm(|llm| summarize_group(llm, &config, group, &plan.options, guidance))
    }

    pub(crate) fn resolve_conflict_with_llm(
        &self,
        conflict: &ConflictInfo,
        guidance: Option<&str>,
    ) -> Result<(String, Option<String>)> {
        let config = self.llm_config_for("merge");
        let (system, prompt) = resolve_conflict_prompt(conflict, guidance);
        let response = self.with_llm(|llm| {
            llm.chat(
                ChatRequest::new(vec![
                    Message::new("system", system),
                    Message::new("user", prompt),
                ])
                .with_config(config.clone()),
            )
            .map_err(TractError::Llm)
        })?;
        let text = response.first_content()?.to_string();
        let reasoning = response.choices.first().and_then(|c| c.reasoning.clone());
        Ok((text, reasoning))
    }

    pub(crate) fn summarize_tool_content(
        &self,
        tool_name: &str,
        content: &str,
        instructions: Option<&str>,
        include_context: bool,
    ) -> Result<String> {
        let config = self.llm_config_for("compress");
        let mut prompt = format!(
            "Summarize this tool output, keeping every fact a follow-up turn could need.\n\n\
             [tool:{tool_name}]: {content}"
        );
        if let Some(instructions) = instructions {
            prompt.push_str(&format!("\n\nInstructions: {instructions}"));
        }
        if include_context {
            let context = self.compile()?;
            let rendered: Vec<String> = context
                .messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect();
            prompt.push_str(&format!(
                "\n\nConversation so far (use it to judge relevance):\n{}",
                rendered.join("\n")
            ));
        }
        let response = self.with_llm(|llm| {
            llm.chat(
                ChatRequest::new(vec![
                    Message::new(
                        "system",
                        "You condense tool outputs for a language model's context window.",
                    ),
                    Message::new("user", prompt),
                ])
                .with_config(config.clone()),
            )
            .map_err(TractError::Llm)
        })?;
        Ok(response.first_content()?.to_string())
    }

    // -- Dynamic scripting ----------------------------------------------

    fn script_api(&self) -> Rc<TractScriptApi> {
        let head_tract = self.clone();
        let log_tract = self.clone();
        let annotate_tract = self.clone();
        let note_tract = self.clone();
        Rc::new(TractScriptApi {
            head: Box::new(move || head_tract.head().ok().flatten().unwrap_or_default()),
            log_len: Box::new(move || {
                log_tract.log().map(|l| l.len() as i64).unwrap_or(0)
            }),
            annotate: Box::new(move |hash, priority| {
                Priority::parse(&priority)
                    .and_then(|p| annotate_tract.annotate(&hash, p))
                    .is_ok()
            }),
            note: Box::new(move |text| {
                note_tract
                    .commit(Content::Freeform {
                        text,
                        role: "system".into(),
                    })
                    .map(|c| c.commit_hash)
                    .unwrap_or_default()
            }),
        })
    }

    pub(crate) fn run_dynamic_action(
        &self,
        spec: &OperationSpec,
        fields: &mut serde_json::Map<String, Value>,
        action_name: &str,
        args: &Value,
    ) -> Result<Value> {
        let action = spec.action(action_name).ok_or_else(|| {
            TractError::OperationSpec(format!(
                "operation '{}' has no action '{action_name}'",
                spec.name
            ))
        })?;
        run_action(self.script_api(), fields, action, args)
    }

    // -- Cache maintenance ----------------------------------------------

    fn invalidate_commit_caches(&self, commit_hash: &str) -> Result<()> {
        let edits = self.inner.store.borrow().edits_of(commit_hash)?;
        {
            let mut cache = self.inner.cache.borrow_mut();
            cache.invalidate_commit(commit_hash);
            for edit in &edits {
                cache.invalidate_commit(&edit.commit_hash);
            }
        }
        let store = self.inner.store.borrow();
        store.invalidate_compile_records_for(commit_hash)?;
        for edit in &edits {
            store.invalidate_compile_records_for(&edit.commit_hash)?;
        }
        debug!(commit = %&commit_hash[..8.min(commit_hash.len())], "invalidated compile caches");
        Ok(())
    }
}

fn convert_outcome<T>(
    outcome: HookOutcome<OperationOutput>,
    convert: impl FnOnce(OperationOutput) -> Option<T>,
) -> Result<HookOutcome<T>> {
    Ok(match outcome {
        HookOutcome::Completed(output) => HookOutcome::Completed(
            convert(output)
                .ok_or_else(|| TractError::Hook("operation produced an unexpected result".into()))?,
        ),
        HookOutcome::Pending(pending) => HookOutcome::Pending(pending),
        HookOutcome::Rejected(rejection) => HookOutcome::Rejected(rejection),
    })
}
