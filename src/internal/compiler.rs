//! Context compilation: projecting a commit chain into the linear,
//! deduplicated, annotation-aware message list an LLM API expects.
//!
//! The algorithm:
//!
//! 1. Walk first-parent from the anchor (HEAD, `at_commit`, or the
//!    latest commit at `at_time`) to the root; reverse to chronological
//!    order.
//! 2. Compute the effective set: each append commit is replaced by the
//!    latest edit targeting it that is an ancestor of the anchor; edit
//!    commits themselves are dropped from the sequence.
//! 3. Filter by priority (latest annotation wins, content-type default
//!    otherwise). `skip` drops a message unless it is a default-skip
//!    reasoning trace explicitly requested via `include_reasoning`.
//! 4. Project each surviving payload to a message; session boundaries
//!    are never emitted.
//! 5. Apply the caller-supplied `order` permutation, emitting reorder
//!    warnings for structure- or meaning-breaking placements.
//!
//! Compiles are cached in a per-tract LRU keyed by
//! `(anchor, options fingerprint)` and persisted as compile records so a
//! reopened tract can skip the effective-set walk.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::errors::Result;
use crate::hash::sha256_canonical;
use crate::internal::annotations::Priority;
use crate::internal::commit::CommitInfo;
use crate::internal::content::Content;
use crate::internal::dag::first_parent_chain;
use crate::internal::engine::{load_content, storage_now};
use crate::llm::Message;
use crate::storage::{CompileRecord, Store, encode_ts};
use crate::tokens::TokenCounter;

/// Options controlling one compile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    /// Compile as of this commit instead of HEAD.
    pub at_commit: Option<String>,
    /// Compile as of the latest commit at or before this instant.
    pub at_time: Option<DateTime<Utc>>,
    /// Promote default-skip reasoning traces into the output.
    pub include_reasoning: bool,
    /// Explicit output ordering by commit hash.
    pub order: Option<Vec<String>>,
}

impl CompileOptions {
    /// Deterministic fingerprint for cache keys and compile records.
    pub fn fingerprint(&self) -> String {
        sha256_canonical(&json!({
            "at_commit": self.at_commit,
            "at_time": self.at_time.map(encode_ts),
            "include_reasoning": self.include_reasoning,
            "order": self.order,
        }))
    }
}

/// Severity of a reorder warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningSeverity {
    /// Affects commit-graph integrity (e.g. edit before its target).
    Structural,
    /// May affect meaning (e.g. a broken tool-call/result chain).
    Semantic,
}

/// Warning emitted when an explicit `order` risks breaking the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderWarning {
    pub warning_type: String,
    pub commit_hash: String,
    pub description: String,
    pub severity: WarningSeverity,
}

/// Output of context compilation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledContext {
    pub messages: Vec<Message>,
    pub token_count: usize,
    pub commit_count: usize,
    /// Identity of the token counter used, for provenance.
    pub token_source: String,
    /// Effective commits behind `messages`, in output order.
    pub commit_hashes: Vec<String>,
    pub warnings: Vec<ReorderWarning>,
}

/// One compiled message together with the commits it came from.
struct CompiledEntry {
    message: Message,
    /// The append commit owning the position.
    original_hash: String,
    /// The commit actually projected (the original or its latest edit).
    effective_hash: String,
    content: Content,
}

/// Per-tract LRU of compiled contexts.
pub struct CompileCache {
    entries: LruCache<(String, String), CachedCompile>,
}

struct CachedCompile {
    context: CompiledContext,
    /// Every commit the compile consulted, including skip-elided ones;
    /// any annotation or edit touching one of these invalidates the
    /// entry.
    touched: HashSet<String>,
}

impl CompileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one"),
            ),
        }
    }

    pub fn get(&mut self, anchor: &str, fingerprint: &str) -> Option<CompiledContext> {
        self.entries
            .get(&(anchor.to_string(), fingerprint.to_string()))
            .map(|cached| cached.context.clone())
    }

    fn put(&mut self, anchor: String, fingerprint: String, cached: CachedCompile) {
        self.entries.put((anchor, fingerprint), cached);
    }

    /// Drop every entry whose compile touched `commit_hash`.
    pub fn invalidate_commit(&mut self, commit_hash: &str) {
        let stale: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|(_, cached)| cached.touched.contains(commit_hash))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.entries.pop(&key);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Resolve the anchor commit for a compile.
pub fn resolve_anchor(
    store: &Store,
    head: &str,
    options: &CompileOptions,
) -> Result<Option<String>> {
    let start = options.at_commit.as_deref().unwrap_or(head);
    match options.at_time {
        None => Ok(Some(start.to_string())),
        Some(at_time) => {
            // Latest commit on the chain created at or before the instant.
            for commit in first_parent_chain(store, start)? {
                if commit.created_at <= at_time {
                    return Ok(Some(commit.commit_hash));
                }
            }
            Ok(None)
        }
    }
}

/// Compile the chain ending at `anchor`.
pub fn compile(
    store: &Store,
    cache: &mut CompileCache,
    tract_id: &str,
    anchor: &str,
    options: &CompileOptions,
    counter: &dyn TokenCounter,
) -> Result<CompiledContext> {
    let fingerprint = options.fingerprint();
    if let Some(hit) = cache.get(anchor, &fingerprint) {
        debug!(anchor = %&anchor[..8.min(anchor.len())], "compile cache hit");
        return Ok(hit);
    }

    let (effective, touched) =
        match load_recorded_effective(store, tract_id, anchor, &fingerprint)? {
            Some(recorded) => recorded,
            None => effective_entries(store, anchor, options)?,
        };

    let (entries, mut warnings) = match &options.order {
        Some(order) => apply_order(effective, order),
        None => (effective, Vec::new()),
    };
    warnings.extend(chain_warnings(&entries));

    let messages: Vec<Message> = entries.iter().map(|e| e.message.clone()).collect();
    let commit_hashes: Vec<String> = entries.iter().map(|e| e.effective_hash.clone()).collect();
    let token_count = counter.count_messages(&messages);

    let context = CompiledContext {
        commit_count: messages.len(),
        token_count,
        token_source: counter.source(),
        messages,
        commit_hashes,
        warnings,
    };

    persist_record(store, tract_id, anchor, &fingerprint, &context, &touched)?;
    cache.put(anchor.to_string(), fingerprint, CachedCompile {
        context: context.clone(),
        touched,
    });
    Ok(context)
}

/// An empty compile result (no commits yet).
pub fn empty_context(counter: &dyn TokenCounter) -> CompiledContext {
    CompiledContext {
        messages: Vec::new(),
        token_count: 0,
        commit_count: 0,
        token_source: counter.source(),
        commit_hashes: Vec::new(),
        warnings: Vec::new(),
    }
}

/// Build the compiled entries for a chain, together with the set of
/// every commit the walk consulted. The touched set must cover commits
/// that were *excluded* (skip priority, sessions, edits) as well, so an
/// annotation that later promotes one of them invalidates the cache.
fn effective_entries(
    store: &Store,
    anchor: &str,
    options: &CompileOptions,
) -> Result<(Vec<CompiledEntry>, HashSet<String>)> {
    let mut chain = first_parent_chain(store, anchor)?;
    chain.reverse();
    let touched: HashSet<String> = chain.iter().map(|c| c.commit_hash.clone()).collect();

    // Latest edit per target, restricted to edits on this chain.
    let mut latest_edit: HashMap<String, CommitInfo> = HashMap::new();
    for commit in &chain {
        if let Some(target) = &commit.edit_target {
            latest_edit.insert(target.clone(), commit.clone());
        }
    }

    let mut entries = Vec::new();
    for commit in &chain {
        if commit.is_edit() {
            continue;
        }
        let effective = latest_edit.get(&commit.commit_hash).unwrap_or(commit);
        let content = load_content(store, effective)?;

        let annotation = latest_of(
            store.latest_annotation(&commit.commit_hash)?,
            store.latest_annotation(&effective.commit_hash)?,
        );
        let explicit = annotation.is_some();
        let priority = annotation
            .map(|a| a.priority)
            .unwrap_or_else(|| content.default_priority());

        if priority == Priority::Skip {
            let promoted = !explicit
                && options.include_reasoning
                && matches!(content, Content::Reasoning { .. });
            if !promoted {
                continue;
            }
        }

        if let Some(message) = content.to_message() {
            entries.push(CompiledEntry {
                message,
                original_hash: commit.commit_hash.clone(),
                effective_hash: effective.commit_hash.clone(),
                content,
            });
        }
    }
    Ok((entries, touched))
}

fn latest_of(
    a: Option<crate::internal::annotations::PriorityAnnotation>,
    b: Option<crate::internal::annotations::PriorityAnnotation>,
) -> Option<crate::internal::annotations::PriorityAnnotation> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.created_at > a.created_at { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Permute entries to match the caller-supplied hash ordering. Hashes may
/// name either the original or the effective commit. Entries not named
/// keep their relative order after the named ones; unknown hashes warn.
fn apply_order(
    entries: Vec<CompiledEntry>,
    order: &[String],
) -> (Vec<CompiledEntry>, Vec<ReorderWarning>) {
    let mut warnings = Vec::new();
    let mut by_hash: HashMap<String, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        by_hash.insert(entry.original_hash.clone(), index);
        by_hash.insert(entry.effective_hash.clone(), index);
    }

    let mut picked: Vec<usize> = Vec::new();
    let mut taken: HashSet<usize> = HashSet::new();
    for hash in order {
        match by_hash.get(hash) {
            Some(&index) if !taken.contains(&index) => {
                taken.insert(index);
                picked.push(index);
            }
            Some(_) => {}
            None => warnings.push(ReorderWarning {
                warning_type: "unknown_commit".into(),
                commit_hash: hash.clone(),
                description: format!("ordered commit {hash} is not part of the compiled chain"),
                severity: WarningSeverity::Structural,
            }),
        }
    }
    for index in 0..entries.len() {
        if !taken.contains(&index) {
            picked.push(index);
        }
    }

    let mut indexed: Vec<Option<CompiledEntry>> = entries.into_iter().map(Some).collect();
    let reordered: Vec<CompiledEntry> = picked
        .into_iter()
        .map(|index| indexed[index].take().expect("each index picked once"))
        .collect();
    (reordered, warnings)
}

/// Warnings about broken structure in the final entry order.
fn chain_warnings(entries: &[CompiledEntry]) -> Vec<ReorderWarning> {
    let mut warnings = Vec::new();
    let mut seen_calls: HashSet<&str> = HashSet::new();
    for entry in entries {
        if let Content::ToolIo {
            role,
            tool_call_id,
            ..
        } = &entry.content
        {
            match role {
                crate::internal::content::ToolIoRole::ToolCall => {
                    seen_calls.insert(tool_call_id.as_str());
                }
                crate::internal::content::ToolIoRole::ToolResult => {
                    if !seen_calls.contains(tool_call_id.as_str()) {
                        warnings.push(ReorderWarning {
                            warning_type: "broken_tool_chain".into(),
                            commit_hash: entry.effective_hash.clone(),
                            description: format!(
                                "tool result for call {tool_call_id} appears before (or without) its call"
                            ),
                            severity: WarningSeverity::Semantic,
                        });
                    }
                }
            }
        }
    }
    warnings
}

/// Fast path: rebuild entries from a persisted compile record. The
/// record's full consulted set comes back as the touched set so cache
/// invalidation stays exact on warm starts.
fn load_recorded_effective(
    store: &Store,
    tract_id: &str,
    anchor: &str,
    fingerprint: &str,
) -> Result<Option<(Vec<CompiledEntry>, HashSet<String>)>> {
    let Some(record) = store.get_compile_record(tract_id, anchor, fingerprint)? else {
        return Ok(None);
    };
    let mut entries = Vec::new();
    for hash in store.compile_effective(&record.record_id)? {
        let Some(commit) = store.get_commit(&hash)? else {
            return Ok(None);
        };
        let content = load_content(store, &commit)?;
        let Some(message) = content.to_message() else {
            return Ok(None);
        };
        entries.push(CompiledEntry {
            message,
            original_hash: commit.edit_target.clone().unwrap_or_else(|| hash.clone()),
            effective_hash: hash,
            content,
        });
    }
    let touched: HashSet<String> = store
        .compile_touched(&record.record_id)?
        .into_iter()
        .collect();
    debug!(anchor = %&anchor[..8.min(anchor.len())], "compile record hit");
    Ok(Some((entries, touched)))
}

fn persist_record(
    store: &Store,
    tract_id: &str,
    anchor: &str,
    fingerprint: &str,
    context: &CompiledContext,
    touched: &HashSet<String>,
) -> Result<()> {
    let root_hash = first_parent_chain(store, anchor)?
        .last()
        .map(|c| c.commit_hash.clone());
    let record = CompileRecord {
        record_id: uuid::Uuid::new_v4().to_string(),
        tract_id: tract_id.to_string(),
        root_hash,
        head_hash: anchor.to_string(),
        options_hash: fingerprint.to_string(),
        message_count: context.messages.len(),
        token_count: context.token_count,
        created_at: storage_now(),
    };
    let consulted: Vec<String> = touched
        .iter()
        .filter(|hash| !context.commit_hashes.contains(*hash))
        .cloned()
        .collect();
    store.upsert_compile_record(&record, &context.commit_hashes, &consulted)?;
    Ok(())
}
