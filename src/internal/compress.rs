//! Compression: collapsing runs of commits into LLM-produced summaries.
//!
//! Pinned commits and explicitly preserved commits act as boundaries
//! that split the range into groups; skip-annotated commits are excluded
//! from the input entirely. Each group produces one summary commit, and
//! the new HEAD is rebuilt by chaining summaries and preserved commits
//! in their original order on top of the range's parent.
//!
//! Retention is the hard invariant: every `match_pattern` carried by an
//! `important` commit in a group MUST appear in that group's summary,
//! checked deterministically after summarization. A compression that
//! would lose a retention pattern cannot be approved.

use serde::Serialize;
use serde_json::json;

use crate::errors::{Result, TractError};
use crate::internal::annotations::{MatchMode, Priority, RetentionCriteria};
use crate::internal::commit::CommitInfo;
use crate::internal::content::Content;
use crate::internal::dag::{branch_commits, first_parent_chain, is_ancestor};
use crate::internal::engine::{CommitRequest, create_commit, load_content, storage_now};
use crate::llm::{ChatRequest, LlmClient, LlmConfig, Message};
use crate::storage::{CommitRole, OperationEvent, Store};
use crate::tokens::TokenCounter;

/// Default system prompt for group summarization.
pub const SUMMARIZE_SYSTEM: &str = "You compress conversation history for a language model. \
Produce a dense, factual summary that preserves decisions, constraints, named entities and \
unresolved questions. Never invent content.";

/// System prompt for the guidance stage of two-stage compression.
pub const GUIDANCE_SYSTEM: &str = "You are planning a summary. Given conversation history, \
state in a short list what the summary must cover to remain useful.";

/// Where the guidance text of a two-stage compression came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceSource {
    Llm,
    User,
    UserPlusLlm,
}

impl GuidanceSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            GuidanceSource::Llm => "llm",
            GuidanceSource::User => "user",
            GuidanceSource::UserPlusLlm => "user+llm",
        }
    }
}

/// Caller-facing compression options.
#[derive(Debug, Clone, Default)]
pub struct CompressOptions {
    /// Start of the range (resolved hash); defaults to the root.
    pub from: Option<String>,
    /// End of the range (resolved hash); defaults to HEAD.
    pub to: Option<String>,
    pub target_tokens: Option<usize>,
    /// Manual mode: use this text as the summary (single group only).
    pub content: Option<String>,
    /// Commits preserved verbatim in addition to pinned ones.
    pub preserve: Vec<String>,
    pub instructions: Option<String>,
    pub system_prompt: Option<String>,
    /// Generate guidance with a separate LLM call before summarizing.
    pub two_stage: bool,
}

/// One summarizable group between boundaries.
#[derive(Debug, Clone)]
pub struct CompressGroup {
    pub source_commits: Vec<CommitInfo>,
    /// Compiled projection of the group, used as summarization input.
    pub messages: Vec<Message>,
    pub retention_patterns: Vec<(String, MatchMode)>,
    pub retention_instructions: Vec<String>,
}

/// A chain element of the rebuilt history, in original order.
#[derive(Debug, Clone)]
pub enum Segment {
    /// Index into [`CompressPlan::groups`]; becomes one summary commit.
    Group(usize),
    /// A commit carried through verbatim.
    Preserved(CommitInfo),
}

/// A planned compression.
#[derive(Debug, Clone)]
pub struct CompressPlan {
    pub from_hash: String,
    pub to_hash: String,
    /// Parent of `from`; the rebuilt chain starts here.
    pub rebuild_base: Option<String>,
    pub segments: Vec<Segment>,
    pub groups: Vec<CompressGroup>,
    /// Commits past `to` replayed on top after the rebuilt range.
    pub tail: Vec<CommitInfo>,
    pub original_tokens: usize,
    pub options: CompressOptions,
}

impl CompressPlan {
    pub fn source_commit_hashes(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.source_commits.iter().map(|c| c.commit_hash.clone()))
            .collect()
    }

    pub fn preserved_commit_hashes(&self) -> Vec<String> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Preserved(c) => Some(c.commit_hash.clone()),
                Segment::Group(_) => None,
            })
            .collect()
    }
}

/// Result of a completed compression.
#[derive(Debug, Clone)]
pub struct CompressResult {
    pub compression_id: String,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub source_commits: Vec<String>,
    pub summary_commits: Vec<String>,
    pub preserved_commits: Vec<String>,
    pub compression_ratio: f64,
    pub new_head: String,
}

/// Failure of retention validation for one summary.
#[derive(Debug, Clone)]
pub struct RetentionFailure {
    pub group_index: usize,
    pub missing_patterns: Vec<String>,
}

/// Plan a compression over `[from, to]` and produce initial summaries.
pub fn plan_compress(
    store: &Store,
    tract_id: &str,
    options: CompressOptions,
) -> Result<CompressPlan> {
    let head = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Compression("nothing to compress: no commits".into()))?;
    let to_hash = options.to.clone().unwrap_or_else(|| head.clone());
    if !is_ancestor(store, &to_hash, &head)? {
        return Err(TractError::Compression(format!(
            "range end {} is not reachable from HEAD",
            &to_hash[..8.min(to_hash.len())]
        )));
    }

    let mut range: Vec<CommitInfo> = first_parent_chain(store, &to_hash)?;
    range.reverse();
    let from_hash = match &options.from {
        Some(from) => {
            let position = range
                .iter()
                .position(|c| &c.commit_hash == from)
                .ok_or_else(|| {
                    TractError::Compression(format!(
                        "range start {} is not an ancestor of the range end",
                        &from[..8.min(from.len())]
                    ))
                })?;
            range.drain(..position);
            from.clone()
        }
        None => range
            .first()
            .map(|c| c.commit_hash.clone())
            .ok_or_else(|| TractError::Compression("empty range".into()))?,
    };
    let rebuild_base = range.first().and_then(|c| c.parent_hash.clone());

    // Resolve effective edits within the range so summaries describe the
    // final text of each message, then partition at boundaries.
    let mut latest_edit: std::collections::HashMap<String, CommitInfo> =
        std::collections::HashMap::new();
    for commit in &range {
        if let Some(target) = &commit.edit_target {
            latest_edit.insert(target.clone(), commit.clone());
        }
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut groups: Vec<CompressGroup> = Vec::new();
    let mut current: Vec<(CommitInfo, Content)> = Vec::new();
    let mut original_tokens = 0usize;

    let retention_of = |commit: &CommitInfo| -> Option<RetentionCriteria> {
        store
            .latest_annotation(&commit.commit_hash)
            .ok()
            .flatten()
            .filter(|a| a.priority == Priority::Important)
            .and_then(|a| a.retention)
    };

    let flush =
        |current: &mut Vec<(CommitInfo, Content)>,
         segments: &mut Vec<Segment>,
         groups: &mut Vec<CompressGroup>| {
            if current.is_empty() {
                return;
            }
            let mut messages = Vec::new();
            let mut patterns = Vec::new();
            let mut instructions = Vec::new();
            for (commit, content) in current.iter() {
                if let Some(message) = content.to_message() {
                    messages.push(message);
                }
                if let Some(retention) = retention_of(commit) {
                    if let Some(ps) = &retention.match_patterns {
                        patterns
                            .extend(ps.iter().map(|p| (p.clone(), retention.match_mode)));
                    }
                    if let Some(text) = &retention.instructions {
                        instructions.push(text.clone());
                    }
                }
            }
            segments.push(Segment::Group(groups.len()));
            groups.push(CompressGroup {
                source_commits: current.drain(..).map(|(c, _)| c).collect(),
                messages,
                retention_patterns: patterns,
                retention_instructions: instructions,
            });
        };

    for commit in &range {
        if commit.is_edit() {
            continue;
        }
        let effective = latest_edit.get(&commit.commit_hash).unwrap_or(commit);
        let content = load_content(store, effective)?;
        original_tokens += effective.token_count;

        let priority = store
            .latest_annotation(&commit.commit_hash)?
            .map(|a| a.priority)
            .unwrap_or_else(|| content.default_priority());

        if priority == Priority::Skip {
            continue;
        }
        if priority == Priority::Pinned || options.preserve.contains(&commit.commit_hash) {
            flush(&mut current, &mut segments, &mut groups);
            segments.push(Segment::Preserved(effective.clone()));
            continue;
        }
        current.push((effective.clone(), content));
    }
    flush(&mut current, &mut segments, &mut groups);

    if groups.is_empty() {
        return Err(TractError::Compression(
            "nothing to compress: every commit in range is pinned, preserved or skipped".into(),
        ));
    }
    if options.content.is_some() && groups.len() != 1 {
        return Err(TractError::Compression(format!(
            "manual content requires exactly one group, found {}",
            groups.len()
        )));
    }

    let tail = branch_commits(store, &head, &to_hash)?;

    Ok(CompressPlan {
        from_hash,
        to_hash,
        rebuild_base,
        segments,
        groups,
        tail,
        original_tokens,
        options,
    })
}

fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the user prompt for one group.
pub fn build_group_prompt(
    group: &CompressGroup,
    options: &CompressOptions,
    guidance: Option<&str>,
) -> String {
    let mut prompt = String::from("Summarize the following conversation history.\n\n");
    prompt.push_str(&render_messages(&group.messages));
    if let Some(target) = options.target_tokens {
        prompt.push_str(&format!("\n\nTarget length: about {target} tokens."));
    }
    if let Some(instructions) = &options.instructions {
        prompt.push_str(&format!("\n\nInstructions: {instructions}"));
    }
    for retention in &group.retention_instructions {
        prompt.push_str(&format!("\n\nRetention guidance: {retention}"));
    }
    if !group.retention_patterns.is_empty() {
        prompt.push_str("\n\nThe following fragments MUST appear verbatim in the summary:");
        for (pattern, _) in &group.retention_patterns {
            prompt.push_str(&format!("\n- {pattern}"));
        }
    }
    if let Some(guidance) = guidance {
        prompt.push_str(&format!("\n\nGuidance for this summary:\n{guidance}"));
    }
    prompt
}

/// Summarize one group with the injected client.
pub fn summarize_group(
    llm: &dyn LlmClient,
    config: &LlmConfig,
    group: &CompressGroup,
    options: &CompressOptions,
    guidance: Option<&str>,
) -> Result<String> {
    let system = options
        .system_prompt
        .clone()
        .unwrap_or_else(|| SUMMARIZE_SYSTEM.to_string());
    let request = ChatRequest::new(vec![
        Message::new("system", system),
        Message::new("user", build_group_prompt(group, options, guidance)),
    ])
    .with_config(config.clone());
    let response = llm.chat(request).map_err(TractError::Llm)?;
    Ok(response.first_content()?.to_string())
}

/// First stage of two-stage compression: ask the LLM what the summary
/// should cover.
pub fn generate_guidance(
    llm: &dyn LlmClient,
    config: &LlmConfig,
    plan: &CompressPlan,
) -> Result<String> {
    let mut prompt =
        String::from("What should a summary of this conversation preserve? Answer briefly.\n\n");
    for group in &plan.groups {
        prompt.push_str(&render_messages(&group.messages));
        prompt.push('\n');
    }
    if let Some(instructions) = &plan.options.instructions {
        prompt.push_str(&format!("\nThe user asked: {instructions}"));
    }
    let request = ChatRequest::new(vec![
        Message::new("system", GUIDANCE_SYSTEM),
        Message::new("user", prompt),
    ])
    .with_config(config.clone());
    let response = llm.chat(request).map_err(TractError::Llm)?;
    Ok(response.first_content()?.to_string())
}

/// Produce the initial summaries for a plan: manual content when given,
/// otherwise one LLM call per group.
pub fn initial_summaries(
    plan: &CompressPlan,
    llm: Option<&dyn LlmClient>,
    config: &LlmConfig,
    guidance: Option<&str>,
) -> Result<Vec<String>> {
    if let Some(content) = &plan.options.content {
        return Ok(vec![content.clone()]);
    }
    let llm = llm.ok_or_else(|| {
        TractError::Compression("no LLM client configured and no manual content supplied".into())
    })?;
    plan.groups
        .iter()
        .map(|group| summarize_group(llm, config, group, &plan.options, guidance))
        .collect()
}

/// Check every summary against its group's retention patterns.
pub fn validate_summaries(
    plan: &CompressPlan,
    summaries: &[String],
) -> Result<Vec<RetentionFailure>> {
    if summaries.len() != plan.groups.len() {
        return Err(TractError::Compression(format!(
            "expected {} summaries, found {}",
            plan.groups.len(),
            summaries.len()
        )));
    }
    let mut failures = Vec::new();
    for (index, (group, summary)) in plan.groups.iter().zip(summaries).enumerate() {
        let mut missing = Vec::new();
        for (pattern, mode) in &group.retention_patterns {
            let criteria = RetentionCriteria {
                match_mode: *mode,
                ..Default::default()
            };
            if !criteria.pattern_matches(pattern, summary)? {
                missing.push(pattern.clone());
            }
        }
        if !missing.is_empty() {
            failures.push(RetentionFailure {
                group_index: index,
                missing_patterns: missing,
            });
        }
    }
    Ok(failures)
}

/// Execute a validated compression: rebuild the chain, move HEAD, record
/// the event.
pub fn execute_compress(
    store: &Store,
    tract_id: &str,
    default_branch: &str,
    counter: &dyn TokenCounter,
    plan: &CompressPlan,
    summaries: &[String],
    guidance_source: Option<GuidanceSource>,
) -> Result<CompressResult> {
    let failures = validate_summaries(plan, summaries)?;
    if let Some(failure) = failures.first() {
        return Err(TractError::Compression(format!(
            "summary {} is missing retention pattern(s): {}",
            failure.group_index,
            failure.missing_patterns.join(", ")
        )));
    }

    let compression_id = uuid::Uuid::new_v4().to_string();
    let mut new_head = plan.rebuild_base.clone();
    let mut summary_commits = Vec::new();
    let mut preserved_commits = Vec::new();

    for segment in &plan.segments {
        match segment {
            Segment::Group(index) => {
                let group = &plan.groups[*index];
                let content = Content::Freeform {
                    text: summaries[*index].clone(),
                    role: "assistant".into(),
                };
                let sources: Vec<String> = group
                    .source_commits
                    .iter()
                    .map(|c| c.commit_hash.clone())
                    .collect();
                let created =
                    create_commit(store, tract_id, default_branch, counter, CommitRequest {
                        content: &content,
                        operation: crate::internal::commit::CommitOperation::Append,
                        edit_target: None,
                        message: Some(format!("Compressed {} commits", sources.len())),
                        metadata: Some(json!({
                            "summarized_from": sources,
                            "summarized_from_length": sources.len(),
                            "compression_id": compression_id,
                        })),
                        generation_config: None,
                        parent_override: Some(new_head.clone()),
                        update_head: false,
                    })?;
                summary_commits.push(created.commit_hash.clone());
                new_head = Some(created.commit_hash);
            }
            Segment::Preserved(commit) => {
                let content = load_content(store, commit)?;
                let created =
                    create_commit(store, tract_id, default_branch, counter, CommitRequest {
                        content: &content,
                        operation: crate::internal::commit::CommitOperation::Append,
                        edit_target: None,
                        message: commit.message.clone(),
                        metadata: commit.metadata.clone(),
                        generation_config: commit.generation_config.clone(),
                        parent_override: Some(new_head.clone()),
                        update_head: false,
                    })?;
                preserved_commits.push(created.commit_hash.clone());
                new_head = Some(created.commit_hash);
            }
        }
    }

    // Replay anything past the compressed range.
    for commit in &plan.tail {
        let content = load_content(store, commit)?;
        let created = create_commit(store, tract_id, default_branch, counter, CommitRequest {
            content: &content,
            operation: commit.operation,
            edit_target: commit.edit_target.clone(),
            message: commit.message.clone(),
            metadata: commit.metadata.clone(),
            generation_config: commit.generation_config.clone(),
            parent_override: Some(new_head.clone()),
            update_head: false,
        })?;
        new_head = Some(created.commit_hash);
    }

    let new_head =
        new_head.ok_or_else(|| TractError::Compression("compression produced no commits".into()))?;
    store.update_head(tract_id, &new_head)?;

    let source_commits = plan.source_commit_hashes();
    let compressed_tokens: usize = summary_commits
        .iter()
        .map(|hash| {
            store
                .get_commit(hash)
                .ok()
                .flatten()
                .map(|c| c.token_count)
                .unwrap_or(0)
        })
        .sum();
    let compression_ratio = if plan.original_tokens > 0 {
        compressed_tokens as f64 / plan.original_tokens as f64
    } else {
        1.0
    };

    let event = OperationEvent {
        event_id: compression_id.clone(),
        tract_id: tract_id.to_string(),
        operation: "compress".to_string(),
        params: Some(json!({
            "from": plan.from_hash,
            "to": plan.to_hash,
            "target_tokens": plan.options.target_tokens,
            "two_stage": plan.options.two_stage,
        })),
        instructions: plan.options.instructions.clone(),
        guidance_source: guidance_source.map(|g| g.as_str().to_string()),
        stats: Some(json!({
            "original_tokens": plan.original_tokens,
            "compressed_tokens": compressed_tokens,
            "new_head": new_head,
        })),
        created_at: storage_now(),
    };
    store.insert_operation_event(&event)?;
    store.link_operation_commits(&event.event_id, CommitRole::Consumed, &source_commits)?;
    store.link_operation_commits(&event.event_id, CommitRole::Produced, &summary_commits)?;
    store.link_operation_commits(&event.event_id, CommitRole::Preserved, &preserved_commits)?;

    Ok(CompressResult {
        compression_id,
        original_tokens: plan.original_tokens,
        compressed_tokens,
        source_commits,
        summary_commits,
        preserved_commits,
        compression_ratio,
        new_head,
    })
}
