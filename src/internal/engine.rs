//! Commit engine: validates content, persists blobs and commit rows,
//! and moves HEAD.
//!
//! The engine enforces the structural invariants: commit-hash
//! determinism, edit-target rules (edits target existing append commits,
//! never other edits), and parent consistency. Transaction scoping and
//! budget enforcement live one level up, in the facade.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hash::{commit_hash, content_hash};
use crate::internal::commit::{CommitInfo, CommitOperation};
use crate::internal::content::Content;
use crate::llm::LlmConfig;
use crate::storage::{Store, decode_ts, encode_ts};
use crate::tokens::TokenCounter;

/// Parameters for one commit creation.
pub struct CommitRequest<'a> {
    pub content: &'a Content,
    pub operation: CommitOperation,
    pub edit_target: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<Value>,
    pub generation_config: Option<LlmConfig>,
    /// `Some(parent)` pins the parent explicitly (merge/rebase/compress
    /// chain building); `None` uses the current HEAD.
    pub parent_override: Option<Option<String>>,
    /// Whether HEAD advances to the new commit.
    pub update_head: bool,
}

impl<'a> CommitRequest<'a> {
    pub fn append(content: &'a Content) -> Self {
        Self {
            content,
            operation: CommitOperation::Append,
            edit_target: None,
            message: None,
            metadata: None,
            generation_config: None,
            parent_override: None,
            update_head: true,
        }
    }

    pub fn edit(content: &'a Content, target: impl Into<String>) -> Self {
        Self {
            operation: CommitOperation::Edit,
            edit_target: Some(target.into()),
            ..Self::append(content)
        }
    }
}

/// Validate, hash and persist one commit; returns the stored record.
pub fn create_commit(
    store: &Store,
    tract_id: &str,
    default_branch: &str,
    counter: &dyn TokenCounter,
    request: CommitRequest<'_>,
) -> Result<CommitInfo> {
    request.content.validate()?;

    match request.operation {
        CommitOperation::Edit => {
            let target = request.edit_target.as_deref().ok_or_else(|| {
                TractError::EditTarget("edit commits require an edit target".into())
            })?;
            let target_commit = store
                .get_commit(target)?
                .ok_or_else(|| TractError::EditTarget(format!("target not found: {target}")))?;
            if target_commit.is_edit() {
                // Chained edits are forbidden; every revision targets the
                // original append commit.
                return Err(TractError::EditTarget(format!(
                    "target {target} is itself an edit; edits must target the original append"
                )));
            }
        }
        CommitOperation::Append => {
            if request.edit_target.is_some() {
                return Err(TractError::EditTarget(
                    "append commits cannot carry an edit target".into(),
                ));
            }
        }
    }

    let payload = request.content.to_payload()?;
    let payload_hash = content_hash(&payload);
    let payload_json = String::from_utf8(crate::hash::canonical_json(&payload))
        .map_err(|e| TractError::Other(format!("payload is not UTF-8: {e}")))?;

    let parent = match request.parent_override {
        Some(parent) => parent,
        None => store.get_head(tract_id)?,
    };
    if let Some(parent_hash) = &parent {
        if !store.commit_exists(parent_hash)? {
            return Err(TractError::CommitNotFound(parent_hash.clone()));
        }
    }

    let created_at = storage_now();
    let timestamp_iso = encode_ts(created_at);

    let hash = commit_hash(
        &payload_hash,
        parent.as_deref(),
        request.content.content_type(),
        request.operation.as_str(),
        &timestamp_iso,
        request.edit_target.as_deref(),
    );

    // Blob token count covers the raw text; the commit row caches the
    // compiled-projection cost including message overhead.
    let text_tokens = counter.count_text(&request.content.primary_text());
    let projection_tokens = request
        .content
        .to_message()
        .map(|m| counter.count_messages(std::slice::from_ref(&m)))
        .unwrap_or(0);

    store.insert_blob(&payload_hash, &payload_json, text_tokens, created_at)?;

    let first_commit = store.get_head(tract_id)?.is_none();
    let commit = CommitInfo {
        commit_hash: hash,
        tract_id: tract_id.to_string(),
        parent_hash: parent,
        content_hash: payload_hash,
        content_type: request.content.content_type().to_string(),
        operation: request.operation,
        edit_target: request.edit_target,
        message: request.message,
        token_count: projection_tokens,
        metadata: request.metadata,
        generation_config: request.generation_config,
        created_at,
    };
    store.insert_commit(&commit)?;

    if request.update_head {
        if first_commit && store.current_branch(tract_id)?.is_none() {
            // First commit of the tract: establish the default branch and
            // attach HEAD to it.
            store.set_branch(tract_id, default_branch, &commit.commit_hash)?;
            store.attach_head(tract_id, default_branch)?;
        } else {
            store.update_head(tract_id, &commit.commit_hash)?;
        }
    }

    Ok(commit)
}

/// Current time truncated to storage precision so in-memory records
/// compare equal to their persisted form.
pub fn storage_now() -> DateTime<Utc> {
    decode_ts(&encode_ts(Utc::now())).expect("encoding round-trips")
}

/// Load the typed content payload of a commit.
pub fn load_content(store: &Store, commit: &CommitInfo) -> Result<Content> {
    let blob = store.require_blob(&commit.content_hash)?;
    Content::from_payload(&blob.payload()?)
}
