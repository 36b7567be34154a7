//! Single-commit import (cherry-pick).
//!
//! Copies one commit onto the current HEAD: same content hash (same
//! blob), new commit hash (new parent). Semantic oddities surface as
//! warnings rather than errors.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{Result, TractError};
use crate::internal::commit::CommitInfo;
use crate::internal::content::{Content, ToolIoRole};
use crate::internal::dag::first_parent_chain;
use crate::internal::engine::{CommitRequest, create_commit, load_content, storage_now};
use crate::storage::{CommitRole, OperationEvent, Store};
use crate::tokens::TokenCounter;

/// Warning about a semantically odd import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportIssue {
    pub issue_type: String,
    pub commit_hash: String,
    pub description: String,
}

/// Result of importing one commit.
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub new_commit: CommitInfo,
    pub source_hash: String,
    pub issues: Vec<ImportIssue>,
}

/// Import `source_hash` onto the current HEAD.
pub fn import_commit(
    store: &Store,
    tract_id: &str,
    default_branch: &str,
    counter: &dyn TokenCounter,
    source_hash: &str,
) -> Result<ImportResult> {
    let source = store.require_commit(source_hash)?;
    let head = store.get_head(tract_id)?;
    let content = load_content(store, &source)?;

    let mut issues = Vec::new();
    let history: Vec<String> = match &head {
        Some(tip) => first_parent_chain(store, tip)?
            .into_iter()
            .map(|c| c.commit_hash)
            .collect(),
        None => Vec::new(),
    };

    // An imported edit without its target in the destination history can
    // never take effect on compile.
    let edit_target = match &source.edit_target {
        Some(target) if history.contains(target) => Some(target.clone()),
        Some(target) => {
            issues.push(ImportIssue {
                issue_type: "edit_without_target".into(),
                commit_hash: source_hash.to_string(),
                description: format!(
                    "imported edit targets {} which is not in the current history; \
                     importing as a plain append",
                    &target[..8.min(target.len())]
                ),
            });
            None
        }
        None => None,
    };
    let operation = if edit_target.is_some() {
        source.operation
    } else {
        crate::internal::commit::CommitOperation::Append
    };

    if let Content::ToolIo {
        role: ToolIoRole::ToolResult,
        tool_call_id,
        ..
    } = &content
    {
        let call_present = history.iter().any(|hash| {
            store
                .get_commit(hash)
                .ok()
                .flatten()
                .and_then(|c| load_content(store, &c).ok())
                .map(|c| {
                    matches!(
                        c,
                        Content::ToolIo { role: ToolIoRole::ToolCall, tool_call_id: id, .. }
                        if id == *tool_call_id
                    )
                })
                .unwrap_or(false)
        });
        if !call_present {
            issues.push(ImportIssue {
                issue_type: "result_without_call".into(),
                commit_hash: source_hash.to_string(),
                description: format!(
                    "imported tool result references call {tool_call_id} which is absent \
                     from the current history"
                ),
            });
        }
    }

    if head.is_none() && source.is_edit() {
        return Err(TractError::ImportCommit(
            "cannot import an edit into an empty tract".into(),
        ));
    }

    let created = create_commit(store, tract_id, default_branch, counter, CommitRequest {
        content: &content,
        operation,
        edit_target,
        message: source.message.clone(),
        metadata: source.metadata.clone(),
        generation_config: source.generation_config.clone(),
        parent_override: None,
        update_head: true,
    })?;

    let event = OperationEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        tract_id: tract_id.to_string(),
        operation: "import".to_string(),
        params: Some(json!({"source": source_hash})),
        instructions: None,
        guidance_source: None,
        stats: Some(json!({"issues": issues.len()})),
        created_at: storage_now(),
    };
    store.insert_operation_event(&event)?;
    store.link_operation_commits(&event.event_id, CommitRole::Consumed, &[source_hash.to_string()])?;
    store.link_operation_commits(
        &event.event_id,
        CommitRole::Produced,
        &[created.commit_hash.clone()],
    )?;

    Ok(ImportResult {
        new_commit: created,
        source_hash: source_hash.to_string(),
        issues,
    })
}
