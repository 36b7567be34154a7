//! Rebase: replay the current branch's divergent commits onto another
//! branch's tip.
//!
//! Replayed commits get new hashes (new parents) but keep their content
//! hashes. On any unrecoverable failure the branch is reset to its
//! original tip.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{Result, TractError};
use crate::internal::commit::CommitInfo;
use crate::internal::dag::{branch_commits, is_ancestor, merge_base};
use crate::internal::engine::{CommitRequest, create_commit, load_content, storage_now};
use crate::storage::{CommitRole, OperationEvent, Store};
use crate::tokens::TokenCounter;

/// Warning about a potentially lossy replay step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebaseWarning {
    pub warning_type: String,
    pub commit_hash: String,
    pub description: String,
}

/// A planned rebase awaiting approval.
#[derive(Debug, Clone)]
pub struct RebasePlan {
    pub onto_branch: String,
    /// Tip of the branch being rebased onto.
    pub target_base: String,
    /// Commit hashes to replay, chronological.
    pub replay_plan: Vec<String>,
    pub warnings: Vec<RebaseWarning>,
    /// Branch being rebased (current branch), if attached.
    pub current_branch: Option<String>,
    /// Original tip, for rollback.
    pub original_tip: String,
}

/// Result of a completed rebase.
#[derive(Debug, Clone)]
pub struct RebaseResult {
    pub new_head: String,
    /// Old hash -> new hash for every replayed commit.
    pub replayed: Vec<(String, String)>,
    pub warnings: Vec<RebaseWarning>,
    /// Commits dropped from the plan before execution.
    pub skipped: Vec<String>,
}

/// Plan a rebase of the current branch onto `onto_branch`.
pub fn plan_rebase(store: &Store, tract_id: &str, onto_branch: &str) -> Result<RebasePlan> {
    let onto_tip = store
        .get_branch(tract_id, onto_branch)?
        .ok_or_else(|| TractError::BranchNotFound(onto_branch.to_string()))?;
    let head = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Other("Cannot rebase: no commits on HEAD".into()))?;
    let current_branch = store.current_branch(tract_id)?;

    if current_branch.as_deref() == Some(onto_branch) {
        return Err(TractError::Rebase(format!(
            "already on '{onto_branch}'"
        )));
    }

    let base = merge_base(store, &head, &onto_tip)?
        .ok_or_else(|| TractError::Rebase("no common ancestor with the target branch".into()))?;
    if base == head {
        // Nothing of ours to replay; the rebase is a fast-forward.
        return Ok(RebasePlan {
            onto_branch: onto_branch.to_string(),
            target_base: onto_tip,
            replay_plan: Vec::new(),
            warnings: Vec::new(),
            current_branch,
            original_tip: head,
        });
    }

    let commits = branch_commits(store, &head, &base)?;
    let mut warnings = Vec::new();
    for commit in &commits {
        if let Some(target) = &commit.edit_target {
            if !is_ancestor(store, target, &onto_tip)?
                && !commits.iter().any(|c| &c.commit_hash == target)
            {
                warnings.push(RebaseWarning {
                    warning_type: "edit_target_missing".into(),
                    commit_hash: commit.commit_hash.clone(),
                    description: format!(
                        "edit targets {} which is not reachable from '{onto_branch}'",
                        &target[..8.min(target.len())]
                    ),
                });
            }
        }
    }

    Ok(RebasePlan {
        onto_branch: onto_branch.to_string(),
        target_base: onto_tip,
        replay_plan: commits.into_iter().map(|c| c.commit_hash).collect(),
        warnings,
        current_branch,
        original_tip: head,
    })
}

/// Execute a planned rebase. `skipped` lists commits excluded from the
/// original plan by a handler.
pub fn execute_rebase(
    store: &Store,
    tract_id: &str,
    default_branch: &str,
    counter: &dyn TokenCounter,
    plan: &RebasePlan,
    skipped: Vec<String>,
) -> Result<RebaseResult> {
    let run = || -> Result<(String, Vec<(String, String)>, Vec<RebaseWarning>)> {
        let mut new_head = plan.target_base.clone();
        let mut replayed: Vec<(String, String)> = Vec::new();
        let mut warnings = plan.warnings.clone();

        for old_hash in &plan.replay_plan {
            let commit: CommitInfo = store.require_commit(old_hash)?;
            // An edit whose target was replayed must point at the new
            // hash of that target.
            let edit_target = match &commit.edit_target {
                Some(target) => match replayed.iter().find(|(old, _)| old == target) {
                    Some((_, new)) => Some(new.clone()),
                    None if store.commit_exists(target)? => Some(target.clone()),
                    None => {
                        warnings.push(RebaseWarning {
                            warning_type: "edit_dropped".into(),
                            commit_hash: old_hash.clone(),
                            description: format!(
                                "edit skipped: target {} no longer exists",
                                &target[..8.min(target.len())]
                            ),
                        });
                        continue;
                    }
                },
                None => None,
            };

            let content = load_content(store, &commit)?;
            let created = create_commit(store, tract_id, default_branch, counter, CommitRequest {
                content: &content,
                operation: commit.operation,
                edit_target,
                message: commit.message.clone(),
                metadata: commit.metadata.clone(),
                generation_config: commit.generation_config.clone(),
                parent_override: Some(Some(new_head.clone())),
                update_head: false,
            })?;
            replayed.push((old_hash.clone(), created.commit_hash.clone()));
            new_head = created.commit_hash;
        }
        for skipped_hash in &skipped {
            warnings.push(RebaseWarning {
                warning_type: "excluded".into(),
                commit_hash: skipped_hash.clone(),
                description: "commit excluded from the replay plan".into(),
            });
        }
        Ok((new_head, replayed, warnings))
    };

    match run() {
        Ok((new_head, replayed, warnings)) => {
            store.update_head(tract_id, &new_head)?;
            let event = OperationEvent {
                event_id: uuid::Uuid::new_v4().to_string(),
                tract_id: tract_id.to_string(),
                operation: "rebase".to_string(),
                params: Some(json!({
                    "onto_branch": plan.onto_branch,
                    "target_base": plan.target_base,
                })),
                instructions: None,
                guidance_source: None,
                stats: Some(json!({
                    "replayed": replayed.len(),
                    "skipped": skipped.len(),
                })),
                created_at: storage_now(),
            };
            store.insert_operation_event(&event)?;
            let consumed: Vec<String> = replayed.iter().map(|(old, _)| old.clone()).collect();
            let produced: Vec<String> = replayed.iter().map(|(_, new)| new.clone()).collect();
            store.link_operation_commits(&event.event_id, CommitRole::Consumed, &consumed)?;
            store.link_operation_commits(&event.event_id, CommitRole::Produced, &produced)?;
            Ok(RebaseResult {
                new_head,
                replayed,
                warnings,
                skipped,
            })
        }
        Err(error) => {
            // Restore the branch to its pre-rebase tip.
            store.update_head(tract_id, &plan.original_tip)?;
            Err(TractError::Rebase(format!(
                "rebase failed and was rolled back: {error}"
            )))
        }
    }
}
