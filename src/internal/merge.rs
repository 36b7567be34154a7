//! Three-way merge with structural conflict classification.
//!
//! The merge walks both branches back to their merge base, partitions
//! the divergent commits into content groups (keyed by edit target for
//! edits, by commit hash for appends), and classifies collisions:
//!
//! - `both_edit` — both sides edited the same target.
//! - `skip_vs_edit` — one side edited a commit the other side skipped
//!   via annotation.
//! - `edit_plus_append` — one side edited a target the other side
//!   chained a reply onto.
//!
//! Non-conflicting source groups replay onto the target in chronological
//! order; conflicts require a resolution text each, then the merge
//! commit ties both tips together as parents.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{Result, TractError};
use crate::internal::annotations::Priority;
use crate::internal::commit::{CommitInfo, CommitOperation};
use crate::internal::content::Content;
use crate::internal::dag::{branch_commits, merge_base};
use crate::internal::engine::{CommitRequest, create_commit, load_content, storage_now};
use crate::storage::{CommitRole, OperationEvent, Store};
use crate::tokens::TokenCounter;

/// Classification of one merge conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    BothEdit,
    SkipVsEdit,
    EditPlusAppend,
}

impl ConflictKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::BothEdit => "both_edit",
            ConflictKind::SkipVsEdit => "skip_vs_edit",
            ConflictKind::EditPlusAppend => "edit_plus_append",
        }
    }
}

/// Rich context for a single conflict, sized for either human review or
/// LLM-mediated resolution: both sides' full text, the common ancestor,
/// and the surrounding branch history.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub conflict_type: ConflictKind,
    /// The commit both sides are fighting over.
    pub target_hash: String,
    /// Latest edit from the target branch, if that side edited.
    pub commit_a: Option<CommitInfo>,
    /// Latest edit (or chained append) from the source branch.
    pub commit_b: Option<CommitInfo>,
    pub content_a_text: String,
    pub content_b_text: String,
    pub ancestor: Option<CommitInfo>,
    pub ancestor_content_text: Option<String>,
    /// Divergent commits on the target branch, chronological.
    pub branch_a_commits: Vec<String>,
    /// Divergent commits on the source branch, chronological.
    pub branch_b_commits: Vec<String>,
}

/// How a merge concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeType {
    FastForward,
    Clean,
    Conflict,
}

/// Result of a completed merge.
#[derive(Debug, Clone)]
pub struct MergeResult {
    pub merge_type: MergeType,
    pub source_branch: String,
    pub target_branch: Option<String>,
    pub merge_base: Option<String>,
    /// The merge commit, absent for fast-forwards.
    pub merge_commit: Option<String>,
    pub new_head: String,
    /// Source commits replayed onto the target (old hash -> new hash).
    pub replayed: Vec<(String, String)>,
    /// Targets whose conflicts were resolved with an edit commit.
    pub resolved_conflicts: Vec<String>,
}

/// A planned merge awaiting execution (or resolution, when conflicted).
#[derive(Debug, Clone)]
pub struct MergePlan {
    pub source_branch: String,
    pub target_branch: Option<String>,
    pub source_tip: String,
    pub target_tip: String,
    pub merge_base: Option<String>,
    /// Source commits to replay, chronological; conflict-group members
    /// are excluded.
    pub replay: Vec<CommitInfo>,
    pub conflicts: Vec<ConflictInfo>,
    /// target_hash -> resolved text, supplied before execution.
    pub resolutions: BTreeMap<String, String>,
}

impl MergePlan {
    pub fn is_fast_forward(&self) -> bool {
        self.merge_base.as_deref() == Some(self.target_tip.as_str())
    }

    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Targets still lacking a resolution.
    pub fn unresolved(&self) -> Vec<String> {
        self.conflicts
            .iter()
            .map(|c| c.target_hash.clone())
            .filter(|t| !self.resolutions.contains_key(t))
            .collect()
    }
}

/// Plan a merge of `source_branch` into the current HEAD.
pub fn plan_merge(
    store: &Store,
    tract_id: &str,
    source_branch: &str,
    no_ff: bool,
) -> Result<MergePlan> {
    let source_tip = store
        .get_branch(tract_id, source_branch)?
        .ok_or_else(|| TractError::BranchNotFound(source_branch.to_string()))?;
    let target_tip = store
        .get_head(tract_id)?
        .ok_or_else(|| TractError::Other("Cannot merge: no commits on HEAD".into()))?;
    let target_branch = store.current_branch(tract_id)?;

    if target_branch.as_deref() == Some(source_branch) {
        return Err(TractError::NothingToMerge(format!(
            "branch '{source_branch}' is the current branch"
        )));
    }

    let base = merge_base(store, &target_tip, &source_tip)?;
    if base.as_deref() == Some(source_tip.as_str()) {
        return Err(TractError::NothingToMerge(format!(
            "'{source_branch}' is already reachable from the current branch"
        )));
    }

    let mut plan = MergePlan {
        source_branch: source_branch.to_string(),
        target_branch,
        source_tip: source_tip.clone(),
        target_tip: target_tip.clone(),
        merge_base: base.clone(),
        replay: Vec::new(),
        conflicts: Vec::new(),
        resolutions: BTreeMap::new(),
    };

    if plan.is_fast_forward() && !no_ff {
        return Ok(plan);
    }

    let base_hash = base.clone().unwrap_or_default();
    let commits_a = branch_commits(store, &target_tip, &base_hash)?;
    let commits_b = branch_commits(store, &source_tip, &base_hash)?;

    // Content groups: edits keyed by their target, appends by themselves.
    let edits_by_target = |commits: &[CommitInfo]| -> HashMap<String, Vec<CommitInfo>> {
        let mut groups: HashMap<String, Vec<CommitInfo>> = HashMap::new();
        for commit in commits {
            if let Some(target) = &commit.edit_target {
                groups.entry(target.clone()).or_default().push(commit.clone());
            }
        }
        groups
    };
    let edits_a = edits_by_target(&commits_a);
    let edits_b = edits_by_target(&commits_b);

    let reply_target = |commit: &CommitInfo| -> Option<String> {
        commit
            .metadata
            .as_ref()
            .and_then(|m| m.get("reply_to"))
            .and_then(|v| v.as_str())
            .map(String::from)
    };

    let hashes = |commits: &[CommitInfo]| commits.iter().map(|c| c.commit_hash.clone()).collect();
    let branch_a_hashes: Vec<String> = hashes(&commits_a);
    let branch_b_hashes: Vec<String> = hashes(&commits_b);

    let mut conflicted_b: Vec<String> = Vec::new();
    let mut targets: Vec<&String> = edits_a.keys().chain(edits_b.keys()).collect();
    targets.sort();
    targets.dedup();

    for target in targets {
        let side_a = edits_a.get(target);
        let side_b = edits_b.get(target);

        let kind = if side_a.is_some() && side_b.is_some() {
            Some(ConflictKind::BothEdit)
        } else {
            let skip_annotated = store
                .latest_annotation(target)?
                .map(|a| a.priority == Priority::Skip)
                .unwrap_or(false);
            let other_side_replies = match (side_a, side_b) {
                (Some(_), None) => commits_b
                    .iter()
                    .any(|c| reply_target(c).as_deref() == Some(target)),
                (None, Some(_)) => commits_a
                    .iter()
                    .any(|c| reply_target(c).as_deref() == Some(target)),
                _ => false,
            };
            if skip_annotated {
                Some(ConflictKind::SkipVsEdit)
            } else if other_side_replies {
                Some(ConflictKind::EditPlusAppend)
            } else {
                None
            }
        };

        let Some(kind) = kind else { continue };

        let latest = |side: Option<&Vec<CommitInfo>>| side.and_then(|v| v.last().cloned());
        let commit_a = latest(side_a);
        let commit_b = latest(side_b);
        let text_of = |commit: &Option<CommitInfo>| -> Result<String> {
            commit
                .as_ref()
                .map(|c| Ok(load_content(store, c)?.primary_text()))
                .unwrap_or_else(|| Ok(String::new()))
        };
        let ancestor = store.get_commit(target)?;
        let ancestor_text = ancestor
            .as_ref()
            .map(|c| load_content(store, c).map(|content| content.primary_text()))
            .transpose()?;

        if let Some(b) = side_b {
            conflicted_b.extend(b.iter().map(|c| c.commit_hash.clone()));
        }

        plan.conflicts.push(ConflictInfo {
            conflict_type: kind,
            target_hash: target.clone(),
            content_a_text: text_of(&commit_a)?,
            content_b_text: text_of(&commit_b)?,
            commit_a,
            commit_b,
            ancestor,
            ancestor_content_text: ancestor_text,
            branch_a_commits: branch_a_hashes.clone(),
            branch_b_commits: branch_b_hashes.clone(),
        });
    }

    plan.replay = commits_b
        .into_iter()
        .filter(|c| !conflicted_b.contains(&c.commit_hash))
        .collect();

    Ok(plan)
}

/// Execute a planned merge. Every conflict must carry a resolution.
pub fn execute_merge(
    store: &Store,
    tract_id: &str,
    default_branch: &str,
    counter: &dyn TokenCounter,
    plan: &MergePlan,
    no_ff: bool,
) -> Result<MergeResult> {
    if plan.is_fast_forward() && !no_ff {
        store.update_head(tract_id, &plan.source_tip)?;
        record_merge_event(store, tract_id, plan, MergeType::FastForward, &[], None)?;
        return Ok(MergeResult {
            merge_type: MergeType::FastForward,
            source_branch: plan.source_branch.clone(),
            target_branch: plan.target_branch.clone(),
            merge_base: plan.merge_base.clone(),
            merge_commit: None,
            new_head: plan.source_tip.clone(),
            replayed: Vec::new(),
            resolved_conflicts: Vec::new(),
        });
    }

    let unresolved = plan.unresolved();
    if !unresolved.is_empty() {
        return Err(TractError::MergeConflict(format!(
            "{} unresolved conflict(s): {}",
            unresolved.len(),
            unresolved
                .iter()
                .map(|h| &h[..8.min(h.len())])
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let mut new_head = plan.target_tip.clone();
    let mut replayed: Vec<(String, String)> = Vec::new();

    // Non-conflicting source commits, chronological.
    for commit in &plan.replay {
        let content = load_content(store, commit)?;
        let created = create_commit(store, tract_id, default_branch, counter, CommitRequest {
            content: &content,
            operation: commit.operation,
            edit_target: commit.edit_target.clone(),
            message: commit.message.clone(),
            metadata: commit.metadata.clone(),
            generation_config: commit.generation_config.clone(),
            parent_override: Some(Some(new_head.clone())),
            update_head: false,
        })?;
        replayed.push((commit.commit_hash.clone(), created.commit_hash.clone()));
        new_head = created.commit_hash;
    }

    // One edit commit per resolved conflict.
    let mut resolved_conflicts = Vec::new();
    for conflict in &plan.conflicts {
        let resolution = plan
            .resolutions
            .get(&conflict.target_hash)
            .expect("unresolved conflicts rejected above");
        let base_content = match &conflict.ancestor {
            Some(ancestor) => load_content(store, ancestor)?,
            None => Content::Freeform {
                text: String::new(),
                role: "assistant".into(),
            },
        };
        let content = base_content.with_primary_text(resolution.clone());
        let created = create_commit(store, tract_id, default_branch, counter, CommitRequest {
            content: &content,
            operation: CommitOperation::Edit,
            edit_target: Some(conflict.target_hash.clone()),
            message: Some(format!(
                "Resolve {} conflict on {}",
                conflict.conflict_type.as_str(),
                &conflict.target_hash[..8.min(conflict.target_hash.len())]
            )),
            metadata: Some(json!({"merge_resolution": true})),
            generation_config: None,
            parent_override: Some(Some(new_head.clone())),
            update_head: false,
        })?;
        resolved_conflicts.push(conflict.target_hash.clone());
        new_head = created.commit_hash;
    }

    // The merge commit itself: a system marker with both tips as parents,
    // skip-annotated so it never reaches compiled output.
    let marker = Content::Freeform {
        text: format!("Merge branch '{}'", plan.source_branch),
        role: "system".into(),
    };
    let merge_commit = create_commit(store, tract_id, default_branch, counter, CommitRequest {
        content: &marker,
        operation: CommitOperation::Append,
        edit_target: None,
        message: Some(format!("Merge branch '{}'", plan.source_branch)),
        metadata: Some(json!({
            "merge_source": plan.source_tip,
            "merge_target": plan.target_tip,
        })),
        generation_config: None,
        parent_override: Some(Some(new_head.clone())),
        update_head: false,
    })?;
    store.insert_commit_parents(&merge_commit.commit_hash, &[
        new_head.clone(),
        plan.source_tip.clone(),
    ])?;
    store.insert_annotation(&crate::internal::annotations::PriorityAnnotation {
        id: None,
        tract_id: tract_id.to_string(),
        target_hash: merge_commit.commit_hash.clone(),
        priority: Priority::Skip,
        reason: Some("merge marker".into()),
        retention: None,
        created_at: storage_now(),
    })?;

    store.update_head(tract_id, &merge_commit.commit_hash)?;

    let merge_type = if plan.has_conflicts() {
        MergeType::Conflict
    } else {
        MergeType::Clean
    };
    record_merge_event(
        store,
        tract_id,
        plan,
        merge_type,
        &replayed,
        Some(&merge_commit.commit_hash),
    )?;

    Ok(MergeResult {
        merge_type,
        source_branch: plan.source_branch.clone(),
        target_branch: plan.target_branch.clone(),
        merge_base: plan.merge_base.clone(),
        merge_commit: Some(merge_commit.commit_hash.clone()),
        new_head: merge_commit.commit_hash,
        replayed,
        resolved_conflicts,
    })
}

/// System prompt for LLM-mediated conflict resolution.
pub const RESOLVE_SYSTEM: &str = "You resolve conflicting revisions of one message in a \
conversation history. Produce a single merged text that preserves the intent of both \
revisions. Answer with the merged text only.";

/// Build the (system, user) prompt pair for resolving one conflict.
pub fn resolve_conflict_prompt(
    conflict: &ConflictInfo,
    guidance: Option<&str>,
) -> (String, String) {
    let mut prompt = format!(
        "Two branches revised the same message ({} conflict).\n\n",
        conflict.conflict_type.as_str()
    );
    if let Some(ancestor) = &conflict.ancestor_content_text {
        prompt.push_str(&format!("Original text:\n{ancestor}\n\n"));
    }
    prompt.push_str(&format!(
        "Revision A (current branch):\n{}\n\nRevision B (incoming branch):\n{}\n",
        conflict.content_a_text, conflict.content_b_text
    ));
    if let Some(guidance) = guidance {
        prompt.push_str(&format!("\nGuidance:\n{guidance}\n"));
    }
    prompt.push_str("\nProduce the merged text.");
    (RESOLVE_SYSTEM.to_string(), prompt)
}

fn record_merge_event(
    store: &Store,
    tract_id: &str,
    plan: &MergePlan,
    merge_type: MergeType,
    replayed: &[(String, String)],
    merge_commit: Option<&str>,
) -> Result<()> {
    let event = OperationEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        tract_id: tract_id.to_string(),
        operation: "merge".to_string(),
        params: Some(json!({
            "source_branch": plan.source_branch,
            "target_branch": plan.target_branch,
            "merge_base": plan.merge_base,
        })),
        instructions: None,
        guidance_source: None,
        stats: Some(json!({
            "merge_type": merge_type,
            "replayed": replayed.len(),
            "conflicts": plan.conflicts.len(),
        })),
        created_at: storage_now(),
    };
    store.insert_operation_event(&event)?;
    let consumed: Vec<String> = replayed.iter().map(|(old, _)| old.clone()).collect();
    let mut produced: Vec<String> = replayed.iter().map(|(_, new)| new.clone()).collect();
    if let Some(commit) = merge_commit {
        produced.push(commit.to_string());
    }
    store.link_operation_commits(&event.event_id, CommitRole::Consumed, &consumed)?;
    store.link_operation_commits(&event.event_id, CommitRole::Produced, &produced)?;
    Ok(())
}
