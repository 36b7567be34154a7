//! Garbage collection: reclaiming unreachable history.
//!
//! A commit is collectable when it is unreachable from every branch and
//! from HEAD, and it has aged past its retention window:
//! `orphan_retention_days` for plain orphans, `archive_retention_days`
//! for commits archived by a compression event. Deleting a commit also
//! deletes blobs nothing references any more.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::debug;

use crate::errors::Result;
use crate::internal::dag::all_ancestors;
use crate::internal::engine::storage_now;
use crate::storage::{CommitRole, OperationEvent, Store};

/// Caller-facing gc options.
#[derive(Debug, Clone)]
pub struct GcOptions {
    pub orphan_retention_days: u32,
    pub archive_retention_days: u32,
}

/// A planned garbage collection.
#[derive(Debug, Clone)]
pub struct GcPlan {
    pub commits_to_remove: Vec<String>,
    pub tokens_to_free: usize,
    /// Subset of `commits_to_remove` that were archived by compression.
    pub archived: HashSet<String>,
}

/// Result of a completed garbage collection.
#[derive(Debug, Clone)]
pub struct GcResult {
    pub commits_removed: usize,
    pub blobs_removed: usize,
    pub tokens_freed: usize,
    pub archives_removed: usize,
    pub duration_seconds: f64,
}

/// Compute the set of collectable commits.
pub fn plan_gc(store: &Store, tract_id: &str, options: &GcOptions) -> Result<GcPlan> {
    // Reachability roots: every branch tip plus HEAD. Navigation refs
    // (ORIG_HEAD, PREV_HEAD) deliberately do not pin history.
    let mut roots: Vec<String> = Vec::new();
    for branch in store.list_branches(tract_id)? {
        if let Some(tip) = store.get_branch(tract_id, &branch)? {
            roots.push(tip);
        }
    }
    if let Some(head) = store.get_head(tract_id)? {
        roots.push(head);
    }

    let mut reachable: HashSet<String> = HashSet::new();
    for root in roots {
        reachable.extend(all_ancestors(store, &root)?);
    }

    let archived: HashMap<String, DateTime<Utc>> =
        store.archived_commits(tract_id)?.into_iter().collect();
    let now = storage_now();
    let orphan_cutoff = now - Duration::days(i64::from(options.orphan_retention_days));
    let archive_cutoff = now - Duration::days(i64::from(options.archive_retention_days));

    let mut plan = GcPlan {
        commits_to_remove: Vec::new(),
        tokens_to_free: 0,
        archived: HashSet::new(),
    };
    for commit in store.commits_for_tract(tract_id)? {
        if reachable.contains(&commit.commit_hash) {
            continue;
        }
        let expired = match archived.get(&commit.commit_hash) {
            Some(archived_at) => {
                if *archived_at <= archive_cutoff {
                    plan.archived.insert(commit.commit_hash.clone());
                    true
                } else {
                    false
                }
            }
            None => commit.created_at <= orphan_cutoff,
        };
        if expired {
            plan.tokens_to_free += commit.token_count;
            plan.commits_to_remove.push(commit.commit_hash);
        }
    }
    Ok(plan)
}

/// Execute a gc plan: delete commits, their annotations and parent rows,
/// then any blobs left unreferenced.
pub fn execute_gc(store: &Store, tract_id: &str, plan: &GcPlan) -> Result<GcResult> {
    let started = Instant::now();

    let mut commits_removed = 0usize;
    let mut archives_removed = 0usize;
    for hash in &plan.commits_to_remove {
        store.delete_annotations_for(hash)?;
        store.delete_commit_parents(hash)?;
        store.delete_operation_links_for(hash)?;
        if store.delete_commit(hash)? {
            commits_removed += 1;
            if plan.archived.contains(hash) {
                archives_removed += 1;
            }
        }
    }

    let mut blobs_removed = 0usize;
    for content_hash in store.unreferenced_blob_hashes()? {
        if store.delete_blob(&content_hash)? {
            blobs_removed += 1;
        }
    }

    let result = GcResult {
        commits_removed,
        blobs_removed,
        tokens_freed: plan.tokens_to_free,
        archives_removed,
        duration_seconds: started.elapsed().as_secs_f64(),
    };
    debug!(
        commits = result.commits_removed,
        blobs = result.blobs_removed,
        "gc complete"
    );

    let event = OperationEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        tract_id: tract_id.to_string(),
        operation: "gc".to_string(),
        params: None,
        instructions: None,
        guidance_source: None,
        stats: Some(json!({
            "commits_removed": result.commits_removed,
            "blobs_removed": result.blobs_removed,
            "tokens_freed": result.tokens_freed,
            "archives_removed": result.archives_removed,
        })),
        created_at: storage_now(),
    };
    store.insert_operation_event(&event)?;
    store.link_operation_commits(
        &event.event_id,
        CommitRole::Consumed,
        &plan.commits_to_remove,
    )?;

    Ok(result)
}
