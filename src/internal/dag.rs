//! DAG utilities: ancestor sets, merge base, branch commit ranges.
//!
//! Traversals follow both the first-parent chain (`commits.parent_hash`)
//! and extra parents recorded for merge commits. Every walk carries a
//! visited set so it terminates even if data corruption introduced a
//! cycle.

use std::collections::{HashSet, VecDeque};

use crate::errors::Result;
use crate::internal::commit::CommitInfo;
use crate::storage::Store;

/// All ancestor hashes of `commit_hash`, including itself.
pub fn all_ancestors(store: &Store, commit_hash: &str) -> Result<HashSet<String>> {
    let mut ancestors: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([commit_hash.to_string()]);

    while let Some(current) = queue.pop_front() {
        if !ancestors.insert(current.clone()) {
            continue;
        }
        if let Some(commit) = store.get_commit(&current)? {
            if let Some(parent) = commit.parent_hash {
                queue.push_back(parent);
            }
        }
        for extra in store.commit_parents(&current)? {
            if !ancestors.contains(&extra) {
                queue.push_back(extra);
            }
        }
    }
    Ok(ancestors)
}

/// Best common ancestor of two commits, or `None` when their histories
/// are disjoint.
///
/// Builds the ancestor set of `a`, then BFS from `b`; the first hit is
/// the merge base. Symmetric: `merge_base(a, b) == merge_base(b, a)`.
pub fn merge_base(store: &Store, hash_a: &str, hash_b: &str) -> Result<Option<String>> {
    let ancestors_a = all_ancestors(store, hash_a)?;

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::from([hash_b.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if ancestors_a.contains(&current) {
            return Ok(Some(current));
        }
        if let Some(commit) = store.get_commit(&current)? {
            if let Some(parent) = commit.parent_hash {
                queue.push_back(parent);
            }
        }
        for extra in store.commit_parents(&current)? {
            if !visited.contains(&extra) {
                queue.push_back(extra);
            }
        }
    }
    Ok(None)
}

/// Commits between `base` (exclusive) and `tip` (inclusive), walking the
/// first-parent chain only, returned in chronological order (root first).
pub fn branch_commits(store: &Store, tip: &str, base: &str) -> Result<Vec<CommitInfo>> {
    let mut commits: Vec<CommitInfo> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut current = Some(tip.to_string());

    while let Some(hash) = current {
        if hash == base || !seen.insert(hash.clone()) {
            break;
        }
        let Some(commit) = store.get_commit(&hash)? else {
            break;
        };
        current = commit.parent_hash.clone();
        commits.push(commit);
    }
    commits.reverse();
    Ok(commits)
}

/// True if `potential_ancestor` is reachable from `commit_hash`.
pub fn is_ancestor(store: &Store, potential_ancestor: &str, commit_hash: &str) -> Result<bool> {
    if potential_ancestor == commit_hash {
        return Ok(true);
    }
    Ok(all_ancestors(store, commit_hash)?.contains(potential_ancestor))
}

/// First-parent chain from `tip` back to the root, tip first.
pub fn first_parent_chain(store: &Store, tip: &str) -> Result<Vec<CommitInfo>> {
    let mut chain: Vec<CommitInfo> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut current = Some(tip.to_string());
    while let Some(hash) = current {
        if !seen.insert(hash.clone()) {
            break;
        }
        let Some(commit) = store.get_commit(&hash)? else {
            break;
        };
        current = commit.parent_hash.clone();
        chain.push(commit);
    }
    Ok(chain)
}
