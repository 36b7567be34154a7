//! Navigation: resolving refs, reset and checkout.
//!
//! These operations move HEAD without creating commits. They compose the
//! ref and commit repositories into the user-facing verbs.

use tracing::debug;

use crate::errors::{Result, TractError};
use crate::hash::is_full_hash;
use crate::storage::{BRANCH_PREFIX, Store};

/// Reset mode. `Soft` and `Hard` behave identically (there is no working
/// tree); `Hard` exists so the verb reads like git and is gated on an
/// explicit force flag at the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    Soft,
    Hard,
}

/// Resolve `ref_or_prefix` to a full commit hash.
///
/// Resolution order: exact commit hash scoped to the tract, branch name,
/// then a >=4-character hex prefix.
pub fn resolve_commit(store: &Store, tract_id: &str, ref_or_prefix: &str) -> Result<String> {
    if is_full_hash(ref_or_prefix) {
        if let Some(commit) = store.get_commit(ref_or_prefix)? {
            if commit.tract_id == tract_id {
                return Ok(commit.commit_hash);
            }
        }
    }

    if let Some(branch_hash) = store.get_branch(tract_id, ref_or_prefix)? {
        return Ok(branch_hash);
    }

    if ref_or_prefix.len() >= 4 && ref_or_prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Ok(store.commit_by_prefix(ref_or_prefix, tract_id)?.commit_hash);
    }

    Err(TractError::CommitNotFound(ref_or_prefix.to_string()))
}

/// Move HEAD to `target_hash`, storing the old HEAD as `ORIG_HEAD`.
pub fn reset(store: &Store, tract_id: &str, target_hash: &str, mode: ResetMode) -> Result<String> {
    if let Some(current) = store.get_head(tract_id)? {
        store.set_ref(tract_id, "ORIG_HEAD", &current)?;
    }
    store.update_head(tract_id, target_hash)?;
    debug!(target = %&target_hash[..8.min(target_hash.len())], ?mode, "reset HEAD");
    Ok(target_hash.to_string())
}

/// Checkout a branch, commit, prefix, or `-` (previous position).
///
/// Returns `(resolved_hash, is_detached)`. Stores the pre-switch state
/// as `PREV_HEAD`/`PREV_BRANCH` so `-` swaps back.
pub fn checkout(store: &Store, tract_id: &str, target: &str) -> Result<(String, bool)> {
    let current_head = store.get_head(tract_id)?;

    if target == "-" {
        // Read PREV_HEAD before overwriting it with the current state.
        let prev_head = store.get_ref(tract_id, "PREV_HEAD")?.ok_or_else(|| {
            TractError::Other("No previous position to return to (PREV_HEAD not set)".into())
        })?;
        if !store.commit_exists(&prev_head)? {
            return Err(TractError::CommitNotFound(prev_head));
        }
        let prev_branch_ref = store.get_symbolic_ref(tract_id, "PREV_BRANCH")?;

        save_prev_position(store, tract_id, current_head.as_deref())?;

        return match prev_branch_ref {
            Some(target_ref) => {
                let branch = target_ref
                    .strip_prefix(BRANCH_PREFIX)
                    .unwrap_or(&target_ref)
                    .to_string();
                store.attach_head(tract_id, &branch)?;
                Ok((prev_head, false))
            }
            None => {
                store.detach_head(tract_id, &prev_head)?;
                Ok((prev_head, true))
            }
        };
    }

    save_prev_position(store, tract_id, current_head.as_deref())?;

    if let Some(branch_hash) = store.get_branch(tract_id, target)? {
        store.attach_head(tract_id, target)?;
        return Ok((branch_hash, false));
    }

    let resolved = resolve_commit(store, tract_id, target)?;
    store.detach_head(tract_id, &resolved)?;
    Ok((resolved, true))
}

fn save_prev_position(store: &Store, tract_id: &str, current_head: Option<&str>) -> Result<()> {
    let Some(head) = current_head else {
        return Ok(());
    };
    store.set_ref(tract_id, "PREV_HEAD", head)?;
    match store.current_branch(tract_id)? {
        Some(branch) => {
            store.set_symbolic_ref(tract_id, "PREV_BRANCH", &format!("{BRANCH_PREFIX}{branch}"))?;
        }
        None => {
            store.delete_ref(tract_id, "PREV_BRANCH")?;
        }
    }
    Ok(())
}
