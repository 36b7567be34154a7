//! Branch operations: name validation, create, delete, list.

use crate::errors::{Result, TractError};
use crate::internal::dag::is_ancestor;
use crate::storage::Store;

/// Summary of one branch for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub tip_hash: String,
    pub is_current: bool,
}

const FORBIDDEN_CHARS: &[char] = &['~', '^', ':', '?', '*', '[', '\\'];

/// Validate a branch name against git-style rules.
pub fn validate_branch_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(TractError::InvalidBranchName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("branch name cannot be empty");
    }
    if name.contains("..") {
        return invalid("branch name cannot contain '..'");
    }
    if name.ends_with(".lock") {
        return invalid("branch name cannot end with '.lock'");
    }
    if name.starts_with('.') || name.ends_with('.') {
        return invalid("branch name cannot start or end with '.'");
    }
    if name.chars().any(char::is_whitespace) || name.contains(FORBIDDEN_CHARS) {
        return invalid("branch name contains forbidden characters (whitespace, ~, ^, :, ?, *, [, \\)");
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return invalid("branch name has invalid slash usage");
    }
    Ok(())
}

/// Create a branch at `source` (defaults to HEAD), optionally switching
/// HEAD onto it.
pub fn create_branch(
    store: &Store,
    tract_id: &str,
    name: &str,
    source: Option<&str>,
    switch: bool,
) -> Result<String> {
    validate_branch_name(name)?;

    if store.get_branch(tract_id, name)?.is_some() {
        return Err(TractError::BranchExists(name.to_string()));
    }

    let source_hash = match source {
        Some(hash) => hash.to_string(),
        None => store
            .get_head(tract_id)?
            .ok_or_else(|| TractError::Other("Cannot create branch: no commits exist".into()))?,
    };

    store.set_branch(tract_id, name, &source_hash)?;
    if switch {
        store.attach_head(tract_id, name)?;
    }
    Ok(source_hash)
}

/// Delete a branch. Refuses the current branch always, and an unmerged
/// branch unless `force`.
pub fn delete_branch(store: &Store, tract_id: &str, name: &str, force: bool) -> Result<()> {
    let branch_hash = store
        .get_branch(tract_id, name)?
        .ok_or_else(|| TractError::BranchNotFound(name.to_string()))?;

    if store.current_branch(tract_id)?.as_deref() == Some(name) {
        return Err(TractError::Other(format!(
            "Cannot delete the current branch '{name}'"
        )));
    }

    if !force {
        if let Some(current_head) = store.get_head(tract_id)? {
            if branch_hash != current_head && !is_ancestor(store, &branch_hash, &current_head)? {
                return Err(TractError::UnmergedBranch(name.to_string()));
            }
        }
    }

    store.delete_branch_ref(tract_id, name)?;
    Ok(())
}

/// All branches of a tract with tips and the current marker.
pub fn list_branches(store: &Store, tract_id: &str) -> Result<Vec<BranchInfo>> {
    let current = store.current_branch(tract_id)?;
    let mut branches = Vec::new();
    for name in store.list_branches(tract_id)? {
        if let Some(tip_hash) = store.get_branch(tract_id, &name)? {
            branches.push(BranchInfo {
                is_current: current.as_deref() == Some(&name),
                name,
                tip_hash,
            });
        }
    }
    Ok(branches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_name_rules() {
        assert!(validate_branch_name("feature/login").is_ok());
        assert!(validate_branch_name("hotfix-1.2").is_ok());

        for bad in [
            "",
            "has space",
            "tilde~1",
            "care^t",
            "col:on",
            "que?ry",
            "sta*r",
            "brack[et",
            "back\\slash",
            "dot..dot",
            ".leading",
            "trailing.",
            "name.lock",
            "/leading",
            "trailing/",
            "double//slash",
        ] {
            assert!(
                matches!(
                    validate_branch_name(bad),
                    Err(TractError::InvalidBranchName { .. })
                ),
                "expected `{bad}` to be rejected"
            );
        }
    }
}
