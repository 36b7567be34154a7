//! Ref repository: branches, HEAD (attached or detached), and the
//! navigation refs `ORIG_HEAD`, `PREV_HEAD`, `PREV_BRANCH`.
//!
//! A ref row is either direct (`commit_hash` set) or symbolic
//! (`symbolic_target` set), never both. `HEAD` is symbolic while
//! attached to a branch and direct while detached.

use rusqlite::{OptionalExtension, params};

use super::Store;
use crate::errors::{Result, TractError};

/// Prefix under which branch refs are stored.
pub const BRANCH_PREFIX: &str = "refs/heads/";

fn branch_ref(name: &str) -> String {
    format!("{BRANCH_PREFIX}{name}")
}

impl Store {
    // -- Direct refs -----------------------------------------------------

    pub fn get_ref(&self, tract_id: &str, ref_name: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT commit_hash FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
                params![tract_id, ref_name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_ref(&self, tract_id: &str, ref_name: &str, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO refs (tract_id, ref_name, commit_hash, symbolic_target)
             VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(tract_id, ref_name)
             DO UPDATE SET commit_hash = excluded.commit_hash, symbolic_target = NULL",
            params![tract_id, ref_name, commit_hash],
        )?;
        Ok(())
    }

    /// Create a direct ref, failing with `DuplicateRef` if it exists.
    pub fn create_ref(&self, tract_id: &str, ref_name: &str, commit_hash: &str) -> Result<()> {
        let existing: Option<String> = self
            .conn()
            .query_row(
                "SELECT ref_name FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
                params![tract_id, ref_name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(TractError::DuplicateRef(ref_name.to_string()));
        }
        self.set_ref(tract_id, ref_name, commit_hash)
    }

    pub fn delete_ref(&self, tract_id: &str, ref_name: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
            params![tract_id, ref_name],
        )?;
        Ok(changed > 0)
    }

    // -- Symbolic refs ---------------------------------------------------

    pub fn get_symbolic_ref(&self, tract_id: &str, ref_name: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT symbolic_target FROM refs WHERE tract_id = ?1 AND ref_name = ?2",
                params![tract_id, ref_name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn set_symbolic_ref(&self, tract_id: &str, ref_name: &str, target: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO refs (tract_id, ref_name, commit_hash, symbolic_target)
             VALUES (?1, ?2, NULL, ?3)
             ON CONFLICT(tract_id, ref_name)
             DO UPDATE SET commit_hash = NULL, symbolic_target = excluded.symbolic_target",
            params![tract_id, ref_name, target],
        )?;
        Ok(())
    }

    // -- Branches --------------------------------------------------------

    pub fn get_branch(&self, tract_id: &str, name: &str) -> Result<Option<String>> {
        self.get_ref(tract_id, &branch_ref(name))
    }

    pub fn set_branch(&self, tract_id: &str, name: &str, commit_hash: &str) -> Result<()> {
        self.set_ref(tract_id, &branch_ref(name), commit_hash)
    }

    pub fn delete_branch_ref(&self, tract_id: &str, name: &str) -> Result<bool> {
        self.delete_ref(tract_id, &branch_ref(name))
    }

    pub fn list_branches(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT ref_name FROM refs
             WHERE tract_id = ?1 AND ref_name LIKE 'refs/heads/%'
             ORDER BY ref_name",
        )?;
        let names = stmt
            .query_map([tract_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names
            .into_iter()
            .map(|n| n.trim_start_matches(BRANCH_PREFIX).to_string())
            .collect())
    }

    // -- HEAD ------------------------------------------------------------

    /// Resolve HEAD to a commit hash, following a symbolic target.
    pub fn get_head(&self, tract_id: &str) -> Result<Option<String>> {
        if let Some(target) = self.get_symbolic_ref(tract_id, "HEAD")? {
            return self.get_ref(tract_id, &target);
        }
        self.get_ref(tract_id, "HEAD")
    }

    /// Move HEAD to `commit_hash`, writing through to the current branch
    /// when attached and updating detached HEAD otherwise.
    pub fn update_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        if let Some(target) = self.get_symbolic_ref(tract_id, "HEAD")? {
            self.set_ref(tract_id, &target, commit_hash)
        } else {
            self.set_ref(tract_id, "HEAD", commit_hash)
        }
    }

    /// Attach HEAD to a branch (HEAD becomes symbolic).
    pub fn attach_head(&self, tract_id: &str, branch: &str) -> Result<()> {
        self.set_symbolic_ref(tract_id, "HEAD", &branch_ref(branch))
    }

    /// Detach HEAD at a specific commit.
    pub fn detach_head(&self, tract_id: &str, commit_hash: &str) -> Result<()> {
        self.set_ref(tract_id, "HEAD", commit_hash)
    }

    /// The branch HEAD is attached to, or `None` when detached.
    pub fn current_branch(&self, tract_id: &str) -> Result<Option<String>> {
        Ok(self
            .get_symbolic_ref(tract_id, "HEAD")?
            .and_then(|t| t.strip_prefix(BRANCH_PREFIX).map(String::from)))
    }

    pub fn head_is_detached(&self, tract_id: &str) -> Result<bool> {
        Ok(self.get_symbolic_ref(tract_id, "HEAD")?.is_none()
            && self.get_ref(tract_id, "HEAD")?.is_some())
    }

    /// Every commit hash a ref (branch or navigation) points at.
    pub fn ref_targets(&self, tract_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM refs
             WHERE tract_id = ?1 AND commit_hash IS NOT NULL",
        )?;
        let targets = stmt
            .query_map([tract_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attached_head_writes_through_to_branch() {
        let store = Store::open_in_memory().unwrap();
        store.set_branch("t", "main", &"1".repeat(64)).unwrap();
        store.attach_head("t", "main").unwrap();

        assert_eq!(store.get_head("t").unwrap(), Some("1".repeat(64)));
        store.update_head("t", &"2".repeat(64)).unwrap();
        assert_eq!(store.get_branch("t", "main").unwrap(), Some("2".repeat(64)));
        assert_eq!(store.current_branch("t").unwrap().as_deref(), Some("main"));
        assert!(!store.head_is_detached("t").unwrap());
    }

    #[test]
    fn test_detached_head() {
        let store = Store::open_in_memory().unwrap();
        store.set_branch("t", "main", &"1".repeat(64)).unwrap();
        store.attach_head("t", "main").unwrap();
        store.detach_head("t", &"3".repeat(64)).unwrap();

        assert!(store.head_is_detached("t").unwrap());
        assert_eq!(store.get_head("t").unwrap(), Some("3".repeat(64)));
        // Branch is untouched by detached-HEAD movement.
        store.update_head("t", &"4".repeat(64)).unwrap();
        assert_eq!(store.get_branch("t", "main").unwrap(), Some("1".repeat(64)));
    }

    #[test]
    fn test_list_branches_sorted() {
        let store = Store::open_in_memory().unwrap();
        store.set_branch("t", "main", &"1".repeat(64)).unwrap();
        store.set_branch("t", "feature", &"1".repeat(64)).unwrap();
        store.set_ref("t", "ORIG_HEAD", &"1".repeat(64)).unwrap();
        assert_eq!(store.list_branches("t").unwrap(), vec!["feature", "main"]);
    }

    #[test]
    fn test_create_ref_duplicate() {
        let store = Store::open_in_memory().unwrap();
        store.create_ref("t", "ORIG_HEAD", &"1".repeat(64)).unwrap();
        assert!(matches!(
            store.create_ref("t", "ORIG_HEAD", &"2".repeat(64)),
            Err(TractError::DuplicateRef(_))
        ));
    }

    #[test]
    fn test_refs_scoped_by_tract() {
        let store = Store::open_in_memory().unwrap();
        store.set_branch("t1", "main", &"1".repeat(64)).unwrap();
        assert_eq!(store.get_branch("t2", "main").unwrap(), None);
    }
}
