//! Extra-parent repository for merge commits.
//!
//! Non-merge commits only use `commits.parent_hash`. Merge commits store
//! ALL parents here (including the first) with positions preserved,
//! since parent ordering is significant for merge semantics.

use rusqlite::params;

use super::Store;
use crate::errors::Result;

impl Store {
    /// Record the full parent list of a merge commit.
    pub fn insert_commit_parents(&self, commit_hash: &str, parents: &[String]) -> Result<()> {
        for (position, parent) in parents.iter().enumerate() {
            self.conn().execute(
                "INSERT OR IGNORE INTO commit_parents (commit_hash, parent_hash, position)
                 VALUES (?1, ?2, ?3)",
                params![commit_hash, parent, position as i64],
            )?;
        }
        Ok(())
    }

    /// All recorded parents of a commit, in position order. Empty for
    /// non-merge commits.
    pub fn commit_parents(&self, commit_hash: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT parent_hash FROM commit_parents
             WHERE commit_hash = ?1 ORDER BY position",
        )?;
        let parents = stmt
            .query_map([commit_hash], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(parents)
    }

    pub fn delete_commit_parents(&self, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM commit_parents WHERE commit_hash = ?1",
            [commit_hash],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_ordering_preserved() {
        let store = Store::open_in_memory().unwrap();
        let parents = vec!["p0".repeat(32), "p1".repeat(32)];
        store.insert_commit_parents(&"m".repeat(64), &parents).unwrap();
        assert_eq!(store.commit_parents(&"m".repeat(64)).unwrap(), parents);
        assert!(store.commit_parents(&"x".repeat(64)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_parents() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_commit_parents(&"m".repeat(64), &["p".repeat(64)])
            .unwrap();
        store.delete_commit_parents(&"m".repeat(64)).unwrap();
        assert!(store.commit_parents(&"m".repeat(64)).unwrap().is_empty());
    }
}
