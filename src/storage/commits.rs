//! Commit repository: rows of the context DAG plus prefix lookup.

use rusqlite::{OptionalExtension, Row, params};

use super::{Store, decode_ts, encode_ts};
use crate::errors::{Result, TractError};
use crate::internal::commit::{CommitInfo, CommitOperation};
use crate::llm::LlmConfig;

/// Minimum hex-prefix length accepted by [`Store::commit_by_prefix`].
pub const MIN_PREFIX_LEN: usize = 4;

fn row_to_commit(row: &Row<'_>) -> rusqlite::Result<(CommitInfo, String)> {
    // created_at is decoded by the caller so timestamp errors surface as
    // TractError instead of panicking inside the rusqlite mapper.
    let metadata_json: Option<String> = row.get(9)?;
    let generation_json: Option<String> = row.get(10)?;
    let created_at_raw: String = row.get(11)?;
    let operation_raw: String = row.get(5)?;
    Ok((
        CommitInfo {
            commit_hash: row.get(0)?,
            tract_id: row.get(1)?,
            parent_hash: row.get(2)?,
            content_hash: row.get(3)?,
            content_type: row.get(4)?,
            operation: CommitOperation::parse(&operation_raw)
                .unwrap_or(CommitOperation::Append),
            edit_target: row.get(6)?,
            message: row.get(8)?,
            token_count: row.get::<_, i64>(7)? as usize,
            metadata: metadata_json.and_then(|m| serde_json::from_str(&m).ok()),
            generation_config: generation_json
                .and_then(|g| serde_json::from_str::<LlmConfig>(&g).ok()),
            created_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        },
        created_at_raw,
    ))
}

const COMMIT_COLUMNS: &str = "commit_hash, tract_id, parent_hash, content_hash, content_type,
     operation, response_to, token_count, message, metadata_json,
     generation_config_json, created_at";

impl Store {
    pub fn insert_commit(&self, commit: &CommitInfo) -> Result<()> {
        let metadata_json = commit
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let generation_json = commit
            .generation_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn().execute(
            "INSERT INTO commits
                 (commit_hash, tract_id, parent_hash, content_hash, content_type,
                  operation, response_to, token_count, message, metadata_json,
                  generation_config_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                commit.commit_hash,
                commit.tract_id,
                commit.parent_hash,
                commit.content_hash,
                commit.content_type,
                commit.operation.as_str(),
                commit.edit_target,
                commit.token_count as i64,
                commit.message,
                metadata_json,
                generation_json,
                encode_ts(commit.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_commit(&self, commit_hash: &str) -> Result<Option<CommitInfo>> {
        let found = self
            .conn()
            .query_row(
                &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_hash = ?1"),
                [commit_hash],
                row_to_commit,
            )
            .optional()?;
        found
            .map(|(mut commit, raw_ts)| {
                commit.created_at = decode_ts(&raw_ts)?;
                Ok(commit)
            })
            .transpose()
    }

    /// Fetch a commit, failing with `CommitNotFound` when absent.
    pub fn require_commit(&self, commit_hash: &str) -> Result<CommitInfo> {
        self.get_commit(commit_hash)?
            .ok_or_else(|| TractError::CommitNotFound(commit_hash.to_string()))
    }

    pub fn commit_exists(&self, commit_hash: &str) -> Result<bool> {
        Ok(self
            .conn()
            .query_row(
                "SELECT 1 FROM commits WHERE commit_hash = ?1",
                [commit_hash],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    /// Resolve a hex prefix (>= 4 chars) to the unique matching commit in
    /// this tract.
    pub fn commit_by_prefix(&self, prefix: &str, tract_id: &str) -> Result<CommitInfo> {
        if prefix.len() < MIN_PREFIX_LEN {
            return Err(TractError::CommitNotFound(prefix.to_string()));
        }
        let pattern = format!("{}%", prefix.replace(['%', '_'], ""));
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE tract_id = ?1 AND commit_hash LIKE ?2 LIMIT 3"
        ))?;
        let rows = stmt
            .query_map(params![tract_id, pattern], row_to_commit)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        match rows.len() {
            0 => Err(TractError::CommitNotFound(prefix.to_string())),
            1 => {
                let (mut commit, raw_ts) = rows.into_iter().next().expect("one row");
                commit.created_at = decode_ts(&raw_ts)?;
                Ok(commit)
            }
            n => Err(TractError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                matches: n,
            }),
        }
    }

    /// All commits of a tract in chronological order.
    pub fn commits_for_tract(&self, tract_id: &str) -> Result<Vec<CommitInfo>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE tract_id = ?1 ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt
            .query_map([tract_id], row_to_commit)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut commit, raw_ts)| {
                commit.created_at = decode_ts(&raw_ts)?;
                Ok(commit)
            })
            .collect()
    }

    /// All edits whose target is `edit_target`, oldest first.
    pub fn edits_of(&self, edit_target: &str) -> Result<Vec<CommitInfo>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COMMIT_COLUMNS} FROM commits
             WHERE response_to = ?1 AND operation = 'edit'
             ORDER BY created_at, commit_hash"
        ))?;
        let rows = stmt
            .query_map([edit_target], row_to_commit)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut commit, raw_ts)| {
                commit.created_at = decode_ts(&raw_ts)?;
                Ok(commit)
            })
            .collect()
    }

    pub fn delete_commit(&self, commit_hash: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM commits WHERE commit_hash = ?1", [commit_hash])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seed(store: &Store, hash: &str, parent: Option<&str>) -> CommitInfo {
        store
            .insert_blob(&"b".repeat(64), "{}", 0, Utc::now())
            .unwrap();
        let commit = CommitInfo {
            commit_hash: hash.to_string(),
            tract_id: "t1".into(),
            parent_hash: parent.map(String::from),
            content_hash: "b".repeat(64),
            content_type: "dialogue".into(),
            operation: CommitOperation::Append,
            edit_target: None,
            message: Some("seed".into()),
            token_count: 2,
            metadata: Some(serde_json::json!({"k": "v"})),
            generation_config: None,
            created_at: super::super::decode_ts(&encode_ts(Utc::now())).unwrap(),
        };
        store.insert_commit(&commit).unwrap();
        commit
    }

    #[test]
    fn test_commit_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let commit = seed(&store, &"1a".repeat(32), None);
        let loaded = store.require_commit(&commit.commit_hash).unwrap();
        assert_eq!(loaded, commit);
    }

    #[test]
    fn test_prefix_lookup() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, &format!("aaaa{}", "0".repeat(60)), None);
        seed(&store, &format!("aabb{}", "0".repeat(60)), None);

        let found = store.commit_by_prefix("aaaa", "t1").unwrap();
        assert!(found.commit_hash.starts_with("aaaa"));

        assert!(matches!(
            store.commit_by_prefix("aa", "t1"),
            Err(TractError::CommitNotFound(_))
        ));
        assert!(matches!(
            store.commit_by_prefix("aaaa", "other-tract"),
            Err(TractError::CommitNotFound(_))
        ));
    }

    #[test]
    fn test_ambiguous_prefix() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, &format!("abcd1{}", "0".repeat(59)), None);
        seed(&store, &format!("abcd2{}", "0".repeat(59)), None);
        assert!(matches!(
            store.commit_by_prefix("abcd", "t1"),
            Err(TractError::AmbiguousPrefix { matches: 2, .. })
        ));
    }

    #[test]
    fn test_edits_of() {
        let store = Store::open_in_memory().unwrap();
        let target = seed(&store, &"2b".repeat(32), None);
        let mut edit = seed(&store, &"3c".repeat(32), Some(&target.commit_hash));
        edit.commit_hash = "4d".repeat(32);
        edit.operation = CommitOperation::Edit;
        edit.edit_target = Some(target.commit_hash.clone());
        store.insert_commit(&edit).unwrap();

        let edits = store.edits_of(&target.commit_hash).unwrap();
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].commit_hash, edit.commit_hash);
    }
}
