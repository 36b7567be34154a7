//! Operation-event repository: one row per compression, merge, rebase,
//! gc or import invocation, plus per-commit links recording what each
//! event consumed, produced or preserved.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{Store, decode_ts, encode_ts};
use crate::errors::Result;

/// Role a commit played in an operation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRole {
    /// Input commit rewritten or replaced by the operation.
    Consumed,
    /// Commit created by the operation.
    Produced,
    /// Commit carried through verbatim (pinned/preserved).
    Preserved,
}

impl CommitRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CommitRole::Consumed => "consumed",
            CommitRole::Produced => "produced",
            CommitRole::Preserved => "preserved",
        }
    }
}

/// A recorded operation invocation.
#[derive(Debug, Clone)]
pub struct OperationEvent {
    pub event_id: String,
    pub tract_id: String,
    pub operation: String,
    pub params: Option<Value>,
    pub instructions: Option<String>,
    pub guidance_source: Option<String>,
    pub stats: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub fn insert_operation_event(&self, event: &OperationEvent) -> Result<()> {
        self.conn().execute(
            "INSERT INTO operation_events
                 (event_id, tract_id, operation, params_json, instructions,
                  guidance_source, stats_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.tract_id,
                event.operation,
                event.params.as_ref().map(|p| p.to_string()),
                event.instructions,
                event.guidance_source,
                event.stats.as_ref().map(|s| s.to_string()),
                encode_ts(event.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn link_operation_commits(
        &self,
        event_id: &str,
        role: CommitRole,
        commits: &[String],
    ) -> Result<()> {
        for (position, hash) in commits.iter().enumerate() {
            self.conn().execute(
                "INSERT OR IGNORE INTO operation_commits (event_id, commit_hash, role, position)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event_id, hash, role.as_str(), position as i64],
            )?;
        }
        Ok(())
    }

    pub fn get_operation_event(&self, event_id: &str) -> Result<Option<OperationEvent>> {
        let found = self
            .conn()
            .query_row(
                "SELECT event_id, tract_id, operation, params_json, instructions,
                        guidance_source, stats_json, created_at
                 FROM operation_events WHERE event_id = ?1",
                [event_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(
                |(event_id, tract_id, operation, params, instructions, guidance, stats, raw)| {
                    Ok(OperationEvent {
                        event_id,
                        tract_id,
                        operation,
                        params: params.and_then(|p| serde_json::from_str(&p).ok()),
                        instructions,
                        guidance_source: guidance,
                        stats: stats.and_then(|s| serde_json::from_str(&s).ok()),
                        created_at: decode_ts(&raw)?,
                    })
                },
            )
            .transpose()
    }

    /// Commits linked to an event under a given role, in position order.
    pub fn operation_commits(&self, event_id: &str, role: CommitRole) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM operation_commits
             WHERE event_id = ?1 AND role = ?2 ORDER BY position",
        )?;
        let commits = stmt
            .query_map(params![event_id, role.as_str()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(commits)
    }

    /// Commits consumed by compression events, with the event timestamp.
    /// These are the "archived" commits subject to the archive retention
    /// window during gc.
    pub fn archived_commits(&self, tract_id: &str) -> Result<Vec<(String, DateTime<Utc>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT oc.commit_hash, e.created_at
             FROM operation_commits oc
             JOIN operation_events e ON e.event_id = oc.event_id
             WHERE e.tract_id = ?1 AND e.operation = 'compress' AND oc.role = 'consumed'",
        )?;
        let rows = stmt
            .query_map([tract_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(hash, raw)| Ok((hash, decode_ts(&raw)?)))
            .collect()
    }

    pub fn delete_operation_links_for(&self, commit_hash: &str) -> Result<usize> {
        let changed = self.conn().execute(
            "DELETE FROM operation_commits WHERE commit_hash = ?1",
            [commit_hash],
        )?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, operation: &str) -> OperationEvent {
        OperationEvent {
            event_id: id.to_string(),
            tract_id: "t".into(),
            operation: operation.to_string(),
            params: Some(json!({"target_tokens": 50})),
            instructions: Some("keep decisions".into()),
            guidance_source: Some("llm".into()),
            stats: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_round_trip_with_links() {
        let store = Store::open_in_memory().unwrap();
        store.insert_operation_event(&event("e1", "compress")).unwrap();
        store
            .link_operation_commits("e1", CommitRole::Consumed, &["a".repeat(64), "b".repeat(64)])
            .unwrap();
        store
            .link_operation_commits("e1", CommitRole::Produced, &["c".repeat(64)])
            .unwrap();

        let loaded = store.get_operation_event("e1").unwrap().unwrap();
        assert_eq!(loaded.operation, "compress");
        assert_eq!(loaded.params.unwrap()["target_tokens"], 50);
        assert_eq!(
            store.operation_commits("e1", CommitRole::Consumed).unwrap(),
            vec!["a".repeat(64), "b".repeat(64)]
        );
        assert_eq!(
            store.operation_commits("e1", CommitRole::Produced).unwrap(),
            vec!["c".repeat(64)]
        );
    }

    #[test]
    fn test_archived_commits_only_from_compress() {
        let store = Store::open_in_memory().unwrap();
        store.insert_operation_event(&event("e1", "compress")).unwrap();
        store.insert_operation_event(&event("e2", "rebase")).unwrap();
        store
            .link_operation_commits("e1", CommitRole::Consumed, &["a".repeat(64)])
            .unwrap();
        store
            .link_operation_commits("e2", CommitRole::Consumed, &["b".repeat(64)])
            .unwrap();

        let archived = store.archived_commits("t").unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].0, "a".repeat(64));
    }
}
