//! Annotation repository: the append-only priority log.
//!
//! Rows are never updated; changing a commit's priority inserts a new
//! row and "latest by created_at wins" (ties broken by rowid).

use rusqlite::{OptionalExtension, Row, params};

use super::{Store, decode_ts, encode_ts};
use crate::errors::Result;
use crate::internal::annotations::{
    AnnotationCounts, Priority, PriorityAnnotation, RetentionCriteria,
};

fn row_to_annotation(row: &Row<'_>) -> rusqlite::Result<(PriorityAnnotation, String)> {
    let priority_raw: String = row.get(3)?;
    let retention_json: Option<String> = row.get(5)?;
    let created_raw: String = row.get(6)?;
    Ok((
        PriorityAnnotation {
            id: Some(row.get(0)?),
            tract_id: row.get(1)?,
            target_hash: row.get(2)?,
            priority: Priority::parse(&priority_raw).unwrap_or(Priority::Normal),
            reason: row.get(4)?,
            retention: retention_json
                .and_then(|r| serde_json::from_str::<RetentionCriteria>(&r).ok()),
            created_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        },
        created_raw,
    ))
}

const ANNOTATION_COLUMNS: &str =
    "id, tract_id, target_hash, priority, reason, retention_json, created_at";

impl Store {
    /// Append one annotation row. `retention` is persisted only for
    /// `important` priority; it has no meaning elsewhere.
    pub fn insert_annotation(&self, annotation: &PriorityAnnotation) -> Result<i64> {
        let retention_json = match (annotation.priority, &annotation.retention) {
            (Priority::Important, Some(retention)) => Some(serde_json::to_string(retention)?),
            _ => None,
        };
        self.conn().execute(
            "INSERT INTO annotations
                 (tract_id, target_hash, priority, reason, retention_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                annotation.tract_id,
                annotation.target_hash,
                annotation.priority.as_str(),
                annotation.reason,
                retention_json,
                encode_ts(annotation.created_at),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// The current (latest) annotation for a commit, if any.
    pub fn latest_annotation(&self, target_hash: &str) -> Result<Option<PriorityAnnotation>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {ANNOTATION_COLUMNS} FROM annotations
                     WHERE target_hash = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [target_hash],
                row_to_annotation,
            )
            .optional()?;
        found
            .map(|(mut annotation, raw)| {
                annotation.created_at = decode_ts(&raw)?;
                Ok(annotation)
            })
            .transpose()
    }

    /// Full annotation history for a commit, oldest first.
    pub fn annotation_history(&self, target_hash: &str) -> Result<Vec<PriorityAnnotation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ANNOTATION_COLUMNS} FROM annotations
             WHERE target_hash = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map([target_hash], row_to_annotation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(mut annotation, raw)| {
                annotation.created_at = decode_ts(&raw)?;
                Ok(annotation)
            })
            .collect()
    }

    /// Current priority per annotated commit of a tract.
    pub fn current_priorities(&self, tract_id: &str) -> Result<Vec<(String, Priority)>> {
        let mut stmt = self.conn().prepare(
            "SELECT a.target_hash, a.priority FROM annotations a
             JOIN (SELECT target_hash, MAX(id) AS max_id FROM annotations
                   WHERE tract_id = ?1 GROUP BY target_hash) latest
               ON a.id = latest.max_id",
        )?;
        let rows = stmt
            .query_map([tract_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(hash, priority)| {
                (hash, Priority::parse(&priority).unwrap_or(Priority::Normal))
            })
            .collect())
    }

    /// Tally current priorities across a tract's annotated commits.
    pub fn annotation_counts(&self, tract_id: &str) -> Result<AnnotationCounts> {
        let mut counts = AnnotationCounts::default();
        for (_, priority) in self.current_priorities(tract_id)? {
            match priority {
                Priority::Pinned => counts.pinned += 1,
                Priority::Important => counts.important += 1,
                Priority::Normal => counts.normal += 1,
                Priority::Skip => counts.skip += 1,
            }
        }
        Ok(counts)
    }

    pub fn delete_annotations_for(&self, target_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM annotations WHERE target_hash = ?1",
            [target_hash],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn annotation(target: &str, priority: Priority) -> PriorityAnnotation {
        PriorityAnnotation {
            id: None,
            tract_id: "t".into(),
            target_hash: target.to_string(),
            priority,
            reason: None,
            retention: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_latest_wins() {
        let store = Store::open_in_memory().unwrap();
        let target = "c".repeat(64);
        store.insert_annotation(&annotation(&target, Priority::Pinned)).unwrap();
        store.insert_annotation(&annotation(&target, Priority::Skip)).unwrap();

        let latest = store.latest_annotation(&target).unwrap().unwrap();
        assert_eq!(latest.priority, Priority::Skip);
        assert_eq!(store.annotation_history(&target).unwrap().len(), 2);
    }

    #[test]
    fn test_retention_persisted_for_important_only() {
        let store = Store::open_in_memory().unwrap();
        let retention = RetentionCriteria::with_patterns(["42 widgets"]);

        let mut important = annotation(&"a".repeat(64), Priority::Important);
        important.retention = Some(retention.clone());
        store.insert_annotation(&important).unwrap();

        let mut pinned = annotation(&"b".repeat(64), Priority::Pinned);
        pinned.retention = Some(retention);
        store.insert_annotation(&pinned).unwrap();

        assert!(
            store
                .latest_annotation(&"a".repeat(64))
                .unwrap()
                .unwrap()
                .retention
                .is_some()
        );
        assert!(
            store
                .latest_annotation(&"b".repeat(64))
                .unwrap()
                .unwrap()
                .retention
                .is_none()
        );
    }

    #[test]
    fn test_counts_use_current_priority() {
        let store = Store::open_in_memory().unwrap();
        store.insert_annotation(&annotation(&"a".repeat(64), Priority::Pinned)).unwrap();
        store.insert_annotation(&annotation(&"b".repeat(64), Priority::Skip)).unwrap();
        // b flips to normal; only the latest row counts.
        store.insert_annotation(&annotation(&"b".repeat(64), Priority::Normal)).unwrap();

        let counts = store.annotation_counts("t").unwrap();
        assert_eq!(counts.pinned, 1);
        assert_eq!(counts.normal, 1);
        assert_eq!(counts.skip, 0);
    }
}
