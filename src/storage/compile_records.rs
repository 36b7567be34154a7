//! Compile-record repository: persisted summaries of past compiles.
//!
//! A record is keyed by `(tract, head, options)` and optionally carries
//! the effective commit list, letting a reopened tract skip the
//! effective-set computation for a repeat compile.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::{Store, decode_ts, encode_ts};
use crate::errors::Result;

/// Persisted summary of one compile.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRecord {
    pub record_id: String,
    pub tract_id: String,
    pub root_hash: Option<String>,
    pub head_hash: String,
    pub options_hash: String,
    pub message_count: usize,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Insert or replace the record for `(tract, head, options)`.
    ///
    /// `effective` is the compiled commit list in output order;
    /// `consulted` holds every other commit the compile looked at
    /// (edits, skip-elided commits, session boundaries). Both sets are
    /// stored so an annotation write to any of them invalidates the
    /// record, but only `effective` rows are replayed on a warm start.
    pub fn upsert_compile_record(
        &self,
        record: &CompileRecord,
        effective: &[String],
        consulted: &[String],
    ) -> Result<()> {
        if let Some(existing) = self.get_compile_record(
            &record.tract_id,
            &record.head_hash,
            &record.options_hash,
        )? {
            self.conn().execute(
                "DELETE FROM compile_effective WHERE record_id = ?1",
                [&existing.record_id],
            )?;
            self.conn().execute(
                "DELETE FROM compile_records WHERE record_id = ?1",
                [&existing.record_id],
            )?;
        }
        self.conn().execute(
            "INSERT INTO compile_records
                 (record_id, tract_id, root_hash, head_hash, options_hash,
                  message_count, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.record_id,
                record.tract_id,
                record.root_hash,
                record.head_hash,
                record.options_hash,
                record.message_count as i64,
                record.token_count as i64,
                encode_ts(record.created_at),
            ],
        )?;
        for (position, hash) in effective.iter().enumerate() {
            self.conn().execute(
                "INSERT INTO compile_effective (record_id, commit_hash, position, included)
                 VALUES (?1, ?2, ?3, 1)",
                params![record.record_id, hash, position as i64],
            )?;
        }
        for (offset, hash) in consulted.iter().enumerate() {
            self.conn().execute(
                "INSERT INTO compile_effective (record_id, commit_hash, position, included)
                 VALUES (?1, ?2, ?3, 0)",
                params![record.record_id, hash, (effective.len() + offset) as i64],
            )?;
        }
        Ok(())
    }

    pub fn get_compile_record(
        &self,
        tract_id: &str,
        head_hash: &str,
        options_hash: &str,
    ) -> Result<Option<CompileRecord>> {
        let found = self
            .conn()
            .query_row(
                "SELECT record_id, tract_id, root_hash, head_hash, options_hash,
                        message_count, token_count, created_at
                 FROM compile_records
                 WHERE tract_id = ?1 AND head_hash = ?2 AND options_hash = ?3",
                params![tract_id, head_hash, options_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;
        found
            .map(
                |(record_id, tract_id, root, head, options, messages, tokens, raw)| {
                    Ok(CompileRecord {
                        record_id,
                        tract_id,
                        root_hash: root,
                        head_hash: head,
                        options_hash: options,
                        message_count: messages as usize,
                        token_count: tokens as usize,
                        created_at: decode_ts(&raw)?,
                    })
                },
            )
            .transpose()
    }

    /// Effective commits of a record, in compile order.
    pub fn compile_effective(&self, record_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM compile_effective
             WHERE record_id = ?1 AND included = 1 ORDER BY position",
        )?;
        let hashes = stmt
            .query_map([record_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hashes)
    }

    /// Every commit a record's compile consulted, whether or not it was
    /// emitted. These are the record's invalidation keys.
    pub fn compile_touched(&self, record_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT commit_hash FROM compile_effective
             WHERE record_id = ?1 ORDER BY position",
        )?;
        let hashes = stmt
            .query_map([record_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hashes)
    }

    /// Drop every record whose effective list mentions `commit_hash`.
    /// Called when an annotation write changes how that commit compiles.
    pub fn invalidate_compile_records_for(&self, commit_hash: &str) -> Result<()> {
        self.conn().execute(
            "DELETE FROM compile_records WHERE record_id IN
                 (SELECT record_id FROM compile_effective WHERE commit_hash = ?1)",
            [commit_hash],
        )?;
        self.conn().execute(
            "DELETE FROM compile_effective WHERE record_id NOT IN
                 (SELECT record_id FROM compile_records)",
            [],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(head: &str, options: &str) -> CompileRecord {
        CompileRecord {
            record_id: uuid::Uuid::new_v4().to_string(),
            tract_id: "t".into(),
            root_hash: Some("r".repeat(64)),
            head_hash: head.to_string(),
            options_hash: options.to_string(),
            message_count: 3,
            token_count: 42,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_replaces_existing() {
        let store = Store::open_in_memory().unwrap();
        let first = record(&"h".repeat(64), "opts");
        store
            .upsert_compile_record(&first, &["a".repeat(64)], &[])
            .unwrap();

        let mut second = record(&"h".repeat(64), "opts");
        second.token_count = 99;
        store
            .upsert_compile_record(&second, &["a".repeat(64), "b".repeat(64)], &["s".repeat(64)])
            .unwrap();

        let loaded = store
            .get_compile_record("t", &"h".repeat(64), "opts")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.token_count, 99);
        // Warm-start replay sees only the emitted commits...
        assert_eq!(store.compile_effective(&loaded.record_id).unwrap().len(), 2);
        // ...but the consulted set carries the elided one too.
        assert_eq!(store.compile_touched(&loaded.record_id).unwrap().len(), 3);
    }

    #[test]
    fn test_invalidation_by_commit() {
        let store = Store::open_in_memory().unwrap();
        let r = record(&"h".repeat(64), "opts");
        store
            .upsert_compile_record(&r, &["a".repeat(64)], &[])
            .unwrap();

        store.invalidate_compile_records_for(&"a".repeat(64)).unwrap();
        assert!(
            store
                .get_compile_record("t", &"h".repeat(64), "opts")
                .unwrap()
                .is_none()
        );
        assert!(store.compile_effective(&r.record_id).unwrap().is_empty());
    }

    #[test]
    fn test_invalidation_by_consulted_only_commit() {
        let store = Store::open_in_memory().unwrap();
        let r = record(&"h".repeat(64), "opts");
        store
            .upsert_compile_record(&r, &["a".repeat(64)], &["s".repeat(64)])
            .unwrap();

        // The skip-elided commit never compiled, but annotating it must
        // still drop the record.
        store.invalidate_compile_records_for(&"s".repeat(64)).unwrap();
        assert!(
            store
                .get_compile_record("t", &"h".repeat(64), "opts")
                .unwrap()
                .is_none()
        );
    }
}
