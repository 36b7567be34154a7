//! SQLite-backed storage.
//!
//! One [`Store`] owns one connection and serializes all writes for its
//! tract. The schema covers blobs, commits, extra parents, refs, the
//! append-only annotation log, operation events, compile records and
//! saved operation specs, plus a key/value `meta` table carrying the
//! schema version.
//!
//! Repositories are grouped as `impl Store` blocks, one file per table
//! family:
//!
//! - [`blobs`] — content-addressable payload storage
//! - [`commits`] — commit rows and prefix lookup
//! - [`parents`] — extra parents for merge commits
//! - [`refs`] — branches, HEAD, symbolic refs
//! - [`annotations`] — append-only priority log
//! - [`events`] — operation provenance
//! - [`compile_records`] — persisted compile summaries
//! - [`specs`] — saved dynamic operation specs

pub mod annotations;
pub mod blobs;
pub mod commits;
pub mod compile_records;
pub mod events;
pub mod parents;
pub mod refs;
pub mod specs;

pub use blobs::BlobRecord;
pub use compile_records::CompileRecord;
pub use events::{CommitRole, OperationEvent};
pub use refs::BRANCH_PREFIX;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::errors::{Result, TractError};

/// Current schema version written into `meta.schema_version`.
pub const SCHEMA_VERSION: u32 = 3;

/// Timestamp encoding used everywhere in storage: fixed-width RFC 3339
/// with microseconds and a `Z` suffix, which sorts lexicographically.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TractError::Other(format!("invalid stored timestamp `{raw}`: {e}")))
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS blobs (
    content_hash TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    byte_size    INTEGER NOT NULL,
    token_count  INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS commits (
    commit_hash            TEXT PRIMARY KEY,
    tract_id               TEXT NOT NULL,
    parent_hash            TEXT,
    content_hash           TEXT NOT NULL REFERENCES blobs(content_hash),
    content_type           TEXT NOT NULL,
    operation              TEXT NOT NULL,
    response_to            TEXT,
    message                TEXT,
    token_count            INTEGER NOT NULL,
    metadata_json          TEXT,
    generation_config_json TEXT,
    created_at             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_commits_tract_time ON commits(tract_id, created_at);
CREATE INDEX IF NOT EXISTS ix_commits_tract_type ON commits(tract_id, content_type);
CREATE INDEX IF NOT EXISTS ix_commits_response_to ON commits(response_to);
CREATE TABLE IF NOT EXISTS commit_parents (
    commit_hash TEXT NOT NULL,
    parent_hash TEXT NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (commit_hash, parent_hash)
);
CREATE INDEX IF NOT EXISTS ix_commit_parents_commit ON commit_parents(commit_hash);
CREATE TABLE IF NOT EXISTS refs (
    tract_id        TEXT NOT NULL,
    ref_name        TEXT NOT NULL,
    commit_hash     TEXT,
    symbolic_target TEXT,
    PRIMARY KEY (tract_id, ref_name)
);
CREATE TABLE IF NOT EXISTS annotations (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    tract_id       TEXT NOT NULL,
    target_hash    TEXT NOT NULL,
    priority       TEXT NOT NULL,
    reason         TEXT,
    retention_json TEXT,
    created_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_annotations_target_time ON annotations(target_hash, created_at);
CREATE INDEX IF NOT EXISTS ix_annotations_tract ON annotations(tract_id);
CREATE TABLE IF NOT EXISTS operation_events (
    event_id        TEXT PRIMARY KEY,
    tract_id        TEXT NOT NULL,
    operation       TEXT NOT NULL,
    params_json     TEXT,
    instructions    TEXT,
    guidance_source TEXT,
    stats_json      TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_operation_events_tract ON operation_events(tract_id, created_at);
CREATE TABLE IF NOT EXISTS operation_commits (
    event_id    TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    role        TEXT NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (event_id, commit_hash, role)
);
CREATE INDEX IF NOT EXISTS ix_operation_commits_hash ON operation_commits(commit_hash);
CREATE TABLE IF NOT EXISTS compile_records (
    record_id     TEXT PRIMARY KEY,
    tract_id      TEXT NOT NULL,
    root_hash     TEXT,
    head_hash     TEXT NOT NULL,
    options_hash  TEXT NOT NULL,
    message_count INTEGER NOT NULL,
    token_count   INTEGER NOT NULL,
    created_at    TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS ix_compile_records_key
    ON compile_records(tract_id, head_hash, options_hash);
CREATE TABLE IF NOT EXISTS compile_effective (
    record_id   TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    position    INTEGER NOT NULL,
    included    INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (record_id, position)
);
CREATE INDEX IF NOT EXISTS ix_compile_effective_hash ON compile_effective(commit_hash);
CREATE TABLE IF NOT EXISTS saved_specs (
    name       TEXT PRIMARY KEY,
    spec_json  TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// Owns the SQLite connection for one open tract.
pub struct Store {
    conn: Connection,
    tx_depth: usize,
}

impl Store {
    /// Open (or create) an on-disk database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        // WAL is a no-op for in-memory databases; rusqlite reports the
        // active mode, so use a query rather than execute.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let mut store = Self { conn, tx_depth: 0 };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(SCHEMA_SQL)?;
        match self.schema_version()? {
            None => self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?,
            Some(version) if version < SCHEMA_VERSION => {
                // v1 -> v2 added commit_parents (the idempotent DDL above
                // creates missing tables); v2 -> v3 added the `included`
                // flag on compile_effective. The ALTER is a no-op failure
                // when the column already exists, which keeps the
                // migration re-runnable.
                let _ = self.conn.execute_batch(
                    "ALTER TABLE compile_effective ADD COLUMN included INTEGER NOT NULL DEFAULT 1",
                );
                self.set_meta("schema_version", &SCHEMA_VERSION.to_string())?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<u32>> {
        Ok(self
            .get_meta("schema_version")?
            .and_then(|v| v.parse().ok()))
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        use rusqlite::OptionalExtension;
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- Transactions ----------------------------------------------------
    //
    // Nested calls are flattened: only the outermost begin/commit touches
    // SQLite, so `batch` can wrap operations that already transact.

    pub fn begin(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        self.tx_depth += 1;
        Ok(())
    }

    pub fn commit_tx(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            // An inner rollback already ended the transaction.
            return Ok(());
        }
        self.tx_depth -= 1;
        if self.tx_depth == 0 {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }

    pub fn rollback_tx(&mut self) -> Result<()> {
        if self.tx_depth == 0 {
            return Ok(());
        }
        self.tx_depth = 0;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.tx_depth > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version_set_on_create() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_meta_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.set_meta("k", "v1").unwrap();
        store.set_meta("k", "v2").unwrap();
        assert_eq!(store.get_meta("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(store.get_meta("missing").unwrap(), None);
    }

    #[test]
    fn test_timestamp_encoding_sorts() {
        // Round-trip through encoding first: storage precision is micros.
        let earlier = decode_ts(&encode_ts(Utc::now())).unwrap();
        let later = earlier + chrono::Duration::microseconds(5);
        assert!(encode_ts(earlier) < encode_ts(later));
        assert_eq!(decode_ts(&encode_ts(earlier)).unwrap(), earlier);
    }

    #[test]
    fn test_nested_transactions_flatten() {
        let mut store = Store::open_in_memory().unwrap();
        store.begin().unwrap();
        store.begin().unwrap();
        assert!(store.in_transaction());
        store.commit_tx().unwrap();
        assert!(store.in_transaction());
        store.commit_tx().unwrap();
        assert!(!store.in_transaction());
    }
}
