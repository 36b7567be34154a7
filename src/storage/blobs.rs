//! Blob repository: content-addressable payload storage.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde_json::Value;

use super::{Store, decode_ts, encode_ts};
use crate::errors::{Result, TractError};

/// A stored content blob, keyed by the SHA-256 of its canonical JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRecord {
    pub content_hash: String,
    pub payload_json: String,
    pub byte_size: usize,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

impl BlobRecord {
    pub fn payload(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

impl Store {
    /// Insert a blob if its hash is not already present. Blobs are
    /// immutable, so an existing row is left untouched.
    pub fn insert_blob(
        &self,
        content_hash: &str,
        payload_json: &str,
        token_count: usize,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO blobs
                 (content_hash, payload_json, byte_size, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                content_hash,
                payload_json,
                payload_json.len() as i64,
                token_count as i64,
                encode_ts(created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_blob(&self, content_hash: &str) -> Result<Option<BlobRecord>> {
        self.conn()
            .query_row(
                "SELECT content_hash, payload_json, byte_size, token_count, created_at
                 FROM blobs WHERE content_hash = ?1",
                [content_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?
            .map(|(content_hash, payload_json, byte_size, token_count, created_at)| {
                Ok(BlobRecord {
                    content_hash,
                    payload_json,
                    byte_size: byte_size as usize,
                    token_count: token_count as usize,
                    created_at: decode_ts(&created_at)?,
                })
            })
            .transpose()
    }

    /// Fetch a blob, failing with `BlobNotFound` when absent.
    pub fn require_blob(&self, content_hash: &str) -> Result<BlobRecord> {
        self.get_blob(content_hash)?
            .ok_or_else(|| TractError::BlobNotFound(content_hash.to_string()))
    }

    pub fn delete_blob(&self, content_hash: &str) -> Result<bool> {
        let changed = self.conn().execute(
            "DELETE FROM blobs WHERE content_hash = ?1",
            [content_hash],
        )?;
        Ok(changed > 0)
    }

    /// Content hashes of blobs no commit references any more.
    pub fn unreferenced_blob_hashes(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT b.content_hash FROM blobs b
             WHERE NOT EXISTS (SELECT 1 FROM commits c WHERE c.content_hash = b.content_hash)",
        )?;
        let hashes = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let payload = r#"{"content_type":"output","text":"done"}"#;
        store
            .insert_blob(&"a".repeat(64), payload, 3, Utc::now())
            .unwrap();
        let blob = store.require_blob(&"a".repeat(64)).unwrap();
        assert_eq!(blob.payload_json, payload);
        assert_eq!(blob.byte_size, payload.len());
        assert_eq!(blob.token_count, 3);
        assert_eq!(blob.payload().unwrap()["text"], "done");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_blob(&"a".repeat(64), "{\"v\":1}", 1, Utc::now())
            .unwrap();
        // A second insert under the same hash leaves the original row.
        store
            .insert_blob(&"a".repeat(64), "{\"v\":2}", 9, Utc::now())
            .unwrap();
        assert_eq!(store.require_blob(&"a".repeat(64)).unwrap().token_count, 1);
    }

    #[test]
    fn test_missing_blob_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.require_blob(&"f".repeat(64)),
            Err(TractError::BlobNotFound(_))
        ));
    }
}
