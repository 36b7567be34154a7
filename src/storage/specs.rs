//! Saved-spec repository: dynamically-registered operation specs.

use rusqlite::{OptionalExtension, params};

use super::{Store, encode_ts};
use crate::errors::Result;

impl Store {
    pub fn save_spec(&self, name: &str, spec_json: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO saved_specs (name, spec_json, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET spec_json = excluded.spec_json",
            params![name, spec_json, encode_ts(chrono::Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_spec(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT spec_json FROM saved_specs WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn list_specs(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT name, spec_json FROM saved_specs ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_spec(&self, name: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM saved_specs WHERE name = ?1", [name])?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.save_spec("prune", r#"{"name":"prune"}"#).unwrap();
        store.save_spec("prune", r#"{"name":"prune","v":2}"#).unwrap();
        assert_eq!(
            store.get_spec("prune").unwrap().as_deref(),
            Some(r#"{"name":"prune","v":2}"#)
        );
        assert_eq!(store.list_specs().unwrap().len(), 1);
        assert!(store.delete_spec("prune").unwrap());
        assert!(store.get_spec("prune").unwrap().is_none());
    }
}
