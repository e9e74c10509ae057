use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use super::{RecordKind, StateStore};

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("State database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS engine_records (
                kind TEXT NOT NULL,
                key TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, key)
            )"#,
            [],
        )
        .context("Failed to create engine_records table")?;
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT payload FROM engine_records WHERE kind = ?1 AND key = ?2",
            params![kind.as_str(), key],
            |row| row.get(0),
        );

        match result {
            Ok(payload) => Ok(Some(payload)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, kind: RecordKind, key: &str, payload: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO engine_records (kind, key, payload, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![kind.as_str(), key, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "DELETE FROM engine_records WHERE kind = ?1 AND key = ?2",
            params![kind.as_str(), key],
        )?;
        Ok(())
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM engine_records WHERE kind = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map([kind.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.db");
        {
            let store = SqliteStateStore::new(&path).expect("open");
            store
                .save(RecordKind::Relationship, "ada|nova", "{\"affinity\":0.4}")
                .expect("save");
            store
                .save(RecordKind::Relationship, "ada|nova", "{\"affinity\":0.6}")
                .expect("replace");
        }
        let store = SqliteStateStore::new(&path).expect("reopen");
        assert_eq!(
            store.load(RecordKind::Relationship, "ada|nova").expect("load"),
            Some("{\"affinity\":0.6}".to_string())
        );
        assert_eq!(
            store.list_keys(RecordKind::Relationship).expect("keys"),
            vec!["ada|nova".to_string()]
        );
        assert!(store.list_keys(RecordKind::Evolution).expect("keys").is_empty());
    }

    #[test]
    fn delete_and_missing_keys() {
        let store = SqliteStateStore::in_memory().expect("open");
        assert_eq!(store.load(RecordKind::Activity, "general").expect("load"), None);
        store
            .save(RecordKind::Activity, "general", "{}")
            .expect("save");
        store.delete(RecordKind::Activity, "general").expect("delete");
        assert_eq!(store.load(RecordKind::Activity, "general").expect("load"), None);
    }
}
