//! Durable record storage behind a narrow trait so the engine never cares
//! whether records land in SQLite, plain files, or nowhere at all.

pub mod files;
pub mod memory;
pub mod sqlite;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::config::{PersistenceConfig, StorageKind};

pub use files::FileStateStore;
pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Evolution,
    Relationship,
    Activity,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [
        RecordKind::Evolution,
        RecordKind::Relationship,
        RecordKind::Activity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Evolution => "evolution",
            RecordKind::Relationship => "relationship",
            RecordKind::Activity => "activity",
        }
    }

    pub fn from_db(raw: &str) -> Option<Self> {
        match raw {
            "evolution" => Some(RecordKind::Evolution),
            "relationship" => Some(RecordKind::Relationship),
            "activity" => Some(RecordKind::Activity),
            _ => None,
        }
    }
}

/// Key/value store of JSON payloads grouped by record kind. Every `save`
/// replaces the whole record atomically: readers see the old payload or the
/// new one, never a mix.
pub trait StateStore: Send + Sync {
    fn backend_name(&self) -> &'static str;
    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<String>>;
    fn save(&self, kind: RecordKind, key: &str, payload: &str) -> Result<()>;
    fn delete(&self, kind: RecordKind, key: &str) -> Result<()>;
    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>>;
}

pub fn open_store(config: &PersistenceConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.storage {
        StorageKind::Sqlite => Arc::new(
            SqliteStateStore::new(&config.data_path)
                .with_context(|| format!("Failed to open state database {}", config.data_path))?,
        ),
        StorageKind::Files => Arc::new(
            FileStateStore::new(Path::new(&config.data_path))
                .with_context(|| format!("Failed to open state directory {}", config.data_path))?,
        ),
        StorageKind::Memory => Arc::new(MemoryStateStore::new()),
    };
    tracing::info!(
        "State store: {} ({})",
        store.backend_name(),
        if config.storage == StorageKind::Memory {
            "ephemeral"
        } else {
            config.data_path.as_str()
        }
    );
    Ok(store)
}

/// Parses a stored payload, treating unreadable records as absent so the
/// caller starts that entity fresh.
pub fn decode_record<T: serde::de::DeserializeOwned>(
    kind: RecordKind,
    key: &str,
    payload: Option<String>,
) -> Option<T> {
    let payload = payload?;
    match serde_json::from_str(&payload) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                "Discarding corrupt {} record '{}': {}",
                kind.as_str(),
                key,
                e
            );
            None
        }
    }
}

/// Loads and decodes in one go; store failures are logged and read as
/// "no record" because the decision path must not fail on storage.
pub fn load_record<T: serde::de::DeserializeOwned>(
    store: &dyn StateStore,
    kind: RecordKind,
    key: &str,
) -> Option<T> {
    match store.load(kind, key) {
        Ok(payload) => decode_record(kind, key, payload),
        Err(e) => {
            tracing::warn!(
                "Failed to load {} record '{}' from {}: {}",
                kind.as_str(),
                key,
                store.backend_name(),
                e
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        count: u32,
    }

    #[test]
    fn corrupt_payload_reads_as_missing() {
        let store = MemoryStateStore::new();
        store
            .save(RecordKind::Evolution, "nova", "{\"count\": ")
            .expect("save");
        let loaded: Option<Sample> = load_record(&store, RecordKind::Evolution, "nova");
        assert!(loaded.is_none());

        store
            .save(RecordKind::Evolution, "nova", "{\"count\": 3}")
            .expect("save");
        let loaded: Option<Sample> = load_record(&store, RecordKind::Evolution, "nova");
        assert_eq!(loaded, Some(Sample { count: 3 }));
    }

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_db(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::from_db("mood"), None);
    }

    #[test]
    fn memory_backend_opens_without_a_path() {
        let config = PersistenceConfig {
            storage: StorageKind::Memory,
            ..PersistenceConfig::default()
        };
        let store = open_store(&config).expect("memory store");
        assert_eq!(store.backend_name(), "memory");
    }
}
