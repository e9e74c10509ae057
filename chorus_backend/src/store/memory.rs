use anyhow::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{RecordKind, StateStore};

/// Process-local store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<(RecordKind, String), String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl StateStore for MemoryStateStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<String>> {
        Ok(self.records.read().get(&(kind, key.to_string())).cloned())
    }

    fn save(&self, kind: RecordKind, key: &str, payload: &str) -> Result<()> {
        self.records
            .write()
            .insert((kind, key.to_string()), payload.to_string());
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.records.write().remove(&(kind, key.to_string()));
        Ok(())
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
