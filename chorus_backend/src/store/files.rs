use anyhow::{Context, Result};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{RecordKind, StateStore};

/// One JSON file per record under `<root>/<kind>/`. Writes go to a temp
/// file in the same directory and are renamed over the old record.
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: &Path) -> Result<Self> {
        for kind in RecordKind::ALL {
            let dir = root.join(kind.as_str());
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create state directory {:?}", dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn record_path(&self, kind: RecordKind, key: &str) -> PathBuf {
        self.root
            .join(kind.as_str())
            .join(format!("{}.json", escape_key(key)))
    }
}

/// Keys may contain `|`, `/` or platform ids with odd characters; anything
/// outside `[A-Za-z0-9_.-]` becomes `%XX`.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        let ch = byte as char;
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || (ch == '.' && !out.is_empty()) {
            out.push(ch);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = name.get(index + 1..index + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            out.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(out).ok()
}

impl StateStore for FileStateStore {
    fn backend_name(&self) -> &'static str {
        "files"
    }

    fn load(&self, kind: RecordKind, key: &str) -> Result<Option<String>> {
        let path = self.record_path(kind, key);
        match fs::read_to_string(&path) {
            Ok(payload) => Ok(Some(payload)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
        }
    }

    fn save(&self, kind: RecordKind, key: &str, payload: &str) -> Result<()> {
        let path = self.record_path(kind, key);
        let dir = self.root.join(kind.as_str());
        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        tmp.write_all(payload.as_bytes())
            .context("Failed to write record")?;
        tmp.as_file().sync_all().context("Failed to sync record")?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {:?}", path))?;
        Ok(())
    }

    fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        let path = self.record_path(kind, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
        }
    }

    fn list_keys(&self, kind: RecordKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.as_str());
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {:?}", dir))? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match unescape_key(stem) {
                Some(key) => keys.push(key),
                None => tracing::warn!("Ignoring unrecognised state file {:?}", entry.path()),
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn awkward_keys_round_trip() {
        for key in ["ada|nova", "guild/123", "..", "plain-key_1", "émoji 🎉"] {
            assert_eq!(unescape_key(&escape_key(key)).as_deref(), Some(key));
            assert!(!escape_key(key).contains('/'));
        }
        assert_ne!(escape_key(".."), "..");
    }

    #[test]
    fn save_replaces_whole_record() {
        let dir = tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path()).expect("open");
        store
            .save(RecordKind::Evolution, "nova", "{\"total_messages\":1}")
            .expect("save");
        store
            .save(RecordKind::Evolution, "nova", "{\"total_messages\":2}")
            .expect("save");
        assert_eq!(
            store.load(RecordKind::Evolution, "nova").expect("load"),
            Some("{\"total_messages\":2}".to_string())
        );

        let leftovers = fs::read_dir(dir.path().join("evolution"))
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn lists_and_deletes() {
        let dir = tempdir().expect("tempdir");
        let store = FileStateStore::new(dir.path()).expect("open");
        store
            .save(RecordKind::Relationship, "ada|nova", "{}")
            .expect("save");
        store
            .save(RecordKind::Relationship, "ada|rook", "{}")
            .expect("save");
        assert_eq!(
            store.list_keys(RecordKind::Relationship).expect("list"),
            vec!["ada|nova".to_string(), "ada|rook".to_string()]
        );
        store.delete(RecordKind::Relationship, "ada|nova").expect("delete");
        store.delete(RecordKind::Relationship, "missing").expect("delete missing");
        assert_eq!(store.list_keys(RecordKind::Relationship).expect("list").len(), 1);
        assert_eq!(store.load(RecordKind::Activity, "nobody").expect("load"), None);
    }
}
