//! Key-value storage for the registry's JSON blobs.
//!
//! The registry never touches the filesystem itself. It reads and writes
//! opaque strings by name through a [`Store`], so the same ledgers can live
//! in memory (tests, dry runs) or in a single JSON file on disk.

use crate::error::{BridgeError, Result};
use log::{error, info, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Get/set string blobs keyed by name.
pub trait Store: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
    fn set(&self, name: &str, value: String) -> Result<()>;
}

/// Volatile store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, name: &str) -> Option<String> {
        self.entries.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: String) -> Result<()> {
        self.entries.write().insert(name.to_string(), value);
        Ok(())
    }
}

/// Store persisted as one JSON object file, rewritten on every `set`.
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    fn load(path: &Path) -> BTreeMap<String, String> {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<BTreeMap<String, String>>(&bytes) {
                Ok(entries) => {
                    info!("Loaded {} state entries from {:?}", entries.len(), path);
                    entries
                }
                Err(e) => {
                    warn!("Failed to parse state file {:?}: {}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?} (first run)", path);
                BTreeMap::new()
            }
            Err(e) => {
                error!("Failed to read state file {:?}: {}", path, e);
                BTreeMap::new()
            }
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(entries)?;
        // Write-then-rename so a crash never leaves a truncated file behind
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for FileStore {
    fn get(&self, name: &str) -> Option<String> {
        self.entries.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: String) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(name.to_string(), value);
        self.save(&entries)
            .map_err(|e| BridgeError::Store(format!("{:?}: {}", self.path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_get_set() {
        let store = MemoryStore::new();
        assert_eq!(store.get("knownSensors"), None);

        store.set("knownSensors", "{}".to_string()).unwrap();
        assert_eq!(store.get("knownSensors").as_deref(), Some("{}"));

        store.set("knownSensors", "{\"1\":{}}".to_string()).unwrap();
        assert_eq!(store.get("knownSensors").as_deref(), Some("{\"1\":{}}"));
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStore::open(&path);
        assert_eq!(store.get("devices"), None);
        store.set("devices", "[1,2]".to_string()).unwrap();
        drop(store);

        let reopened = FileStore::open(&path);
        assert_eq!(reopened.get("devices").as_deref(), Some("[1,2]"));
    }

    #[test]
    fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"not json").unwrap();

        let store = FileStore::open(&path);
        assert_eq!(store.get("anything"), None);
    }
}
