//! Black-box persistence for derived purchase state.
//!
//! The engine treats storage as an opaque get/set API; entitlement snapshots
//! survive process restarts through whichever adapter the caller supplies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Storage keys
pub mod keys {
    /// JSON snapshot of registry entitlement state and install metadata.
    pub const SNAPSHOT: &str = concat!("storefront:", "snapshot");
}

/// Storage adapter trait for custom persistence backends.
pub trait StorageAdapter: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &str) -> Option<String>;

    /// Set a value by key
    fn set(&self, key: &str, value: &str);

    /// Remove a value by key
    fn remove(&self, key: &str);
}

/// In-memory storage, the default. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut values) = self.values.write() {
            values.remove(key);
        }
    }
}

/// File-backed storage.
///
/// Entitlement snapshots must survive a crash mid-write (the whole point of
/// persisting them is an unclean shutdown), so every mutation rewrites the
/// document through a temp file and an atomic rename. Reads go to disk:
/// the snapshot is small, written rarely, and another process may share the
/// same directory.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes read-modify-write cycles against this path.
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Open storage rooted at `storage_dir/storefront.json`.
    ///
    /// The directory must already exist; returns `None` otherwise so the
    /// caller can fall back to [`MemoryStorage`].
    pub fn new(storage_dir: &Path) -> Option<Self> {
        if !storage_dir.is_dir() {
            return None;
        }
        let path = storage_dir.join("storefront.json");
        Some(Self {
            tmp_path: path.with_extension("json.tmp"),
            path,
            write_lock: Mutex::new(()),
        })
    }

    fn read_document(&self) -> HashMap<String, String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    fn write_document(&self, document: &HashMap<String, String>) {
        let Ok(contents) = serde_json::to_string_pretty(document) else {
            return;
        };
        if std::fs::write(&self.tmp_path, contents).is_err() {
            tracing::error!(path = %self.tmp_path.display(), "failed to stage snapshot write");
            return;
        }
        if let Err(e) = std::fs::rename(&self.tmp_path, &self.path) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to commit snapshot");
        }
    }
}

impl StorageAdapter for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.read_document().remove(key)
    }

    fn set(&self, key: &str, value: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut document = self.read_document();
        document.insert(key.to_string(), value.to_string());
        self.write_document(&document);
    }

    fn remove(&self, key: &str) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut document = self.read_document();
        if document.remove(key).is_some() {
            self.write_document(&document);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(keys::SNAPSHOT), None);
        storage.set(keys::SNAPSHOT, "{}");
        assert_eq!(storage.get(keys::SNAPSHOT).as_deref(), Some("{}"));
        storage.remove(keys::SNAPSHOT);
        assert_eq!(storage.get(keys::SNAPSHOT), None);
    }

    #[test]
    fn test_file_storage_round_trip_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            storage.set(keys::SNAPSHOT, r#"{"items":[]}"#);
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.get(keys::SNAPSHOT).as_deref(), Some(r#"{"items":[]}"#));
        // The staged write was committed, not left behind.
        assert!(!dir.path().join("storefront.json.tmp").exists());

        storage.remove(keys::SNAPSHOT);
        assert_eq!(storage.get(keys::SNAPSHOT), None);
    }

    #[test]
    fn test_file_storage_tolerates_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("storefront.json"), "not json").unwrap();

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.get(keys::SNAPSHOT), None);
        storage.set(keys::SNAPSHOT, "{}");
        assert_eq!(storage.get(keys::SNAPSHOT).as_deref(), Some("{}"));
    }

    #[test]
    fn test_file_storage_requires_existing_directory() {
        assert!(FileStorage::new(Path::new("/definitely/not/a/dir")).is_none());
    }
}
