//! Backing stores — byte-addressable storage behind the persistence manager
//!
//! The store contract is put/get/delete/list by key plus a free-capacity
//! report. `MemoryStore` is capacity-limited and used for tests and the demo;
//! `FileStore` writes one payload file per key under a directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::MeshError;

/// Byte-addressable store contract (external collaborator)
pub trait BackingStore: Send + Sync {
    /// Write bytes under a key, returning the storage location descriptor
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, MeshError>;

    /// Read bytes back; `NotFound` when the key is absent
    fn get(&self, key: &str) -> Result<Vec<u8>, MeshError>;

    /// Remove a key; `NotFound` when absent
    fn delete(&self, key: &str) -> Result<(), MeshError>;

    /// All keys currently held
    fn list(&self) -> Result<Vec<String>, MeshError>;

    /// Remaining capacity in bytes; `None` means unbounded
    fn free_capacity(&self) -> Option<u64>;

    /// Location descriptor a key would be stored at
    fn location(&self, key: &str) -> String;
}

/// In-memory store with an optional capacity cap
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    capacity: Option<u64>,
}

impl MemoryStore {
    pub fn new(capacity: Option<u64>) -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn used(&self) -> u64 {
        self.blobs
            .lock()
            .unwrap()
            .values()
            .map(|v| v.len() as u64)
            .sum()
    }
}

impl BackingStore for MemoryStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, MeshError> {
        let mut blobs = self.blobs.lock().unwrap();
        if let Some(capacity) = self.capacity {
            let used: u64 = blobs
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len() as u64)
                .sum();
            if used + bytes.len() as u64 > capacity {
                return Err(MeshError::StorageExhausted {
                    needed: bytes.len() as u64,
                    available: capacity.saturating_sub(used),
                });
            }
        }
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(self.location(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MeshError> {
        self.blobs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| MeshError::NotFound(key.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), MeshError> {
        self.blobs
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| MeshError::NotFound(key.to_string()))
    }

    fn list(&self) -> Result<Vec<String>, MeshError> {
        Ok(self.blobs.lock().unwrap().keys().cloned().collect())
    }

    fn free_capacity(&self) -> Option<u64> {
        self.capacity.map(|c| c.saturating_sub(self.used()))
    }

    fn location(&self, key: &str) -> String {
        format!("mem://{}", key)
    }
}

/// Directory-backed store, one payload file per key
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MeshError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys may contain replica suffixes with '/'; flatten for the fs.
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.bin", safe))
    }
}

impl BackingStore for FileStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, MeshError> {
        let path = self.path_for(key);
        std::fs::write(&path, bytes)?;
        Ok(self.location(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MeshError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(MeshError::NotFound(key.to_string()));
        }
        Ok(std::fs::read(path)?)
    }

    fn delete(&self, key: &str) -> Result<(), MeshError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Err(MeshError::NotFound(key.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, MeshError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".bin") {
                keys.push(stem.to_string());
            }
        }
        Ok(keys)
    }

    fn free_capacity(&self) -> Option<u64> {
        None
    }

    fn location(&self, key: &str) -> String {
        self.path_for(key).to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new(None);
        let loc = store.put("k1", b"hello").unwrap();
        assert!(loc.starts_with("mem://"));
        assert_eq!(store.get("k1").unwrap(), b"hello");
        store.delete("k1").unwrap();
        assert!(matches!(store.get("k1"), Err(MeshError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_capacity() {
        let store = MemoryStore::new(Some(10));
        store.put("a", &[0u8; 8]).unwrap();
        let err = store.put("b", &[0u8; 8]).unwrap_err();
        assert!(matches!(err, MeshError::StorageExhausted { .. }));
        assert_eq!(store.free_capacity(), Some(2));
        // Overwriting the same key does not double-count.
        store.put("a", &[0u8; 10]).unwrap();
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put("state-1", b"payload").unwrap();
        assert_eq!(store.get("state-1").unwrap(), b"payload");
        assert_eq!(store.list().unwrap(), vec!["state-1".to_string()]);
        store.delete("state-1").unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
