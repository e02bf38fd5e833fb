// Storage abstraction for local persistence
//
// Everything the engine keeps on disk (identities, outbox, delivery metadata,
// folders) goes through `StorageBackend`, with bincode-encoded values.

use super::{Result, StoreError};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Ordered key/value storage
pub trait StorageBackend: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn remove(&self, key: &[u8]) -> Result<()>;
    /// Entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
    fn count_prefix(&self, prefix: &[u8]) -> Result<usize>;
    fn flush(&self) -> Result<()>;
}

/// In-memory storage useful for testing and ephemeral engines
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.data.write().remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .count())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// sled-backed persistent storage
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    /// A separate tree in the same database
    pub fn open_tree(&self, name: &str) -> Result<SledTree> {
        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(SledTree { tree })
    }
}

/// A named sled tree
pub struct SledTree {
    tree: sled::Tree,
}

macro_rules! sled_backend {
    ($ty:ty, $field:ident) => {
        impl StorageBackend for $ty {
            fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
                self.$field
                    .insert(key, value)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }

            fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
                let value = self
                    .$field
                    .get(key)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(value.map(|ivec| ivec.to_vec()))
            }

            fn remove(&self, key: &[u8]) -> Result<()> {
                self.$field
                    .remove(key)
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }

            fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
                let mut results = Vec::new();
                for item in self.$field.scan_prefix(prefix) {
                    let (k, v) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
                    results.push((k.to_vec(), v.to_vec()));
                }
                Ok(results)
            }

            fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
                Ok(self.$field.scan_prefix(prefix).count())
            }

            fn flush(&self) -> Result<()> {
                self.$field
                    .flush()
                    .map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(())
            }
        }
    };
}

sled_backend!(SledStorage, db);
sled_backend!(SledTree, tree);

// ============================================================================
// Typed helpers
// ============================================================================

/// Store a bincode-encoded value
pub fn put_object<T: Serialize>(backend: &dyn StorageBackend, key: &[u8], value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    backend.put(key, &bytes)
}

/// Load a bincode-encoded value
pub fn get_object<T: DeserializeOwned>(backend: &dyn StorageBackend, key: &[u8]) -> Result<Option<T>> {
    match backend.get(key)? {
        Some(bytes) => bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Load every value under `prefix`. Undecodable entries are skipped with a warning.
pub fn scan_objects<T: DeserializeOwned>(backend: &dyn StorageBackend, prefix: &[u8]) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for (key, bytes) in backend.scan_prefix(prefix)? {
        match bincode::deserialize(&bytes) {
            Ok(value) => values.push(value),
            Err(e) => tracing::warn!(
                key = %String::from_utf8_lossy(&key),
                "Skipping undecodable record: {}",
                e
            ),
        }
    }
    Ok(values)
}

/// Join a prefix and an id into a storage key
pub fn storage_key(prefix: &[u8], id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + id.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    fn exercise(backend: &dyn StorageBackend) {
        backend.put(b"a_1", b"one").unwrap();
        backend.put(b"a_2", b"two").unwrap();
        backend.put(b"b_1", b"three").unwrap();

        assert_eq!(backend.get(b"a_1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.count_prefix(b"a_").unwrap(), 2);

        let scanned = backend.scan_prefix(b"a_").unwrap();
        assert_eq!(scanned[0].0, b"a_1".to_vec());
        assert_eq!(scanned[1].0, b"a_2".to_vec());

        backend.remove(b"a_1").unwrap();
        assert_eq!(backend.get(b"a_1").unwrap(), None);
        backend.flush().unwrap();
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_sled_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::new(dir.path().join("db")).unwrap();
        exercise(&storage);
        exercise(&storage.open_tree("other").unwrap());
    }

    #[test]
    fn test_typed_helpers() {
        let storage = MemoryStorage::new();
        let record = Record {
            name: "x".to_string(),
            count: 3,
        };
        put_object(&storage, b"rec_1", &record).unwrap();
        storage.put(b"rec_2", &[0xff]).unwrap();

        assert_eq!(get_object::<Record>(&storage, b"rec_1").unwrap(), Some(record));
        assert!(get_object::<Record>(&storage, b"missing").unwrap().is_none());

        // the corrupt record is skipped
        let all: Vec<Record> = scan_objects(&storage, b"rec_").unwrap();
        assert_eq!(all.len(), 1);
    }
}
