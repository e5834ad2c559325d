//! # Progress Store
//!
//! Durable key/document storage for job metadata, job-item progress and
//! consistency-check state. Keys are `/`-separated paths built from job
//! ids; values are JSON documents.
//!
//! ## Backends
//!
//! - **InMemory**: `BTreeMap`, for tests and single-process demos
//! - **FileSystem**: one `.json` file per key under a root directory,
//!   written through a temp file and renamed into place
//!
//! Typed access lives in [`JobRepository`](crate::repository::JobRepository).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::error::StoreError;

/// Trait for progress store implementations.
pub trait ProgressStore: Send + Sync {
    /// Get a document by key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Put a document, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be written.
    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError>;

    /// Delete a document. Missing keys are not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be written.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend cannot be listed.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// In-memory progress store.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    data: RwLock<BTreeMap<String, Value>>,
}

impl InMemoryProgressStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for InMemoryProgressStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.data.write().insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .data
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// File-backed progress store: key `a/b/c` lives at `<root>/a/b/c.json`.
#[derive(Debug)]
pub struct FileSystemProgressStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSystemProgressStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut segments = key.split('/').filter(|s| !s.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}.json"));
            }
        }
        path
    }

    fn collect_keys(dir: &Path, prefix: &str, keys: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                Self::collect_keys(&path, &format!("{prefix}{name}/"), keys)?;
            } else if let Some(stem) = name.strip_suffix(".json") {
                keys.push(format!("{prefix}{stem}"));
            }
        }
        Ok(())
    }
}

impl ProgressStore for FileSystemProgressStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match fs::read(self.path_of(key)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.path_of(key);
        let bytes = serde_json::to_vec_pretty(value)?;
        let _guard = self.write_lock.lock();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(self.path_of(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        Self::collect_keys(&self.root, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &dyn ProgressStore) {
        assert_eq!(store.get("jobs/j1/meta").unwrap(), None);
        store.put("jobs/j1/meta", &json!({"active": true})).unwrap();
        store.put("jobs/j1/items/0", &json!({"n": 0})).unwrap();
        store.put("jobs/j1/items/1", &json!({"n": 1})).unwrap();
        store.put("jobs/j2/meta", &json!({})).unwrap();

        assert_eq!(store.get("jobs/j1/meta").unwrap(), Some(json!({"active": true})));
        assert_eq!(
            store.keys_with_prefix("jobs/j1/items/").unwrap(),
            vec!["jobs/j1/items/0".to_string(), "jobs/j1/items/1".to_string()]
        );

        store.put("jobs/j1/meta", &json!({"active": false})).unwrap();
        assert_eq!(store.get("jobs/j1/meta").unwrap(), Some(json!({"active": false})));

        store.delete("jobs/j1/items/0").unwrap();
        store.delete("jobs/j1/items/0").unwrap();
        assert_eq!(store.keys_with_prefix("jobs/j1/items/").unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_store() {
        exercise(&InMemoryProgressStore::new());
    }

    #[test]
    fn test_file_system_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemProgressStore::open(dir.path()).unwrap();
        exercise(&store);
        assert!(dir.path().join("jobs").join("j1").join("meta.json").exists());
    }

    #[test]
    fn test_file_system_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileSystemProgressStore::open(dir.path()).unwrap();
            store.put("checks/j11/progress", &json!({"checked": 5})).unwrap();
        }
        let store = FileSystemProgressStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("checks/j11/progress").unwrap(),
            Some(json!({"checked": 5}))
        );
        assert_eq!(store.keys_with_prefix("").unwrap(), vec!["checks/j11/progress".to_string()]);
    }

    #[test]
    fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSystemProgressStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("bad.json"), b"{not json").unwrap();
        assert!(matches!(store.get("bad"), Err(StoreError::Serialization(_))));
    }
}
