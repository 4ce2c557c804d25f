//! Synchronous device-local key/value storage, the Rust face of browser `localStorage`.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

/// Failures surfaced by device storage backends.
#[derive(Debug, Error)]
pub enum LocalStoreError {
    /// The backing file could not be read.
    #[error("failed to read device storage `{path}`")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The backing file could not be written.
    #[error("failed to write device storage `{path}`")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The backing file does not hold a JSON object of strings.
    #[error("device storage `{path}` is corrupted")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// A previous writer panicked while holding the storage lock.
    #[error("device storage lock poisoned")]
    Poisoned,
}

/// Synchronous string storage keyed by plain string keys.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`.
    fn get_item(&self, key: &str) -> Result<Option<String>, LocalStoreError>;
    /// Store `value` under `key`, replacing any previous value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), LocalStoreError>;
    /// Remove `key`; removing a missing key is not an error.
    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError>;
}

/// In-memory storage; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    items: DashMap<String, String>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        Ok(self.items.get(key).map(|entry| entry.value().clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError> {
        self.items.remove(key);
        Ok(())
    }
}

/// Storage persisted as a single JSON object on disk, rewritten on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LocalStoreError> {
        let path = path.as_ref().to_path_buf();
        let items = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                LocalStoreError::Corrupted {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(LocalStoreError::Read { path, source }),
        };

        debug!(path = %path.display(), keys = items.len(), "opened device storage");
        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    fn persist(&self, items: &BTreeMap<String, String>) -> Result<(), LocalStoreError> {
        let contents = serde_json::to_string(items).map_err(|source| LocalStoreError::Corrupted {
            path: self.path.clone(),
            source,
        })?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)
            .and_then(|()| fs::rename(&tmp, &self.path))
            .map_err(|source| LocalStoreError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, LocalStoreError> {
        let items = self.items.lock().map_err(|_| LocalStoreError::Poisoned)?;
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), LocalStoreError> {
        let mut items = self.items.lock().map_err(|_| LocalStoreError::Poisoned)?;
        let mut staged = items.clone();
        staged.insert(key.to_string(), value.to_string());
        self.persist(&staged)?;
        *items = staged;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), LocalStoreError> {
        let mut items = self.items.lock().map_err(|_| LocalStoreError::Poisoned)?;
        if !items.contains_key(key) {
            return Ok(());
        }
        let mut staged = items.clone();
        staged.remove(key);
        self.persist(&staged)?;
        *items = staged;
        Ok(())
    }
}
