//! Durable key-value storage for the session token.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::TokenBackend;

use super::credentials::KeyringTokenStorage;

/// The single storage key in use: the session token
pub const TOKEN_KEY: &str = "token";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Scratch file renamed over the session file on save
const SESSION_TMP_FILE: &str = "session.json.tmp";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Key-value persistence that survives process restarts.
pub trait TokenStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Open the storage backend selected in the config.
pub fn open_storage(backend: TokenBackend, dir: &Path) -> Arc<dyn TokenStorage> {
    match backend {
        TokenBackend::File => Arc::new(FileTokenStorage::new(dir.to_path_buf())),
        TokenBackend::Keyring => Arc::new(KeyringTokenStorage::new()),
        TokenBackend::Memory => Arc::new(MemoryTokenStorage::new()),
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create storage that already holds a token
    pub fn with_token(token: &str) -> Self {
        let storage = Self::new();
        storage
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TOKEN_KEY.to_string(), token.to_string());
        storage
    }
}

impl TokenStorage for MemoryTokenStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredItem {
    value: String,
    saved_at: DateTime<Utc>,
}

/// JSON file in the cache directory, one entry per key.
pub struct FileTokenStorage {
    dir: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileTokenStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    /// When the value under `key` was written
    pub fn saved_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.get(key).map(|item| item.saved_at))
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    fn load(&self) -> Result<BTreeMap<String, StoredItem>, StorageError> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Load before a write. A file that no longer parses is discarded so
    /// the next write replaces it.
    fn load_for_write(&self) -> Result<BTreeMap<String, StoredItem>, StorageError> {
        match self.load() {
            Err(StorageError::Serde(e)) => {
                let path = self.session_path();
                warn!(error = %e, path = %path.display(), "Discarding unreadable session file");
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn save(&self, items: &BTreeMap<String, StoredItem>) -> Result<(), StorageError> {
        let path = self.session_path();
        if items.is_empty() {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(items)?;
        let tmp = self.dir.join(SESSION_TMP_FILE);
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl TokenStorage for FileTokenStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(key).map(|item| item.value))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = self.load_for_write()?;
        items.insert(
            key.to_string(),
            StoredItem {
                value: value.to_string(),
                saved_at: Utc::now(),
            },
        );
        self.save(&items)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut items = match self.load() {
            Err(StorageError::Serde(e)) => {
                warn!(error = %e, "Removing unreadable session file");
                std::fs::remove_file(self.session_path())?;
                return Ok(());
            }
            other => other?,
        };
        if items.remove(key).is_some() {
            self.save(&items)?;
        }
        Ok(())
    }
}
