use keyring::Entry;
use tracing::debug;

use super::storage::{StorageError, TokenStorage};

const SERVICE_NAME: &str = "fixdesk";

/// Token storage backed by the OS keychain.
/// Each storage key becomes a keychain entry under the `fixdesk` service.
#[derive(Debug, Default)]
pub struct KeyringTokenStorage;

impl KeyringTokenStorage {
    pub fn new() -> Self {
        Self
    }

    fn entry(key: &str) -> Result<Entry, StorageError> {
        Ok(Entry::new(SERVICE_NAME, key)?)
    }
}

impl TokenStorage for KeyringTokenStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match Self::entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        Self::entry(key)?.set_password(value)?;
        debug!(key, "Stored item in keychain");
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        match Self::entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
