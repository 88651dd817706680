use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

/// Stable identifier of a request. Two requests with the same signature
/// must be the same semantic request, or they will read each other's
/// cached values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Join parts into one signature, e.g. `["repair", "list", "page=2"]`
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestSignature {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RequestSignature {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<Value>,
    pub stored_at: Instant,
}

impl CacheEntry {
    pub fn new(value: impl Into<Arc<Value>>) -> Self {
        Self {
            value: value.into(),
            stored_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// Fresh while strictly younger than `ttl`
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(self.value.as_ref())
    }
}

#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<RequestSignature, CacheEntry>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestSignature, CacheEntry>> {
        // No invariant spans a lock, so a poisoned map is still usable
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &RequestSignature) -> Option<CacheEntry> {
        self.entries().get(key).cloned()
    }

    /// Entry for `key` only if it is younger than `ttl`
    pub fn get_fresh(&self, key: &RequestSignature, ttl: Duration) -> Option<CacheEntry> {
        self.get(key).filter(|entry| entry.is_fresh(ttl))
    }

    /// Store `value` stamped with the current instant, replacing any entry
    pub fn set(&self, key: RequestSignature, value: impl Into<Arc<Value>>) {
        debug!(signature = %key, "Caching response");
        self.entries().insert(key, CacheEntry::new(value));
    }

    /// Returns whether an entry was removed
    pub fn delete(&self, key: &RequestSignature) -> bool {
        self.entries().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
