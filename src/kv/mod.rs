//! Narrow key-value abstraction shared by the idempotency store, group
//! reservation lock, and (optionally) the task queue's result backend.
//!
//! Implementations must treat [`KVStore::set_if_absent`] as atomic under
//! concurrent callers; this is the primitive the group reservation lock and
//! the idempotency store build on.

#[cfg(feature = "redis-backend")]
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A networked or in-memory string-keyed byte store with TTL support.
///
/// All operations are expected to be fallible over the network; transient
/// failures are surfaced as [`crate::error::CoreError::Transient`], distinct
/// from a well-formed "not present" result.
#[async_trait]
pub trait KVStore: Send + Sync {
    /// Fetch a value. Returns `None` if the key is absent or expired.
    ///
    /// # Errors
    /// Returns an error on transient backend failure.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Set a value with a TTL, overwriting any existing value.
    ///
    /// # Errors
    /// Returns an error on transient backend failure.
    async fn set_expiring(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Atomically set a value only if the key is currently absent.
    ///
    /// Returns `true` if this call acquired the key, `false` if another
    /// holder already owns it.
    ///
    /// # Errors
    /// Returns an error on transient backend failure.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns `true` if the key existed.
    ///
    /// # Errors
    /// Returns an error on transient backend failure.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List all keys carrying the given prefix.
    ///
    /// # Errors
    /// Returns an error on transient backend failure.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory [`KVStore`] for tests and single-process deployments.
///
/// Expiry is checked lazily on read; there is no background sweep, matching
/// the teacher crate's in-memory test doubles.
#[derive(Clone)]
pub struct InMemoryKvStore {
    entries: std::sync::Arc<dashmap::DashMap<String, Entry>>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: std::time::Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

impl InMemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: std::sync::Arc::new(dashmap::DashMap::new()),
        }
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KVStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_expiring(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let acquired = match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) if !existing.get().is_expired() => {
                false
            }
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                existing.insert(Entry {
                    value,
                    expires_at: std::time::Instant::now() + ttl,
                });
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value,
                    expires_at: std::time::Instant::now() + ttl,
                });
                true
            }
        };
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired() && entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let store = InMemoryKvStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = InMemoryKvStore::new();
        store
            .set_expiring("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = InMemoryKvStore::new();
        assert!(store
            .set_if_absent("lock:G1", b"holder-a".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock:G1", b"holder-b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("lock:G1").await.unwrap(), Some(b"holder-a".to_vec()));
    }

    #[tokio::test]
    async fn delete_reports_whether_key_existed() {
        let store = InMemoryKvStore::new();
        assert!(!store.delete("absent").await.unwrap());
        store
            .set_expiring("present", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.delete("present").await.unwrap());
        assert_eq!(store.get("present").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let store = InMemoryKvStore::new();
        store
            .set_expiring("k", b"v".to_vec(), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // set_if_absent must treat the expired entry as free to acquire.
        assert!(store
            .set_if_absent("k", b"new".to_vec(), Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn scan_filters_by_prefix_and_skips_expired() {
        let store = InMemoryKvStore::new();
        store
            .set_expiring("lock:group:A", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_expiring("lock:group:B", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_expiring("idempotency:Z", b"x".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let mut keys = store.scan("lock:group:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["lock:group:A".to_string(), "lock:group:B".to_string()]);
    }
}
