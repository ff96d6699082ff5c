//! Idempotency store: deduplicates logically identical requests by caching
//! the result of a producer closure under a request fingerprint.
//!
//! The store does **not** enforce mutual exclusion across concurrent
//! in-flight producers for the same key — duplicate concurrent producers are
//! tolerated because the downstream saga/workflow is itself idempotent via
//! the reservation and unique-constraint path (see design notes).

use crate::error::Result;
use crate::kv::KVStore;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Build a deterministic fingerprint from an operation tag, principal id,
/// and a JSON payload, namespaced as `<operation>:<principal>:<hash16>`.
///
/// Canonicalization recursively sorts object keys and any array whose
/// elements are themselves orderable, so that `{G1,G2}` and `{G2,G1}` hash
/// identically.
#[must_use]
pub fn fingerprint(operation: &str, principal_id: &str, payload: &Value) -> String {
    let canonical = canonicalize(payload);
    let key_string = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    hasher.update(b":");
    hasher.update(principal_id.as_bytes());
    hasher.update(b":");
    hasher.update(key_string.as_bytes());
    let digest = hasher.finalize();
    let hash16 = digest.iter().take(8).map(|b| format!("{b:02x}")).collect::<String>();
    format!("{operation}:{principal_id}:{hash16}")
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(String, Value)> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => {
            let mut canonicalized: Vec<Value> = items.iter().map(canonicalize).collect();
            // Sort only when every element is itself orderable as a string;
            // this mirrors the source's "sort if sortable, else keep order"
            // behavior for things like a list of group codes.
            if canonicalized.iter().all(Value::is_string) {
                canonicalized.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            }
            Value::Array(canonicalized)
        }
        other => other.clone(),
    }
}

/// Cached result envelope.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct CachedResult {
    /// The cached JSON result payload.
    pub result: Value,
    /// When the result was first produced (Unix seconds).
    pub created_at: i64,
}

/// A type-erased async producer, boxed so [`IdempotencyStore::get_or_run`]
/// can remain object-safe.
pub type Producer<'a> =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> + Send + 'a>;

/// Deduplicates logically identical operations by fingerprint.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Look up `key`; on a cache hit return the stored result with
    /// `cached = true`. On a miss, run `producer`; on success, best-effort
    /// cache the result under `ttl` and return `cached = false`. Cache-write
    /// failures must not fail the operation.
    ///
    /// # Errors
    /// Propagates the producer's error; never fails solely because caching
    /// failed.
    async fn get_or_run<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        producer: Producer<'a>,
    ) -> Result<(Value, bool)>;

    /// Invalidate a cached result.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    async fn invalidate(&self, key: &str) -> Result<bool>;
}

/// [`IdempotencyStore`] backed by any [`KVStore`].
pub struct KvIdempotencyStore<S: KVStore> {
    store: S,
}

impl<S: KVStore> KvIdempotencyStore<S> {
    /// Wrap a [`KVStore`] as an idempotency cache.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    fn cache_key(key: &str) -> String {
        format!("idempotency:{key}")
    }
}

#[async_trait]
impl<S: KVStore> IdempotencyStore for KvIdempotencyStore<S> {
    async fn get_or_run<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
        producer: Producer<'a>,
    ) -> Result<(Value, bool)> {
        let cache_key = Self::cache_key(key);

        match self.store.get(&cache_key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CachedResult>(&bytes) {
                Ok(cached) => {
                    tracing::info!(idempotency_key = key, "idempotency cache hit");
                    return Ok((cached.result, true));
                }
                Err(err) => {
                    tracing::warn!(idempotency_key = key, error = %err, "invalid cached payload, recomputing");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(idempotency_key = key, error = %err, "idempotency cache read failed, recomputing");
            }
        }

        tracing::info!(idempotency_key = key, "executing producer for idempotency key");
        let result = producer().await?;

        let envelope = CachedResult {
            result: result.clone(),
            created_at: chrono::Utc::now().timestamp(),
        };
        if let Ok(bytes) = serde_json::to_vec(&envelope) {
            if let Err(err) = self.store.set_expiring(&cache_key, bytes, ttl).await {
                tracing::warn!(idempotency_key = key, error = %err, "failed to cache idempotency result");
            }
        }

        Ok((result, false))
    }

    async fn invalidate(&self, key: &str) -> Result<bool> {
        self.store.delete(&Self::cache_key(key)).await
    }
}
