//! Redis-backed [`super::KVStore`].

use super::KVStore;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use std::time::Duration;

/// `KVStore` implementation over a Redis (or Redis-compatible) server.
///
/// Uses `SET ... NX EX` for [`KVStore::set_if_absent`], which Redis
/// guarantees is atomic, and `SCAN` for prefix listing rather than `KEYS` to
/// avoid blocking the server on large keyspaces.
#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    /// Returns an error if the initial connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(CoreError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(CoreError::from)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KVStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(CoreError::from)?;
        Ok(value)
    }

    async fn set_expiring(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let _: () = conn
            .set_ex(key, value, seconds)
            .await
            .map_err(CoreError::from)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        let acquired: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async::<Option<String>>(&mut conn)
            .await
            .map_err(CoreError::from)?
            .is_some();
        Ok(acquired)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(CoreError::from)?;
        Ok(removed > 0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(CoreError::from)?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }
}
