//! Cluster-shared cache backend.
//!
//! Values are stored as a JSON envelope:
//!
//! ```json
//! {"value": "...", "expires_at": 1767084657058, "created_at": 1767084357058}
//! ```
//!
//! Redis enforces the TTL via `SET .. PX`; `expires_at` is checked again on
//! read so that a peer with a skewed clock cannot serve stale data.
//! Invalidation walks the keyspace with `SCAN MATCH`, never `KEYS`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};
use serde::{Deserialize, Serialize};

use super::{Cache, CacheStats};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

/// Key shapes owned by the cache, used by `clear()` and `stats()` so that
/// lock keys and index documents sharing the instance are left alone.
const CACHE_PATTERNS: [&str; 3] = ["*:filter:*", "*:list:*", "*:stats"];

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    expires_at: i64,
    created_at: i64,
}

pub struct RedisCache {
    connection: ConnectionManager,
    prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisCache {
    pub async fn new(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_cache_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix))
    }

    /// Share an existing connection (the lock and index use the same instance).
    #[must_use]
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to scan cache keys: {}", e)))?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let mut removed = 0u64;
        for chunk in keys.chunks(500) {
            let n: u64 = conn
                .del(chunk)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            removed += n;
        }
        Ok(removed)
    }

    async fn cache_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let prefix = escape_glob(&self.prefix);
        for pattern in CACHE_PATTERNS {
            keys.extend(self.scan(&format!("{}{}", prefix, pattern)).await?);
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

/// Escape Redis glob metacharacters so user values match literally.
#[must_use]
pub fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let full_key = self.prefixed_key(key);
        let raw: Option<String> = conn
            .get(&full_key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let value = match raw {
            Some(raw) => {
                let envelope: Envelope = serde_json::from_str(&raw)?;
                if envelope.expires_at <= Utc::now().timestamp_millis() {
                    let _: Result<(), _> = conn.del(&full_key).await;
                    None
                } else {
                    Some(envelope.value)
                }
            }
            None => None,
        };

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = (ttl.as_millis() as u64).max(1);
        let envelope = Envelope {
            value: value.to_string(),
            expires_at: now + ttl_ms as i64,
            created_at: now,
        };
        let raw = serde_json::to_string(&envelope)?;

        let mut conn = self.connection.clone();
        let _: () = cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(raw)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .del(self.prefixed_key(key))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn invalidate_by_type(&self, prefix: &str) -> Result<u64, StorageError> {
        let escaped = escape_glob(&self.prefixed_key(prefix));
        let mut keys = self.scan(&format!("{}:*", escaped)).await?;
        keys.push(self.prefixed_key(prefix));
        self.delete_keys(&keys).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, StorageError> {
        let keys = self
            .scan(&format!("{}*{}*", escape_glob(&self.prefix), escape_glob(pattern)))
            .await?;
        self.delete_keys(&keys).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let keys = self.cache_keys().await?;
        self.delete_keys(&keys).await?;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, StorageError> {
        let total = self.cache_keys().await?.len() as u64;

        let mut conn = self.connection.clone();
        let info: String = cmd("INFO")
            .arg("memory")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let memory_bytes = parse_used_memory(&info).unwrap_or(0);

        Ok(CacheStats {
            backend: self.backend_name().to_string(),
            total_entries: total,
            // Redis evicts on TTL, so scanned keys are live
            expired_entries: 0,
            valid_entries: total,
            memory_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    fn backend_name(&self) -> &'static str {
        "distributed"
    }
}

fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory:"))
        .and_then(|v| v.trim().parse().ok())
}
