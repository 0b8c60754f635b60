// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TTL cache in front of the decision path and the list surface.
//!
//! Two interchangeable backends implement [`Cache`]:
//!
//! - [`MemoryCache`]: a single mutex-guarded map, swept periodically.
//! - [`RedisCache`]: cluster-shared values wrapped in a
//!   `{value, expires_at, created_at}` envelope.
//!
//! # Key grammar
//!
//! ```text
//! {kind}:filter:{value}                        per-dimension decision
//! {kind}:list:{page}:{limit}:{search}:{status} list page
//! {kind}:stats                                 count/summary
//! ```
//!
//! Cache faults never fail the enclosing operation: the [`get_json`] and
//! [`set_json`] helpers turn read errors into misses and log write errors.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics;
use crate::storage::traits::StorageError;

pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Per-dimension filter result TTL.
pub const FILTER_TTL: Duration = Duration::from_secs(5 * 60);
/// List page TTL.
pub const LIST_TTL: Duration = Duration::from_secs(2 * 60);
/// Count/summary TTL.
pub const STATS_TTL: Duration = Duration::from_secs(30);
/// Expired-entry sweep interval for the local backend.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[must_use]
pub fn filter_key(kind: &str, value: &str) -> String {
    format!("{}:filter:{}", kind, value)
}

#[must_use]
pub fn list_key(kind: &str, page: u32, limit: u32, search: &str, status: &str) -> String {
    format!("{}:list:{}:{}:{}:{}", kind, page, limit, search, status)
}

#[must_use]
pub fn stats_key(kind: &str) -> String {
    format!("{}:stats", kind)
}

/// `key == prefix` or `key` starts with `prefix:`.
#[must_use]
pub fn matches_type(key: &str, prefix: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// `in-memory` or `distributed`.
    #[serde(rename = "type")]
    pub backend: String,
    pub total_entries: u64,
    pub expired_entries: u64,
    pub valid_entries: u64,
    /// Rough estimate of bytes held (keys plus values).
    pub memory_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[async_trait]
pub trait Cache: Send + Sync {
    /// Miss on absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Remove `prefix` and every `prefix:*` key. Returns the count removed.
    async fn invalidate_by_type(&self, prefix: &str) -> Result<u64, StorageError>;

    /// Remove every key containing `pattern`. Returns the count removed.
    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;

    async fn stats(&self) -> Result<CacheStats, StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// Shared handle passed to every component.
pub type SharedCache = Arc<dyn Cache>;

/// Read and decode a JSON value. Backend or decode failures are misses.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    match cache.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(v) => {
                metrics::record_cache_lookup(cache.backend_name(), true);
                Some(v)
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                metrics::record_cache_lookup(cache.backend_name(), false);
                None
            }
        },
        Ok(None) => {
            metrics::record_cache_lookup(cache.backend_name(), false);
            None
        }
        Err(e) => {
            warn!(key, error = %e, "Cache read failed, treating as miss");
            metrics::record_cache_error(cache.backend_name(), "get");
            None
        }
    }
}

/// Encode and store a JSON value. Failures are logged and dropped.
pub async fn set_json<T: Serialize + ?Sized>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "Failed to encode cache value");
            return;
        }
    };
    if let Err(e) = cache.set(key, &raw, ttl).await {
        warn!(key, error = %e, "Cache write failed, ignoring");
        metrics::record_cache_error(cache.backend_name(), "set");
    }
}

/// Invalidate every cache entry for a kind, logging instead of failing.
pub async fn invalidate_kind(cache: &dyn Cache, kind: &str) -> bool {
    match cache.invalidate_by_type(kind).await {
        Ok(removed) => {
            metrics::record_cache_invalidation(kind, removed);
            true
        }
        Err(e) => {
            warn!(kind, error = %e, "Cache invalidation failed");
            metrics::record_cache_error(cache.backend_name(), "invalidate");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_grammar() {
        assert_eq!(filter_key("ip", "1.2.3.4"), "ip:filter:1.2.3.4");
        assert_eq!(list_key("email", 2, 50, "spam", "denied"), "email:list:2:50:spam:denied");
        assert_eq!(stats_key("country"), "country:stats");
    }

    #[test]
    fn test_matches_type() {
        assert!(matches_type("ip", "ip"));
        assert!(matches_type("ip:filter:1.2.3.4", "ip"));
        assert!(matches_type("ip:stats", "ip"));
        assert!(!matches_type("ipv6:filter:x", "ip"));
        assert!(!matches_type("email:filter:ip", "ip"));
    }

    #[test]
    fn test_ttl_constants() {
        assert_eq!(FILTER_TTL.as_secs(), 300);
        assert_eq!(LIST_TTL.as_secs(), 120);
        assert_eq!(STATS_TTL.as_secs(), 30);
        assert_eq!(CLEANUP_INTERVAL.as_secs(), 300);
    }

    #[tokio::test]
    async fn test_json_helpers_round_trip() {
        let cache = MemoryCache::new();
        set_json(&cache, "k", &vec![1, 2, 3], FILTER_TTL).await;
        let back: Option<Vec<i32>> = get_json(&cache, "k").await;
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_get_json_undecodable_is_miss() {
        let cache = MemoryCache::new();
        cache.set("k", "not json", FILTER_TTL).await.unwrap();
        let back: Option<Vec<i32>> = get_json(&cache, "k").await;
        assert!(back.is_none());
    }
}
