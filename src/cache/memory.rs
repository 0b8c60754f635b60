//! Single-process cache backend.
//!
//! One `parking_lot::Mutex` guards the map; no await happens while it is
//! held. Expired entries are purged when read and by a periodic sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{matches_type, Cache, CacheStats};
use crate::storage::traits::StorageError;

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    /// Spawn the periodic sweep. Exits when `cancel` fires.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!(removed, "Purged expired cache entries");
                        }
                    }
                }
            }
        })
    }

    fn remove_where(&self, pred: impl Fn(&str) -> bool) -> u64 {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !pred(k));
        (before - entries.len()) as u64
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let value = match entries.get(key) {
            Some(e) if e.expires_at > now => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        };
        drop(entries);

        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StorageError> {
        let entry = Entry { value: value.to_string(), expires_at: Instant::now() + ttl };
        self.entries.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn invalidate_by_type(&self, prefix: &str) -> Result<u64, StorageError> {
        Ok(self.remove_where(|k| matches_type(k, prefix)))
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, StorageError> {
        Ok(self.remove_where(|k| k.contains(pattern)))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.entries.lock().clear();
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, StorageError> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let total = entries.len() as u64;
        let expired = entries.values().filter(|e| e.expires_at <= now).count() as u64;
        let memory_bytes = entries
            .iter()
            .map(|(k, e)| (k.len() + e.value.len() + std::mem::size_of::<Entry>()) as u64)
            .sum();
        drop(entries);

        Ok(CacheStats {
            backend: self.backend_name().to_string(),
            total_entries: total,
            expired_entries: expired,
            valid_entries: total - expired,
            memory_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());

        cache.set("ip:filter:1.2.3.4", "\"denied\"", TTL).await.unwrap();
        assert_eq!(cache.get("ip:filter:1.2.3.4").await.unwrap().as_deref(), Some("\"denied\""));

        cache.delete("ip:filter:1.2.3.4").await.unwrap();
        assert!(cache.get("ip:filter:1.2.3.4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_purged() {
        let cache = MemoryCache::new();
        cache.set("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_type() {
        let cache = MemoryCache::new();
        for key in ["ip", "ip:filter:1.1.1.1", "ip:stats", "ipx:filter:a", "email:filter:ip"] {
            cache.set(key, "v", TTL).await.unwrap();
        }

        let removed = cache.invalidate_by_type("ip").await.unwrap();
        assert_eq!(removed, 3);
        assert!(cache.get("ipx:filter:a").await.unwrap().is_some());
        assert!(cache.get("email:filter:ip").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_pattern() {
        let cache = MemoryCache::new();
        for key in ["ip:list:1:10::", "email:list:1:10::", "ip:stats"] {
            cache.set(key, "v", TTL).await.unwrap();
        }

        let removed = cache.invalidate_pattern(":list:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_counts_expired() {
        let cache = MemoryCache::new();
        cache.set("a", "1", TTL).await.unwrap();
        cache.set("b", "2", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.backend, "in-memory");
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.valid_entries, 1);
        assert!(stats.memory_bytes > 0);
    }

    #[tokio::test]
    async fn test_cleanup_task_purges() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("short", "v", Duration::from_millis(5)).await.unwrap();
        cache.set("long", "v", TTL).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = cache.spawn_cleanup(Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MemoryCache::new();
        cache.set("a", "1", TTL).await.unwrap();
        cache.clear().await.unwrap();
        assert!(cache.is_empty());
    }
}
