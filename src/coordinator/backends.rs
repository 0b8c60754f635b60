// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backend wiring from configuration.
//!
//! | Concern | Config switch | Backends |
//! |---------|---------------|----------|
//! | rules, watermarks, traffic | `sql.url` | [`SqlStore`] or [`InMemoryStore`] |
//! | TTL cache | `caching.distributed` | [`RedisCache`] or [`MemoryCache`] |
//! | cluster lock | `locking.enabled` | [`RedisLock`] or [`NoopLock`] |
//! | document index | `search.backend` | [`RedisSearchIndex`] or [`InMemoryIndex`] |
//!
//! Every Redis-backed component shares one `ConnectionManager`.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

use crate::cache::{MemoryCache, RedisCache, SharedCache};
use crate::config::{FirewallConfig, SearchBackend};
use crate::geo::{GeoLookup, NoopGeo};
use crate::lock::{NoopLock, RedisLock, SharedLock};
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::search::{InMemoryIndex, RedisSearchIndex, SharedIndex};
use crate::storage::memory::InMemoryStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::{RuleStore, StorageError, SyncStateStore, TrafficStore};

/// Handles the coordinator is built from. Fields are public so tests and
/// embedders can swap any single backend.
#[derive(Clone)]
pub struct Backends {
    pub rules: Arc<dyn RuleStore>,
    pub sync_state: Arc<dyn SyncStateStore>,
    pub traffic: Arc<dyn TrafficStore>,
    pub index: SharedIndex,
    pub cache: SharedCache,
    pub lock: SharedLock,
    pub geo: Arc<dyn GeoLookup>,
    /// Kept for health checks.
    pub sql: Option<Arc<SqlStore>>,
    pub redis: Option<ConnectionManager>,
    /// Set when the local cache is in use, so its sweep task can run.
    pub memory_cache: Option<Arc<MemoryCache>>,
}

impl Backends {
    /// Single-process backends with no external dependency.
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        Self {
            rules: store.clone(),
            sync_state: store.clone(),
            traffic: store,
            index: Arc::new(InMemoryIndex::new()),
            cache: cache.clone(),
            lock: Arc::new(NoopLock::new()),
            geo: Arc::new(NoopGeo),
            sql: None,
            redis: None,
            memory_cache: Some(cache),
        }
    }

    /// Connect everything the config asks for. Connections retry with
    /// startup backoff before giving up.
    pub async fn connect(config: &FirewallConfig) -> Result<Self, StorageError> {
        let mut backends = Self::in_memory();

        if let Some(url) = config.sql.url.as_deref() {
            let phase_start = std::time::Instant::now();
            let store = Arc::new(SqlStore::new(url).await?);
            backends.rules = store.clone();
            backends.sync_state = store.clone();
            backends.traffic = store.clone();
            backends.sql = Some(store);
            metrics::set_backend_healthy("sql", true);
            metrics::record_startup_phase("sql_connect", phase_start.elapsed());
            info!("SQL store connected");
        }

        if config.needs_redis() {
            let phase_start = std::time::Instant::now();
            let connection = connect_redis(&config.redis.url()).await?;
            let prefix = Some(config.redis.key_prefix.as_str()).filter(|p| !p.is_empty());

            if config.caching.distributed {
                backends.cache = Arc::new(RedisCache::from_connection(connection.clone(), prefix));
                backends.memory_cache = None;
            }
            if config.locking.enabled {
                backends.lock = Arc::new(RedisLock::from_connection(connection.clone(), prefix));
            }
            if config.search.backend == SearchBackend::Redis {
                backends.index = Arc::new(RedisSearchIndex::from_connection(connection.clone(), prefix));
            }
            backends.redis = Some(connection);
            metrics::set_backend_healthy("redis", true);
            metrics::record_startup_phase("redis_connect", phase_start.elapsed());
            info!(
                cache = backends.cache.backend_name(),
                lock = backends.lock.backend_name(),
                index = backends.index.backend_name(),
                "Redis connected"
            );
        }

        Ok(backends)
    }
}

async fn connect_redis(url: &str) -> Result<ConnectionManager, StorageError> {
    let client = Client::open(url).map_err(|e| StorageError::Backend(e.to_string()))?;
    retry("redis_connect", &RetryConfig::startup(), || async {
        ConnectionManager::new(client.clone()).await
    })
    .await
    .map_err(|e: redis::RedisError| {
        metrics::set_backend_healthy("redis", false);
        StorageError::Backend(e.to_string())
    })
}
