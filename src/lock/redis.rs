// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis lease: `SET lock:{name} {instance_id}:{rfc3339} NX PX {ttl}`.
//!
//! Release and extend are Lua compare-and-act scripts so an instance can
//! never delete or prolong a lease that expired and was taken by a peer.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

use super::{instance_id, lock_key, lock_value, parse_lock_value, DistributedLock, LockInfo};
use crate::cache::redis::escape_glob;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::StorageError;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

fn redis_err(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

pub struct RedisLock {
    connection: ConnectionManager,
    prefix: String,
    instance_id: String,
    /// Values written by this instance, by lock name.
    held: Mutex<HashMap<String, String>>,
    release_script: Script,
    extend_script: Script,
}

impl RedisLock {
    pub async fn new(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(redis_err)?;

        let connection = retry("redis_lock_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(redis_err)?;

        Ok(Self::from_connection(connection, prefix))
    }

    #[must_use]
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        let instance_id = instance_id();
        info!(instance_id = %instance_id, "Redis lock backend ready");
        Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            instance_id,
            held: Mutex::new(HashMap::new()),
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, lock_key(name))
    }

    fn name_from_key<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|k| k.strip_prefix("lock:"))
            .unwrap_or(key)
    }

    async fn info_for_key(&self, key: &str) -> Result<Option<LockInfo>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await.map_err(redis_err)?;
        let Some(value) = value else {
            return Ok(None);
        };
        let pttl: i64 = cmd("PTTL").arg(key).query_async(&mut conn).await.map_err(redis_err)?;
        let (holder, acquired_at) = parse_lock_value(&value);
        Ok(Some(LockInfo {
            name: self.name_from_key(key).to_string(),
            holder,
            acquired_at,
            ttl_remaining: u64::try_from(pttl).ok().map(Duration::from_millis),
        }))
    }

    async fn scan_lock_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}lock:*", escape_glob(&self.prefix));
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::Backend(format!("Failed to scan lock keys: {}", e)))?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, StorageError> {
        let value = lock_value(&self.instance_id, Utc::now());
        let mut conn = self.connection.clone();
        let reply: Option<String> = cmd("SET")
            .arg(self.key(name))
            .arg(&value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let acquired = reply.is_some();
        if acquired {
            self.held.lock().insert(name.to_string(), value);
            debug!(lock = name, ?ttl, "Lock acquired");
        } else {
            debug!(lock = name, "Lock busy");
        }
        metrics::record_lock(name, "acquire", if acquired { "acquired" } else { "busy" });
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> Result<bool, StorageError> {
        let Some(value) = self.held.lock().remove(name) else {
            return Ok(false);
        };
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release_script
            .key(self.key(name))
            .arg(&value)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let released = deleted == 1;
        if !released {
            warn!(lock = name, "Lock expired before release");
        }
        metrics::record_lock(name, "release", if released { "released" } else { "lost" });
        Ok(released)
    }

    async fn extend(&self, name: &str, ttl: Duration) -> Result<bool, StorageError> {
        let Some(value) = self.held.lock().get(name).cloned() else {
            return Ok(false);
        };
        let mut conn = self.connection.clone();
        let extended: i64 = self
            .extend_script
            .key(self.key(name))
            .arg(&value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let extended = extended == 1;
        if !extended {
            self.held.lock().remove(name);
        }
        metrics::record_lock(name, "extend", if extended { "extended" } else { "lost" });
        Ok(extended)
    }

    async fn is_locked(&self, name: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(self.key(name)).await.map_err(redis_err)?;
        Ok(exists)
    }

    async fn get_info(&self, name: &str) -> Result<Option<LockInfo>, StorageError> {
        self.info_for_key(&self.key(name)).await
    }

    async fn list_active(&self) -> Result<Vec<LockInfo>, StorageError> {
        let mut active = Vec::new();
        for key in self.scan_lock_keys().await? {
            if let Some(info) = self.info_for_key(&key).await? {
                active.push(info);
            }
        }
        Ok(active)
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let mut conn = self.connection.clone();
        let mut removed = 0u64;
        for key in self.scan_lock_keys().await? {
            // -1: key exists without expiry, which a lease never should
            let pttl: i64 = cmd("PTTL").arg(&key).query_async(&mut conn).await.map_err(redis_err)?;
            if pttl == -1 {
                let n: u64 = conn.del(&key).await.map_err(redis_err)?;
                removed += n;
            }
        }
        if removed > 0 {
            info!(removed, "Removed lock keys without expiry");
        }
        Ok(removed)
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
