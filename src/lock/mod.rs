// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cluster-wide named leases.
//!
//! Only the full resync takes a lock today (`full_sync`), so that exactly one
//! instance rewrites the index at a time. Single-instance deployments use
//! [`NoopLock`], which always grants.

pub mod noop;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::traits::StorageError;

pub use self::noop::NoopLock;
pub use self::redis::RedisLock;

/// Name of the lock guarding a full resync.
pub const FULL_SYNC_LOCK: &str = "full_sync";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub name: String,
    /// `instance_id` of the holder.
    pub holder: String,
    pub acquired_at: Option<DateTime<Utc>>,
    /// `None` if the key has no expiry.
    pub ttl_remaining: Option<Duration>,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Take the lease if nobody holds it. Returns false when busy.
    async fn try_acquire(&self, name: &str, ttl: Duration) -> Result<bool, StorageError>;

    /// Release iff this instance holds the lease.
    async fn release(&self, name: &str) -> Result<bool, StorageError>;

    /// Reset the TTL iff this instance holds the lease.
    async fn extend(&self, name: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn is_locked(&self, name: &str) -> Result<bool, StorageError>;

    async fn get_info(&self, name: &str) -> Result<Option<LockInfo>, StorageError>;

    async fn list_active(&self) -> Result<Vec<LockInfo>, StorageError>;

    /// Remove lock keys that have lost their expiry. Returns how many.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;

    fn instance_id(&self) -> &str;

    fn backend_name(&self) -> &'static str;
}

pub type SharedLock = Arc<dyn DistributedLock>;

/// `{hostname}-{pid}-{startup unix seconds}`.
#[must_use]
pub fn instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}-{}", host, std::process::id(), Utc::now().timestamp())
}

/// `lock:{name}`
#[must_use]
pub fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

/// Lock value: `{instance_id}:{rfc3339}`.
#[must_use]
pub fn lock_value(instance_id: &str, at: DateTime<Utc>) -> String {
    format!("{}:{}", instance_id, at.to_rfc3339())
}

/// Split a lock value into holder and acquire time.
#[must_use]
pub fn parse_lock_value(value: &str) -> (String, Option<DateTime<Utc>>) {
    match value.split_once(':') {
        Some((holder, at)) => (
            holder.to_string(),
            DateTime::parse_from_rfc3339(at).ok().map(|t| t.with_timezone(&Utc)),
        ),
        None => (value.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_shape() {
        let id = instance_id();
        let parts: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<i64>().is_ok());
        assert_eq!(parts[1].parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn test_lock_value_round_trip() {
        let at = Utc::now();
        let value = lock_value("web-1-42-1700000000", at);
        let (holder, parsed) = parse_lock_value(&value);
        assert_eq!(holder, "web-1-42-1700000000");
        assert_eq!(parsed.unwrap().timestamp(), at.timestamp());

        assert_eq!(parse_lock_value("garbage"), ("garbage".to_string(), None));
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key(FULL_SYNC_LOCK), "lock:full_sync");
    }
}
