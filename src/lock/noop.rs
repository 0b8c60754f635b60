//! Lock backend for single-instance deployments.

use std::time::Duration;

use async_trait::async_trait;

use super::{instance_id, DistributedLock, LockInfo};
use crate::storage::traits::StorageError;

/// Always grants; never reports a lock as held.
pub struct NoopLock {
    instance_id: String,
}

impl NoopLock {
    #[must_use]
    pub fn new() -> Self {
        Self { instance_id: instance_id() }
    }
}

impl Default for NoopLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedLock for NoopLock {
    async fn try_acquire(&self, _name: &str, _ttl: Duration) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn release(&self, _name: &str) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn extend(&self, _name: &str, _ttl: Duration) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn is_locked(&self, _name: &str) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn get_info(&self, _name: &str) -> Result<Option<LockInfo>, StorageError> {
        Ok(None)
    }

    async fn list_active(&self) -> Result<Vec<LockInfo>, StorageError> {
        Ok(Vec::new())
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        Ok(0)
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn backend_name(&self) -> &'static str {
        "noop"
    }
}
