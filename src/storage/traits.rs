// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Authoritative store seams.
//!
//! Three traits split the durable state by concern: rule rows, per-kind
//! sync watermarks, and traffic data (logs, relationship counters,
//! rollups). Both the in-memory and the SQL backend implement all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::rule::{EntityKind, Rule, StoredRule};
use crate::traffic::model::{
    AttributeTuple, Page, Relationship, Rollup, RollupType, TrafficLog,
};
use crate::traffic::query::TrafficQuery;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or overwrite by natural key. `created_at` survives overwrites.
    async fn upsert_rule(&self, rule: &Rule) -> Result<StoredRule, StorageError>;

    /// Returns whether a row was removed.
    async fn delete_rule(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError>;

    async fn get_rule(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRule>, StorageError>;

    /// Rows with `updated_at > since OR created_at > since`.
    async fn scan_updated_since(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredRule>, StorageError>;

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<StoredRule>, StorageError>;

    async fn count_rules(&self, kind: EntityKind) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_watermark(&self, kind: EntityKind) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Store `at` unless the current watermark is already later.
    async fn advance_watermark(&self, kind: EntityKind, at: DateTime<Utc>) -> Result<(), StorageError>;
}

#[async_trait]
pub trait TrafficStore: Send + Sync {
    /// Persist a log row and return its assigned ID.
    async fn insert_log(&self, log: &TrafficLog) -> Result<i64, StorageError>;

    /// Increment the counter for `(relationship_type, attributes)` or insert
    /// it with frequency 1.
    async fn upsert_relationship(
        &self,
        relationship_type: &str,
        attributes: &AttributeTuple,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Logs with `start <= timestamp < end`, in insertion order.
    async fn logs_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrafficLog>, StorageError>;

    /// Relationship rows whose `last_seen` falls in `[start, end)`.
    async fn relationships_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Relationship>, StorageError>;

    async fn rollup_exists(
        &self,
        date: DateTime<Utc>,
        aggregation_type: RollupType,
    ) -> Result<bool, StorageError>;

    /// Returns false without writing when a rollup for the same
    /// `(aggregation_date, aggregation_type)` already exists.
    async fn insert_rollup(&self, rollup: &Rollup) -> Result<bool, StorageError>;

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    /// Deletes by `last_seen`.
    async fn delete_relationships_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn list_logs(&self, query: &TrafficQuery) -> Result<Page<TrafficLog>, StorageError>;

    async fn list_relationships(&self, query: &TrafficQuery) -> Result<Page<Relationship>, StorageError>;

    async fn list_rollups(&self, query: &TrafficQuery) -> Result<Page<Rollup>, StorageError>;
}
