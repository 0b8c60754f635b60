// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document index: the query path of the decision engine.
//!
//! Each rule kind is projected into its own index, one JSON document per
//! rule, with the natural key as the document ID:
//!
//! ```text
//! ip-addresses  {"address": "1.2.3.4", "status": "denied", "is_cidr": false, ...}
//! emails        {"address": "test@gmail.com", "status": "denied", "is_regex": false}
//! user-agents   {"user_agent": "curl/8.0", "status": "denied", "is_regex": false}
//! ```
//!
//! [`DocumentIndex`] is the raw backend seam (in-memory or RediSearch);
//! [`IndexAdapter`] speaks in rules and statuses on top of it.

mod index_manager;
mod memory;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use crate::metrics::{self, LatencyTimer};
use crate::rule::{EntityKind, Rule, RuleStatus};
use crate::storage::traits::StorageError;

pub use index_manager::{IndexManager, SearchField, SearchFieldType, SearchIndex, DOC_NAMESPACE};
pub use memory::InMemoryIndex;
pub use redis::RedisSearchIndex;

#[async_trait]
pub trait DocumentIndex: Send + Sync {
    /// Create the index for a kind if the backend needs one.
    async fn ensure_index(&self, _kind: EntityKind) -> Result<(), StorageError> {
        Ok(())
    }

    /// Upsert by document ID. Re-indexing the same ID overwrites.
    async fn upsert(&self, index: &str, id: &str, doc: &Value) -> Result<(), StorageError>;

    /// Deleting a missing document is not an error.
    async fn delete(&self, index: &str, id: &str) -> Result<(), StorageError>;

    /// Documents whose `field` equals `value` exactly.
    async fn search_term(
        &self,
        index: &str,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, StorageError>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedIndex = Arc<dyn DocumentIndex>;

/// Rule-level operations over a [`DocumentIndex`].
#[derive(Clone)]
pub struct IndexAdapter {
    index: SharedIndex,
}

impl IndexAdapter {
    #[must_use]
    pub fn new(index: SharedIndex) -> Self {
        Self { index }
    }

    #[must_use]
    pub fn backend(&self) -> &SharedIndex {
        &self.index
    }

    pub async fn ensure_indexes(&self) -> Result<(), StorageError> {
        for kind in EntityKind::ALL {
            self.index.ensure_index(kind).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, rule), fields(kind = %rule.kind(), key = rule.natural_key()))]
    pub async fn index(&self, rule: &Rule) -> Result<(), StorageError> {
        let kind = rule.kind();
        let result = self
            .index
            .upsert(kind.index_name(), rule.natural_key(), &rule.document())
            .await;
        metrics::record_index_write(self.index.backend_name(), "upsert", result.is_ok());
        result
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, kind: EntityKind, natural_id: &str) -> Result<(), StorageError> {
        let result = self.index.delete(kind.index_name(), natural_id).await;
        metrics::record_index_write(self.index.backend_name(), "delete", result.is_ok());
        result
    }

    /// Status of the first literal document whose `field` equals `value`.
    ///
    /// Pattern documents (CIDR blocks, regexes) are skipped: their key is a
    /// pattern, not a value, and they are evaluated by the predicate cache.
    pub async fn search_exact(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> Result<Option<RuleStatus>, StorageError> {
        let hits = self.index.search_term(kind.index_name(), field, value, 10).await?;
        Ok(hits.iter().find(|doc| !is_pattern_doc(doc)).and_then(status_of))
    }

    /// Shorthand for a lookup on the kind's natural key field.
    pub async fn lookup(&self, kind: EntityKind, value: &str) -> Result<Option<RuleStatus>, StorageError> {
        let _timer = LatencyTimer::new("index", "lookup");
        self.search_exact(kind, kind.key_field(), value).await
    }
}

fn is_pattern_doc(doc: &Value) -> bool {
    doc.get("is_cidr").and_then(Value::as_bool).unwrap_or(false)
        || doc.get("is_regex").and_then(Value::as_bool).unwrap_or(false)
}

fn status_of(doc: &Value) -> Option<RuleStatus> {
    doc.get("status")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}
