//! In-process document index backed by `DashMap`.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::DocumentIndex;
use crate::storage::traits::StorageError;

/// `index name -> (document id -> document)`.
pub struct InMemoryIndex {
    indexes: DashMap<String, DashMap<String, Value>>,
}

impl InMemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self { indexes: DashMap::new() }
    }

    /// Number of documents in an index.
    #[must_use]
    pub fn len(&self, index: &str) -> usize {
        self.indexes.get(index).map_or(0, |docs| docs.len())
    }

    #[must_use]
    pub fn get(&self, index: &str, id: &str) -> Option<Value> {
        self.indexes
            .get(index)
            .and_then(|docs| docs.get(id).map(|d| d.value().clone()))
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn field_equals(doc: &Value, field: &str, value: &str) -> bool {
    match doc.get(field) {
        Some(Value::String(s)) => s == value,
        Some(Value::Bool(b)) => value.parse::<bool>().ok() == Some(*b),
        Some(Value::Number(n)) => n.to_string() == value,
        _ => false,
    }
}

#[async_trait]
impl DocumentIndex for InMemoryIndex {
    async fn upsert(&self, index: &str, id: &str, doc: &Value) -> Result<(), StorageError> {
        self.indexes
            .entry(index.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), StorageError> {
        if let Some(docs) = self.indexes.get(index) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn search_term(
        &self,
        index: &str,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, StorageError> {
        let Some(docs) = self.indexes.get(index) else {
            return Ok(Vec::new());
        };

        // Natural-key lookups hit the document ID directly
        if let Some(doc) = docs.get(value) {
            if field_equals(doc.value(), field, value) {
                return Ok(vec![doc.value().clone()]);
            }
        }

        Ok(docs
            .iter()
            .filter(|entry| field_equals(entry.value(), field, value))
            .take(limit)
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
