//! RediSearch document index over RedisJSON.
//!
//! Documents are written with `JSON.SET {prefix}fw:{index}:{id} $ <doc>` and
//! queried with a TAG match:
//!
//! ```text
//! FT.SEARCH idx:ip-addresses "@address:{1\.2\.3\.4}" LIMIT 0 10 DIALECT 2
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Client, Value as RedisValue};
use serde_json::Value;
use tracing::{debug, info};

use super::index_manager::IndexManager;
use super::DocumentIndex;
use crate::resilience::retry::{retry, RetryConfig};
use crate::rule::EntityKind;
use crate::storage::traits::StorageError;

pub struct RedisSearchIndex {
    connection: ConnectionManager,
    manager: IndexManager,
    prefix: String,
}

impl RedisSearchIndex {
    pub async fn new(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_search_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, prefix))
    }

    #[must_use]
    pub fn from_connection(connection: ConnectionManager, prefix: Option<&str>) -> Self {
        let prefix = prefix.unwrap_or("").to_string();
        Self { connection, manager: IndexManager::for_rules(&prefix), prefix }
    }
}

/// Escape a value for use inside a TAG query `{...}`.
#[must_use]
pub fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() * 2);
    for c in value.chars() {
        if !(c.is_alphanumeric() || c == '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Pull the JSON documents out of an `FT.SEARCH` reply:
/// `[total, key1, ["$", "<json>"], key2, ["$", "<json>"], ...]`.
fn parse_search_reply(reply: RedisValue) -> Result<Vec<Value>, StorageError> {
    let RedisValue::Array(items) = reply else {
        return Err(StorageError::Backend("Unexpected FT.SEARCH reply".to_string()));
    };

    let mut docs = Vec::new();
    for item in items.into_iter().skip(1) {
        let RedisValue::Array(fields) = item else {
            // Document key
            continue;
        };
        let mut iter = fields.into_iter();
        while let (Some(_name), Some(body)) = (iter.next(), iter.next()) {
            let raw = match body {
                RedisValue::BulkString(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                RedisValue::SimpleString(s) => s,
                _ => continue,
            };
            docs.push(serde_json::from_str(&raw)?);
        }
    }
    Ok(docs)
}

#[async_trait]
impl DocumentIndex for RedisSearchIndex {
    async fn ensure_index(&self, kind: EntityKind) -> Result<(), StorageError> {
        let Some(index) = self.manager.get(kind.index_name()) else {
            return Ok(());
        };
        let args = index.to_ft_create_args(&self.prefix);

        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = cmd("FT.CREATE")
            .arg(&args)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(index = %index.name, "Created search index");
                Ok(())
            }
            Err(e) if e.to_string().contains("Index already exists") => {
                debug!(index = %index.name, "Search index already exists");
                Ok(())
            }
            Err(e) => Err(StorageError::Backend(format!("FT.CREATE {} failed: {}", index.name, e))),
        }
    }

    async fn upsert(&self, index: &str, id: &str, doc: &Value) -> Result<(), StorageError> {
        let json = serde_json::to_string(doc)?;
        let mut conn = self.connection.clone();
        let _: () = cmd("JSON.SET")
            .arg(self.manager.doc_key(index, id))
            .arg("$")
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: i64 = cmd("DEL")
            .arg(self.manager.doc_key(index, id))
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn search_term(
        &self,
        index: &str,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Value>, StorageError> {
        let query = format!("@{}:{{{}}}", field, escape_tag(value));
        let mut conn = self.connection.clone();
        let reply: RedisValue = cmd("FT.SEARCH")
            .arg(self.manager.index_id(index))
            .arg(&query)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .arg("DIALECT")
            .arg(2)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        parse_search_reply(reply)
    }

    fn backend_name(&self) -> &'static str {
        "redisearch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("1.2.3.4"), "1\\.2\\.3\\.4");
        assert_eq!(escape_tag("a@b.com"), "a\\@b\\.com");
        assert_eq!(escape_tag("Mozilla/5.0 (X11)"), "Mozilla\\/5\\.0\\ \\(X11\\)");
        assert_eq!(escape_tag("user_1"), "user_1");
    }

    #[test]
    fn test_parse_search_reply() {
        let reply = RedisValue::Array(vec![
            RedisValue::Int(1),
            RedisValue::BulkString(b"fw:ip-addresses:1.2.3.4".to_vec()),
            RedisValue::Array(vec![
                RedisValue::BulkString(b"$".to_vec()),
                RedisValue::BulkString(br#"{"address":"1.2.3.4","status":"denied"}"#.to_vec()),
            ]),
        ]);
        let docs = parse_search_reply(reply).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["status"], "denied");
    }

    #[test]
    fn test_parse_empty_reply() {
        let docs = parse_search_reply(RedisValue::Array(vec![RedisValue::Int(0)])).unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_parse_unexpected_reply() {
        assert!(parse_search_reply(RedisValue::Nil).is_err());
    }
}
