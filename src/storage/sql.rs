// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL authoritative store (SQLite or MySQL through the sqlx `Any` driver).
//!
//! One table per rule kind, all with the same shape. Per-kind attributes
//! live in the `attributes` JSON column; `status` is duplicated into its
//! own column for admin queries:
//!
//! ```sql
//! CREATE TABLE ip_addresses (
//!   natural_key VARCHAR(512) PRIMARY KEY,
//!   status      VARCHAR(16) NOT NULL,
//!   attributes  TEXT NOT NULL,     -- {"address": "...", "is_cidr": false, ...}
//!   created_at  BIGINT NOT NULL,   -- unix millis
//!   updated_at  BIGINT NOT NULL
//! )
//! ```
//!
//! Plus `sync_state` (watermarks), `traffic_logs`, `relationships` and
//! `rollups`. Relationship rows are unique on `(relationship_type,
//! tuple_key)` where `tuple_key` is the SHA-256 of the attribute tuple, so
//! the unique index stays fixed-width on MySQL.
//!
//! ## sqlx Any Driver Quirks
//!
//! All integers are BIGINT (INTEGER on SQLite) because `Any` only decodes
//! `i64` from 64-bit columns. Text columns can come back as bytes from
//! MySQL, so reads try `String` first and fall back to `Vec<u8>`.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::{RuleStore, StorageError, SyncStateStore, TrafficStore};
use crate::resilience::retry::{retry, RetryConfig};
use crate::rule::{EntityKind, Rule, StoredRule};
use crate::traffic::model::{
    AttributeTuple, FinalResult, Page, Relationship, RequestMetadata, Rollup, RollupType, TrafficLog,
};
use crate::traffic::query::{QueryTarget, TrafficQuery};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const LOG_COLUMNS: &str = "id, request_id, timestamp, ip, email, user_agent, username, country, charset, asn, \
    final_result, filter_results, response_time_ms, cache_hit, user_id, session_id, client_ip, raw_user_agent";

const RELATIONSHIP_COLUMNS: &str =
    "relationship_type, ip, email, user_agent, username, country, charset, frequency, first_seen, last_seen";

const ROLLUP_COLUMNS: &str = "aggregation_date, aggregation_type, total_requests, allowed_requests, \
    denied_requests, whitelisted_requests, timeout_requests, error_requests, avg_response_time_ms, \
    cache_hit_rate, top_ips, top_emails, top_user_agents, top_usernames, top_countries, top_charsets, \
    top_relationships, created_at";

const TUPLE_COLUMNS: [&str; 6] = ["ip", "email", "user_agent", "username", "country", "charset"];

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Read a text column as `String`, falling back to bytes for MySQL.
fn text(row: &AnyRow, column: &str) -> String {
    opt_text(row, column).unwrap_or_default()
}

fn opt_text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn int(row: &AnyRow, column: &str) -> i64 {
    row.try_get::<i64, _>(column).unwrap_or(0)
}

fn float(row: &AnyRow, column: &str) -> f64 {
    row.try_get::<f64, _>(column).unwrap_or(0.0)
}

fn json<T: serde::de::DeserializeOwned + Default>(row: &AnyRow, column: &str) -> Result<T, StorageError> {
    match opt_text(row, column) {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(T::default()),
    }
}

fn tuple_from_row(row: &AnyRow) -> AttributeTuple {
    AttributeTuple {
        ip: text(row, "ip"),
        email: text(row, "email"),
        user_agent: text(row, "user_agent"),
        username: text(row, "username"),
        country: text(row, "country"),
        charset: text(row, "charset"),
    }
}

/// A bind parameter for dynamically built list queries.
#[derive(Debug, Clone)]
enum Arg {
    Text(String),
    Int(i64),
}

fn bind_args<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    args: &[Arg],
) -> Query<'q, Any, AnyArguments<'q>> {
    for arg in args {
        query = match arg {
            Arg::Text(s) => query.bind(s.clone()),
            Arg::Int(i) => query.bind(*i),
        };
    }
    query
}

/// WHERE clause for a list query.
struct ListFilter {
    clauses: Vec<String>,
    args: Vec<Arg>,
}

impl ListFilter {
    fn new(query: &TrafficQuery, status_column: &str, time_column: &str, search_columns: &[&str]) -> Self {
        let mut clauses = Vec::new();
        let mut args = Vec::new();

        if let Some(status) = &query.status {
            clauses.push(format!("{} = ?", status_column));
            args.push(Arg::Text(status.clone()));
        }
        if let Some(since) = query.since {
            clauses.push(format!("{} >= ?", time_column));
            args.push(Arg::Int(to_millis(since)));
        }
        if let Some(until) = query.until {
            clauses.push(format!("{} < ?", time_column));
            args.push(Arg::Int(to_millis(until)));
        }
        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            if !search_columns.is_empty() {
                let pattern = format!("%{}%", search);
                let ors: Vec<String> = search_columns.iter().map(|c| format!("{} LIKE ?", c)).collect();
                clauses.push(format!("({})", ors.join(" OR ")));
                args.extend(search_columns.iter().map(|_| Arg::Text(pattern.clone())));
            }
        }
        Self { clauses, args }
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

fn direction(descending: bool) -> &'static str {
    if descending { "DESC" } else { "ASC" }
}

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        // A single long-lived connection keeps `sqlite::memory:` databases alive
        let (max_connections, idle_timeout) = if is_sqlite {
            (1, None)
        } else {
            (20, Some(Duration::from_secs(300)))
        };

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(idle_timeout)
                .max_lifetime(idle_timeout.map(|t| t * 6))
                .connect(connection_string)
                .await
                .map_err(backend_err)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL store ready");
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    pub async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(backend_err)?;
        Ok(())
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        // In-memory databases ignore WAL; the pragma still succeeds
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    fn schema(&self) -> Vec<String> {
        let mut statements = Vec::new();

        for kind in EntityKind::ALL {
            let table = kind.table_name();
            if self.is_sqlite {
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        natural_key TEXT PRIMARY KEY,
                        status TEXT NOT NULL,
                        attributes TEXT NOT NULL,
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    )"
                ));
                statements.push(format!(
                    "CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table} (updated_at)"
                ));
            } else {
                statements.push(format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        natural_key VARCHAR(512) PRIMARY KEY,
                        status VARCHAR(16) NOT NULL,
                        attributes TEXT NOT NULL,
                        created_at BIGINT NOT NULL,
                        updated_at BIGINT NOT NULL,
                        INDEX idx_updated_at (updated_at)
                    )"
                ));
            }
        }

        if self.is_sqlite {
            statements.extend([
                "CREATE TABLE IF NOT EXISTS sync_state (
                    data_type TEXT PRIMARY KEY,
                    last_sync INTEGER NOT NULL
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS traffic_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    ip TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL DEFAULT '',
                    user_agent TEXT NOT NULL DEFAULT '',
                    username TEXT NOT NULL DEFAULT '',
                    country TEXT NOT NULL DEFAULT '',
                    charset TEXT NOT NULL DEFAULT '',
                    asn TEXT NOT NULL DEFAULT '',
                    final_result TEXT NOT NULL,
                    filter_results TEXT,
                    response_time_ms INTEGER NOT NULL DEFAULT 0,
                    cache_hit INTEGER NOT NULL DEFAULT 0,
                    user_id TEXT,
                    session_id TEXT,
                    client_ip TEXT,
                    raw_user_agent TEXT
                )"
                .to_string(),
                "CREATE INDEX IF NOT EXISTS idx_traffic_logs_timestamp ON traffic_logs (timestamp)".to_string(),
                "CREATE TABLE IF NOT EXISTS relationships (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    relationship_type TEXT NOT NULL,
                    tuple_key TEXT NOT NULL,
                    ip TEXT NOT NULL DEFAULT '',
                    email TEXT NOT NULL DEFAULT '',
                    user_agent TEXT NOT NULL DEFAULT '',
                    username TEXT NOT NULL DEFAULT '',
                    country TEXT NOT NULL DEFAULT '',
                    charset TEXT NOT NULL DEFAULT '',
                    frequency INTEGER NOT NULL DEFAULT 1,
                    first_seen INTEGER NOT NULL,
                    last_seen INTEGER NOT NULL,
                    UNIQUE (relationship_type, tuple_key)
                )"
                .to_string(),
                "CREATE INDEX IF NOT EXISTS idx_relationships_last_seen ON relationships (last_seen)".to_string(),
                "CREATE TABLE IF NOT EXISTS rollups (
                    aggregation_date INTEGER NOT NULL,
                    aggregation_type TEXT NOT NULL,
                    total_requests INTEGER NOT NULL,
                    allowed_requests INTEGER NOT NULL,
                    denied_requests INTEGER NOT NULL,
                    whitelisted_requests INTEGER NOT NULL,
                    timeout_requests INTEGER NOT NULL,
                    error_requests INTEGER NOT NULL,
                    avg_response_time_ms REAL NOT NULL,
                    cache_hit_rate REAL NOT NULL,
                    top_ips TEXT,
                    top_emails TEXT,
                    top_user_agents TEXT,
                    top_usernames TEXT,
                    top_countries TEXT,
                    top_charsets TEXT,
                    top_relationships TEXT,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (aggregation_date, aggregation_type)
                )"
                .to_string(),
            ]);
        } else {
            statements.extend([
                "CREATE TABLE IF NOT EXISTS sync_state (
                    data_type VARCHAR(32) PRIMARY KEY,
                    last_sync BIGINT NOT NULL
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS traffic_logs (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    request_id VARCHAR(36) NOT NULL,
                    timestamp BIGINT NOT NULL,
                    ip VARCHAR(45) NOT NULL DEFAULT '',
                    email VARCHAR(254) NOT NULL DEFAULT '',
                    user_agent VARCHAR(500) NOT NULL DEFAULT '',
                    username VARCHAR(100) NOT NULL DEFAULT '',
                    country VARCHAR(8) NOT NULL DEFAULT '',
                    charset VARCHAR(32) NOT NULL DEFAULT '',
                    asn VARCHAR(16) NOT NULL DEFAULT '',
                    final_result VARCHAR(16) NOT NULL,
                    filter_results TEXT,
                    response_time_ms BIGINT NOT NULL DEFAULT 0,
                    cache_hit BIGINT NOT NULL DEFAULT 0,
                    user_id VARCHAR(255),
                    session_id VARCHAR(255),
                    client_ip VARCHAR(45),
                    raw_user_agent VARCHAR(1024),
                    INDEX idx_timestamp (timestamp),
                    INDEX idx_final_result (final_result)
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS relationships (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    relationship_type VARCHAR(32) NOT NULL,
                    tuple_key CHAR(64) NOT NULL,
                    ip VARCHAR(45) NOT NULL DEFAULT '',
                    email VARCHAR(254) NOT NULL DEFAULT '',
                    user_agent VARCHAR(500) NOT NULL DEFAULT '',
                    username VARCHAR(100) NOT NULL DEFAULT '',
                    country VARCHAR(8) NOT NULL DEFAULT '',
                    charset VARCHAR(32) NOT NULL DEFAULT '',
                    frequency BIGINT NOT NULL DEFAULT 1,
                    first_seen BIGINT NOT NULL,
                    last_seen BIGINT NOT NULL,
                    UNIQUE KEY uq_relationship (relationship_type, tuple_key),
                    INDEX idx_last_seen (last_seen)
                )"
                .to_string(),
                "CREATE TABLE IF NOT EXISTS rollups (
                    aggregation_date BIGINT NOT NULL,
                    aggregation_type VARCHAR(16) NOT NULL,
                    total_requests BIGINT NOT NULL,
                    allowed_requests BIGINT NOT NULL,
                    denied_requests BIGINT NOT NULL,
                    whitelisted_requests BIGINT NOT NULL,
                    timeout_requests BIGINT NOT NULL,
                    error_requests BIGINT NOT NULL,
                    avg_response_time_ms DOUBLE NOT NULL,
                    cache_hit_rate DOUBLE NOT NULL,
                    top_ips TEXT,
                    top_emails TEXT,
                    top_user_agents TEXT,
                    top_usernames TEXT,
                    top_countries TEXT,
                    top_charsets TEXT,
                    top_relationships TEXT,
                    created_at BIGINT NOT NULL,
                    PRIMARY KEY (aggregation_date, aggregation_type)
                )"
                .to_string(),
            ]);
        }
        statements
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in self.schema() {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(&sql).execute(&self.pool).await.map_err(backend_err)
            })
            .await?;
        }
        Ok(())
    }

    fn stored_rule(kind: EntityKind, row: &AnyRow) -> Result<StoredRule, StorageError> {
        let attributes: serde_json::Value = serde_json::from_str(&text(row, "attributes"))?;
        Ok(StoredRule {
            rule: Rule::from_document(kind, attributes)?,
            created_at: from_millis(int(row, "created_at")),
            updated_at: from_millis(int(row, "updated_at")),
        })
    }

    fn traffic_log(row: &AnyRow) -> Result<TrafficLog, StorageError> {
        let request_id = Uuid::parse_str(&text(row, "request_id"))
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let final_result: FinalResult = text(row, "final_result")
            .parse()
            .map_err(StorageError::Serialization)?;
        Ok(TrafficLog {
            id: Some(int(row, "id")),
            request_id,
            timestamp: from_millis(int(row, "timestamp")),
            attributes: tuple_from_row(row),
            asn: text(row, "asn"),
            final_result,
            filter_results: json(row, "filter_results")?,
            response_time_ms: u64::try_from(int(row, "response_time_ms")).unwrap_or(0),
            cache_hit: int(row, "cache_hit") != 0,
            metadata: RequestMetadata {
                user_id: opt_text(row, "user_id"),
                session_id: opt_text(row, "session_id"),
                client_ip: opt_text(row, "client_ip"),
                raw_user_agent: opt_text(row, "raw_user_agent"),
            },
        })
    }

    fn relationship(row: &AnyRow) -> Relationship {
        Relationship {
            relationship_type: text(row, "relationship_type"),
            attributes: tuple_from_row(row),
            frequency: u64::try_from(int(row, "frequency")).unwrap_or(0),
            first_seen: from_millis(int(row, "first_seen")),
            last_seen: from_millis(int(row, "last_seen")),
        }
    }

    fn rollup(row: &AnyRow) -> Result<Rollup, StorageError> {
        let count = |c: &str| u64::try_from(int(row, c)).unwrap_or(0);
        let aggregation_type: RollupType = text(row, "aggregation_type")
            .parse()
            .map_err(StorageError::Serialization)?;
        Ok(Rollup {
            aggregation_date: from_millis(int(row, "aggregation_date")),
            aggregation_type,
            total_requests: count("total_requests"),
            allowed_requests: count("allowed_requests"),
            denied_requests: count("denied_requests"),
            whitelisted_requests: count("whitelisted_requests"),
            timeout_requests: count("timeout_requests"),
            error_requests: count("error_requests"),
            avg_response_time_ms: float(row, "avg_response_time_ms"),
            cache_hit_rate: float(row, "cache_hit_rate"),
            top_ips: json(row, "top_ips")?,
            top_emails: json(row, "top_emails")?,
            top_user_agents: json(row, "top_user_agents")?,
            top_usernames: json(row, "top_usernames")?,
            top_countries: json(row, "top_countries")?,
            top_charsets: json(row, "top_charsets")?,
            top_relationships: json(row, "top_relationships")?,
            created_at: from_millis(int(row, "created_at")),
        })
    }

    async fn count(&self, table: &str, filter: &ListFilter) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}{}", table, filter.sql());
        let row = bind_args(sqlx::query(&sql), &filter.args)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(u64::try_from(int(&row, "total")).unwrap_or(0))
    }

    async fn fetch_page(
        &self,
        columns: &str,
        table: &str,
        filter: &ListFilter,
        order: &str,
        query: &TrafficQuery,
    ) -> Result<Vec<AnyRow>, StorageError> {
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} LIMIT ? OFFSET ?",
            columns,
            table,
            filter.sql(),
            order
        );
        bind_args(sqlx::query(&sql), &filter.args)
            .bind(i64::from(query.limit))
            .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)
    }
}

#[async_trait]
impl RuleStore for SqlStore {
    async fn upsert_rule(&self, rule: &Rule) -> Result<StoredRule, StorageError> {
        let kind = rule.kind();
        let table = kind.table_name();
        let key = rule.natural_key().to_string();
        let attributes = serde_json::to_string(&rule.document())?;
        let now = to_millis(Utc::now());

        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {table} (natural_key, status, attributes, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(natural_key) DO UPDATE SET
                    status = excluded.status,
                    attributes = excluded.attributes,
                    updated_at = excluded.updated_at"
            )
        } else {
            format!(
                "INSERT INTO {table} (natural_key, status, attributes, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    status = VALUES(status),
                    attributes = VALUES(attributes),
                    updated_at = VALUES(updated_at)"
            )
        };

        retry("sql_upsert_rule", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&key)
                .bind(rule.status().as_str())
                .bind(&attributes)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;

        self.get_rule(kind, &key).await?.ok_or(StorageError::NotFound)
    }

    async fn delete_rule(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        let sql = format!("DELETE FROM {} WHERE natural_key = ?", kind.table_name());
        let result = retry("sql_delete_rule", &RetryConfig::query(), || async {
            sqlx::query(&sql).bind(key).execute(&self.pool).await.map_err(backend_err)
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_rule(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRule>, StorageError> {
        let sql = format!(
            "SELECT attributes, created_at, updated_at FROM {} WHERE natural_key = ?",
            kind.table_name()
        );
        let row = retry("sql_get_rule", &RetryConfig::query(), || async {
            sqlx::query(&sql).bind(key).fetch_optional(&self.pool).await.map_err(backend_err)
        })
        .await?;
        row.map(|r| Self::stored_rule(kind, &r)).transpose()
    }

    async fn scan_updated_since(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredRule>, StorageError> {
        let sql = format!(
            "SELECT attributes, created_at, updated_at FROM {} \
             WHERE updated_at > ? OR created_at > ? ORDER BY updated_at",
            kind.table_name()
        );
        let since = to_millis(since);
        let rows = retry("sql_scan_updated", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(since)
                .bind(since)
                .fetch_all(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        debug!(kind = %kind, rows = rows.len(), "Scanned updated rules");
        rows.iter().map(|r| Self::stored_rule(kind, r)).collect()
    }

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<StoredRule>, StorageError> {
        let sql = format!(
            "SELECT attributes, created_at, updated_at FROM {} ORDER BY natural_key",
            kind.table_name()
        );
        let rows = retry("sql_scan_all", &RetryConfig::query(), || async {
            sqlx::query(&sql).fetch_all(&self.pool).await.map_err(backend_err)
        })
        .await?;
        rows.iter().map(|r| Self::stored_rule(kind, r)).collect()
    }

    async fn count_rules(&self, kind: EntityKind) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", kind.table_name());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await.map_err(backend_err)?;
        Ok(u64::try_from(int(&row, "total")).unwrap_or(0))
    }
}

#[async_trait]
impl SyncStateStore for SqlStore {
    async fn get_watermark(&self, kind: EntityKind) -> Result<Option<DateTime<Utc>>, StorageError> {
        let row = sqlx::query("SELECT last_sync FROM sync_state WHERE data_type = ?")
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.map(|r| from_millis(int(&r, "last_sync"))))
    }

    async fn advance_watermark(&self, kind: EntityKind, at: DateTime<Utc>) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_state (data_type, last_sync) VALUES (?, ?)
             ON CONFLICT(data_type) DO UPDATE SET last_sync = MAX(last_sync, excluded.last_sync)"
        } else {
            "INSERT INTO sync_state (data_type, last_sync) VALUES (?, ?)
             ON DUPLICATE KEY UPDATE last_sync = GREATEST(last_sync, VALUES(last_sync))"
        };
        let at = to_millis(at);
        retry("sql_advance_watermark", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(kind.as_str())
                .bind(at)
                .execute(&self.pool)
                .await
                .map_err(backend_err)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TrafficStore for SqlStore {
    async fn insert_log(&self, log: &TrafficLog) -> Result<i64, StorageError> {
        let a = &log.attributes;
        let filter_results = serde_json::to_string(&log.filter_results)?;
        let sql = format!(
            "INSERT INTO traffic_logs ({}) VALUES (NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            LOG_COLUMNS
        );
        let result = sqlx::query(&sql)
            .bind(log.request_id.to_string())
            .bind(to_millis(log.timestamp))
            .bind(&a.ip)
            .bind(&a.email)
            .bind(&a.user_agent)
            .bind(&a.username)
            .bind(&a.country)
            .bind(&a.charset)
            .bind(&log.asn)
            .bind(log.final_result.as_str())
            .bind(filter_results)
            .bind(i64::try_from(log.response_time_ms).unwrap_or(i64::MAX))
            .bind(i64::from(log.cache_hit))
            .bind(log.metadata.user_id.clone())
            .bind(log.metadata.session_id.clone())
            .bind(log.metadata.client_ip.clone())
            .bind(log.metadata.raw_user_agent.clone())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.last_insert_id().unwrap_or_default())
    }

    async fn upsert_relationship(
        &self,
        relationship_type: &str,
        attributes: &AttributeTuple,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO relationships
                (relationship_type, tuple_key, ip, email, user_agent, username, country, charset, frequency, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(relationship_type, tuple_key) DO UPDATE SET
                frequency = frequency + 1,
                last_seen = excluded.last_seen"
        } else {
            "INSERT INTO relationships
                (relationship_type, tuple_key, ip, email, user_agent, username, country, charset, frequency, first_seen, last_seen)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON DUPLICATE KEY UPDATE
                frequency = frequency + 1,
                last_seen = VALUES(last_seen)"
        };
        let seen = to_millis(seen_at);
        sqlx::query(sql)
            .bind(relationship_type)
            .bind(attributes.digest())
            .bind(&attributes.ip)
            .bind(&attributes.email)
            .bind(&attributes.user_agent)
            .bind(&attributes.username)
            .bind(&attributes.country)
            .bind(&attributes.charset)
            .bind(seen)
            .bind(seen)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn logs_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<TrafficLog>, StorageError> {
        let sql = format!(
            "SELECT {} FROM traffic_logs WHERE timestamp >= ? AND timestamp < ? ORDER BY id",
            LOG_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(start))
            .bind(to_millis(end))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(Self::traffic_log).collect()
    }

    async fn relationships_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Relationship>, StorageError> {
        let sql = format!(
            "SELECT {} FROM relationships WHERE last_seen >= ? AND last_seen < ? ORDER BY id",
            RELATIONSHIP_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(to_millis(start))
            .bind(to_millis(end))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(rows.iter().map(Self::relationship).collect())
    }

    async fn rollup_exists(&self, date: DateTime<Utc>, aggregation_type: RollupType) -> Result<bool, StorageError> {
        let row = sqlx::query("SELECT 1 AS found FROM rollups WHERE aggregation_date = ? AND aggregation_type = ?")
            .bind(to_millis(date))
            .bind(aggregation_type.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(row.is_some())
    }

    async fn insert_rollup(&self, rollup: &Rollup) -> Result<bool, StorageError> {
        let verb = if self.is_sqlite { "INSERT OR IGNORE" } else { "INSERT IGNORE" };
        let sql = format!(
            "{} INTO rollups ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            verb, ROLLUP_COLUMNS
        );
        let count = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        let result = sqlx::query(&sql)
            .bind(to_millis(rollup.aggregation_date))
            .bind(rollup.aggregation_type.as_str())
            .bind(count(rollup.total_requests))
            .bind(count(rollup.allowed_requests))
            .bind(count(rollup.denied_requests))
            .bind(count(rollup.whitelisted_requests))
            .bind(count(rollup.timeout_requests))
            .bind(count(rollup.error_requests))
            .bind(rollup.avg_response_time_ms)
            .bind(rollup.cache_hit_rate)
            .bind(serde_json::to_string(&rollup.top_ips)?)
            .bind(serde_json::to_string(&rollup.top_emails)?)
            .bind(serde_json::to_string(&rollup.top_user_agents)?)
            .bind(serde_json::to_string(&rollup.top_usernames)?)
            .bind(serde_json::to_string(&rollup.top_countries)?)
            .bind(serde_json::to_string(&rollup.top_charsets)?)
            .bind(serde_json::to_string(&rollup.top_relationships)?)
            .bind(to_millis(rollup.created_at))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM traffic_logs WHERE timestamp < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    async fn delete_relationships_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM relationships WHERE last_seen < ?")
            .bind(to_millis(cutoff))
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(result.rows_affected())
    }

    async fn list_logs(&self, query: &TrafficQuery) -> Result<Page<TrafficLog>, StorageError> {
        let mut search_columns = TUPLE_COLUMNS.to_vec();
        search_columns.push("asn");
        let filter = ListFilter::new(query, "final_result", "timestamp", &search_columns);
        let dir = direction(query.descending);
        let order = format!("{} {}, id {}", query.order_column(QueryTarget::TrafficLogs), dir, dir);

        let total = self.count("traffic_logs", &filter).await?;
        let rows = self.fetch_page(LOG_COLUMNS, "traffic_logs", &filter, &order, query).await?;
        let items = rows.iter().map(Self::traffic_log).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total, page: query.page, limit: query.limit })
    }

    async fn list_relationships(&self, query: &TrafficQuery) -> Result<Page<Relationship>, StorageError> {
        let filter = ListFilter::new(query, "relationship_type", "last_seen", &TUPLE_COLUMNS);
        let dir = direction(query.descending);
        let order = format!("{} {}, id {}", query.order_column(QueryTarget::Relationships), dir, dir);

        let total = self.count("relationships", &filter).await?;
        let rows = self.fetch_page(RELATIONSHIP_COLUMNS, "relationships", &filter, &order, query).await?;
        Ok(Page { items: rows.iter().map(Self::relationship).collect(), total, page: query.page, limit: query.limit })
    }

    async fn list_rollups(&self, query: &TrafficQuery) -> Result<Page<Rollup>, StorageError> {
        let filter = ListFilter::new(query, "aggregation_type", "aggregation_date", &[]);
        let order = format!(
            "{} {}",
            query.order_column(QueryTarget::Rollups),
            direction(query.descending)
        );

        let total = self.count("rollups", &filter).await?;
        let rows = self.fetch_page(ROLLUP_COLUMNS, "rollups", &filter, &order, query).await?;
        let items = rows.iter().map(Self::rollup).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total, page: query.page, limit: query.limit })
    }
}
