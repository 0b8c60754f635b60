//! Paginated admin queries over traffic logs, relationships and rollups.
//!
//! Results are cached under `{target}:list:{page}:{limit}:{search}:{status}`
//! for two minutes; summaries under `{target}:stats:{window_secs}` for
//! thirty seconds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::analytics::{summarize, top_values};
use super::model::{Page, Relationship, Rollup, TopEntry, TrafficLog};
use crate::cache::{self, SharedCache};
use crate::config::CachingConfig;
use crate::storage::traits::{StorageError, TrafficStore};

pub const MAX_LIMIT: u32 = 1000;

/// Which table a query targets. Also the cache key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryTarget {
    TrafficLogs,
    Relationships,
    Rollups,
}

impl QueryTarget {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TrafficLogs => "traffic_logs",
            Self::Relationships => "relationships",
            Self::Rollups => "rollups",
        }
    }

    /// Columns a query may order by. The first is the default.
    #[must_use]
    pub const fn orderable(self) -> &'static [&'static str] {
        match self {
            Self::TrafficLogs => &[
                "timestamp", "response_time_ms", "final_result", "ip", "email", "country", "username",
            ],
            Self::Relationships => &["frequency", "last_seen", "first_seen", "relationship_type"],
            Self::Rollups => &["aggregation_date", "total_requests", "denied_requests"],
        }
    }
}

/// Validated list query.
///
/// `status` filters on `final_result` for logs, `relationship_type` for
/// relationships and `aggregation_type` for rollups. `search` is a
/// substring match over the attribute columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default = "default_descending")]
    pub descending: bool,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

fn default_descending() -> bool { true }

impl Default for TrafficQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            search: None,
            status: None,
            order_by: None,
            descending: true,
            since: None,
            until: None,
        }
    }
}

impl TrafficQuery {
    #[must_use]
    pub fn page(page: u32, limit: u32) -> Self {
        Self { page, limit, ..Self::default() }
    }

    #[must_use]
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn ordered_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(column.into());
        self.descending = descending;
        self
    }

    pub fn validate(&self, target: QueryTarget) -> Result<(), String> {
        if self.page < 1 {
            return Err("page must be >= 1".into());
        }
        if self.limit < 1 || self.limit > MAX_LIMIT {
            return Err(format!("limit must be between 1 and {}", MAX_LIMIT));
        }
        if let Some(col) = &self.order_by {
            if !target.orderable().contains(&col.as_str()) {
                return Err(format!("cannot order {} by '{}'", target.as_str(), col));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err("since must not be after until".into());
            }
        }
        Ok(())
    }

    /// Validated column to order by.
    #[must_use]
    pub fn order_column(&self, target: QueryTarget) -> &str {
        self.order_by
            .as_deref()
            .filter(|c| target.orderable().contains(c))
            .unwrap_or(target.orderable()[0])
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.limit)
    }

    #[must_use]
    pub fn cache_key(&self, target: QueryTarget) -> String {
        let mut search = self.search.clone().unwrap_or_default();
        // Ordering and time bounds are part of the result set too
        if self.order_by.is_some() || self.since.is_some() || self.until.is_some() || !self.descending {
            search = format!(
                "{}|{}|{}|{}|{}",
                search,
                self.order_column(target),
                self.descending,
                self.since.map(|t| t.timestamp_millis()).unwrap_or_default(),
                self.until.map(|t| t.timestamp_millis()).unwrap_or_default(),
            );
        }
        cache::list_key(
            target.as_str(),
            self.page,
            self.limit,
            &search,
            self.status.as_deref().unwrap_or(""),
        )
    }

    /// Whether a substring search matches any of `values`.
    #[must_use]
    pub fn search_matches<'a>(&self, values: impl IntoIterator<Item = &'a str>) -> bool {
        match self.search.as_deref().filter(|s| !s.is_empty()) {
            None => true,
            Some(needle) => values.into_iter().any(|v| v.contains(needle)),
        }
    }

    #[must_use]
    pub fn in_window(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at < u)
    }
}

/// Outcome totals over a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficSummary {
    pub total_requests: u64,
    pub by_result: BTreeMap<String, u64>,
    pub avg_response_time_ms: f64,
    pub cache_hit_rate: f64,
}

/// Cached read surface for admin handlers.
pub struct TrafficQueries {
    store: Arc<dyn TrafficStore>,
    cache: SharedCache,
    caching: CachingConfig,
}

impl TrafficQueries {
    #[must_use]
    pub fn new(store: Arc<dyn TrafficStore>, cache: SharedCache, caching: CachingConfig) -> Self {
        Self { store, cache, caching }
    }

    #[instrument(skip(self))]
    pub async fn list_traffic_logs(&self, query: &TrafficQuery) -> Result<Page<TrafficLog>, StorageError> {
        self.cached_list(QueryTarget::TrafficLogs, query, || self.store.list_logs(query)).await
    }

    #[instrument(skip(self))]
    pub async fn list_relationships(&self, query: &TrafficQuery) -> Result<Page<Relationship>, StorageError> {
        self.cached_list(QueryTarget::Relationships, query, || self.store.list_relationships(query)).await
    }

    #[instrument(skip(self))]
    pub async fn list_rollups(&self, query: &TrafficQuery) -> Result<Page<Rollup>, StorageError> {
        self.cached_list(QueryTarget::Rollups, query, || self.store.list_rollups(query)).await
    }

    /// Top `limit` values of an attribute (`ip`, `email`, ...) in a window.
    pub async fn top_values(
        &self,
        field: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TopEntry>, StorageError> {
        let key = cache::list_key(
            QueryTarget::TrafficLogs.as_str(),
            1,
            u32::try_from(limit).unwrap_or(u32::MAX),
            &format!("top:{}:{}:{}", field, since.timestamp(), until.timestamp()),
            "",
        );
        if let Some(hit) = cache::get_json(self.cache.as_ref(), &key).await {
            return Ok(hit);
        }
        let logs = self.store.logs_between(since, until).await?;
        let top = top_values(&logs, field, limit);
        cache::set_json(self.cache.as_ref(), &key, &top, self.caching.list_ttl()).await;
        Ok(top)
    }

    /// Totals over the last `window`, cached per window length.
    pub async fn summary(&self, window: chrono::Duration) -> Result<TrafficSummary, StorageError> {
        let key = summary_key(window);
        if let Some(hit) = cache::get_json(self.cache.as_ref(), &key).await {
            return Ok(hit);
        }
        let until = Utc::now();
        let logs = self.store.logs_between(until - window, until).await?;
        let summary = summarize(&logs);
        cache::set_json(self.cache.as_ref(), &key, &summary, self.caching.stats_ttl()).await;
        Ok(summary)
    }

    async fn cached_list<T, F, Fut>(
        &self,
        target: QueryTarget,
        query: &TrafficQuery,
        fetch: F,
    ) -> Result<Page<T>, StorageError>
    where
        T: Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Page<T>, StorageError>>,
    {
        query.validate(target).map_err(StorageError::InvalidQuery)?;
        let key = query.cache_key(target);
        if let Some(hit) = cache::get_json(self.cache.as_ref(), &key).await {
            return Ok(hit);
        }
        let page = fetch().await?;
        cache::set_json(self.cache.as_ref(), &key, &page, self.caching.list_ttl()).await;
        Ok(page)
    }
}

fn summary_key(window: chrono::Duration) -> String {
    format!("{}:{}", cache::stats_key(QueryTarget::TrafficLogs.as_str()), window.num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::storage::memory::InMemoryStore;
    use crate::traffic::model::{AttributeTuple, FinalResult, RequestMetadata};
    use uuid::Uuid;

    fn log_at(at: DateTime<Utc>) -> TrafficLog {
        TrafficLog {
            id: None,
            request_id: Uuid::new_v4(),
            timestamp: at,
            attributes: AttributeTuple { ip: "1.2.3.4".into(), ..Default::default() },
            asn: String::new(),
            final_result: FinalResult::Denied,
            filter_results: serde_json::json!({}),
            response_time_ms: 4,
            cache_hit: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_summary_cached_per_window() {
        let store = Arc::new(InMemoryStore::new());
        store.insert_log(&log_at(Utc::now() - chrono::Duration::hours(2))).await.unwrap();
        let queries = TrafficQueries::new(store, Arc::new(MemoryCache::new()), CachingConfig::default());

        let last_hour = queries.summary(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(last_hour.total_requests, 0);

        let last_day = queries.summary(chrono::Duration::hours(24)).await.unwrap();
        assert_eq!(last_day.total_requests, 1);

        assert_eq!(summary_key(chrono::Duration::hours(1)), "traffic_logs:stats:3600");
        assert!(cache::matches_type(&summary_key(chrono::Duration::hours(24)), "traffic_logs"));
    }

    #[test]
    fn test_validate_bounds() {
        assert!(TrafficQuery::page(1, 1).validate(QueryTarget::TrafficLogs).is_ok());
        assert!(TrafficQuery::page(1, 1000).validate(QueryTarget::TrafficLogs).is_ok());
        assert!(TrafficQuery::page(0, 10).validate(QueryTarget::TrafficLogs).is_err());
        assert!(TrafficQuery::page(1, 0).validate(QueryTarget::TrafficLogs).is_err());
        assert!(TrafficQuery::page(1, 1001).validate(QueryTarget::TrafficLogs).is_err());
    }

    #[test]
    fn test_validate_order_column() {
        let q = TrafficQuery::page(1, 10).ordered_by("frequency", true);
        assert!(q.validate(QueryTarget::Relationships).is_ok());
        assert!(q.validate(QueryTarget::TrafficLogs).is_err());

        let q = TrafficQuery::page(1, 10).ordered_by("1; DROP TABLE traffic_logs", true);
        assert!(q.validate(QueryTarget::TrafficLogs).is_err());
        assert_eq!(q.order_column(QueryTarget::TrafficLogs), "timestamp");
    }

    #[test]
    fn test_offset() {
        assert_eq!(TrafficQuery::page(1, 50).offset(), 0);
        assert_eq!(TrafficQuery::page(3, 50).offset(), 100);
    }

    #[test]
    fn test_cache_key() {
        let q = TrafficQuery::page(2, 25).with_search("1.2").with_status("denied");
        assert_eq!(q.cache_key(QueryTarget::TrafficLogs), "traffic_logs:list:2:25:1.2:denied");

        let plain = TrafficQuery::page(1, 10);
        let ordered = TrafficQuery::page(1, 10).ordered_by("ip", false);
        assert_ne!(
            plain.cache_key(QueryTarget::TrafficLogs),
            ordered.cache_key(QueryTarget::TrafficLogs)
        );
    }

    #[test]
    fn test_search_matches() {
        let q = TrafficQuery::page(1, 10).with_search("gmail");
        assert!(q.search_matches(["1.2.3.4", "a@gmail.com"]));
        assert!(!q.search_matches(["1.2.3.4", "a@yahoo.com"]));
        assert!(TrafficQuery::page(1, 10).search_matches(["x"]));
    }
}
