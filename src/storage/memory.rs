//! In-memory authoritative store.
//!
//! Implements every store trait for single-process deployments and tests.
//! Rules and watermarks live in `DashMap`s; traffic tables are append-mostly
//! vectors behind `parking_lot` mutexes so insertion order is preserved.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::traits::{RuleStore, StorageError, SyncStateStore, TrafficStore};
use crate::rule::{EntityKind, Rule, StoredRule};
use crate::traffic::model::{AttributeTuple, Page, Relationship, Rollup, RollupType, TrafficLog};
use crate::traffic::query::{QueryTarget, TrafficQuery};

#[derive(Default)]
struct RelationshipTable {
    rows: Vec<Relationship>,
    by_key: HashMap<(String, AttributeTuple), usize>,
}

impl RelationshipTable {
    fn reindex(&mut self) {
        self.by_key = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| ((r.relationship_type.clone(), r.attributes.clone()), i))
            .collect();
    }
}

pub struct InMemoryStore {
    rules: DashMap<(EntityKind, String), StoredRule>,
    watermarks: DashMap<EntityKind, DateTime<Utc>>,
    logs: Mutex<Vec<TrafficLog>>,
    next_log_id: AtomicI64,
    relationships: Mutex<RelationshipTable>,
    rollups: Mutex<Vec<Rollup>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            watermarks: DashMap::new(),
            logs: Mutex::new(Vec::new()),
            next_log_id: AtomicI64::new(1),
            relationships: Mutex::new(RelationshipTable::default()),
            rollups: Mutex::new(Vec::new()),
        }
    }

    /// Insert a rule row with explicit timestamps (seeding and tests).
    pub fn put_stored(&self, stored: StoredRule) {
        let key = (stored.rule.kind(), stored.rule.natural_key().to_string());
        self.rules.insert(key, stored);
    }

    /// Append a log row as-is, keeping its timestamp (seeding and tests).
    pub fn push_log(&self, mut log: TrafficLog) -> i64 {
        let id = self.next_log_id.fetch_add(1, Ordering::Relaxed);
        log.id = Some(id);
        self.logs.lock().push(log);
        id
    }

    #[must_use]
    pub fn log_count(&self) -> usize {
        self.logs.lock().len()
    }

    #[must_use]
    pub fn rollup_count(&self) -> usize {
        self.rollups.lock().len()
    }

    #[must_use]
    pub fn relationship_count(&self) -> usize {
        self.relationships.lock().rows.len()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T: Clone>(items: &[T], query: &TrafficQuery) -> Page<T> {
    let total = items.len() as u64;
    let start = usize::try_from(query.offset()).unwrap_or(usize::MAX).min(items.len());
    let end = start.saturating_add(query.limit as usize).min(items.len());
    Page { items: items[start..end].to_vec(), total, page: query.page, limit: query.limit }
}

fn directed(ord: CmpOrdering, descending: bool) -> CmpOrdering {
    if descending { ord.reverse() } else { ord }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn upsert_rule(&self, rule: &Rule) -> Result<StoredRule, StorageError> {
        let now = Utc::now();
        let key = (rule.kind(), rule.natural_key().to_string());
        let created_at = self.rules.get(&key).map_or(now, |r| r.created_at);
        let stored = StoredRule { rule: rule.clone(), created_at, updated_at: now };
        self.rules.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete_rule(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        Ok(self.rules.remove(&(kind, key.to_string())).is_some())
    }

    async fn get_rule(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRule>, StorageError> {
        Ok(self.rules.get(&(kind, key.to_string())).map(|r| r.value().clone()))
    }

    async fn scan_updated_since(
        &self,
        kind: EntityKind,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredRule>, StorageError> {
        let mut rows: Vec<StoredRule> = self
            .rules
            .iter()
            .filter(|r| r.key().0 == kind && (r.updated_at > since || r.created_at > since))
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by_key(|r| r.updated_at);
        Ok(rows)
    }

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<StoredRule>, StorageError> {
        let mut rows: Vec<StoredRule> = self
            .rules
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| r.value().clone())
            .collect();
        rows.sort_by(|a, b| a.rule.natural_key().cmp(b.rule.natural_key()));
        Ok(rows)
    }

    async fn count_rules(&self, kind: EntityKind) -> Result<u64, StorageError> {
        Ok(self.rules.iter().filter(|r| r.key().0 == kind).count() as u64)
    }
}

#[async_trait]
impl SyncStateStore for InMemoryStore {
    async fn get_watermark(&self, kind: EntityKind) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.watermarks.get(&kind).map(|w| *w))
    }

    async fn advance_watermark(&self, kind: EntityKind, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.watermarks
            .entry(kind)
            .and_modify(|w| {
                if at > *w {
                    *w = at;
                }
            })
            .or_insert(at);
        Ok(())
    }
}

#[async_trait]
impl TrafficStore for InMemoryStore {
    async fn insert_log(&self, log: &TrafficLog) -> Result<i64, StorageError> {
        Ok(self.push_log(log.clone()))
    }

    async fn upsert_relationship(
        &self,
        relationship_type: &str,
        attributes: &AttributeTuple,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut table = self.relationships.lock();
        let key = (relationship_type.to_string(), attributes.clone());
        if let Some(&idx) = table.by_key.get(&key) {
            let row = &mut table.rows[idx];
            row.frequency += 1;
            row.last_seen = seen_at;
        } else {
            let idx = table.rows.len();
            table.rows.push(Relationship {
                relationship_type: relationship_type.to_string(),
                attributes: attributes.clone(),
                frequency: 1,
                first_seen: seen_at,
                last_seen: seen_at,
            });
            table.by_key.insert(key, idx);
        }
        Ok(())
    }

    async fn logs_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<TrafficLog>, StorageError> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|l| l.timestamp >= start && l.timestamp < end)
            .cloned()
            .collect())
    }

    async fn relationships_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Relationship>, StorageError> {
        Ok(self
            .relationships
            .lock()
            .rows
            .iter()
            .filter(|r| r.last_seen >= start && r.last_seen < end)
            .cloned()
            .collect())
    }

    async fn rollup_exists(&self, date: DateTime<Utc>, aggregation_type: RollupType) -> Result<bool, StorageError> {
        Ok(self
            .rollups
            .lock()
            .iter()
            .any(|r| r.aggregation_date == date && r.aggregation_type == aggregation_type))
    }

    async fn insert_rollup(&self, rollup: &Rollup) -> Result<bool, StorageError> {
        let mut rollups = self.rollups.lock();
        let exists = rollups
            .iter()
            .any(|r| r.aggregation_date == rollup.aggregation_date && r.aggregation_type == rollup.aggregation_type);
        if exists {
            return Ok(false);
        }
        rollups.push(rollup.clone());
        Ok(true)
    }

    async fn delete_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut logs = self.logs.lock();
        let before = logs.len();
        logs.retain(|l| l.timestamp >= cutoff);
        Ok((before - logs.len()) as u64)
    }

    async fn delete_relationships_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut table = self.relationships.lock();
        let before = table.rows.len();
        table.rows.retain(|r| r.last_seen >= cutoff);
        let removed = before - table.rows.len();
        if removed > 0 {
            table.reindex();
        }
        Ok(removed as u64)
    }

    async fn list_logs(&self, query: &TrafficQuery) -> Result<Page<TrafficLog>, StorageError> {
        let mut rows: Vec<TrafficLog> = self
            .logs
            .lock()
            .iter()
            .filter(|l| query.status.as_deref().map_or(true, |s| l.final_result.as_str() == s))
            .filter(|l| query.in_window(l.timestamp))
            .filter(|l| {
                let a = &l.attributes;
                query.search_matches([
                    a.ip.as_str(), a.email.as_str(), a.user_agent.as_str(),
                    a.username.as_str(), a.country.as_str(), a.charset.as_str(), l.asn.as_str(),
                ])
            })
            .cloned()
            .collect();

        let column = query.order_column(QueryTarget::TrafficLogs).to_string();
        rows.sort_by(|a, b| {
            let ord = match column.as_str() {
                "response_time_ms" => a.response_time_ms.cmp(&b.response_time_ms),
                "final_result" => a.final_result.as_str().cmp(b.final_result.as_str()),
                "ip" | "email" | "country" | "username" => {
                    a.attributes.get(&column).cmp(b.attributes.get(&column))
                }
                _ => a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)),
            };
            directed(ord, query.descending)
        });
        Ok(paginate(&rows, query))
    }

    async fn list_relationships(&self, query: &TrafficQuery) -> Result<Page<Relationship>, StorageError> {
        let mut rows: Vec<Relationship> = self
            .relationships
            .lock()
            .rows
            .iter()
            .filter(|r| query.status.as_deref().map_or(true, |s| r.relationship_type == s))
            .filter(|r| query.in_window(r.last_seen))
            .filter(|r| {
                let a = &r.attributes;
                query.search_matches([
                    a.ip.as_str(), a.email.as_str(), a.user_agent.as_str(),
                    a.username.as_str(), a.country.as_str(), a.charset.as_str(),
                ])
            })
            .cloned()
            .collect();

        let column = query.order_column(QueryTarget::Relationships);
        rows.sort_by(|a, b| {
            let ord = match column {
                "last_seen" => a.last_seen.cmp(&b.last_seen),
                "first_seen" => a.first_seen.cmp(&b.first_seen),
                "relationship_type" => a.relationship_type.cmp(&b.relationship_type),
                _ => a.frequency.cmp(&b.frequency),
            };
            directed(ord, query.descending)
        });
        Ok(paginate(&rows, query))
    }

    async fn list_rollups(&self, query: &TrafficQuery) -> Result<Page<Rollup>, StorageError> {
        let mut rows: Vec<Rollup> = self
            .rollups
            .lock()
            .iter()
            .filter(|r| query.status.as_deref().map_or(true, |s| r.aggregation_type.as_str() == s))
            .filter(|r| query.in_window(r.aggregation_date))
            .cloned()
            .collect();

        let column = query.order_column(QueryTarget::Rollups);
        rows.sort_by(|a, b| {
            let ord = match column {
                "total_requests" => a.total_requests.cmp(&b.total_requests),
                "denied_requests" => a.denied_requests.cmp(&b.denied_requests),
                _ => a.aggregation_date.cmp(&b.aggregation_date),
            };
            directed(ord, query.descending)
        });
        Ok(paginate(&rows, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::RuleStatus;
    use crate::traffic::model::{FinalResult, RequestMetadata};
    use chrono::Duration;
    use uuid::Uuid;

    fn log_at(ip: &str, result: FinalResult, at: DateTime<Utc>) -> TrafficLog {
        TrafficLog {
            id: None,
            request_id: Uuid::new_v4(),
            timestamp: at,
            attributes: AttributeTuple { ip: ip.into(), ..Default::default() },
            asn: String::new(),
            final_result: result,
            filter_results: serde_json::json!({}),
            response_time_ms: 3,
            cache_hit: false,
            metadata: RequestMetadata::default(),
        }
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at() {
        let store = InMemoryStore::new();
        let first = store.upsert_rule(&Rule::ip("1.2.3.4", RuleStatus::Denied)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.upsert_rule(&Rule::ip("1.2.3.4", RuleStatus::Allowed)).await.unwrap();

        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(store.count_rules(EntityKind::Ip).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_updated_since() {
        let store = InMemoryStore::new();
        let old = Utc::now() - Duration::hours(1);
        store.put_stored(StoredRule {
            rule: Rule::email("old@x.com", RuleStatus::Denied),
            created_at: old,
            updated_at: old,
        });
        store.upsert_rule(&Rule::email("new@x.com", RuleStatus::Denied)).await.unwrap();

        let rows = store
            .scan_updated_since(EntityKind::Email, Utc::now() - Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule.natural_key(), "new@x.com");
        assert_eq!(store.scan_all(EntityKind::Email).await.unwrap().len(), 2);
        assert!(store.scan_all(EntityKind::Ip).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watermark_never_moves_back() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.advance_watermark(EntityKind::Ip, now).await.unwrap();
        store.advance_watermark(EntityKind::Ip, now - Duration::minutes(1)).await.unwrap();
        assert_eq!(store.get_watermark(EntityKind::Ip).await.unwrap(), Some(now));
        assert_eq!(store.get_watermark(EntityKind::Asn).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_relationship_upsert_counts() {
        let store = InMemoryStore::new();
        let tuple = AttributeTuple { ip: "1.1.1.1".into(), email: "a@b.c".into(), ..Default::default() };
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);
        store.upsert_relationship("ip_email", &tuple, t0).await.unwrap();
        store.upsert_relationship("ip_email", &tuple, t1).await.unwrap();

        let rows = store.relationships_between(t0, t1 + Duration::seconds(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].frequency, 2);
        assert_eq!(rows[0].first_seen, t0);
        assert_eq!(rows[0].last_seen, t1);
    }

    #[tokio::test]
    async fn test_retention_deletes() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.push_log(log_at("1.1.1.1", FinalResult::Allowed, now - Duration::days(40)));
        store.push_log(log_at("1.1.1.2", FinalResult::Allowed, now));
        let tuple = AttributeTuple { ip: "1.1.1.1".into(), country: "DE".into(), ..Default::default() };
        store.upsert_relationship("ip_country", &tuple, now - Duration::days(40)).await.unwrap();

        let cutoff = now - Duration::days(30);
        assert_eq!(store.delete_logs_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.delete_relationships_before(cutoff).await.unwrap(), 1);
        assert_eq!(store.log_count(), 1);
        assert_eq!(store.relationship_count(), 0);
    }

    #[tokio::test]
    async fn test_list_logs_filters_and_pages() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store.push_log(log_at(&format!("10.0.0.{}", i), FinalResult::Denied, now + Duration::seconds(i)));
        }
        store.push_log(log_at("192.168.0.1", FinalResult::Allowed, now));

        let page = store
            .list_logs(&TrafficQuery::page(1, 2).with_status("denied"))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        // Newest first by default
        assert_eq!(page.items[0].attributes.ip, "10.0.0.4");

        let page = store.list_logs(&TrafficQuery::page(3, 2).with_status("denied")).await.unwrap();
        assert_eq!(page.items.len(), 1);

        let page = store.list_logs(&TrafficQuery::page(1, 10).with_search("192.168")).await.unwrap();
        assert_eq!(page.total, 1);
    }
}
