// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rule mutation events.
//!
//! Every admin mutation writes the authoritative store first and then
//! publishes a [`RuleEvent`]. A single consumer projects events, in publish
//! order, into the index, predicate cache and TTL cache. Index failures go
//! to the [`RetryQueue`]; the event itself is never re-published.
//!
//! Publishing never blocks. A full channel drops the event with a warning;
//! delivery is not durable across process crashes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::projection::{IndexOp, Projector};
use crate::resilience::retry_queue::RetryQueue;
use crate::rule::Rule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Created,
    Updated,
    Deleted,
    Imported,
}

impl RuleAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Imported => "imported",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvent {
    pub action: RuleAction,
    /// For `deleted`, only the kind and natural key are meaningful.
    pub rule: Rule,
    pub timestamp: DateTime<Utc>,
}

impl RuleEvent {
    #[must_use]
    pub fn new(action: RuleAction, rule: Rule) -> Self {
        Self { action, rule, timestamp: Utc::now() }
    }

    /// The index op this event projects to.
    #[must_use]
    pub fn to_op(&self) -> IndexOp {
        match self.action {
            RuleAction::Deleted => IndexOp::Delete {
                kind: self.rule.kind(),
                id: self.rule.natural_key().to_string(),
            },
            RuleAction::Created | RuleAction::Updated | RuleAction::Imported => {
                IndexOp::Upsert(self.rule.clone())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStats {
    pub pending: usize,
    pub capacity: usize,
    pub published: u64,
    pub dropped: u64,
    pub processed: u64,
    pub index_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    index_failures: AtomicU64,
}

pub struct EventBus {
    tx: mpsc::Sender<RuleEvent>,
    rx: Mutex<Option<mpsc::Receiver<RuleEvent>>>,
    counters: Counters,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self { tx, rx: Mutex::new(Some(rx)), counters: Counters::default() })
    }

    /// Non-blocking publish. Returns false if the event was dropped.
    pub fn publish(&self, action: RuleAction, rule: Rule) -> bool {
        self.publish_event(RuleEvent::new(action, rule))
    }

    pub fn publish_event(&self, event: RuleEvent) -> bool {
        let kind = event.rule.kind();
        let action = event.action;
        match self.tx.try_send(event) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                metrics::record_event(kind.as_str(), action.as_str(), "published");
                true
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_event(kind.as_str(), action.as_str(), "dropped");
                warn!(
                    kind = %kind,
                    action = %action,
                    key = event.rule.natural_key(),
                    "Event bus full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                warn!(kind = %kind, key = event.rule.natural_key(), "Event bus closed, dropping event");
                false
            }
        }
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            pending: self.pending(),
            capacity: self.tx.max_capacity(),
            published: self.counters.published.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            index_failures: self.counters.index_failures.load(Ordering::Relaxed),
        }
    }

    /// Wait until every published event has been handled by the consumer.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let published = self.counters.published.load(Ordering::Acquire);
            let processed = self.counters.processed.load(Ordering::Acquire);
            if processed >= published {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Start the single consumer. Only the first call gets the receiver.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        projector: Projector,
        retry_queue: Arc<RetryQueue>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().take()?;
        let bus = Arc::clone(self);
        Some(tokio::spawn(async move { bus.run(rx, projector, retry_queue, cancel).await }))
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<RuleEvent>,
        projector: Projector,
        retry_queue: Arc<RetryQueue>,
        cancel: CancellationToken,
    ) {
        info!(capacity = self.tx.max_capacity(), "Event consumer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event, &projector, &retry_queue).await,
                    None => break,
                },
            }
        }

        // Events already accepted still get one projection attempt
        rx.close();
        let mut drained = 0u64;
        while let Some(event) = rx.recv().await {
            self.dispatch(event, &projector, &retry_queue).await;
            drained += 1;
        }
        info!(drained, "Event consumer stopped");
    }

    #[instrument(skip_all, fields(kind = %event.rule.kind(), action = %event.action, key = event.rule.natural_key()))]
    async fn dispatch(&self, event: RuleEvent, projector: &Projector, retry_queue: &RetryQueue) {
        let op = event.to_op();
        let kind = event.rule.kind();

        match retry_queue.apply_current(projector, &op).await {
            Ok(()) => {
                projector.invalidate(kind).await;
                metrics::record_event(kind.as_str(), event.action.as_str(), "indexed");
                debug!("Event projected");
            }
            Err(e) => {
                self.counters.index_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_event(kind.as_str(), event.action.as_str(), "index_failed");
                warn!(error = %e, op_kind = %op.op_kind(), "Index write failed, queueing retry");
                retry_queue.enqueue(op);
            }
        }
        self.counters.processed.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{filter_key, Cache, MemoryCache, FILTER_TTL};
    use crate::config::RetryQueueConfig;
    use crate::filter::predicates::PredicateCache;
    use crate::rule::{EntityKind, RuleStatus};
    use crate::search::{IndexAdapter, InMemoryIndex};
    use crate::storage::traits::StorageError;

    fn setup() -> (Arc<EventBus>, Projector, Arc<RetryQueue>, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let projector = Projector::new(
            IndexAdapter::new(Arc::new(InMemoryIndex::new())),
            cache.clone(),
            Arc::new(PredicateCache::new()),
        );
        (EventBus::new(8), projector, RetryQueue::new(RetryQueueConfig::default()), cache)
    }

    #[test]
    fn test_event_to_op() {
        let rule = Rule::email("a@b.com", RuleStatus::Denied);
        assert_eq!(
            RuleEvent::new(RuleAction::Imported, rule.clone()).to_op(),
            IndexOp::Upsert(rule.clone())
        );
        assert_eq!(
            RuleEvent::new(RuleAction::Deleted, rule).to_op(),
            IndexOp::Delete { kind: EntityKind::Email, id: "a@b.com".into() }
        );
    }

    #[test]
    fn test_publish_drops_when_full() {
        let bus = EventBus::new(1);
        assert!(bus.publish(RuleAction::Created, Rule::country("DE", RuleStatus::Denied)));
        assert!(!bus.publish(RuleAction::Created, Rule::country("FR", RuleStatus::Denied)));
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_consumer_projects_and_invalidates() {
        let (bus, projector, retry, cache) = setup();
        cache.set(&filter_key("ip", "1.2.3.4"), "\"allowed\"", FILTER_TTL).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = bus.spawn_consumer(projector.clone(), retry, cancel.clone()).unwrap();

        bus.publish(RuleAction::Created, Rule::ip("1.2.3.4", RuleStatus::Denied));
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(
            projector.index().lookup(EntityKind::Ip, "1.2.3.4").await.unwrap(),
            Some(RuleStatus::Denied)
        );
        assert!(cache.get(&filter_key("ip", "1.2.3.4")).await.unwrap().is_none());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_for_same_key_apply_in_order() {
        let (bus, projector, retry, _) = setup();
        let cancel = CancellationToken::new();
        let handle = bus.spawn_consumer(projector.clone(), retry, cancel.clone()).unwrap();

        bus.publish(RuleAction::Created, Rule::username("eve", RuleStatus::Denied));
        bus.publish(RuleAction::Updated, Rule::username("eve", RuleStatus::Whitelisted));
        bus.publish(RuleAction::Updated, Rule::username("eve", RuleStatus::Allowed));
        assert!(bus.wait_idle(Duration::from_secs(1)).await);

        assert_eq!(
            projector.index().lookup(EntityKind::Username, "eve").await.unwrap(),
            Some(RuleStatus::Allowed)
        );

        bus.publish(RuleAction::Deleted, Rule::username("eve", RuleStatus::Allowed));
        assert!(bus.wait_idle(Duration::from_secs(1)).await);
        assert_eq!(projector.index().lookup(EntityKind::Username, "eve").await.unwrap(), None);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_accepted_events() {
        let (bus, projector, retry, _) = setup();
        bus.publish(RuleAction::Created, Rule::charset("Cyrillic", RuleStatus::Denied));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let handle = bus.spawn_consumer(projector.clone(), retry, cancel).unwrap();
        handle.await.unwrap();

        assert_eq!(
            projector.index().lookup(EntityKind::Charset, "Cyrillic").await.unwrap(),
            Some(RuleStatus::Denied)
        );
        assert_eq!(bus.stats().processed, 1);
    }

    /// Refuses the first upsert, then delegates.
    struct FlakyOnce {
        inner: InMemoryIndex,
        failed: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::search::DocumentIndex for FlakyOnce {
        async fn upsert(&self, index: &str, id: &str, doc: &serde_json::Value) -> Result<(), StorageError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(StorageError::Backend("index busy".into()));
            }
            self.inner.upsert(index, id, doc).await
        }
        async fn delete(&self, index: &str, id: &str) -> Result<(), StorageError> {
            self.inner.delete(index, id).await
        }
        async fn search_term(
            &self,
            index: &str,
            field: &str,
            value: &str,
            limit: usize,
        ) -> Result<Vec<serde_json::Value>, StorageError> {
            self.inner.search_term(index, field, value, limit).await
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_failed_write_is_not_replayed_over_newer_update() {
        let index = FlakyOnce { inner: InMemoryIndex::new(), failed: Default::default() };
        let projector = Projector::new(
            IndexAdapter::new(Arc::new(index)),
            Arc::new(MemoryCache::new()),
            Arc::new(PredicateCache::new()),
        );
        let retry = RetryQueue::new(RetryQueueConfig {
            capacity: 8,
            max_attempts: 5,
            backoff_unit_ms: 10,
            poll_interval_ms: 2,
        });
        let bus = EventBus::new(8);
        let cancel = CancellationToken::new();
        let consumer = bus.spawn_consumer(projector.clone(), Arc::clone(&retry), cancel.clone()).unwrap();
        let worker = retry.spawn_worker(projector.clone(), cancel.clone()).unwrap();

        bus.publish(RuleAction::Created, Rule::ip("1.2.3.4", RuleStatus::Denied));
        bus.publish(RuleAction::Updated, Rule::ip("1.2.3.4", RuleStatus::Allowed));
        assert!(bus.wait_idle(Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            projector.index().lookup(EntityKind::Ip, "1.2.3.4").await.unwrap(),
            Some(RuleStatus::Allowed)
        );
        let stats = retry.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.pending, 0);

        cancel.cancel();
        consumer.await.unwrap();
        worker.await.unwrap();
    }
}
