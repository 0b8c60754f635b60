// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded in-process queue of failed index operations.
//!
//! A single worker pops items in FIFO order:
//!
//! 1. Not yet due: requeue (dropped if the queue is full) and nap.
//! 2. Due: bump `attempts`; past `max_attempts` the item is dropped.
//! 3. Replay through the [`Projector`]. On failure the next attempt is
//!    scheduled `attempts² × backoff_unit` out (1, 4, 9, 16, 25 s by
//!    default) and the item is requeued.
//!
//! Publishers never block: a full queue drops the item and counts it. The
//! watermark-driven incremental sync picks up anything lost here.
//!
//! Only the newest op per rule is ever replayed. Each item carries a
//! sequence number and the queue remembers the latest one per
//! `(kind, natural_id)`. Queueing a newer op for the same rule, or a direct
//! write through [`RetryQueue::apply_current`], supersedes older items and
//! the worker drops them unreplayed. Direct writes and replays share one
//! gate so a replay already in flight cannot land after a newer write.
//!
//! On shutdown the worker drains what is left without retrying it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryQueueConfig;
use crate::metrics;
use crate::projection::{IndexOp, Projector};
use crate::rule::EntityKind;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone)]
pub struct RetryItem {
    pub op: IndexOp,
    pub attempts: u32,
    pub next_retry_at: Instant,
    seq: u64,
}

/// Outcome of the most recent replay, kept for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryOutcome {
    pub op_kind: String,
    pub natural_id: String,
    pub attempts: u32,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryQueueStats {
    pub pending: usize,
    pub capacity: usize,
    pub enqueued: u64,
    pub succeeded: u64,
    pub failed_attempts: u64,
    pub dropped_full: u64,
    pub exhausted: u64,
    pub superseded: u64,
    pub drained_on_shutdown: u64,
    pub last_outcome: Option<RetryOutcome>,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    dropped_full: AtomicU64,
    exhausted: AtomicU64,
    superseded: AtomicU64,
    drained: AtomicU64,
}

type RuleId = (EntityKind, String);

fn rule_id(op: &IndexOp) -> RuleId {
    (op.kind(), op.natural_id().to_string())
}

pub struct RetryQueue {
    tx: mpsc::Sender<RetryItem>,
    rx: Mutex<Option<mpsc::Receiver<RetryItem>>>,
    config: RetryQueueConfig,
    counters: Counters,
    last_outcome: Mutex<Option<RetryOutcome>>,
    next_seq: AtomicU64,
    /// Sequence of the newest queued item per rule.
    latest: Mutex<HashMap<RuleId, u64>>,
    gate: tokio::sync::Mutex<()>,
}

impl RetryQueue {
    #[must_use]
    pub fn new(config: RetryQueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            config,
            counters: Counters::default(),
            last_outcome: Mutex::new(None),
            next_seq: AtomicU64::new(1),
            latest: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
        })
    }

    /// Queue a failed op for its first retry, one backoff unit from now.
    /// Any older item for the same rule is superseded. Returns false if the
    /// queue was full and the op was dropped.
    pub fn enqueue(&self, op: IndexOp) -> bool {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.latest.lock().insert(rule_id(&op), seq);
        let item = RetryItem {
            op,
            attempts: 0,
            next_retry_at: Instant::now() + self.config.backoff_unit(),
            seq,
        };
        let accepted = self.offer(item);
        if accepted {
            self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Write `op` as the newest state of its rule, bypassing the queue
    /// (index, predicates; no cache invalidation). On success every queued
    /// item for the rule is superseded. The caller decides whether a
    /// failure is queued.
    pub async fn apply_current(&self, projector: &Projector, op: &IndexOp) -> Result<(), StorageError> {
        let _gate = self.gate.lock().await;
        projector.apply_uncached(op).await?;
        if self.latest.lock().remove(&rule_id(op)).is_some() {
            debug!(op = %op, "Superseded queued retry");
        }
        Ok(())
    }

    fn is_current(&self, item: &RetryItem) -> bool {
        self.latest.lock().get(&rule_id(&item.op)) == Some(&item.seq)
    }

    /// Forget the item's rule if this item is still its newest entry.
    fn settle(&self, item: &RetryItem) {
        let mut latest = self.latest.lock();
        let id = rule_id(&item.op);
        if latest.get(&id) == Some(&item.seq) {
            latest.remove(&id);
        }
    }

    fn offer(&self, item: RetryItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                metrics::set_retry_queue_depth(self.pending());
                true
            }
            Err(mpsc::error::TrySendError::Full(item)) => {
                self.counters.dropped_full.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry("dropped_full");
                warn!(op = %item.op, attempts = item.attempts, "Retry queue full, dropping item");
                self.settle(&item);
                false
            }
            Err(mpsc::error::TrySendError::Closed(item)) => {
                warn!(op = %item.op, "Retry queue closed, dropping item");
                self.settle(&item);
                false
            }
        }
    }

    /// Items waiting in the channel (the one in flight is not counted).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    #[must_use]
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        self.config.backoff_unit() * attempts.saturating_mul(attempts)
    }

    #[must_use]
    pub fn stats(&self) -> RetryQueueStats {
        let c = &self.counters;
        RetryQueueStats {
            pending: self.pending(),
            capacity: self.tx.max_capacity(),
            enqueued: c.enqueued.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
            dropped_full: c.dropped_full.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            superseded: c.superseded.load(Ordering::Relaxed),
            drained_on_shutdown: c.drained.load(Ordering::Relaxed),
            last_outcome: self.last_outcome.lock().clone(),
        }
    }

    /// Start the single worker. Only the first call gets the receiver;
    /// later calls return `None`.
    pub fn spawn_worker(self: &Arc<Self>, projector: Projector, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().take()?;
        let queue = Arc::clone(self);
        Some(tokio::spawn(async move { queue.run(rx, projector, cancel).await }))
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<RetryItem>, projector: Projector, cancel: CancellationToken) {
        info!(capacity = self.tx.max_capacity(), "Retry worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if !self.is_current(&item) {
                self.drop_superseded(&item);
                continue;
            }

            if Instant::now() < item.next_retry_at {
                self.offer(item);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
                continue;
            }

            self.attempt(item, &projector).await;
        }

        let mut drained = 0u64;
        while let Ok(item) = rx.try_recv() {
            drained += 1;
            warn!(op = %item.op, attempts = item.attempts, "Dropping pending retry on shutdown");
        }
        self.counters.drained.fetch_add(drained, Ordering::Relaxed);
        self.latest.lock().clear();
        metrics::set_retry_queue_depth(0);
        info!(drained, "Retry worker stopped");
    }

    fn drop_superseded(&self, item: &RetryItem) {
        self.counters.superseded.fetch_add(1, Ordering::Relaxed);
        metrics::record_retry("superseded");
        debug!(op = %item.op, attempts = item.attempts, "Dropping superseded retry");
        metrics::set_retry_queue_depth(self.pending());
    }

    async fn attempt(&self, mut item: RetryItem, projector: &Projector) {
        let _gate = self.gate.lock().await;
        // A newer write may have landed while this item waited for the gate
        if !self.is_current(&item) {
            self.drop_superseded(&item);
            return;
        }

        item.attempts += 1;

        if item.attempts > self.config.max_attempts {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            metrics::record_retry("exhausted");
            error!(
                op = %item.op,
                attempts = item.attempts - 1,
                "Retry attempts exhausted, dropping; incremental sync will reconcile"
            );
            self.record_outcome(&item, false);
            self.settle(&item);
            return;
        }

        match projector.apply(&item.op).await {
            Ok(()) => {
                self.settle(&item);
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry("succeeded");
                info!(op = %item.op, attempts = item.attempts, "Retry succeeded");
                self.record_outcome(&item, true);
            }
            Err(e) => {
                self.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                metrics::record_retry("failed");
                let delay = self.backoff_for(item.attempts);
                warn!(op = %item.op, attempts = item.attempts, error = %e, ?delay, "Retry failed, rescheduling");
                item.next_retry_at = Instant::now() + delay;
                self.record_outcome(&item, false);
                self.offer(item);
            }
        }
        metrics::set_retry_queue_depth(self.pending());
    }

    fn record_outcome(&self, item: &RetryItem, succeeded: bool) {
        *self.last_outcome.lock() = Some(RetryOutcome {
            op_kind: item.op.op_kind(),
            natural_id: item.op.natural_id().to_string(),
            attempts: item.attempts,
            succeeded,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::filter::predicates::PredicateCache;
    use crate::rule::{EntityKind, Rule, RuleStatus};
    use crate::search::{IndexAdapter, InMemoryIndex};

    fn test_config(capacity: usize) -> RetryQueueConfig {
        RetryQueueConfig {
            capacity,
            max_attempts: 5,
            backoff_unit_ms: 10,
            poll_interval_ms: 2,
        }
    }

    fn projector() -> Projector {
        Projector::new(
            IndexAdapter::new(Arc::new(InMemoryIndex::new())),
            Arc::new(MemoryCache::new()),
            Arc::new(PredicateCache::new()),
        )
    }

    fn upsert(ip: &str) -> IndexOp {
        IndexOp::Upsert(Rule::ip(ip, RuleStatus::Denied))
    }

    #[test]
    fn test_backoff_is_quadratic() {
        let queue = RetryQueue::new(RetryQueueConfig::default());
        let secs: Vec<u64> = (1..=5).map(|a| queue.backoff_for(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 4, 9, 16, 25]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let queue = RetryQueue::new(test_config(2));
        assert!(queue.enqueue(upsert("1.1.1.1")));
        assert!(queue.enqueue(upsert("1.1.1.2")));
        assert!(!queue.enqueue(upsert("1.1.1.3")));

        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped_full, 1);
    }

    #[tokio::test]
    async fn test_worker_replays_after_backoff() {
        let queue = RetryQueue::new(test_config(16));
        let projector = projector();
        let cancel = CancellationToken::new();
        let handle = queue.spawn_worker(projector.clone(), cancel.clone()).unwrap();

        queue.enqueue(upsert("9.9.9.9"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            projector.index().lookup(EntityKind::Ip, "9.9.9.9").await.unwrap(),
            Some(RuleStatus::Denied)
        );
        let stats = queue.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.last_outcome.unwrap().attempts, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_only_spawns_once() {
        let queue = RetryQueue::new(test_config(4));
        let cancel = CancellationToken::new();
        let first = queue.spawn_worker(projector(), cancel.clone());
        assert!(first.is_some());
        assert!(queue.spawn_worker(projector(), cancel.clone()).is_none());
        cancel.cancel();
        first.unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_without_retrying() {
        let mut config = test_config(8);
        config.backoff_unit_ms = 60_000;
        let queue = RetryQueue::new(config);
        let projector = projector();
        queue.enqueue(upsert("1.1.1.1"));
        queue.enqueue(upsert("1.1.1.2"));

        let cancel = CancellationToken::new();
        let handle = queue.spawn_worker(projector.clone(), cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.drained_on_shutdown, 2);
        assert_eq!(projector.index().lookup(EntityKind::Ip, "1.1.1.1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_newer_enqueue_supersedes_older_item() {
        let queue = RetryQueue::new(test_config(16));
        let projector = projector();
        queue.enqueue(IndexOp::Upsert(Rule::ip("4.4.4.4", RuleStatus::Denied)));
        queue.enqueue(IndexOp::Upsert(Rule::ip("4.4.4.4", RuleStatus::Whitelisted)));

        let cancel = CancellationToken::new();
        let handle = queue.spawn_worker(projector.clone(), cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(
            projector.index().lookup(EntityKind::Ip, "4.4.4.4").await.unwrap(),
            Some(RuleStatus::Whitelisted)
        );
        let stats = queue.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.succeeded, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_write_supersedes_queued_item() {
        let queue = RetryQueue::new(test_config(16));
        let projector = projector();
        queue.enqueue(IndexOp::Upsert(Rule::ip("5.5.5.5", RuleStatus::Denied)));
        queue
            .apply_current(&projector, &IndexOp::Delete { kind: EntityKind::Ip, id: "5.5.5.5".into() })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = queue.spawn_worker(projector.clone(), cancel.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(projector.index().lookup(EntityKind::Ip, "5.5.5.5").await.unwrap(), None);
        let stats = queue.stats();
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.succeeded, 0);
        assert_eq!(stats.pending, 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
