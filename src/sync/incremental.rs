//! Watermark-driven reconciliation of the index with the authoritative store.
//!
//! Per kind: read `last_sync`, scan rows with `updated_at` or `created_at`
//! after it, re-index them, and move the watermark to the scan start if at
//! least one row landed. Rows that fail are handed to the retry queue.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::metrics;
use crate::projection::{IndexOp, Projector};
use crate::resilience::retry_queue::RetryQueue;
use crate::rule::EntityKind;
use crate::storage::traits::{RuleStore, StorageError, SyncStateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub kind: EntityKind,
    pub scanned: usize,
    pub indexed: usize,
    pub failed: usize,
    /// New watermark, if it moved.
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct IncrementalSyncer {
    rules: Arc<dyn RuleStore>,
    state: Arc<dyn SyncStateStore>,
    projector: Projector,
    retry_queue: Option<Arc<RetryQueue>>,
}

impl IncrementalSyncer {
    #[must_use]
    pub fn new(rules: Arc<dyn RuleStore>, state: Arc<dyn SyncStateStore>, projector: Projector) -> Self {
        Self { rules, state, projector, retry_queue: None }
    }

    /// Queue rows whose index write fails instead of only logging them.
    #[must_use]
    pub fn with_retry_queue(mut self, retry_queue: Arc<RetryQueue>) -> Self {
        self.retry_queue = Some(retry_queue);
        self
    }

    /// Write a row read from the authoritative store. With a retry queue
    /// attached this goes through its gate, so older queued ops for the same
    /// rule are superseded instead of replayed over it.
    pub async fn project(&self, op: &IndexOp) -> Result<(), StorageError> {
        match &self.retry_queue {
            Some(queue) => queue.apply_current(&self.projector, op).await,
            None => self.projector.apply_uncached(op).await,
        }
    }

    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn sync_kind(&self, kind: EntityKind) -> Result<SyncReport, StorageError> {
        let started = Utc::now();
        let since = self.state.get_watermark(kind).await?.unwrap_or_default();
        let rows = self.rules.scan_updated_since(kind, since).await?;

        let mut report = SyncReport { kind, scanned: rows.len(), indexed: 0, failed: 0, watermark: None };
        for row in rows {
            let op = IndexOp::Upsert(row.rule);
            match self.project(&op).await {
                Ok(()) => report.indexed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, op = %op, "Incremental index write failed");
                    if let Some(queue) = &self.retry_queue {
                        queue.enqueue(op);
                    }
                }
            }
        }

        if report.indexed > 0 {
            self.projector.invalidate(kind).await;
            self.state.advance_watermark(kind, started).await?;
            report.watermark = Some(started);
            metrics::record_sync_items("incremental", kind.as_str(), report.indexed);
            debug!(indexed = report.indexed, failed = report.failed, "Incremental sync advanced watermark");
        }
        Ok(report)
    }

    /// One pass over every kind. A failing kind does not stop the others.
    pub async fn sync_all(&self) -> Vec<SyncReport> {
        let start = Instant::now();
        let mut reports = Vec::with_capacity(EntityKind::ALL.len());
        let mut errors = 0usize;

        for kind in EntityKind::ALL {
            match self.sync_kind(kind).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    errors += 1;
                    warn!(kind = %kind, error = %e, "Incremental sync failed for kind");
                }
            }
        }

        let indexed: usize = reports.iter().map(|r| r.indexed).sum();
        metrics::record_sync_run("incremental", if errors == 0 { "success" } else { "partial" });
        metrics::record_sync_duration("incremental", start.elapsed());
        if indexed > 0 {
            info!(indexed, errors, "Incremental sync complete");
        }
        reports
    }
}
