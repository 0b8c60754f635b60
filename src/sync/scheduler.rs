// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic reconciliation driver.
//!
//! ```text
//! every 30s  ─► incremental sync (skipped while a full sync runs here)
//! every 5min ─► full resync under the `full_sync` cluster lock
//! ```
//!
//! Full resync re-indexes every row of every kind and rebuilds the
//! predicate cache per kind. It never prunes index documents whose rows
//! were deleted; deletes reach the index through events only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::incremental::{IncrementalSyncer, SyncReport};
use crate::lock::{SharedLock, FULL_SYNC_LOCK};
use crate::metrics;
use crate::projection::{IndexOp, Projector};
use crate::rule::{EntityKind, Rule};
use crate::storage::traits::{RuleStore, StorageError, SyncStateStore};

pub const FULL_SYNC_BUSY: &str = "full sync already in progress";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FullSyncReport {
    pub indexed: usize,
    pub failed: usize,
    pub predicates: usize,
    pub duration_ms: u64,
}

/// Clears the process-local running flag however the sync exits.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn try_set(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncScheduler {
    incremental: IncrementalSyncer,
    rules: Arc<dyn RuleStore>,
    state: Arc<dyn SyncStateStore>,
    projector: Projector,
    lock: SharedLock,
    full_sync_ttl: Duration,
    full_sync_running: AtomicBool,
}

impl SyncScheduler {
    #[must_use]
    pub fn new(
        incremental: IncrementalSyncer,
        rules: Arc<dyn RuleStore>,
        state: Arc<dyn SyncStateStore>,
        projector: Projector,
        lock: SharedLock,
        full_sync_ttl: Duration,
    ) -> Self {
        Self {
            incremental,
            rules,
            state,
            projector,
            lock,
            full_sync_ttl,
            full_sync_running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_full_sync_running(&self) -> bool {
        self.full_sync_running.load(Ordering::Acquire)
    }

    /// Incremental pass, or `None` if a full sync is running in this process.
    pub async fn run_incremental(&self) -> Option<Vec<SyncReport>> {
        if self.is_full_sync_running() {
            debug!("Full sync in progress, skipping incremental sync");
            metrics::record_sync_run("incremental", "skipped");
            return None;
        }
        Some(self.incremental.sync_all().await)
    }

    /// Full resync. Fails with [`FULL_SYNC_BUSY`] if this process or a peer
    /// is already running one.
    #[instrument(skip(self))]
    pub async fn run_full_sync(&self) -> Result<FullSyncReport, StorageError> {
        let Some(_running) = RunningGuard::try_set(&self.full_sync_running) else {
            metrics::record_sync_run("full", "busy");
            return Err(StorageError::Conflict(FULL_SYNC_BUSY.into()));
        };

        if !self.lock.try_acquire(FULL_SYNC_LOCK, self.full_sync_ttl).await? {
            warn!("Full sync lock held by another instance");
            metrics::record_sync_run("full", "busy");
            return Err(StorageError::Conflict(FULL_SYNC_BUSY.into()));
        }

        let result = self.full_sync_locked().await;

        if let Err(e) = self.lock.release(FULL_SYNC_LOCK).await {
            warn!(error = %e, "Failed to release full sync lock");
        }

        metrics::record_sync_run("full", if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn full_sync_locked(&self) -> Result<FullSyncReport, StorageError> {
        let start = Instant::now();
        let started_at = Utc::now();
        let mut report = FullSyncReport::default();

        for kind in EntityKind::ALL {
            let rows = self.rules.scan_all(kind).await?;
            let mut failed = 0usize;
            for row in &rows {
                let op = IndexOp::Upsert(row.rule.clone());
                if let Err(e) = self.incremental.project(&op).await {
                    failed += 1;
                    warn!(error = %e, op = %op, "Full sync index write failed");
                }
            }
            let indexed = rows.len() - failed;

            let rules: Vec<&Rule> = rows.iter().map(|r| &r.rule).collect();
            report.predicates += self.projector.predicates().rebuild(kind, rules);
            self.projector.invalidate(kind).await;

            if failed == 0 {
                self.state.advance_watermark(kind, started_at).await?;
            }
            metrics::record_sync_items("full", kind.as_str(), indexed);
            report.indexed += indexed;
            report.failed += failed;
        }

        let elapsed = start.elapsed();
        metrics::record_sync_duration("full", elapsed);
        report.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        info!(
            indexed = report.indexed,
            failed = report.failed,
            predicates = report.predicates,
            duration_ms = report.duration_ms,
            "Full sync complete"
        );
        Ok(report)
    }

    /// Drive both tickers until cancelled. The first ticks fire one period
    /// after start; the startup full sync is the caller's job.
    pub fn spawn(
        self: &Arc<Self>,
        incremental_interval: Duration,
        full_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let now = tokio::time::Instant::now();
            let mut incremental = tokio::time::interval_at(now + incremental_interval, incremental_interval);
            let mut full = tokio::time::interval_at(now + full_interval, full_interval);
            incremental.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            full.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(?incremental_interval, ?full_interval, "Sync scheduler started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = full.tick() => {
                        if let Err(e) = scheduler.run_full_sync().await {
                            warn!(error = %e, "Scheduled full sync did not run");
                        }
                    }
                    _ = incremental.tick() => {
                        scheduler.run_incremental().await;
                    }
                }
            }
            info!("Sync scheduler stopped");
        })
    }
}
