//! Engine lifecycle: start and shutdown.
//!
//! Startup order:
//! 1. Document indexes exist (stores were connected before construction)
//! 2. Event consumer
//! 3. Retry worker
//! 4. Sync scheduler, analytics scheduler, cache sweep
//! 5. Initial full resync
//!
//! Shutdown cancels the root token and joins the tasks in reverse order,
//! then waits for in-flight traffic-log work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::{EngineState, Firewall};
use crate::metrics;
use crate::storage::traits::StorageError;

impl Firewall {
    /// Start background work and run the initial full resync.
    ///
    /// A busy `full_sync` lock does not fail startup: another instance is
    /// already resyncing the shared index.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), StorageError> {
        if self.state() != EngineState::Created {
            return Err(StorageError::Conflict(format!("cannot start from state {}", self.state())));
        }
        let startup_start = Instant::now();
        info!("Starting firewall engine...");
        self.set_state(EngineState::Starting);

        // ========== PHASE 1: Indexes ==========
        let phase_start = Instant::now();
        if let Err(e) = self.projector.index().ensure_indexes().await {
            self.set_state(EngineState::Created);
            return Err(e);
        }
        metrics::record_startup_phase("ensure_indexes", phase_start.elapsed());

        // ========== PHASE 2-4: Background tasks ==========
        {
            let mut tasks = self.tasks.lock();
            if let Some(handle) = self.events.spawn_consumer(
                self.projector.clone(),
                Arc::clone(&self.retry_queue),
                self.cancel.child_token(),
            ) {
                tasks.push(("event_consumer", handle));
            }
            if let Some(handle) = self
                .retry_queue
                .spawn_worker(self.projector.clone(), self.cancel.child_token())
            {
                tasks.push(("retry_worker", handle));
            }
            tasks.push((
                "sync_scheduler",
                self.scheduler.spawn(
                    Duration::from_secs(self.config.sync.incremental_interval_secs),
                    Duration::from_secs(self.config.sync.full_interval_secs),
                    self.cancel.child_token(),
                ),
            ));
            if self.config.analytics.enabled {
                tasks.push((
                    "analytics",
                    Arc::clone(&self.analytics).spawn(
                        Duration::from_secs(self.config.analytics.tick_secs),
                        self.cancel.child_token(),
                    ),
                ));
            }
            if let Some(cache) = self.backends.memory_cache.as_ref() {
                tasks.push((
                    "cache_cleanup",
                    cache.spawn_cleanup(
                        Duration::from_secs(self.config.caching.cleanup_interval_secs),
                        self.cancel.child_token(),
                    ),
                ));
            }
            info!(tasks = tasks.len(), "Background tasks started");
        }

        // ========== PHASE 5: Initial full resync ==========
        if self.config.sync.full_sync_on_start {
            let phase_start = Instant::now();
            self.set_state(EngineState::Syncing);
            match self.scheduler.run_full_sync().await {
                Ok(report) => info!(indexed = report.indexed, failed = report.failed, "Initial full sync complete"),
                Err(StorageError::Conflict(reason)) => warn!(reason, "Initial full sync skipped"),
                Err(e) => warn!(error = %e, "Initial full sync failed, scheduler will retry"),
            }
            metrics::record_startup_phase("initial_full_sync", phase_start.elapsed());
        }

        self.set_state(EngineState::Ready);
        metrics::record_startup_phase("total", startup_start.elapsed());
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Firewall engine ready");
        self.set_state(EngineState::Running);
        Ok(())
    }

    /// Cancel every background task and wait for them, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let shutdown_start = Instant::now();
        info!("Initiating firewall engine shutdown...");
        self.set_state(EngineState::ShuttingDown);
        self.cancel.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks.into_iter().rev() {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }
        self.logger.shutdown().await;

        self.set_state(EngineState::Stopped);
        metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!("Firewall engine shutdown complete");
    }
}
