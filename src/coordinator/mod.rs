// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Firewall coordinator.
//!
//! [`Firewall`] owns every component and wires them once at construction:
//!
//! ```text
//!  decide() ──► geo enrich ──► FilterEvaluator ──► TrafficLogger
//!                                   │ reads
//!                     cache ◄── Projector ──► index + predicates
//!                                   ▲ writes
//!  upsert_rule() ──► RuleStore ──► EventBus ──► consumer ──► RetryQueue
//!                        ▲
//!                        └── SyncScheduler (incremental + full resync)
//! ```
//!
//! See [`lifecycle`] for startup and shutdown order and [`api`] for the
//! decision and mutation entry points.

mod api;
mod backends;
mod lifecycle;
mod types;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FirewallConfig;
use crate::events::EventBus;
use crate::filter::evaluator::FilterEvaluator;
use crate::filter::predicates::PredicateCache;
use crate::geo::GeoLookup;
use crate::import::AsnImporter;
use crate::lock::SharedLock;
use crate::projection::Projector;
use crate::resilience::retry_queue::RetryQueue;
use crate::search::IndexAdapter;
use crate::storage::traits::{RuleStore, StorageError};
use crate::sync::{IncrementalSyncer, SyncScheduler};
use crate::traffic::{Analytics, TrafficLogger, TrafficQueries};

pub use backends::Backends;
pub use types::{Decision, EngineState, HealthCheck};

pub struct Firewall {
    config: FirewallConfig,
    state: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    backends: Backends,
    rules: Arc<dyn RuleStore>,
    lock: SharedLock,
    geo: Arc<dyn GeoLookup>,

    projector: Projector,
    evaluator: FilterEvaluator,
    events: Arc<EventBus>,
    retry_queue: Arc<RetryQueue>,
    scheduler: Arc<SyncScheduler>,

    logger: Arc<TrafficLogger>,
    analytics: Arc<Analytics>,
    queries: TrafficQueries,
    importer: AsnImporter,

    cancel: CancellationToken,
    /// Background tasks in spawn order; joined in reverse on shutdown.
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Firewall {
    /// Wire a firewall over the given backends. Nothing runs until
    /// [`start()`](Self::start).
    pub fn new(config: FirewallConfig, backends: Backends) -> Result<Self, StorageError> {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let projector = Projector::new(
            IndexAdapter::new(Arc::clone(&backends.index)),
            Arc::clone(&backends.cache),
            Arc::new(PredicateCache::new()),
        );
        let evaluator = FilterEvaluator::new(&projector, config.caching.filter_ttl());
        let events = EventBus::new(config.events.capacity);
        let retry_queue = RetryQueue::new(config.retry.clone());

        let incremental = IncrementalSyncer::new(
            Arc::clone(&backends.rules),
            Arc::clone(&backends.sync_state),
            projector.clone(),
        )
        .with_retry_queue(Arc::clone(&retry_queue));
        let scheduler = Arc::new(SyncScheduler::new(
            incremental,
            Arc::clone(&backends.rules),
            Arc::clone(&backends.sync_state),
            projector.clone(),
            Arc::clone(&backends.lock),
            config.locking.full_sync_ttl(),
        ));

        let logger = Arc::new(TrafficLogger::new(
            Arc::clone(&backends.traffic),
            config.logging.traffic_logging,
        ));
        let analytics = Arc::new(Analytics::new(
            Arc::clone(&backends.traffic),
            config.logging.retention_days,
        ));
        let queries = TrafficQueries::new(
            Arc::clone(&backends.traffic),
            Arc::clone(&backends.cache),
            config.caching.clone(),
        );
        let importer = AsnImporter::new(config.spamhaus.import_url.clone())
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Self {
            rules: Arc::clone(&backends.rules),
            lock: Arc::clone(&backends.lock),
            geo: Arc::clone(&backends.geo),
            backends,
            config,
            state: state_tx,
            state_rx,
            projector,
            evaluator,
            events,
            retry_queue,
            scheduler,
            logger,
            analytics,
            queries,
            importer,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect the backends named by `config`, then wire.
    pub async fn connect(config: FirewallConfig) -> Result<Self, StorageError> {
        let backends = Backends::connect(&config).await?;
        Self::new(config, backends)
    }

    #[must_use]
    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(&state.to_string());
    }

    #[must_use]
    pub fn projector(&self) -> &Projector {
        &self.projector
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn retry_queue(&self) -> &Arc<RetryQueue> {
        &self.retry_queue
    }

    #[must_use]
    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    #[must_use]
    pub fn logger(&self) -> &Arc<TrafficLogger> {
        &self.logger
    }

    #[must_use]
    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    /// Cached admin list/top-N/summary queries.
    #[must_use]
    pub fn queries(&self) -> &TrafficQueries {
        &self.queries
    }

    #[must_use]
    pub fn lock(&self) -> &SharedLock {
        &self.lock
    }

    /// Ping backends and collect queue and cache state.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let ready = matches!(state, EngineState::Ready | EngineState::Running);

        let (redis, sql) = tokio::join!(self.ping_redis(), self.ping_sql());
        let (redis_connected, redis_latency_ms) = redis;
        let (sql_connected, sql_latency_ms) = sql;

        let cache = match self.backends.cache.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "Cache stats unavailable");
                None
            }
        };

        let healthy = state == EngineState::Running
            && redis_connected != Some(false)
            && sql_connected != Some(false);

        HealthCheck {
            state,
            ready,
            healthy,
            events: self.events.stats(),
            retry_queue: self.retry_queue.stats(),
            cache,
            full_sync_running: self.scheduler.is_full_sync_running(),
            index_backend: self.backends.index.backend_name(),
            lock_backend: self.lock.backend_name(),
            redis_connected,
            redis_latency_ms,
            sql_connected,
            sql_latency_ms,
        }
    }

    async fn ping_redis(&self) -> (Option<bool>, Option<u64>) {
        let Some(connection) = self.backends.redis.as_ref() else {
            return (None, None);
        };
        let start = std::time::Instant::now();
        let mut conn = connection.clone();
        let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        let connected = result.is_ok();
        crate::metrics::set_backend_healthy("redis", connected);
        let latency = connected.then(|| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        (Some(connected), latency)
    }

    async fn ping_sql(&self) -> (Option<bool>, Option<u64>) {
        let Some(store) = self.backends.sql.as_ref() else {
            return (None, None);
        };
        let start = std::time::Instant::now();
        let connected = store.ping().await.is_ok();
        crate::metrics::set_backend_healthy("sql", connected);
        let latency = connected.then(|| u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX));
        (Some(connected), latency)
    }
}
