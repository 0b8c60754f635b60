//! Public types for the firewall coordinator.

use serde::Serialize;
use uuid::Uuid;

use crate::cache::CacheStats;
use crate::events::EventBusStats;
use crate::filter::types::{DimensionResult, FilterResponse};
use crate::resilience::retry_queue::RetryQueueStats;

/// Engine lifecycle state.
///
/// Use [`super::Firewall::state()`] to check the current state or
/// [`super::Firewall::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Built, no background task running
    Created,
    /// Preparing indexes, starting the consumer, retry worker and schedulers
    Starting,
    /// Initial full resync
    Syncing,
    /// Startup finished
    Ready,
    /// Serving with every background task alive
    Running,
    /// Cancelling and draining background tasks
    ShuttingDown,
    /// Every task joined
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Syncing => "Syncing",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

/// A successful decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub response: FilterResponse,
    /// `None` when traffic logging is disabled or the log write failed.
    pub request_id: Option<Uuid>,
    pub cache_hit: bool,
    pub response_time_ms: u64,
    pub dimensions: Vec<DimensionResult>,
}

/// Snapshot for `/health`-style endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    pub ready: bool,
    pub healthy: bool,
    pub events: EventBusStats,
    pub retry_queue: RetryQueueStats,
    /// `None` when the cache backend failed to report.
    pub cache: Option<CacheStats>,
    pub full_sync_running: bool,
    pub index_backend: &'static str,
    pub lock_backend: &'static str,
    /// `None` when Redis is not configured.
    pub redis_connected: Option<bool>,
    pub redis_latency_ms: Option<u64>,
    /// `None` when SQL is not configured.
    pub sql_connected: Option<bool>,
    pub sql_latency_ms: Option<u64>,
}
