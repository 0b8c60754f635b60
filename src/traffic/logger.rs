// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decision logging.
//!
//! Each decision becomes one traffic-log row, followed by its relationship
//! counter updates. Both run on a tracked background task: the request ID
//! is assigned up front and the caller never waits on the store. Nothing
//! here returns an error: a failed log write is a warning, never a failed
//! request.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{AttributeTuple, FinalResult, RequestMetadata, TrafficLog};
use super::relationships::present_relationships;
use crate::metrics;
use crate::storage::traits::TrafficStore;

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// What the evaluator hands to the logger for one request.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub attributes: AttributeTuple,
    pub asn: String,
    pub final_result: FinalResult,
    pub filter_results: Value,
    pub response_time_ms: u64,
    pub cache_hit: bool,
    pub metadata: RequestMetadata,
}

pub struct TrafficLogger {
    store: Arc<dyn TrafficStore>,
    enabled: bool,
    tasks: TaskTracker,
}

impl TrafficLogger {
    #[must_use]
    pub fn new(store: Arc<dyn TrafficStore>, enabled: bool) -> Self {
        Self { store, enabled, tasks: TaskTracker::new() }
    }

    /// Hand a decision to the background writer and return the request ID
    /// it will be stored under. The caller never waits on the store.
    pub fn log(&self, record: DecisionRecord) -> Option<Uuid> {
        if !self.enabled {
            return None;
        }

        let log = TrafficLog {
            id: None,
            request_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            attributes: record.attributes,
            asn: record.asn,
            final_result: record.final_result,
            filter_results: record.filter_results,
            response_time_ms: record.response_time_ms,
            cache_hit: record.cache_hit,
            metadata: record.metadata,
        };
        let request_id = log.request_id;

        let store = Arc::clone(&self.store);
        self.tasks.spawn(async move {
            match store.insert_log(&log).await {
                Ok(id) => {
                    metrics::record_traffic_log(true);
                    debug!(id, request_id = %log.request_id, result = %log.final_result, "Traffic logged");
                }
                Err(e) => {
                    metrics::record_traffic_log(false);
                    warn!(error = %e, request_id = %log.request_id, "Failed to write traffic log");
                    return;
                }
            }

            let types = present_relationships(&log.attributes);
            let mut failed = 0usize;
            for relationship_type in &types {
                if let Err(e) = store.upsert_relationship(relationship_type, &log.attributes, log.timestamp).await {
                    failed += 1;
                    warn!(error = %e, relationship_type, "Failed to update relationship");
                }
            }
            metrics::record_relationships(types.len() - failed, failed);
        });

        Some(request_id)
    }

    /// Number of log writes still in flight.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for in-flight log writes.
    pub async fn flush(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop accepting background work and wait, at most `SHUTDOWN_DRAIN`,
    /// for what is in flight.
    pub async fn shutdown(&self) {
        self.tasks.close();
        if tokio::time::timeout(SHUTDOWN_DRAIN, self.tasks.wait()).await.is_err() {
            warn!(pending = self.tasks.len(), "Traffic log writes still pending at shutdown");
        }
    }
}
