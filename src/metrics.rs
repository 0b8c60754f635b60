// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the firewall engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `firewall_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `kind`: ip, email, user_agent, country, charset, username, asn
//! - `backend`: in-memory, distributed, memory, redisearch, sql
//! - `status` / `outcome`: what happened

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// DECISIONS - Filter evaluator
// ═══════════════════════════════════════════════════════════════════════════

/// Record a final decision (allowed, denied, whitelisted, timeout, error)
pub fn record_decision(status: &str) {
    counter!(
        "firewall_decisions_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record end-to-end decision latency
pub fn record_decision_latency(duration: Duration) {
    histogram!("firewall_decision_seconds").record(duration.as_secs_f64());
}

/// Record a single dimension's outcome and whether it came from cache
pub fn record_dimension(kind: &str, outcome: &str, cache_hit: bool) {
    counter!(
        "firewall_dimension_results_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string(),
        "source" => if cache_hit { "cache" } else { "index" }
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record cache hit/miss
pub fn record_cache_lookup(backend: &str, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "firewall_cache_lookups_total",
        "backend" => backend.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a cache backend fault that was absorbed
pub fn record_cache_error(backend: &str, operation: &str) {
    counter!(
        "firewall_cache_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record keys removed by an invalidation
pub fn record_cache_invalidation(kind: &str, removed: u64) {
    counter!(
        "firewall_cache_invalidated_keys_total",
        "kind" => kind.to_string()
    )
    .increment(removed);
}

// ═══════════════════════════════════════════════════════════════════════════
// RULE PROPAGATION - Event bus, retry queue, index writes
// ═══════════════════════════════════════════════════════════════════════════

/// Record an event bus transition (published, dropped, indexed, index_failed)
pub fn record_event(kind: &str, action: &str, outcome: &str) {
    counter!(
        "firewall_events_total",
        "kind" => kind.to_string(),
        "action" => action.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set retry queue depth
pub fn set_retry_queue_depth(depth: usize) {
    gauge!("firewall_retry_queue_depth").set(depth as f64);
}

/// Record retry queue outcome (enqueued, succeeded, failed, dropped_full, exhausted, drained)
pub fn record_retry(outcome: &str) {
    counter!(
        "firewall_retries_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an index write or delete
pub fn record_index_write(backend: &str, operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "firewall_index_writes_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC - Incremental and full reconciliation
// ═══════════════════════════════════════════════════════════════════════════

/// Record a sync run (incremental/full) and its status
pub fn record_sync_run(mode: &str, status: &str) {
    counter!(
        "firewall_sync_runs_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record rows re-indexed by a sync pass
pub fn record_sync_items(mode: &str, kind: &str, count: usize) {
    counter!(
        "firewall_sync_items_total",
        "mode" => mode.to_string(),
        "kind" => kind.to_string()
    )
    .increment(count as u64);
}

/// Record sync pass duration
pub fn record_sync_duration(mode: &str, duration: Duration) {
    histogram!(
        "firewall_sync_seconds",
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// LOCKS
// ═══════════════════════════════════════════════════════════════════════════

/// Record lock operation (acquire, release, extend) outcome
pub fn record_lock(name: &str, operation: &str, outcome: &str) {
    counter!(
        "firewall_lock_operations_total",
        "name" => name.to_string(),
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAFFIC - Logging, relationships, rollups
// ═══════════════════════════════════════════════════════════════════════════

/// Record a traffic log write
pub fn record_traffic_log(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "firewall_traffic_logs_total",
        "status" => status
    )
    .increment(1);
}

/// Record relationship counter upserts
pub fn record_relationships(updated: usize, failed: usize) {
    counter!("firewall_relationship_updates_total", "status" => "success").increment(updated as u64);
    counter!("firewall_relationship_updates_total", "status" => "failure").increment(failed as u64);
}

/// Record a rollup attempt (written, skipped, empty, failed)
pub fn record_rollup(aggregation_type: &str, outcome: &str) {
    counter!(
        "firewall_rollups_total",
        "type" => aggregation_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record rows removed by the retention sweep
pub fn record_retention(table: &str, deleted: u64) {
    counter!(
        "firewall_retention_deleted_total",
        "table" => table.to_string()
    )
    .increment(deleted);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "firewall_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "firewall_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "firewall_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "firewall_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self { component, operation, start: Instant::now() }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
