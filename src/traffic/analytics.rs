// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hourly and daily rollups, plus the retention sweep.
//!
//! The aggregator reads traffic through [`TrafficStore`] only; it never
//! talks to the logger. Rollups are keyed by `(aggregation_date,
//! aggregation_type)` and written at most once, so the scheduler can tick
//! as often as it likes.
//!
//! ```text
//! tick(now)
//!   ├─ hourly rollup for the hour that just closed
//!   └─ 00:00–00:05 → daily rollup for yesterday + retention sweep
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Timelike, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::model::{
    AttributeTuple, FinalResult, Relationship, Rollup, RollupType, TopEntry, TopRelationship, TrafficLog,
};
use super::query::TrafficSummary;
use super::relationships::ATTRIBUTE_FIELDS;
use crate::metrics;
use crate::storage::traits::{StorageError, TrafficStore};

/// Entries kept per top-N list.
pub const TOP_N: usize = 10;

/// Daily rollups run while the clock is within this many minutes of midnight.
pub const DAILY_WINDOW_MINUTES: u32 = 5;

/// Outcome totals, average latency and cache-hit rate.
pub fn summarize(logs: &[TrafficLog]) -> TrafficSummary {
    let mut summary = TrafficSummary { total_requests: logs.len() as u64, ..Default::default() };
    if logs.is_empty() {
        return summary;
    }

    let mut response_total = 0u64;
    let mut hits = 0u64;
    for log in logs {
        *summary.by_result.entry(log.final_result.as_str().to_string()).or_default() += 1;
        response_total += log.response_time_ms;
        if log.cache_hit {
            hits += 1;
        }
    }
    let n = logs.len() as f64;
    summary.avg_response_time_ms = response_total as f64 / n;
    summary.cache_hit_rate = hits as f64 / n;
    summary
}

/// Top `limit` non-empty values of an attribute by count. Ties keep the
/// order in which values were first seen.
pub fn top_values(logs: &[TrafficLog], field: &str, limit: usize) -> Vec<TopEntry> {
    let mut counts: HashMap<&str, (u64, usize)> = HashMap::new();
    for (i, log) in logs.iter().enumerate() {
        let value = log.attributes.get(field);
        if value.is_empty() {
            continue;
        }
        counts.entry(value).or_insert((0, i)).0 += 1;
    }

    let mut ranked: Vec<(&str, u64, usize)> = counts.into_iter().map(|(v, (c, first))| (v, c, first)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(value, count, _)| TopEntry { value: value.to_string(), count })
        .collect()
}

/// Top `limit` relationships by summed frequency, grouped by type and tuple.
pub fn top_relationships(relationships: &[Relationship], limit: usize) -> Vec<TopRelationship> {
    let mut groups: HashMap<(&str, &AttributeTuple), (u64, usize)> = HashMap::new();
    for (i, r) in relationships.iter().enumerate() {
        groups
            .entry((r.relationship_type.as_str(), &r.attributes))
            .or_insert((0, i))
            .0 += r.frequency;
    }

    let mut ranked: Vec<_> = groups.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked
        .into_iter()
        .take(limit)
        .map(|((relationship_type, attributes), (frequency, _))| TopRelationship {
            relationship_type: relationship_type.to_string(),
            attributes: attributes.clone(),
            frequency,
        })
        .collect()
}

/// Build a rollup row from the logs and relationships of one window.
pub fn build_rollup(
    aggregation_date: DateTime<Utc>,
    aggregation_type: RollupType,
    logs: &[TrafficLog],
    relationships: &[Relationship],
) -> Rollup {
    let summary = summarize(logs);
    let count = |r: FinalResult| summary.by_result.get(r.as_str()).copied().unwrap_or(0);
    let top = |field: &str| top_values(logs, field, TOP_N);

    Rollup {
        aggregation_date,
        aggregation_type,
        total_requests: summary.total_requests,
        allowed_requests: count(FinalResult::Allowed),
        denied_requests: count(FinalResult::Denied),
        whitelisted_requests: count(FinalResult::Whitelisted),
        timeout_requests: count(FinalResult::Timeout),
        error_requests: count(FinalResult::Error),
        avg_response_time_ms: summary.avg_response_time_ms,
        cache_hit_rate: summary.cache_hit_rate,
        top_ips: top(ATTRIBUTE_FIELDS[0]),
        top_emails: top(ATTRIBUTE_FIELDS[1]),
        top_user_agents: top(ATTRIBUTE_FIELDS[2]),
        top_usernames: top(ATTRIBUTE_FIELDS[3]),
        top_countries: top(ATTRIBUTE_FIELDS[4]),
        top_charsets: top(ATTRIBUTE_FIELDS[5]),
        top_relationships: top_relationships(relationships, TOP_N),
        created_at: Utc::now(),
    }
}

/// Start of the window of `aggregation_type` containing `at`.
pub fn window_start(at: DateTime<Utc>, aggregation_type: RollupType) -> DateTime<Utc> {
    at.duration_trunc(aggregation_type.window()).unwrap_or(at)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupOutcome {
    Written,
    AlreadyExists,
    NoTraffic,
}

impl RollupOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Written => "written",
            Self::AlreadyExists => "skipped",
            Self::NoTraffic => "empty",
        }
    }
}

/// Rows removed by a retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub logs: u64,
    pub relationships: u64,
}

pub struct Analytics {
    store: Arc<dyn TrafficStore>,
    retention_days: u32,
}

impl Analytics {
    #[must_use]
    pub fn new(store: Arc<dyn TrafficStore>, retention_days: u32) -> Self {
        Self { store, retention_days }
    }

    /// Roll up the window starting at `start`.
    #[instrument(skip(self), fields(aggregation_type = %aggregation_type))]
    pub async fn rollup(
        &self,
        aggregation_type: RollupType,
        start: DateTime<Utc>,
    ) -> Result<RollupOutcome, StorageError> {
        let start = window_start(start, aggregation_type);
        let outcome = self.rollup_inner(aggregation_type, start).await;
        match &outcome {
            Ok(o) => metrics::record_rollup(aggregation_type.as_str(), o.as_str()),
            Err(_) => metrics::record_rollup(aggregation_type.as_str(), "failed"),
        }
        outcome
    }

    async fn rollup_inner(
        &self,
        aggregation_type: RollupType,
        start: DateTime<Utc>,
    ) -> Result<RollupOutcome, StorageError> {
        if self.store.rollup_exists(start, aggregation_type).await? {
            debug!(%start, "Rollup already exists");
            return Ok(RollupOutcome::AlreadyExists);
        }

        let end = start + aggregation_type.window();
        let logs = self.store.logs_between(start, end).await?;
        if logs.is_empty() {
            debug!(%start, "No traffic in window");
            return Ok(RollupOutcome::NoTraffic);
        }
        let relationships = self.store.relationships_between(start, end).await?;

        let rollup = build_rollup(start, aggregation_type, &logs, &relationships);
        if !self.store.insert_rollup(&rollup).await? {
            // Lost a race with another instance
            return Ok(RollupOutcome::AlreadyExists);
        }
        info!(
            %start,
            total = rollup.total_requests,
            denied = rollup.denied_requests,
            "Rollup written"
        );
        Ok(RollupOutcome::Written)
    }

    /// Hourly rollup of the hour before `now`; daily rollup of the day
    /// before and a retention sweep when `now` is just past midnight.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let previous_hour = window_start(now, RollupType::Hourly) - RollupType::Hourly.window();
        if let Err(e) = self.rollup(RollupType::Hourly, previous_hour).await {
            warn!(error = %e, "Hourly rollup failed");
        }

        if now.hour() == 0 && now.minute() < DAILY_WINDOW_MINUTES {
            let yesterday = window_start(now, RollupType::Daily) - RollupType::Daily.window();
            if let Err(e) = self.rollup(RollupType::Daily, yesterday).await {
                warn!(error = %e, "Daily rollup failed");
            }
            if let Err(e) = self.cleanup(self.retention_days).await {
                warn!(error = %e, "Retention sweep failed");
            }
        }
    }

    /// Delete logs older than `retention_days` and relationships not seen since.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, retention_days: u32) -> Result<RetentionReport, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let logs = self.store.delete_logs_before(cutoff).await?;
        let relationships = self.store.delete_relationships_before(cutoff).await?;
        metrics::record_retention("traffic_logs", logs);
        metrics::record_retention("relationships", relationships);
        info!(logs, relationships, %cutoff, "Retention sweep complete");
        Ok(RetentionReport { logs, relationships })
    }

    /// Tick every `interval` until cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(?interval, "Analytics scheduler started");
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.tick(Utc::now()).await,
                }
            }
            info!("Analytics scheduler stopped");
        })
    }
}
