//! Decision and rule-mutation entry points.
//!
//! - `decide()` - validate, then enrich and evaluate under one deadline, then
//!   hand the record to the background logger
//! - `upsert_rule()` / `delete_rule()` - write the store, then publish
//! - `import_rules()` / `import_spamhaus()` - bulk writes as `imported` events

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{Decision, Firewall};
use crate::events::RuleAction;
use crate::filter::types::{FilterError, FilterRequest, Verdict};
use crate::geo;
use crate::import::{ImportError, ImportReport};
use crate::metrics;
use crate::normalize;
use crate::rule::{EntityKind, Rule, StoredRule};
use crate::storage::traits::StorageError;
use crate::traffic::{DecisionRecord, FinalResult};

fn final_result(outcome: &Result<Verdict, FilterError>) -> FinalResult {
    match outcome {
        Ok(Verdict::Allowed) => FinalResult::Allowed,
        Ok(Verdict::Denied(_)) => FinalResult::Denied,
        Ok(Verdict::Whitelisted(_)) => FinalResult::Whitelisted,
        Err(FilterError::DeadlineExceeded) => FinalResult::Timeout,
        Err(_) => FinalResult::Error,
    }
}

/// Key form the store holds for a request-shaped value.
fn normalized_key(kind: EntityKind, key: &str) -> Option<String> {
    match kind {
        EntityKind::Ip => Some(normalize::ip(key)),
        EntityKind::Email => Some(normalize::email(key)),
        EntityKind::Country => Some(normalize::country(key)),
        EntityKind::Asn => normalize::asn(key),
        EntityKind::UserAgent | EntityKind::Charset | EntityKind::Username => None,
    }
    .filter(|normalized| normalized != key)
}

impl Firewall {
    /// Decide one request.
    ///
    /// Invalid requests are rejected before any lookup and are not logged.
    /// Every evaluated request is logged, including timeouts and backend
    /// errors.
    #[instrument(skip(self, request))]
    pub async fn decide(&self, mut request: FilterRequest) -> Result<Decision, FilterError> {
        let start = Instant::now();
        if let Err(e) = request.validate() {
            metrics::record_decision("invalid");
            return Err(e);
        }

        // Enrichment and evaluation share one deadline.
        let deadline = start + self.config.filter.deadline();
        if tokio::time::timeout_at(deadline, geo::enrich(self.geo.as_ref(), &mut request))
            .await
            .is_err()
        {
            warn!(backend = self.geo.backend_name(), "Geo enrichment hit the request deadline");
        }

        let evaluation = self
            .evaluator
            .evaluate(request.dimensions(), deadline.saturating_duration_since(Instant::now()))
            .await;
        let result = final_result(&evaluation.outcome);
        let cache_hit = evaluation.cache_hit();
        let response_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let request_id = self.logger.log(DecisionRecord {
            attributes: request.attributes(),
            asn: request.normalized_asn(),
            final_result: result,
            filter_results: evaluation.results_json(),
            response_time_ms,
            cache_hit,
            metadata: request.metadata.clone(),
        });

        metrics::record_decision(result.as_str());
        metrics::record_decision_latency(start.elapsed());

        let verdict = evaluation.outcome?;
        debug!(result = %result, cache_hit, response_time_ms, "Decision made");
        Ok(Decision {
            response: verdict.response(),
            request_id,
            cache_hit,
            response_time_ms,
            dimensions: evaluation.results,
        })
    }

    /// Create or replace a rule by its natural key.
    ///
    /// The store write is the commit point. A dropped event only delays
    /// projection until the next incremental sync.
    #[instrument(skip(self, rule), fields(kind = %rule.kind()))]
    pub async fn upsert_rule(&self, rule: Rule) -> Result<StoredRule, StorageError> {
        let rule = rule.normalized();
        rule.validate().map_err(StorageError::InvalidRule)?;

        let action = match self.rules.get_rule(rule.kind(), rule.natural_key()).await? {
            Some(_) => RuleAction::Updated,
            None => RuleAction::Created,
        };
        let stored = self.rules.upsert_rule(&rule).await?;
        if !self.events.publish(action, stored.rule.clone()) {
            warn!(key = rule.natural_key(), %action, "Rule event dropped, projection deferred to sync");
        }
        Ok(stored)
    }

    /// Remove a rule. Returns false when no rule had that key.
    #[instrument(skip(self))]
    pub async fn delete_rule(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        let mut existing = self.rules.get_rule(kind, key).await?;
        if existing.is_none() {
            if let Some(normalized) = normalized_key(kind, key) {
                existing = self.rules.get_rule(kind, &normalized).await?;
            }
        }
        let Some(stored) = existing else {
            return Ok(false);
        };

        let removed = self.rules.delete_rule(kind, stored.rule.natural_key()).await?;
        if removed && !self.events.publish(RuleAction::Deleted, stored.rule) {
            warn!(%kind, key, "Delete event dropped, index entry remains until full sync");
        }
        Ok(removed)
    }

    /// Store a batch of rules and publish each as `imported`. Invalid rules
    /// are counted and skipped; a store failure aborts the batch.
    #[instrument(skip(self, rules), fields(count = rules.len()))]
    pub async fn import_rules(&self, rules: Vec<Rule>) -> Result<ImportReport, StorageError> {
        let mut report = ImportReport::default();
        for rule in rules {
            let rule = rule.normalized();
            if let Err(reason) = rule.validate() {
                debug!(reason, "Rejected imported rule");
                report.rejected += 1;
                continue;
            }
            let stored = self.rules.upsert_rule(&rule).await?;
            report.imported += 1;
            if !self.events.publish(RuleAction::Imported, stored.rule) {
                report.events_dropped += 1;
            }
        }
        if report.events_dropped > 0 {
            warn!(dropped = report.events_dropped, "Import outran the event channel, sync will catch up");
        }
        info!(imported = report.imported, rejected = report.rejected, "Rule import complete");
        Ok(report)
    }

    /// Download the Spamhaus ASN-DROP feed and import it as denied ASNs.
    pub async fn import_spamhaus(&self) -> Result<ImportReport, ImportError> {
        let feed = self.importer.fetch().await?;
        Ok(self.import_rules(feed.rules).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::FirewallConfig;
    use crate::coordinator::Backends;
    use crate::rule::RuleStatus;

    async fn running() -> Firewall {
        let fw = Firewall::new(FirewallConfig::default(), Backends::in_memory()).unwrap();
        fw.start().await.unwrap();
        fw
    }

    #[tokio::test]
    async fn test_upsert_then_decide_denies() {
        let fw = running().await;
        fw.upsert_rule(Rule::ip("1.2.3.4", RuleStatus::Denied)).await.unwrap();
        assert!(fw.events().wait_idle(Duration::from_secs(2)).await);

        let decision = fw.decide(FilterRequest::new().with_ip("1.2.3.4")).await.unwrap();
        assert_eq!(decision.response.kind, "IP");
        assert_eq!(decision.response.status, RuleStatus::Denied);
        fw.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_logged() {
        let fw = running().await;
        let err = fw.decide(FilterRequest::new()).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let decision = fw.decide(FilterRequest::new().with_email("a@b.com")).await.unwrap();
        assert!(decision.request_id.is_some());
        assert_eq!(decision.response.kind, "All");
        fw.shutdown().await;
    }

    #[tokio::test]
    async fn test_upsert_rejects_invalid_rule() {
        let fw = running().await;
        let err = fw.upsert_rule(Rule::ip("not-an-ip", RuleStatus::Denied)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRule(_)));
        fw.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_accepts_unnormalized_key() {
        let fw = running().await;
        fw.upsert_rule(Rule::country("de", RuleStatus::Denied)).await.unwrap();
        assert!(fw.delete_rule(EntityKind::Country, "de").await.unwrap());
        assert!(!fw.delete_rule(EntityKind::Country, "DE").await.unwrap());
        fw.shutdown().await;
    }

    #[tokio::test]
    async fn test_import_counts_rejected() {
        let fw = running().await;
        let report = fw
            .import_rules(vec![
                Rule::asn("AS13335", RuleStatus::Denied),
                Rule::asn("", RuleStatus::Denied),
            ])
            .await
            .unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.rejected, 1);
        fw.shutdown().await;
    }

    #[tokio::test]
    async fn test_spamhaus_without_url() {
        let fw = running().await;
        assert!(matches!(fw.import_spamhaus().await, Err(ImportError::NotConfigured)));
        fw.shutdown().await;
    }

    #[test]
    fn test_normalized_key() {
        assert_eq!(normalized_key(EntityKind::Asn, "as15169").as_deref(), Some("AS15169"));
        assert_eq!(normalized_key(EntityKind::Country, "US"), None);
        assert_eq!(normalized_key(EntityKind::Username, "Bob"), None);
    }
}
