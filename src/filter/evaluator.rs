// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrent multi-dimension evaluation under a deadline.
//!
//! ```text
//!             ┌─ ip ─────── cache ─► index ─► predicates ─┐
//! request ────┼─ email ──── cache ─► index ─► predicates ─┼─► Aggregator ─► Verdict
//!             └─ country ── cache ─► index ───────────────┘        ▲
//!                                                        deadline ─┘
//! ```
//!
//! Each dimension runs on its own task in a [`JoinSet`]. Whitelist
//! short-circuit and deadline expiry both drop the set, which aborts the
//! lookups still in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::aggregate::{Aggregator, Step};
use super::predicates::PredicateCache;
use super::types::{DimensionOutcome, DimensionResult, FilterError, Verdict};
use crate::cache::{self, filter_key, Cache, SharedCache};
use crate::metrics;
use crate::projection::{Generations, Projector};
use crate::rule::{EntityKind, RuleStatus};
use crate::search::IndexAdapter;

/// Everything observed while evaluating one request, whatever the outcome.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: Result<Verdict, FilterError>,
    /// Dimensions that reported before the evaluation ended, in arrival order.
    pub results: Vec<DimensionResult>,
    pub elapsed: Duration,
}

impl Evaluation {
    /// True if any reported dimension was answered from the cache.
    #[must_use]
    pub fn cache_hit(&self) -> bool {
        self.results.iter().any(|r| r.cache_hit)
    }

    /// `{"ip": "denied", "email": "allowed", ...}`
    #[must_use]
    pub fn results_json(&self) -> Value {
        let map: Map<String, Value> = self
            .results
            .iter()
            .map(|r| (r.kind.as_str().to_string(), Value::from(r.outcome.as_str())))
            .collect();
        Value::Object(map)
    }
}

#[derive(Clone)]
pub struct FilterEvaluator {
    index: IndexAdapter,
    cache: SharedCache,
    predicates: Arc<PredicateCache>,
    generations: Arc<Generations>,
    filter_ttl: Duration,
}

impl FilterEvaluator {
    #[must_use]
    pub fn new(projector: &Projector, filter_ttl: Duration) -> Self {
        Self {
            index: projector.index().clone(),
            cache: Arc::clone(projector.cache()),
            predicates: Arc::clone(projector.predicates()),
            generations: Arc::clone(projector.generations()),
            filter_ttl,
        }
    }

    /// Evaluate every dimension concurrently. A zero deadline times out
    /// before any lookup is issued.
    pub async fn evaluate(&self, dimensions: Vec<(EntityKind, String)>, deadline: Duration) -> Evaluation {
        let start = Instant::now();
        if deadline.is_zero() {
            return Evaluation {
                outcome: Err(FilterError::DeadlineExceeded),
                results: Vec::new(),
                elapsed: start.elapsed(),
            };
        }

        let mut tasks = JoinSet::new();
        for (kind, value) in dimensions {
            let evaluator = self.clone();
            tasks.spawn(async move { evaluator.evaluate_dimension(kind, value).await });
        }

        let mut aggregator = Aggregator::new();
        let mut results = Vec::with_capacity(tasks.len());
        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);

        let timed_out = loop {
            tokio::select! {
                biased;
                () = &mut expiry => break true,
                joined = tasks.join_next() => match joined {
                    None => break false,
                    Some(Ok(result)) => {
                        let step = aggregator.push(&result);
                        results.push(result);
                        if step == Step::ShortCircuit {
                            break false;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Dimension task failed");
                        aggregator.record_error(None);
                    }
                },
            }
        };
        tasks.abort_all();

        let outcome = if timed_out {
            debug!(reported = results.len(), ?deadline, "Evaluation deadline exceeded");
            Err(FilterError::DeadlineExceeded)
        } else {
            aggregator.finish()
        };
        Evaluation { outcome, results, elapsed: start.elapsed() }
    }

    /// Cache, then exact index match, then pattern predicates; absent means
    /// allowed. Backend errors are reported, never cached.
    async fn evaluate_dimension(&self, kind: EntityKind, value: String) -> DimensionResult {
        let key = filter_key(kind.as_str(), &value);

        if let Some(status) = cache::get_json::<RuleStatus>(self.cache.as_ref(), &key).await {
            metrics::record_dimension(kind.as_str(), status.as_str(), true);
            return DimensionResult { kind, value, outcome: status.into(), cache_hit: true };
        }

        let generation = self.generations.current(kind);
        let outcome = match self.index.lookup(kind, &value).await {
            Ok(found) => {
                let status = found
                    .or_else(|| self.predicates.matches(kind, &value))
                    .unwrap_or(RuleStatus::Allowed);
                self.fill_cache(kind, &key, &status, generation).await;
                DimensionOutcome::from(status)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Index lookup failed");
                DimensionOutcome::Error
            }
        };
        metrics::record_dimension(kind.as_str(), outcome.as_str(), false);
        DimensionResult { kind, value, outcome, cache_hit: false }
    }

    /// Cache a looked-up status unless the kind was invalidated after
    /// `generation` was sampled. The second check catches an invalidation
    /// that raced the write itself.
    async fn fill_cache(&self, kind: EntityKind, key: &str, status: &RuleStatus, generation: u64) {
        if self.generations.current(kind) != generation {
            debug!(kind = %kind, "Skipping cache fill after invalidation");
            return;
        }
        cache::set_json(self.cache.as_ref(), key, status, self.filter_ttl).await;
        if self.generations.current(kind) != generation {
            if let Err(e) = self.cache.delete(key).await {
                warn!(key, error = %e, "Failed to drop raced cache fill");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::projection::IndexOp;
    use crate::rule::Rule;
    use crate::search::{DocumentIndex, InMemoryIndex};
    use crate::storage::traits::StorageError;
    use async_trait::async_trait;

    fn evaluator_with(index: Arc<dyn DocumentIndex>) -> (FilterEvaluator, Projector, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let projector = Projector::new(IndexAdapter::new(index), cache.clone(), Arc::new(PredicateCache::new()));
        (FilterEvaluator::new(&projector, Duration::from_secs(300)), projector, cache)
    }

    fn evaluator() -> (FilterEvaluator, Projector, Arc<MemoryCache>) {
        evaluator_with(Arc::new(InMemoryIndex::new()))
    }

    fn dims(pairs: &[(EntityKind, &str)]) -> Vec<(EntityKind, String)> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    /// Counts searches and never answers.
    struct StallingIndex(std::sync::atomic::AtomicUsize);

    #[async_trait]
    impl DocumentIndex for StallingIndex {
        async fn upsert(&self, _: &str, _: &str, _: &Value) -> Result<(), StorageError> {
            Ok(())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
        async fn search_term(&self, _: &str, _: &str, _: &str, _: usize) -> Result<Vec<Value>, StorageError> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::future::pending().await
        }
        fn backend_name(&self) -> &'static str {
            "stalling"
        }
    }

    /// Reads the inner index, then holds the answer back for `delay`.
    struct SlowIndex {
        inner: InMemoryIndex,
        delay: Duration,
    }

    #[async_trait]
    impl DocumentIndex for SlowIndex {
        async fn upsert(&self, index: &str, id: &str, doc: &Value) -> Result<(), StorageError> {
            self.inner.upsert(index, id, doc).await
        }
        async fn delete(&self, index: &str, id: &str) -> Result<(), StorageError> {
            self.inner.delete(index, id).await
        }
        async fn search_term(&self, index: &str, field: &str, value: &str, limit: usize) -> Result<Vec<Value>, StorageError> {
            let found = self.inner.search_term(index, field, value, limit).await;
            tokio::time::sleep(self.delay).await;
            found
        }
        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    struct FailingIndex;

    #[async_trait]
    impl DocumentIndex for FailingIndex {
        async fn upsert(&self, _: &str, _: &str, _: &Value) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        async fn search_term(&self, _: &str, _: &str, _: &str, _: usize) -> Result<Vec<Value>, StorageError> {
            Err(StorageError::Backend("down".into()))
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_absent_rules_allow() {
        let (evaluator, _, _) = evaluator();
        let eval = evaluator
            .evaluate(dims(&[(EntityKind::Ip, "8.8.8.8"), (EntityKind::Email, "a@b.com")]), Duration::from_secs(5))
            .await;
        assert_eq!(eval.outcome, Ok(Verdict::Allowed));
        assert_eq!(eval.results.len(), 2);
        assert!(!eval.cache_hit());
    }

    #[tokio::test]
    async fn test_deny_and_cache_hit_on_repeat() {
        let (evaluator, projector, _) = evaluator();
        projector.index().index(&Rule::ip("1.2.3.4", RuleStatus::Denied)).await.unwrap();

        let request = dims(&[(EntityKind::Ip, "1.2.3.4"), (EntityKind::Country, "DE")]);
        let first = evaluator.evaluate(request.clone(), Duration::from_secs(5)).await;
        assert_eq!(first.outcome, Ok(Verdict::Denied(EntityKind::Ip)));
        assert!(!first.cache_hit());

        let second = evaluator.evaluate(request, Duration::from_secs(5)).await;
        assert_eq!(second.outcome, first.outcome);
        assert!(second.results.iter().all(|r| r.cache_hit));
        assert_eq!(second.results_json()["ip"], "denied");
    }

    #[tokio::test]
    async fn test_cidr_and_regex_predicates() {
        let (evaluator, projector, _) = evaluator();
        projector.predicates().apply(&Rule::ip("10.0.0.0/8", RuleStatus::Denied));
        projector.predicates().apply(&Rule::user_agent("^curl/", RuleStatus::Whitelisted).as_regex());

        let eval = evaluator.evaluate(dims(&[(EntityKind::Ip, "10.1.2.3")]), Duration::from_secs(5)).await;
        assert_eq!(eval.outcome, Ok(Verdict::Denied(EntityKind::Ip)));

        let eval = evaluator
            .evaluate(dims(&[(EntityKind::UserAgent, "curl/8.1")]), Duration::from_secs(5))
            .await;
        assert_eq!(eval.outcome, Ok(Verdict::Whitelisted(EntityKind::UserAgent)));
    }

    #[tokio::test]
    async fn test_zero_deadline_issues_no_query() {
        let index = Arc::new(StallingIndex(Default::default()));
        let (evaluator, _, _) = evaluator_with(index.clone());
        let eval = evaluator.evaluate(dims(&[(EntityKind::Ip, "1.1.1.1")]), Duration::ZERO).await;
        assert_eq!(eval.outcome, Err(FilterError::DeadlineExceeded));
        assert_eq!(index.0.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out() {
        let (evaluator, _, _) = evaluator_with(Arc::new(StallingIndex(Default::default())));
        let eval = evaluator
            .evaluate(dims(&[(EntityKind::Ip, "1.1.1.1"), (EntityKind::Email, "x@y.z")]), Duration::from_secs(5))
            .await;
        assert_eq!(eval.outcome, Err(FilterError::DeadlineExceeded));
        assert!(eval.results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_overtaken_by_update_is_not_cached() {
        let index = Arc::new(SlowIndex { inner: InMemoryIndex::new(), delay: Duration::from_millis(100) });
        let (evaluator, projector, cache) = evaluator_with(index);
        projector
            .apply(&IndexOp::Upsert(Rule::ip("1.2.3.4", RuleStatus::Denied)))
            .await
            .unwrap();

        let request = dims(&[(EntityKind::Ip, "1.2.3.4")]);
        let in_flight = {
            let evaluator = evaluator.clone();
            let request = request.clone();
            tokio::spawn(async move { evaluator.evaluate(request, Duration::from_secs(5)).await })
        };

        // The lookup has read "denied" and is parked in the slow index.
        tokio::time::sleep(Duration::from_millis(20)).await;
        projector
            .apply(&IndexOp::Upsert(Rule::ip("1.2.3.4", RuleStatus::Allowed)))
            .await
            .unwrap();

        let stale = in_flight.await.unwrap();
        assert_eq!(stale.outcome, Ok(Verdict::Denied(EntityKind::Ip)));
        assert!(cache.get(&filter_key("ip", "1.2.3.4")).await.unwrap().is_none());

        let fresh = evaluator.evaluate(request, Duration::from_secs(5)).await;
        assert_eq!(fresh.outcome, Ok(Verdict::Allowed));
        assert!(!fresh.cache_hit());
        assert_eq!(
            cache::get_json::<RuleStatus>(cache.as_ref(), &filter_key("ip", "1.2.3.4")).await,
            Some(RuleStatus::Allowed)
        );
    }

    #[tokio::test]
    async fn test_backend_error_surfaces_and_is_not_cached() {
        let (evaluator, _, cache) = evaluator_with(Arc::new(FailingIndex));
        let eval = evaluator.evaluate(dims(&[(EntityKind::Ip, "1.1.1.1")]), Duration::from_secs(5)).await;
        assert!(matches!(eval.outcome, Err(FilterError::Backend(_))));
        assert_eq!(eval.results_json()["ip"], "error");
        assert!(cache.get(&filter_key("ip", "1.1.1.1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cached_deny_beats_backend_error() {
        let (evaluator, _, cache) = evaluator_with(Arc::new(FailingIndex));
        cache::set_json(cache.as_ref(), &filter_key("country", "KP"), &RuleStatus::Denied, Duration::from_secs(60)).await;
        let eval = evaluator
            .evaluate(dims(&[(EntityKind::Ip, "1.1.1.1"), (EntityKind::Country, "KP")]), Duration::from_secs(5))
            .await;
        assert_eq!(eval.outcome, Ok(Verdict::Denied(EntityKind::Country)));
    }
}
