//! Projection of authoritative rules into the query path.
//!
//! A rule becomes visible to the evaluator through three structures: the
//! document index, the predicate cache (CIDR and regex rules) and the TTL
//! cache, which must be invalidated for the kind once the index write
//! lands. The event consumer, the retry worker and the syncers all funnel
//! through [`Projector`] so the three stay coherent.
//!
//! Invalidation also bumps a per-kind [`Generations`] counter. A reader
//! that fills the cache from the index samples the counter before its
//! lookup and discards the fill if the kind was invalidated meanwhile.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::cache::{self, SharedCache};
use crate::filter::predicates::PredicateCache;
use crate::rule::{EntityKind, Rule};
use crate::search::IndexAdapter;
use crate::storage::traits::StorageError;

/// An index mutation, as dispatched by the event consumer and replayed by
/// the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOp {
    Upsert(Rule),
    Delete { kind: EntityKind, id: String },
}

impl IndexOp {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            IndexOp::Upsert(rule) => rule.kind(),
            IndexOp::Delete { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn natural_id(&self) -> &str {
        match self {
            IndexOp::Upsert(rule) => rule.natural_key(),
            IndexOp::Delete { id, .. } => id,
        }
    }

    /// Retry-queue op kind, e.g. `sync_ip` or `delete_email`.
    #[must_use]
    pub fn op_kind(&self) -> String {
        match self {
            IndexOp::Upsert(rule) => format!("sync_{}", rule.kind()),
            IndexOp::Delete { kind, .. } => format!("delete_{}", kind),
        }
    }
}

impl fmt::Display for IndexOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op_kind(), self.natural_id())
    }
}

/// Per-kind invalidation counters.
#[derive(Debug, Default)]
pub struct Generations([AtomicU64; EntityKind::ALL.len()]);

impl Generations {
    #[must_use]
    pub fn current(&self, kind: EntityKind) -> u64 {
        self.0[kind as usize].load(Ordering::Acquire)
    }

    fn bump(&self, kind: EntityKind) {
        self.0[kind as usize].fetch_add(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct Projector {
    index: IndexAdapter,
    cache: SharedCache,
    predicates: Arc<PredicateCache>,
    generations: Arc<Generations>,
}

impl Projector {
    #[must_use]
    pub fn new(index: IndexAdapter, cache: SharedCache, predicates: Arc<PredicateCache>) -> Self {
        Self { index, cache, predicates, generations: Arc::default() }
    }

    #[must_use]
    pub fn index(&self) -> &IndexAdapter {
        &self.index
    }

    #[must_use]
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    #[must_use]
    pub fn predicates(&self) -> &Arc<PredicateCache> {
        &self.predicates
    }

    #[must_use]
    pub fn generations(&self) -> &Arc<Generations> {
        &self.generations
    }

    /// Apply an op and invalidate the kind's cache entries on success.
    pub async fn apply(&self, op: &IndexOp) -> Result<(), StorageError> {
        self.apply_uncached(op).await?;
        self.invalidate(op.kind()).await;
        Ok(())
    }

    /// Apply an op without touching the TTL cache. Batch callers invalidate
    /// once per kind afterwards.
    pub async fn apply_uncached(&self, op: &IndexOp) -> Result<(), StorageError> {
        match op {
            IndexOp::Upsert(rule) => {
                self.index.index(rule).await?;
                self.predicates.apply(rule);
            }
            IndexOp::Delete { kind, id } => {
                self.index.delete(*kind, id).await?;
                self.predicates.remove(*kind, id);
            }
        }
        debug!(op = %op, "Projected index op");
        Ok(())
    }

    /// Bump the kind's generation, then drop its cached filter results.
    /// The bump must precede the removal so a concurrent fill either sees
    /// the new generation or lands before the removal.
    pub async fn invalidate(&self, kind: EntityKind) -> bool {
        self.generations.bump(kind);
        cache::invalidate_kind(self.cache.as_ref(), kind.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{filter_key, Cache, MemoryCache, FILTER_TTL};
    use crate::rule::RuleStatus;
    use crate::search::InMemoryIndex;

    fn projector() -> (Projector, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let projector = Projector::new(
            IndexAdapter::new(Arc::new(InMemoryIndex::new())),
            cache.clone(),
            Arc::new(PredicateCache::new()),
        );
        (projector, cache)
    }

    #[test]
    fn test_op_kind() {
        let op = IndexOp::Upsert(Rule::ip("1.2.3.4", RuleStatus::Denied));
        assert_eq!(op.op_kind(), "sync_ip");
        assert_eq!(op.to_string(), "sync_ip(1.2.3.4)");

        let op = IndexOp::Delete { kind: EntityKind::UserAgent, id: "curl".into() };
        assert_eq!(op.op_kind(), "delete_user_agent");
    }

    #[tokio::test]
    async fn test_apply_indexes_and_invalidates() {
        let (projector, cache) = projector();
        cache.set(&filter_key("ip", "1.2.3.4"), "\"allowed\"", FILTER_TTL).await.unwrap();
        cache.set(&filter_key("email", "a@b.com"), "\"allowed\"", FILTER_TTL).await.unwrap();

        projector
            .apply(&IndexOp::Upsert(Rule::ip("1.2.3.4", RuleStatus::Denied)))
            .await
            .unwrap();

        assert_eq!(
            projector.index().lookup(EntityKind::Ip, "1.2.3.4").await.unwrap(),
            Some(RuleStatus::Denied)
        );
        assert!(cache.get(&filter_key("ip", "1.2.3.4")).await.unwrap().is_none());
        assert!(cache.get(&filter_key("email", "a@b.com")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidation_bumps_only_its_kind() {
        let (projector, _) = projector();
        let generations = Arc::clone(projector.generations());
        assert_eq!(generations.current(EntityKind::Ip), 0);

        projector
            .apply(&IndexOp::Upsert(Rule::ip("1.2.3.4", RuleStatus::Denied)))
            .await
            .unwrap();
        projector.invalidate(EntityKind::Ip).await;

        assert_eq!(generations.current(EntityKind::Ip), 2);
        assert_eq!(generations.current(EntityKind::Email), 0);
        assert_eq!(generations.current(EntityKind::Asn), 0);
    }

    #[tokio::test]
    async fn test_apply_tracks_patterns() {
        let (projector, _) = projector();
        projector
            .apply(&IndexOp::Upsert(Rule::ip("10.0.0.0/8", RuleStatus::Denied)))
            .await
            .unwrap();
        assert_eq!(projector.predicates().matches(EntityKind::Ip, "10.9.9.9"), Some(RuleStatus::Denied));

        projector
            .apply(&IndexOp::Delete { kind: EntityKind::Ip, id: "10.0.0.0/8".into() })
            .await
            .unwrap();
        assert_eq!(projector.predicates().matches(EntityKind::Ip, "10.9.9.9"), None);
    }
}
