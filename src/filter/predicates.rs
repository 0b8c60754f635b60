//! In-process predicates for rules an exact term query cannot answer.
//!
//! CIDR blocks (IP kind) and regex rules (email, user-agent, username) are
//! compiled here. The projector keeps the cache in step with the index;
//! full resync rebuilds it per kind. When several predicates match one
//! value, the strongest status wins (whitelisted over denied over allowed),
//! mirroring how dimensions aggregate.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use regex::Regex;
use tracing::warn;

use crate::rule::{EntityKind, Rule, RuleStatus};

enum Matcher {
    Cidr(IpNetwork),
    Pattern(Regex),
}

impl Matcher {
    fn compile(rule: &Rule) -> Option<Self> {
        let key = rule.natural_key();
        let compiled = match rule.kind() {
            EntityKind::Ip => key.parse::<IpNetwork>().map(Matcher::Cidr).map_err(|e| e.to_string()),
            _ => Regex::new(key).map(Matcher::Pattern).map_err(|e| e.to_string()),
        };
        match compiled {
            Ok(m) => Some(m),
            Err(e) => {
                warn!(kind = %rule.kind(), key, error = %e, "Skipping uncompilable pattern rule");
                None
            }
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Cidr(net) => value.parse::<IpAddr>().is_ok_and(|ip| net.contains(ip)),
            Matcher::Pattern(re) => re.is_match(value),
        }
    }
}

const fn strength(status: RuleStatus) -> u8 {
    match status {
        RuleStatus::Allowed => 0,
        RuleStatus::Denied => 1,
        RuleStatus::Whitelisted => 2,
    }
}

type KindPredicates = BTreeMap<String, (Matcher, RuleStatus)>;

#[derive(Default)]
pub struct PredicateCache {
    by_kind: RwLock<HashMap<EntityKind, KindPredicates>>,
}

impl PredicateCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a rule. Literal rules evict any pattern previously stored
    /// under the same key.
    pub fn apply(&self, rule: &Rule) {
        let kind = rule.kind();
        let key = rule.natural_key().to_string();

        if !rule.is_pattern() {
            self.remove(kind, &key);
            return;
        }
        let Some(matcher) = Matcher::compile(rule) else {
            return;
        };
        self.by_kind
            .write()
            .entry(kind)
            .or_default()
            .insert(key, (matcher, rule.status()));
    }

    pub fn remove(&self, kind: EntityKind, key: &str) -> bool {
        self.by_kind
            .write()
            .get_mut(&kind)
            .is_some_and(|preds| preds.remove(key).is_some())
    }

    /// Replace every predicate of `kind` with the pattern rules in `rules`.
    pub fn rebuild<'a>(&self, kind: EntityKind, rules: impl IntoIterator<Item = &'a Rule>) -> usize {
        let fresh: KindPredicates = rules
            .into_iter()
            .filter(|r| r.kind() == kind && r.is_pattern())
            .filter_map(|r| Matcher::compile(r).map(|m| (r.natural_key().to_string(), (m, r.status()))))
            .collect();
        let count = fresh.len();
        self.by_kind.write().insert(kind, fresh);
        count
    }

    /// Strongest status among the predicates matching `value`.
    #[must_use]
    pub fn matches(&self, kind: EntityKind, value: &str) -> Option<RuleStatus> {
        let guard = self.by_kind.read();
        guard
            .get(&kind)?
            .values()
            .filter(|(m, _)| m.matches(value))
            .map(|(_, status)| *status)
            .max_by_key(|s| strength(*s))
    }

    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.by_kind.read().get(&kind).map_or(0, BTreeMap::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_kind.read().values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_containment() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("10.0.0.0/8", RuleStatus::Denied));

        assert_eq!(preds.matches(EntityKind::Ip, "10.20.30.40"), Some(RuleStatus::Denied));
        assert_eq!(preds.matches(EntityKind::Ip, "11.0.0.1"), None);
        assert_eq!(preds.matches(EntityKind::Ip, "not-an-ip"), None);
    }

    #[test]
    fn test_ipv6_cidr() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("2001:db8::/32", RuleStatus::Denied));
        assert_eq!(preds.matches(EntityKind::Ip, "2001:db8::1"), Some(RuleStatus::Denied));
        assert_eq!(preds.matches(EntityKind::Ip, "10.0.0.1"), None);
    }

    #[test]
    fn test_literal_rules_not_tracked() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("1.2.3.4", RuleStatus::Denied));
        assert!(preds.is_empty());
    }

    #[test]
    fn test_regex_applies_pattern_not_substring() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::user_agent("^curl/", RuleStatus::Denied).as_regex());

        assert_eq!(preds.matches(EntityKind::UserAgent, "curl/8.4.0"), Some(RuleStatus::Denied));
        assert_eq!(preds.matches(EntityKind::UserAgent, "Mozilla curl/8.4.0"), None);
        // Other kinds unaffected
        assert_eq!(preds.matches(EntityKind::Username, "curl/8.4.0"), None);
    }

    #[test]
    fn test_strongest_status_wins() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("10.0.0.0/8", RuleStatus::Denied));
        preds.apply(&Rule::ip("10.1.0.0/16", RuleStatus::Whitelisted));

        assert_eq!(preds.matches(EntityKind::Ip, "10.1.2.3"), Some(RuleStatus::Whitelisted));
        assert_eq!(preds.matches(EntityKind::Ip, "10.2.2.3"), Some(RuleStatus::Denied));
    }

    #[test]
    fn test_update_and_remove() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("10.0.0.0/8", RuleStatus::Denied));
        preds.apply(&Rule::ip("10.0.0.0/8", RuleStatus::Allowed));
        assert_eq!(preds.len(EntityKind::Ip), 1);
        assert_eq!(preds.matches(EntityKind::Ip, "10.0.0.1"), Some(RuleStatus::Allowed));

        assert!(preds.remove(EntityKind::Ip, "10.0.0.0/8"));
        assert!(!preds.remove(EntityKind::Ip, "10.0.0.0/8"));
        assert_eq!(preds.matches(EntityKind::Ip, "10.0.0.1"), None);
    }

    #[test]
    fn test_rebuild_replaces_kind() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::ip("10.0.0.0/8", RuleStatus::Denied));
        preds.apply(&Rule::email(".*@spam\\.com", RuleStatus::Denied).as_regex());

        let rules = vec![
            Rule::ip("192.168.0.0/16", RuleStatus::Denied),
            Rule::ip("1.1.1.1", RuleStatus::Denied),
        ];
        assert_eq!(preds.rebuild(EntityKind::Ip, &rules), 1);
        assert_eq!(preds.matches(EntityKind::Ip, "10.0.0.1"), None);
        assert_eq!(preds.matches(EntityKind::Ip, "192.168.1.1"), Some(RuleStatus::Denied));
        assert_eq!(preds.len(EntityKind::Email), 1);
    }

    #[test]
    fn test_bad_regex_skipped() {
        let preds = PredicateCache::new();
        preds.apply(&Rule::username("(", RuleStatus::Denied).as_regex());
        assert!(preds.is_empty());
    }
}
