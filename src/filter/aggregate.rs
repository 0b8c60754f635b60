//! Fold of per-dimension outcomes into one verdict.
//!
//! Results are pushed in arrival order:
//!
//! - `whitelisted` ends the evaluation immediately
//! - `denied` replaces the running verdict (the last deny names the type)
//! - `allowed` never overrides a deny
//! - `error` only surfaces when nothing denied or whitelisted

use super::types::{DimensionOutcome, DimensionResult, FilterError, Verdict};
use crate::rule::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    ShortCircuit,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    running: Verdict,
    error: Option<String>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    #[must_use]
    pub fn new() -> Self {
        Self { running: Verdict::Allowed, error: None }
    }

    pub fn push(&mut self, result: &DimensionResult) -> Step {
        match result.outcome {
            DimensionOutcome::Whitelisted => {
                self.running = Verdict::Whitelisted(result.kind);
                Step::ShortCircuit
            }
            DimensionOutcome::Denied => {
                self.running = Verdict::Denied(result.kind);
                Step::Continue
            }
            DimensionOutcome::Allowed => Step::Continue,
            DimensionOutcome::Error => {
                self.record_error(Some(result.kind));
                Step::Continue
            }
        }
    }

    /// Note a failed dimension whose kind may be unknown (a panicked task).
    pub fn record_error(&mut self, kind: Option<EntityKind>) {
        if self.error.is_none() {
            self.error = Some(match kind {
                Some(kind) => format!("{} lookup failed", kind),
                None => "dimension task failed".to_string(),
            });
        }
    }

    pub fn finish(self) -> Result<Verdict, FilterError> {
        match (self.running, self.error) {
            (Verdict::Allowed, Some(error)) => Err(FilterError::Backend(error)),
            (verdict, _) => Ok(verdict),
        }
    }
}

/// Aggregate a complete, ordered result set.
pub fn fold<'a>(results: impl IntoIterator<Item = &'a DimensionResult>) -> Result<Verdict, FilterError> {
    let mut aggregator = Aggregator::new();
    for result in results {
        if aggregator.push(result) == Step::ShortCircuit {
            break;
        }
    }
    aggregator.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(kind: EntityKind, outcome: DimensionOutcome) -> DimensionResult {
        DimensionResult { kind, value: String::new(), outcome, cache_hit: false }
    }

    #[test]
    fn test_all_allowed() {
        let results = [r(EntityKind::Ip, DimensionOutcome::Allowed), r(EntityKind::Email, DimensionOutcome::Allowed)];
        assert_eq!(fold(&results), Ok(Verdict::Allowed));
        assert_eq!(fold(&[]), Ok(Verdict::Allowed));
    }

    #[test]
    fn test_deny_dominates_allow() {
        let results = [
            r(EntityKind::Ip, DimensionOutcome::Denied),
            r(EntityKind::Email, DimensionOutcome::Allowed),
        ];
        assert_eq!(fold(&results), Ok(Verdict::Denied(EntityKind::Ip)));
    }

    #[test]
    fn test_last_deny_names_type() {
        let results = [
            r(EntityKind::Ip, DimensionOutcome::Denied),
            r(EntityKind::Country, DimensionOutcome::Denied),
        ];
        assert_eq!(fold(&results), Ok(Verdict::Denied(EntityKind::Country)));
    }

    #[test]
    fn test_whitelist_short_circuits_in_any_position() {
        let results = [
            r(EntityKind::Ip, DimensionOutcome::Denied),
            r(EntityKind::Email, DimensionOutcome::Whitelisted),
            r(EntityKind::Country, DimensionOutcome::Denied),
        ];
        assert_eq!(fold(&results), Ok(Verdict::Whitelisted(EntityKind::Email)));

        let mut agg = Aggregator::new();
        assert_eq!(agg.push(&r(EntityKind::Asn, DimensionOutcome::Whitelisted)), Step::ShortCircuit);
    }

    #[test]
    fn test_error_surfaces_only_without_decisive_result() {
        let results = [r(EntityKind::Ip, DimensionOutcome::Error), r(EntityKind::Email, DimensionOutcome::Allowed)];
        assert!(matches!(fold(&results), Err(FilterError::Backend(_))));

        let results = [r(EntityKind::Ip, DimensionOutcome::Error), r(EntityKind::Email, DimensionOutcome::Denied)];
        assert_eq!(fold(&results), Ok(Verdict::Denied(EntityKind::Email)));

        let results = [r(EntityKind::Ip, DimensionOutcome::Error), r(EntityKind::Email, DimensionOutcome::Whitelisted)];
        assert_eq!(fold(&results), Ok(Verdict::Whitelisted(EntityKind::Email)));
    }
}
