//! Decision path: request validation, per-dimension lookups and the
//! whitelist/deny aggregation protocol.

pub mod aggregate;
pub mod evaluator;
pub mod predicates;
pub mod types;

pub use aggregate::{fold, Aggregator, Step};
pub use evaluator::{Evaluation, FilterEvaluator};
pub use predicates::PredicateCache;
pub use types::{
    DimensionOutcome, DimensionResult, ErrorResponse, FilterError, FilterRequest, FilterResponse, Verdict,
    NO_MATCH_LABEL,
};
