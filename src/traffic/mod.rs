//! Traffic logging, relationship counters, rollups and admin queries.

pub mod analytics;
pub mod logger;
pub mod model;
pub mod query;
pub mod relationships;

pub use analytics::{Analytics, RetentionReport, RollupOutcome, TOP_N};
pub use logger::{DecisionRecord, TrafficLogger};
pub use model::{
    AttributeTuple, FinalResult, Page, Relationship, RequestMetadata, Rollup, RollupType, TopEntry,
    TopRelationship, TrafficLog,
};
pub use query::{QueryTarget, TrafficQueries, TrafficQuery, TrafficSummary};
