//! # Firewall Engine
//!
//! A request-filtering decision engine. Each request carries up to seven
//! attributes (IP, email, user agent, country, username, charset, ASN);
//! every one is checked against its own rule set and the results fold into
//! one verdict: whitelisted, denied or allowed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Decision path                         │
//! │  • Validate → geo enrich → concurrent per-dimension lookup  │
//! │  • TTL cache → document index → CIDR/regex predicates       │
//! │  • Whitelist short-circuit, deadline, traffic log           │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲ reads
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Projection (index + cache)                │
//! │  • In-memory or RediSearch documents per rule kind          │
//! │  • Per-kind cache invalidation on every write               │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲ writes
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Authoritative store                     │
//! │  • SQL (MySQL/SQLite) or in-memory rules, traffic, rollups  │
//! │  • Event bus + retry queue for fast propagation             │
//! │  • Incremental and locked full resync as the backstop       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use firewall_engine::{Backends, FilterRequest, Firewall, FirewallConfig, Rule, RuleStatus};
//!
//! #[tokio::main]
//! async fn main() {
//!     let firewall = Firewall::new(FirewallConfig::default(), Backends::in_memory())
//!         .expect("Failed to wire firewall");
//!     firewall.start().await.expect("Failed to start");
//!
//!     firewall.upsert_rule(Rule::ip("203.0.113.7", RuleStatus::Denied)).await.unwrap();
//!
//!     let decision = firewall
//!         .decide(FilterRequest::new().with_ip("203.0.113.7").with_country("de"))
//!         .await
//!         .unwrap();
//!     println!("{} {}", decision.response.kind, decision.response.status);
//!
//!     firewall.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: [`Firewall`], wiring, lifecycle and entry points
//! - [`filter`]: concurrent evaluator, aggregation, predicates
//! - [`cache`] / [`search`]: TTL cache and document index backends
//! - [`events`] / [`sync`]: rule propagation and resync
//! - [`traffic`]: decision logs, relationships, rollups, admin queries
//! - [`storage`]: authoritative store backends (SQL, memory)
//! - [`lock`]: cluster lock for full resync
//! - [`resilience`]: retry with backoff and the index retry queue

pub mod config;
pub mod rule;
pub mod normalize;
pub mod charset;
pub mod cache;
pub mod search;
pub mod resilience;
pub mod events;
pub mod projection;
pub mod sync;
pub mod lock;
pub mod filter;
pub mod traffic;
pub mod storage;
pub mod geo;
pub mod import;
pub mod coordinator;
pub mod metrics;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::FirewallConfig;
pub use coordinator::{Backends, Decision, EngineState, Firewall, HealthCheck};
pub use rule::{EntityKind, Rule, RuleStatus, StoredRule};
pub use filter::{FilterError, FilterRequest, FilterResponse, Verdict};
pub use events::{EventBus, RuleAction, RuleEvent};
pub use storage::traits::{RuleStore, StorageError, SyncStateStore, TrafficStore};
pub use traffic::{FinalResult, TrafficQuery};
pub use import::{ImportError, ImportReport};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
