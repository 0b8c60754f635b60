//! Authoritative store backends.
//!
//! - [`memory::InMemoryStore`]: single process, tests
//! - [`sql::SqlStore`]: SQLite or MySQL

pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::InMemoryStore;
pub use sql::SqlStore;
pub use traits::{RuleStore, StorageError, SyncStateStore, TrafficStore};
