//! Index reconciliation: incremental watermark scans and full resyncs.

pub mod incremental;
pub mod scheduler;

pub use incremental::{IncrementalSyncer, SyncReport};
pub use scheduler::{FullSyncReport, SyncScheduler, FULL_SYNC_BUSY};
