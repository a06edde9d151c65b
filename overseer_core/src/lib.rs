//! Overseer Core - Observation layer for partitioned simulations
//!
//! A simulation split across N partitions is watched by one observer that:
//! 1. **Snapshots atomically**: every mirrored field reflects the same global step,
//!    read inside one remote lock/unlock bracket
//! 2. **Reconciles statistics**: per-partition reports merge into a gap-free,
//!    step-aligned table even when partitions step at different rates
//! 3. **Polls cheaply**: nothing is fetched unless the remote step counter moved

pub mod config;
pub mod deferred;
pub mod error;
pub mod handle_cache;
pub mod metrics;
pub mod mirror;
pub mod observer;
pub mod poll;
pub mod snapshot;
pub mod stats;
pub mod table;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::{ConfigError, ObserverConfig};
pub use deferred::Deferred;
pub use error::ObserverError;
pub use handle_cache::PartitionHandleCache;
pub use metrics::ObserverMetrics;
pub use mirror::{
    shared, ContinuousMirror, DoubleGridMirror, FieldMirror, FieldSource, GridMirror,
    IntGridMirror, SharedMirror, SnapshotContext,
};
pub use observer::{CycleOutcome, ObserverSession, RefreshReport};
pub use poll::{PollConfig, PollLoop};
pub use snapshot::{SnapshotCoordinator, SnapshotInfo};
pub use stats::{IngestReport, PartitionStatQueue, QueueEntry, StatsReconciler};
pub use table::{Cell, StatsRow, StatsTable};
