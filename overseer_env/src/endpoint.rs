//! Remote partition endpoint and directory abstractions.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::EnvError;
use crate::types::{FieldStorage, IntRect2D, StatRecord};

/// Capability set of one partition as seen from the observer.
///
/// # Implementations
///
/// - **Production**: `TcpEndpoint` (newline-delimited JSON over TCP)
/// - **Simulation**: in-process partitions with fault injection
///
/// Every method is a blocking remote call from the caller's point of view.
/// Implementations apply their own per-call transport timeout.
///
/// # Locking
///
/// `lock()` on the coordinating partition asks every partition to hold its
/// exposed storages stable until `unlock()`. The observer always pairs
/// the two, including on failure paths.
#[async_trait]
pub trait PartitionEndpoint: Send + Sync + 'static {
    /// Number of steps this partition has completed.
    async fn step_counter(&self) -> Result<u64, EnvError>;

    /// Simulation time of this partition.
    async fn time(&self) -> Result<f64, EnvError>;

    /// Bounds of the whole world.
    async fn world_bounds(&self) -> Result<IntRect2D, EnvError>;

    /// Number of partitions in the session.
    async fn partition_count(&self) -> Result<usize, EnvError>;

    /// Bounds of the region owned by this partition.
    async fn local_bounds(&self) -> Result<IntRect2D, EnvError>;

    /// Bounds of every partition, indexed by pid (coordinator only).
    async fn all_local_bounds(&self) -> Result<Vec<IntRect2D>, EnvError>;

    /// Holds all exposed storages stable for reading.
    async fn lock(&self) -> Result<(), EnvError>;

    /// Releases a hold taken by `lock()`.
    async fn unlock(&self) -> Result<(), EnvError>;

    /// Fetches the storage exposed at `index`.
    ///
    /// # Returns
    /// * `Err(EnvError::BadStorageIndex)` - no storage at that index
    async fn field_storage(&self, index: usize) -> Result<FieldStorage, EnvError>;

    /// Returns the statistics produced since the previous call, sorted by step.
    async fn stat_batch(&self) -> Result<Vec<StatRecord>, EnvError>;
}

/// Name directory through which partition endpoints are located.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// Resolves a canonical partition name to a live endpoint.
    ///
    /// # Returns
    /// * `Err(EnvError::NotBound)` - nothing registered under `name`
    /// * `Err(EnvError::NodeUnreachable)` - registered but not reachable
    async fn lookup(&self, name: &str) -> Result<Arc<dyn PartitionEndpoint>, EnvError>;
}
