//! Simulated name directory with lookup accounting.

use async_trait::async_trait;
use overseer_env::{parse_partition_name, Directory, EnvError, PartitionEndpoint, PartitionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::network::SimNetworkController;
use crate::partition::SimPartition;

/// Resolves canonical partition names to simulated partitions.
///
/// Lookups of unreachable partitions fail the same way a call would.
pub struct SimDirectory {
    partitions: Vec<Arc<SimPartition>>,
    network: Arc<SimNetworkController>,
    lookups: Vec<AtomicU64>,
}

impl SimDirectory {
    pub fn new(partitions: Vec<Arc<SimPartition>>, network: Arc<SimNetworkController>) -> Self {
        let lookups = partitions.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            partitions,
            network,
            lookups,
        }
    }

    /// Successful lookups of one partition.
    pub fn lookups_of(&self, pid: PartitionId) -> u64 {
        self.lookups
            .get(pid.index())
            .map_or(0, |n| n.load(Ordering::Relaxed))
    }

    /// Successful lookups across all partitions.
    pub fn lookups(&self) -> u64 {
        self.lookups.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }
}

#[async_trait]
impl Directory for SimDirectory {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn PartitionEndpoint>, EnvError> {
        let pid = parse_partition_name(name).ok_or_else(|| EnvError::NotBound(name.to_string()))?;
        let partition = self
            .partitions
            .get(pid.index())
            .ok_or_else(|| EnvError::NotBound(name.to_string()))?;
        if self.network.is_unreachable(pid) {
            return Err(EnvError::unreachable(pid));
        }

        self.lookups[pid.index()].fetch_add(1, Ordering::Relaxed);
        let endpoint: Arc<dyn PartitionEndpoint> = partition.clone();
        Ok(endpoint)
    }
}
