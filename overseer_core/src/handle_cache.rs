//! Partition handle cache - resolves and memoizes remote endpoints.
//!
//! Resolving a handle costs a directory round trip. The cache performs the
//! lookup once per partition and keeps the handle for the whole session,
//! until a confirmed failure invalidates it.

use std::sync::Arc;

use overseer_env::{Directory, PartitionEndpoint, PartitionId};
use tracing::{debug, info};

use crate::error::ObserverError;

/// Cache of resolved partition endpoints, indexed by pid.
pub struct PartitionHandleCache {
    /// Directory used for name resolution
    directory: Arc<dyn Directory>,

    /// Resolved handles; `None` until first needed
    handles: Vec<Option<Arc<dyn PartitionEndpoint>>>,

    /// Directory lookups performed so far
    lookups: u64,
}

impl PartitionHandleCache {
    /// Resolves the coordinating partition and learns the partition count.
    ///
    /// The count is fixed for the rest of the session.
    pub async fn connect(directory: Arc<dyn Directory>) -> Result<Self, ObserverError> {
        let coordinator_pid = PartitionId::COORDINATOR;
        let coordinator = directory
            .lookup(&coordinator_pid.registry_name())
            .await
            .map_err(|e| ObserverError::endpoint(coordinator_pid, e))?;

        let count = coordinator
            .partition_count()
            .await
            .map_err(|e| ObserverError::endpoint(coordinator_pid, e))?;
        if count == 0 {
            return Err(ObserverError::endpoint(
                coordinator_pid,
                overseer_env::EnvError::remote("coordinator reported zero partitions"),
            ));
        }

        let mut handles = vec![None; count];
        handles[0] = Some(coordinator);
        info!(partitions = count, "connected to coordinator");

        Ok(Self {
            directory,
            handles,
            lookups: 1,
        })
    }

    /// Number of partitions in the session.
    pub fn partition_count(&self) -> usize {
        self.handles.len()
    }

    /// Iterates over every partition id in the session.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> {
        (0..self.handles.len()).map(PartitionId::from_index)
    }

    /// Number of directory lookups performed (including the coordinator's).
    pub fn lookup_count(&self) -> u64 {
        self.lookups
    }

    /// Returns true if a handle for `pid` is currently cached.
    pub fn is_cached(&self, pid: PartitionId) -> bool {
        self.handles
            .get(pid.index())
            .map(Option::is_some)
            .unwrap_or(false)
    }

    fn check(&self, pid: PartitionId) -> Result<(), ObserverError> {
        if pid.index() >= self.handles.len() {
            return Err(ObserverError::partition_out_of_range(pid, self.handles.len()));
        }
        Ok(())
    }

    /// Returns the cached handle for `pid`, looking it up on first use.
    ///
    /// # Errors
    /// * `IndexOutOfRange` - pid not in `0..partition_count()`
    /// * `EndpointUnavailable` - lookup failed; nothing is cached
    pub async fn resolve(
        &mut self,
        pid: PartitionId,
    ) -> Result<Arc<dyn PartitionEndpoint>, ObserverError> {
        self.check(pid)?;
        if let Some(handle) = &self.handles[pid.index()] {
            return Ok(Arc::clone(handle));
        }

        self.lookups += 1;
        let handle = self
            .directory
            .lookup(&pid.registry_name())
            .await
            .map_err(|e| ObserverError::endpoint(pid, e))?;
        debug!(%pid, "resolved partition handle");

        self.handles[pid.index()] = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the coordinating partition's handle.
    pub async fn coordinator(&mut self) -> Result<Arc<dyn PartitionEndpoint>, ObserverError> {
        self.resolve(PartitionId::COORDINATOR).await
    }

    /// Drops a cached handle so the next `resolve` looks it up again.
    pub fn invalidate(&mut self, pid: PartitionId) -> Result<(), ObserverError> {
        self.check(pid)?;
        if self.handles[pid.index()].take().is_some() {
            debug!(%pid, "invalidated partition handle");
        }
        Ok(())
    }
}
