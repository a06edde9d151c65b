//! Snapshot coordinator - atomic cross-field, cross-partition reads.
//!
//! Each registered field may live on a different partition and is fetched by
//! an independent remote call. Polling them one by one could mix step N of
//! one field with step N+1 of another. The coordinator brackets the whole
//! batch with a session-wide remote lock on the coordinating partition:
//!
//! ```text
//! resolve handles ─► lock ─► step? ─► fetch #0 ─► fetch #1 ─► … ─► unlock
//!                                                                    │
//!                              validate every storage ◄──────────────┘
//!                                        │
//!                              commit to every mirror
//! ```
//!
//! Nothing is written to a mirror until every fetch succeeded and every
//! storage validated, so a failed snapshot leaves all mirrors untouched.
//! Once the lock is taken it is released exactly once on every path.

use std::sync::Arc;

use overseer_env::{EnvError, IntRect2D, PartitionEndpoint, PartitionId};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ObserverError;
use crate::handle_cache::PartitionHandleCache;
use crate::mirror::{FieldSource, SharedMirror, SnapshotContext};

/// Where a registration reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourcePartition {
    /// Whatever partition is currently being viewed
    Viewed,
    /// Always the same partition
    Pinned(PartitionId),
}

struct Registration {
    name: String,
    mirror: SharedMirror,
    index: usize,
    partition: SourcePartition,
}

/// Outcome of one successful snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotInfo {
    /// Coordinator step read while the lock was held
    pub step: u64,

    /// Number of mirrors updated
    pub fields: usize,

    /// Partition step each fetched storage was read at
    pub storage_steps: Vec<(PartitionId, usize, u64)>,
}

impl SnapshotInfo {
    /// True if every storage fetched from the same partition carries the same step.
    pub fn is_consistent(&self) -> bool {
        self.storage_steps.iter().all(|(pid, _, step)| {
            self.storage_steps
                .iter()
                .filter(|(other, _, _)| other == pid)
                .all(|(_, _, other_step)| other_step == step)
        })
    }
}

/// Owns the ordered list of registered field mirrors.
pub struct SnapshotCoordinator {
    registrations: Vec<Registration>,
    viewed: PartitionId,
    last: Option<SnapshotInfo>,
}

impl SnapshotCoordinator {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            viewed: PartitionId::COORDINATOR,
            last: None,
        }
    }

    /// Registers a mirror fed from storage `source_index` of the viewed partition.
    ///
    /// Returns the registration's position. The index is checked against the
    /// partition at fetch time.
    pub fn register_field(
        &mut self,
        name: impl Into<String>,
        mirror: SharedMirror,
        source_index: usize,
    ) -> usize {
        self.push(name.into(), mirror, source_index, SourcePartition::Viewed)
    }

    /// Registers a mirror that always reads from partition `pid`.
    pub fn register_field_on(
        &mut self,
        name: impl Into<String>,
        mirror: SharedMirror,
        source_index: usize,
        pid: PartitionId,
    ) -> usize {
        self.push(name.into(), mirror, source_index, SourcePartition::Pinned(pid))
    }

    fn push(
        &mut self,
        name: String,
        mirror: SharedMirror,
        index: usize,
        partition: SourcePartition,
    ) -> usize {
        debug!(field = %name, index, "registered field mirror");
        self.registrations.push(Registration {
            name,
            mirror,
            index,
            partition,
        });
        self.registrations.len() - 1
    }

    /// Number of registered mirrors.
    pub fn field_count(&self) -> usize {
        self.registrations.len()
    }

    /// Names of the registered mirrors in registration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn viewed_partition(&self) -> PartitionId {
        self.viewed
    }

    /// Switches unpinned fields to another partition. Range checks are the
    /// caller's job; the coordinator does not know the partition count.
    pub fn set_viewed_partition(&mut self, pid: PartitionId) {
        self.viewed = pid;
    }

    /// The last successful snapshot.
    pub fn last_snapshot(&self) -> Option<&SnapshotInfo> {
        self.last.as_ref()
    }

    /// Resolved source of every registration, in registration order.
    pub fn sources(&self) -> Vec<FieldSource> {
        self.registrations
            .iter()
            .map(|r| FieldSource {
                pid: match r.partition {
                    SourcePartition::Viewed => self.viewed,
                    SourcePartition::Pinned(pid) => pid,
                },
                index: r.index,
            })
            .collect()
    }

    /// Takes an atomic snapshot of every registered field.
    ///
    /// # Errors
    /// * `EndpointUnavailable` - a handle could not be resolved (lock never taken)
    /// * `SnapshotAborted` - lock not acquired, or a fetch failed; mirrors untouched
    /// * `BadFieldIndex` - a source index is not exposed or has the wrong shape
    pub async fn snapshot(
        &mut self,
        handles: &mut PartitionHandleCache,
        world_bounds: IntRect2D,
    ) -> Result<SnapshotInfo, ObserverError> {
        let sources = self.sources();

        // Resolve every endpoint before taking the lock so the hold stays short.
        let coordinator = handles.coordinator().await?;
        let mut endpoints = Vec::with_capacity(sources.len());
        for source in &sources {
            endpoints.push(handles.resolve(source.pid).await?);
        }

        if let Err(err) = coordinator.lock().await {
            invalidate_on_transport(handles, PartitionId::COORDINATOR, &err);
            return Err(ObserverError::aborted("remote lock not acquired", Some(err)));
        }

        let fetched = fetch_all(coordinator.as_ref(), &sources, &endpoints, world_bounds).await;

        if let Err(err) = coordinator.unlock().await {
            // Everything was read under the hold; the data is still consistent.
            warn!("Failed to release remote lock: {}", err);
            invalidate_on_transport(handles, PartitionId::COORDINATOR, &err);
        }

        let context = match fetched {
            Ok(context) => context,
            Err((pid, err)) => {
                if let ObserverError::SnapshotAborted {
                    source: Some(env), ..
                } = &err
                {
                    invalidate_on_transport(handles, pid, env);
                }
                return Err(err);
            }
        };

        // Validate everything before touching a single mirror.
        for (registration, source) in self.registrations.iter().zip(&sources) {
            let storage = context.storage(*source).ok_or_else(|| {
                ObserverError::aborted(format!("storage for {} missing", source), None)
            })?;
            let mirror = registration.mirror.read().await;
            mirror
                .validate(storage)
                .map_err(|detail| ObserverError::BadFieldIndex {
                    pid: source.pid,
                    index: source.index,
                    detail: format!("{}: {}", registration.name, detail),
                })?;
        }

        for (registration, source) in self.registrations.iter().zip(&sources) {
            let mut mirror = registration.mirror.write().await;
            mirror.update(&context, *source);
        }

        let info = SnapshotInfo {
            step: context.step(),
            fields: self.registrations.len(),
            storage_steps: sources
                .iter()
                .filter_map(|s| context.storage(*s).map(|st| (s.pid, s.index, st.step)))
                .collect(),
        };
        info!(
            step = info.step,
            fields = info.fields,
            "snapshot committed"
        );
        self.last = Some(info.clone());
        Ok(info)
    }
}

impl Default for SnapshotCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches every source one at a time. Runs only while the lock is held.
async fn fetch_all(
    coordinator: &dyn PartitionEndpoint,
    sources: &[FieldSource],
    endpoints: &[Arc<dyn PartitionEndpoint>],
    world_bounds: IntRect2D,
) -> Result<SnapshotContext, (PartitionId, ObserverError)> {
    let step = coordinator.step_counter().await.map_err(|e| {
        (
            PartitionId::COORDINATOR,
            ObserverError::aborted("step counter unavailable under lock", Some(e)),
        )
    })?;

    let mut context = SnapshotContext::new(step, world_bounds);
    for (source, endpoint) in sources.iter().zip(endpoints) {
        if context.storage(*source).is_some() {
            continue;
        }
        let storage = endpoint
            .field_storage(source.index)
            .await
            .map_err(|err| (source.pid, fetch_error(*source, err)))?;
        context.insert(*source, storage);
    }
    Ok(context)
}

fn fetch_error(source: FieldSource, err: EnvError) -> ObserverError {
    match err {
        EnvError::BadStorageIndex { index, available } => ObserverError::BadFieldIndex {
            pid: source.pid,
            index,
            detail: format!("partition exposes {} storages", available),
        },
        other => ObserverError::aborted(format!("fetch of {} failed", source), Some(other)),
    }
}

fn invalidate_on_transport(handles: &mut PartitionHandleCache, pid: PartitionId, err: &EnvError) {
    if err.is_transport() {
        // pid came from the cache itself, so it is always in range
        let _ = handles.invalidate(pid);
    }
}
