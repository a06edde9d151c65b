//! Observer session - one observer attached to one partitioned simulation.
//!
//! The session owns every piece of observer state and runs a single refresh
//! cycle on request. Scheduling lives in [`PollLoop`]; the session never
//! sleeps and never spawns.
//!
//! ```text
//! ┌──────────────────────────── ObserverSession ───────────────────────────┐
//! │                                                                         │
//! │  refresh() ─► step_counter() on P0 ── unchanged? ──► Unchanged          │
//! │                      │ changed                                          │
//! │                      ▼                                                  │
//! │            overview + remote time                                       │
//! │                      │                                                  │
//! │                      ▼                                                  │
//! │   ┌──────────────────────────┐      ┌──────────────────────────────┐    │
//! │   │   SnapshotCoordinator    │      │       StatsReconciler        │    │
//! │   │ lock ► fetch… ► unlock   │ ───► │ stat_batch() per partition   │    │
//! │   │ commit to mirrors        │      │ ingest into gap-free queues  │    │
//! │   └──────────────────────────┘      └──────────────────────────────┘    │
//! │                 ▲                                   ▲                   │
//! │                 └──────── PartitionHandleCache ─────┘                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`PollLoop`]: crate::poll::PollLoop

use std::sync::Arc;

use overseer_env::{Directory, EnvError, IntRect2D, PartitionId};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ObserverError;
use crate::handle_cache::PartitionHandleCache;
use crate::metrics::ObserverMetrics;
use crate::mirror::SharedMirror;
use crate::snapshot::{SnapshotCoordinator, SnapshotInfo};
use crate::stats::{IngestReport, PartitionStatQueue, StatsReconciler};
use crate::table::StatsTable;

/// What one poll iteration did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CycleOutcome {
    /// The refresh-interval gate skipped the remote query
    Throttled,

    /// The remote step counter had not moved; nothing was fetched
    Unchanged { step: u64 },

    /// A snapshot was committed and stats were pulled
    Refreshed(RefreshReport),
}

impl CycleOutcome {
    pub fn is_refreshed(&self) -> bool {
        matches!(self, CycleOutcome::Refreshed(_))
    }
}

/// Details of a completed refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    /// Step counter that triggered the refresh
    pub observed_step: u64,

    pub snapshot: SnapshotInfo,

    /// Accepted stat batches, per partition
    pub ingested: Vec<(PartitionId, IngestReport)>,

    /// Partitions whose batch was rejected as out of order
    pub skipped: Vec<PartitionId>,

    /// Partitions whose stats could not be fetched this cycle
    pub unavailable: Vec<PartitionId>,
}

/// State of one observer attached to a running simulation.
pub struct ObserverSession {
    /// Session identifier (for logs and exports)
    id: Uuid,

    handles: PartitionHandleCache,

    snapshots: SnapshotCoordinator,

    stats: StatsReconciler,

    /// Bounds of the whole simulated world
    world_bounds: IntRect2D,

    /// Local bounds of every partition, refreshed on each remote query
    overview: Vec<IntRect2D>,

    /// Step counter seen at the last successful refresh
    last_observed_step: Option<u64>,

    /// Simulated time reported by the coordinator
    remote_time: f64,

    metrics: ObserverMetrics,
}

impl ObserverSession {
    /// Connects to the coordinating partition and reads the session's fixed shape.
    pub async fn connect(directory: Arc<dyn Directory>) -> Result<Self, ObserverError> {
        let mut handles = PartitionHandleCache::connect(directory).await?;
        let coordinator = handles.coordinator().await?;
        let world_bounds = coordinator
            .world_bounds()
            .await
            .map_err(|e| ObserverError::endpoint(PartitionId::COORDINATOR, e))?;
        let overview = coordinator
            .all_local_bounds()
            .await
            .map_err(|e| ObserverError::endpoint(PartitionId::COORDINATOR, e))?;

        let id = Uuid::new_v4();
        let partitions = handles.partition_count();
        info!(
            session = %id,
            partitions,
            world = %world_bounds,
            "observer session started"
        );

        Ok(Self {
            id,
            handles,
            snapshots: SnapshotCoordinator::new(),
            stats: StatsReconciler::new(partitions),
            world_bounds,
            overview,
            last_observed_step: None,
            remote_time: 0.0,
            metrics: ObserverMetrics::default(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn partition_count(&self) -> usize {
        self.handles.partition_count()
    }

    pub fn world_bounds(&self) -> IntRect2D {
        self.world_bounds
    }

    /// Local bounds of every partition as of the last remote query.
    pub fn overview(&self) -> &[IntRect2D] {
        &self.overview
    }

    /// Remote step counter at the last refresh (0 before the first).
    pub fn remote_steps(&self) -> u64 {
        self.last_observed_step.unwrap_or(0)
    }

    pub fn last_observed_step(&self) -> Option<u64> {
        self.last_observed_step
    }

    /// Simulated time reported by the coordinator at the last refresh.
    pub fn remote_time(&self) -> f64 {
        self.remote_time
    }

    pub fn metrics(&self) -> ObserverMetrics {
        self.metrics
    }

    pub(crate) fn metrics_mut(&mut self) -> &mut ObserverMetrics {
        &mut self.metrics
    }

    pub fn handles(&self) -> &PartitionHandleCache {
        &self.handles
    }

    pub fn snapshots(&self) -> &SnapshotCoordinator {
        &self.snapshots
    }

    pub fn stats(&self) -> &StatsReconciler {
        &self.stats
    }

    fn check_pid(&self, pid: PartitionId) -> Result<(), ObserverError> {
        if pid.index() >= self.partition_count() {
            return Err(ObserverError::partition_out_of_range(
                pid,
                self.partition_count(),
            ));
        }
        Ok(())
    }

    /// Registers a mirror fed from the viewed partition's storage `source_index`.
    pub fn register_field(
        &mut self,
        name: impl Into<String>,
        mirror: SharedMirror,
        source_index: usize,
    ) -> usize {
        self.snapshots.register_field(name, mirror, source_index)
    }

    /// Registers a mirror pinned to partition `pid`.
    pub fn register_field_on(
        &mut self,
        name: impl Into<String>,
        mirror: SharedMirror,
        source_index: usize,
        pid: PartitionId,
    ) -> Result<usize, ObserverError> {
        self.check_pid(pid)?;
        Ok(self
            .snapshots
            .register_field_on(name, mirror, source_index, pid))
    }

    /// Points unpinned mirrors at another partition. Takes effect at the
    /// next refresh, which is forced even if the step hasn't moved.
    pub fn set_viewed_partition(&mut self, pid: PartitionId) -> Result<(), ObserverError> {
        self.check_pid(pid)?;
        if self.snapshots.viewed_partition() != pid {
            self.snapshots.set_viewed_partition(pid);
            self.last_observed_step = None;
            info!(%pid, "viewing partition");
        }
        Ok(())
    }

    pub fn viewed_partition(&self) -> PartitionId {
        self.snapshots.viewed_partition()
    }

    /// Merged stats table through `upto`, clamped to the complete horizon.
    pub fn stats_table(&self, upto: u64) -> StatsTable {
        self.stats.global_table(upto)
    }

    /// Hands over every stat queue as it stands and starts fresh ones.
    pub fn drain_stats(&mut self) -> Vec<PartitionStatQueue> {
        self.stats.drain_and_reset()
    }

    /// Runs one refresh: query the step counter, then snapshot and pull stats
    /// if it advanced past the last observed step.
    ///
    /// Errors from the step query or the snapshot end the cycle; the step is
    /// not recorded, so the next cycle tries again. A failed stats pull from
    /// one partition does not end the cycle and the step is still recorded:
    /// that partition is listed in [`RefreshReport::unavailable`] and its
    /// records stay on the partition until the next pull that reaches it.
    pub async fn refresh(&mut self) -> Result<CycleOutcome, ObserverError> {
        match self.try_refresh().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.metrics.record_failure(&err);
                Err(err)
            }
        }
    }

    async fn try_refresh(&mut self) -> Result<CycleOutcome, ObserverError> {
        let coordinator = self.handles.coordinator().await?;

        let step = match coordinator.step_counter().await {
            Ok(step) => step,
            Err(err) => return Err(self.coordinator_failed(err)),
        };
        if let Some(last) = self.last_observed_step.filter(|last| step <= *last) {
            self.metrics.unchanged += 1;
            if step < last {
                warn!(step, last, "remote step went backwards");
            } else {
                debug!(step, "remote step unchanged");
            }
            return Ok(CycleOutcome::Unchanged { step });
        }

        match coordinator.all_local_bounds().await {
            Ok(overview) => self.overview = overview,
            Err(err) => return Err(self.coordinator_failed(err)),
        }
        match coordinator.time().await {
            Ok(time) => self.remote_time = time,
            Err(err) => return Err(self.coordinator_failed(err)),
        }

        let snapshot = self
            .snapshots
            .snapshot(&mut self.handles, self.world_bounds)
            .await?;
        self.metrics.field_fetches += snapshot.storage_steps.len() as u64;

        let mut report = RefreshReport {
            observed_step: step,
            snapshot,
            ingested: Vec::new(),
            skipped: Vec::new(),
            unavailable: Vec::new(),
        };
        for p in self.handles.partitions().collect::<Vec<_>>() {
            self.pull_stats(p, &mut report).await;
        }

        self.last_observed_step = Some(step);
        self.metrics.refreshes += 1;
        debug!(
            step,
            snapshot_step = report.snapshot.step,
            skipped = report.skipped.len(),
            unavailable = report.unavailable.len(),
            "refresh complete"
        );
        Ok(CycleOutcome::Refreshed(report))
    }

    async fn pull_stats(&mut self, pid: PartitionId, report: &mut RefreshReport) {
        let endpoint = match self.handles.resolve(pid).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(%pid, "Stats unavailable: {}", err);
                report.unavailable.push(pid);
                return;
            }
        };
        let batch = match endpoint.stat_batch().await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%pid, "Failed to fetch stats: {}", err);
                if err.is_transport() {
                    let _ = self.handles.invalidate(pid);
                }
                report.unavailable.push(pid);
                return;
            }
        };

        match self.stats.ingest(pid, batch) {
            Ok(ingest) => {
                self.metrics.stat_records += ingest.records as u64;
                self.metrics.carried_entries += ingest.filled as u64;
                if ingest.records > 0 {
                    report.ingested.push((pid, ingest));
                }
            }
            Err(err @ ObserverError::OutOfOrderStats { .. }) => {
                warn!(%pid, "Skipping stat batch: {}", err);
                self.metrics.skipped_batches += 1;
                report.skipped.push(pid);
            }
            Err(err) => {
                warn!(%pid, "Stat ingestion failed: {}", err);
                report.unavailable.push(pid);
            }
        }
    }

    fn coordinator_failed(&mut self, err: EnvError) -> ObserverError {
        if err.is_transport() {
            let _ = self.handles.invalidate(PartitionId::COORDINATOR);
        }
        ObserverError::endpoint(PartitionId::COORDINATOR, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{shared, DoubleGridMirror, IntGridMirror};
    use crate::table::Cell;
    use crate::testing::{Call, MockCluster, MockDirectory};
    use overseer_env::StatRecord;

    async fn session(partitions: usize) -> (MockCluster, Arc<MockDirectory>, ObserverSession) {
        let cluster = MockCluster::new(partitions);
        let directory = MockDirectory::shared(&cluster);
        let session = ObserverSession::connect(directory.clone()).await.unwrap();
        cluster.clear_calls();
        (cluster, directory, session)
    }

    #[tokio::test]
    async fn test_connect_reads_world_and_overview() {
        let (_cluster, _directory, session) = session(3).await;
        assert_eq!(session.partition_count(), 3);
        assert_eq!(session.world_bounds(), IntRect2D::with_size(12, 2));
        assert_eq!(session.overview().len(), 3);
        assert_eq!(session.remote_steps(), 0);
        assert_eq!(session.viewed_partition(), PartitionId(0));
    }

    #[tokio::test]
    async fn test_refresh_snapshots_and_ingests() {
        let (cluster, _directory, mut session) = session(2).await;
        let heat = shared(DoubleGridMirror::new());
        session.register_field("heat", heat.clone(), 0);

        cluster.set_step_all(3);
        cluster.endpoint(0).push_stats(vec![StatRecord::new(1, "a"), StatRecord::new(3, "c")]);
        cluster.endpoint(1).push_stats(vec![StatRecord::new(2, "b")]);

        let report = match session.refresh().await.unwrap() {
            CycleOutcome::Refreshed(report) => report,
            other => panic!("expected a refresh, got {:?}", other),
        };
        assert_eq!(report.observed_step, 3);
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(heat.read().await.step(), Some(3));
        assert_eq!(session.remote_steps(), 3);
        assert_eq!(session.remote_time(), 1.5);

        let table = session.stats_table(3);
        assert_eq!(table.complete_through, Some(2));
        assert_eq!(table.rows.len(), 2);
        assert!(matches!(table.rows[0].cells[1], Cell::Carried { from: None, .. }));

        let metrics = session.metrics();
        assert_eq!(metrics.refreshes, 1);
        assert_eq!(metrics.stat_records, 3);
        assert_eq!(metrics.field_fetches, 1);
    }

    #[tokio::test]
    async fn test_unchanged_step_fetches_nothing() {
        let (cluster, _directory, mut session) = session(3).await;
        session.register_field("heat", shared(DoubleGridMirror::new()), 0);
        cluster.set_step_all(7);
        session.refresh().await.unwrap();
        cluster.clear_calls();

        let outcome = session.refresh().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Unchanged { step: 7 });
        assert_eq!(cluster.count(Call::StepCounter), 1);
        assert_eq!(cluster.count(Call::Lock), 0);
        assert_eq!(cluster.count(Call::Fetch(0)), 0);
        assert_eq!(cluster.count(Call::Stats), 0);
        assert_eq!(session.metrics().unchanged, 1);
    }

    #[tokio::test]
    async fn test_step_going_backwards_fetches_nothing() {
        let (cluster, _directory, mut session) = session(2).await;
        let heat = shared(DoubleGridMirror::new());
        session.register_field("heat", heat.clone(), 0);
        cluster.set_step_all(7);
        session.refresh().await.unwrap();
        cluster.clear_calls();

        cluster.set_step_all(3);
        cluster.endpoint(1).push_stats(vec![StatRecord::new(3, "old")]);
        let outcome = session.refresh().await.unwrap();
        assert_eq!(outcome, CycleOutcome::Unchanged { step: 3 });
        assert_eq!(cluster.count(Call::Lock), 0);
        assert_eq!(cluster.count(Call::Fetch(0)), 0);
        assert_eq!(cluster.count(Call::Stats), 0);
        assert_eq!(heat.read().await.step(), Some(7));
        assert_eq!(session.remote_steps(), 7);

        cluster.set_step_all(8);
        assert!(session.refresh().await.unwrap().is_refreshed());
    }

    #[tokio::test]
    async fn test_out_of_order_partition_is_skipped() {
        let (cluster, _directory, mut session) = session(2).await;
        cluster.set_step_all(5);
        cluster.endpoint(0).push_stats(vec![StatRecord::new(5, "p0")]);
        cluster.endpoint(1).push_stats(vec![StatRecord::new(5, "p1")]);
        session.refresh().await.unwrap();

        cluster.set_step_all(6);
        cluster.endpoint(0).push_stats(vec![StatRecord::new(6, "p0")]);
        cluster.endpoint(1).push_stats(vec![StatRecord::new(2, "late")]);
        let CycleOutcome::Refreshed(report) = session.refresh().await.unwrap() else {
            panic!("expected a refresh");
        };
        assert_eq!(report.skipped, vec![PartitionId(1)]);
        assert_eq!(session.stats().queue(PartitionId(0)).unwrap().last_known_step(), 6);
        assert_eq!(session.stats().queue(PartitionId(1)).unwrap().last_known_step(), 5);
        assert_eq!(session.metrics().skipped_batches, 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_retried_next_cycle() {
        let (cluster, _directory, mut session) = session(1).await;
        let bugs = shared(IntGridMirror::new());
        session.register_field("bugs", bugs.clone(), 1);
        cluster.set_step_all(2);
        cluster.endpoint(0).fail_lock(true);

        let err = session.refresh().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(session.last_observed_step(), None);
        assert_eq!(session.metrics().aborted_snapshots, 1);

        cluster.endpoint(0).fail_lock(false);
        assert!(session.refresh().await.unwrap().is_refreshed());
        assert_eq!(bugs.read().await.step(), Some(2));
    }

    #[tokio::test]
    async fn test_stats_failure_does_not_block_other_partitions() {
        let (cluster, directory, mut session) = session(3).await;
        cluster.set_step_all(1);
        for p in 0..3 {
            cluster.endpoint(p).push_stats(vec![StatRecord::new(1, "x")]);
        }
        cluster.endpoint(2).fail_stats(true);

        let CycleOutcome::Refreshed(report) = session.refresh().await.unwrap() else {
            panic!("expected a refresh");
        };
        assert_eq!(report.unavailable, vec![PartitionId(2)]);
        assert_eq!(report.ingested.len(), 2);
        // The failed handle is dropped and looked up again next time
        assert!(!session.handles().is_cached(PartitionId(2)));
        // The step still counts as observed
        assert_eq!(session.last_observed_step(), Some(1));
        assert_eq!(
            session.refresh().await.unwrap(),
            CycleOutcome::Unchanged { step: 1 }
        );

        cluster.endpoint(2).fail_stats(false);
        cluster.set_step_all(2);
        session.refresh().await.unwrap();
        assert_eq!(directory.lookups_of(PartitionId(2)), 2);
        assert_eq!(session.stats().queue(PartitionId(2)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_coordinator_failure_surfaces_endpoint_error() {
        let (cluster, _directory, mut session) = session(2).await;
        cluster.endpoint(0).fail_step_counter(true);

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, ObserverError::EndpointUnavailable { .. }));
        assert!(!session.handles().is_cached(PartitionId(0)));
        assert_eq!(session.metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_viewed_partition_forces_refresh() {
        let (cluster, _directory, mut session) = session(2).await;
        let heat = shared(DoubleGridMirror::new());
        session.register_field("heat", heat.clone(), 0);
        session.refresh().await.unwrap();

        assert!(session.set_viewed_partition(PartitionId(4)).is_err());
        session.set_viewed_partition(PartitionId(1)).unwrap();
        assert!(session.refresh().await.unwrap().is_refreshed());
        assert_eq!(heat.read().await.bounds(), IntRect2D::new(4, 0, 8, 2));
        assert!(cluster.endpoint(1).count(Call::Fetch(0)) == 1);
    }

    #[tokio::test]
    async fn test_drain_stats_resets_queues() {
        let (cluster, _directory, mut session) = session(1).await;
        cluster.set_step_all(2);
        cluster
            .endpoint(0)
            .push_stats(vec![StatRecord::new(1, "a"), StatRecord::new(2, "b")]);
        session.refresh().await.unwrap();

        let queues = session.drain_stats();
        assert_eq!(queues.len(), 1);
        assert_eq!(queues[0].last_real_step(), Some(2));
        assert!(session.stats().queue(PartitionId(0)).unwrap().is_empty());
    }
}
