//! Simulated partition - one slice of the simulated world behind an endpoint.
//!
//! Each partition owns three field storages over its local bounds:
//!
//! | index | storage                      | kind        |
//! |-------|------------------------------|-------------|
//! | 0     | heat (diffusing)             | double grid |
//! | 1     | bugs per cell (random walk)  | int grid    |
//! | 2     | flock (bouncing points)      | continuous  |
//!
//! Statistics computed during step k fill a [`Deferred`] when the step ends.
//! Step k+1 adopts it with [`Deferred::copy_from`] and publishes its records,
//! so the observer always sees them one step late.

use async_trait::async_trait;
use overseer_core::Deferred;
use overseer_env::{
    EnvError, FieldStorage, IntRect2D, PartitionEndpoint, PartitionId, Point2D, StatRecord,
    StoragePayload,
};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::context::SimContext;
use crate::network::SimNetworkController;

/// Number of storages every simulated partition exposes.
pub const STORAGE_COUNT: usize = 3;

/// Cluster-wide hold taken by the coordinator's remote lock.
///
/// While held, no partition advances its step.
#[derive(Debug, Default)]
pub struct ClusterHold {
    held: AtomicBool,
    acquisitions: AtomicU64,
}

impl ClusterHold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the hold; false if it was already taken.
    pub fn try_acquire(&self) -> bool {
        let acquired = self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if acquired {
            self.acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Releases the hold; false if it wasn't held.
    pub fn release(&self) -> bool {
        self.held.swap(false, Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

/// Static description of a partition.
#[derive(Debug, Clone)]
pub struct PartitionSpec {
    pub pid: PartitionId,

    /// Bounds of the whole world
    pub world: IntRect2D,

    /// Local bounds of every partition, indexed by pid
    pub all_bounds: Vec<IntRect2D>,

    /// Probability of producing a stat record on a given step
    pub stat_probability: f64,

    /// Simulated seconds per step
    pub step_dt: f64,

    /// Number of points in the flock
    pub flock_size: usize,
}

impl PartitionSpec {
    pub fn bounds(&self) -> IntRect2D {
        self.all_bounds[self.pid.index()]
    }
}

/// Calls served by one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CallStats {
    pub step_queries: u64,
    pub locks: u64,
    pub unlocks: u64,
    pub fetches: u64,
    pub stat_calls: u64,
    pub other: u64,
    /// Calls that failed (refused, lost or rejected)
    pub failed: u64,
}

#[derive(Default)]
struct CallCounters {
    step_queries: AtomicU64,
    locks: AtomicU64,
    unlocks: AtomicU64,
    fetches: AtomicU64,
    stat_calls: AtomicU64,
    other: AtomicU64,
    failed: AtomicU64,
}

impl CallCounters {
    fn snapshot(&self) -> CallStats {
        CallStats {
            step_queries: self.step_queries.load(Ordering::Relaxed),
            locks: self.locks.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            stat_calls: self.stat_calls.load(Ordering::Relaxed),
            other: self.other.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Boid {
    id: u64,
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
}

struct PartitionState {
    step: u64,
    time: f64,
    heat: Vec<f64>,
    bugs: Vec<i64>,
    flock: Vec<Boid>,
    rng: ChaCha8Rng,

    /// Records of the last completed step, not yet published
    finished: Deferred<Vec<StatRecord>>,

    /// Records waiting for the observer
    published: Vec<StatRecord>,

    /// A record to send ahead of the next batch (protocol violation)
    stale_replay: Option<StatRecord>,

    produced: u64,
    delivered: u64,
}

/// One simulated partition.
pub struct SimPartition {
    spec: PartitionSpec,
    context: Arc<SimContext>,
    network: Arc<SimNetworkController>,
    hold: Arc<ClusterHold>,

    /// Steps during unlocked reads
    racing: AtomicBool,

    state: Mutex<PartitionState>,
    calls: CallCounters,
}

impl SimPartition {
    pub fn new(
        spec: PartitionSpec,
        context: Arc<SimContext>,
        network: Arc<SimNetworkController>,
        hold: Arc<ClusterHold>,
    ) -> Self {
        let mut rng = context.derive_rng(0x5eed_0000 + spec.pid.0 as u64);
        let bounds = spec.bounds();
        let area = bounds.area();

        let heat = (0..area).map(|_| rng.gen_range(0.0..10.0)).collect();
        let bugs = (0..area).map(|_| rng.gen_range(0..3)).collect();
        let flock = (0..spec.flock_size as u64)
            .map(|i| Boid {
                id: spec.pid.0 as u64 * 10_000 + i,
                x: rng.gen_range(bounds.x0 as f64..bounds.x1 as f64),
                y: rng.gen_range(bounds.y0 as f64..bounds.y1 as f64),
                vx: rng.gen_range(-0.5..0.5),
                vy: rng.gen_range(-0.5..0.5),
            })
            .collect();

        Self {
            spec,
            context,
            network,
            hold,
            racing: AtomicBool::new(false),
            state: Mutex::new(PartitionState {
                step: 0,
                time: 0.0,
                heat,
                bugs,
                flock,
                rng,
                finished: Deferred::new(),
                published: Vec::new(),
                stale_replay: None,
                produced: 0,
                delivered: 0,
            }),
            calls: CallCounters::default(),
        }
    }

    pub fn pid(&self) -> PartitionId {
        self.spec.pid
    }

    pub fn bounds(&self) -> IntRect2D {
        self.spec.bounds()
    }

    /// Current step, read without going through the network.
    pub fn step(&self) -> u64 {
        self.state.lock().unwrap().step
    }

    pub fn calls(&self) -> CallStats {
        self.calls.snapshot()
    }

    /// Stat records produced so far.
    pub fn produced(&self) -> u64 {
        self.state.lock().unwrap().produced
    }

    /// Stat records handed to the observer so far.
    pub fn delivered(&self) -> u64 {
        self.state.lock().unwrap().delivered
    }

    /// Stat records produced but not yet delivered.
    pub fn undelivered(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let finished = state.finished.get().map_or(0, Vec::len);
        (finished + state.published.len()) as u64
    }

    pub fn set_racing(&self, racing: bool) {
        self.racing.store(racing, Ordering::SeqCst);
    }

    /// Makes the next stat batch start with an already-consumed step.
    pub fn inject_stale_stat(&self) {
        let mut state = self.state.lock().unwrap();
        state.stale_replay = Some(StatRecord::new(
            0,
            serde_json::json!({ "partition": self.spec.pid.0, "replayed": true }),
        ));
    }

    /// Advances one step unless the cluster is held. Returns true if it stepped.
    pub fn advance(&self) -> bool {
        if self.hold.is_held() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        self.step_locked(&mut state);
        true
    }

    fn step_locked(&self, state: &mut PartitionState) {
        // Last step's records become visible now
        let mut handoff = Deferred::new();
        handoff.copy_from(&state.finished);
        state.finished = Deferred::new();
        if let Some(records) = handoff.into_inner() {
            state.published.extend(records);
        }

        state.step += 1;
        state.time += self.spec.step_dt;

        let bounds = self.spec.bounds();
        diffuse(&mut state.heat, bounds, &mut state.rng);
        for bugs in state.bugs.iter_mut() {
            let delta: i64 = state.rng.gen_range(-1..=1);
            *bugs = (*bugs + delta).max(0);
        }
        for boid in state.flock.iter_mut() {
            move_boid(boid, bounds);
        }

        let mut produced = Vec::new();
        if state.rng.gen_bool(self.spec.stat_probability.clamp(0.0, 1.0)) {
            let mean_heat = state.heat.iter().sum::<f64>() / state.heat.len().max(1) as f64;
            let total_bugs: i64 = state.bugs.iter().sum();
            let record = StatRecord::new(
                state.step,
                serde_json::json!({
                    "partition": self.spec.pid.0,
                    "mean_heat": (mean_heat * 1000.0).round() / 1000.0,
                    "bugs": total_bugs,
                }),
            );
            produced.push(record);
            state.produced += 1;
        }
        let _ = state.finished.fulfill(produced);
    }

    /// A racing partition steps on every unlocked read.
    fn race(&self, state: &mut PartitionState) {
        if self.racing.load(Ordering::SeqCst) && !self.hold.is_held() {
            self.step_locked(state);
        }
    }

    /// Consults the network and charges the link latency to the virtual clock.
    async fn enter(&self, counter: &AtomicU64) -> Result<(), EnvError> {
        counter.fetch_add(1, Ordering::Relaxed);
        match self.network.check(self.spec.pid) {
            Ok(latency) => {
                if latency > Duration::ZERO {
                    self.context.advance_time(latency);
                }
                Ok(())
            }
            Err(err) => {
                self.calls.failed.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn reject(&self, msg: &str) -> EnvError {
        self.calls.failed.fetch_add(1, Ordering::Relaxed);
        EnvError::remote(format!("{}: {}", self.spec.pid, msg))
    }

    fn storage(&self, state: &PartitionState, index: usize) -> Result<FieldStorage, EnvError> {
        let bounds = self.spec.bounds();
        let payload = match index {
            0 => StoragePayload::DoubleGrid(state.heat.clone()),
            1 => StoragePayload::IntGrid(state.bugs.clone()),
            2 => StoragePayload::Continuous(
                state
                    .flock
                    .iter()
                    .map(|b| Point2D {
                        id: b.id,
                        x: b.x,
                        y: b.y,
                    })
                    .collect(),
            ),
            _ => {
                self.calls.failed.fetch_add(1, Ordering::Relaxed);
                return Err(EnvError::BadStorageIndex {
                    index,
                    available: STORAGE_COUNT,
                });
            }
        };
        Ok(FieldStorage::new(bounds, state.step, payload))
    }
}

fn diffuse(heat: &mut [f64], bounds: IntRect2D, rng: &mut ChaCha8Rng) {
    let width = bounds.width().max(1) as usize;
    let height = bounds.height().max(1) as usize;
    let before = heat.to_vec();
    for row in 0..height {
        for col in 0..width {
            let mut sum = 0.0;
            let mut n = 0.0;
            if col > 0 {
                sum += before[row * width + col - 1];
                n += 1.0;
            }
            if col + 1 < width {
                sum += before[row * width + col + 1];
                n += 1.0;
            }
            if row > 0 {
                sum += before[(row - 1) * width + col];
                n += 1.0;
            }
            if row + 1 < height {
                sum += before[(row + 1) * width + col];
                n += 1.0;
            }
            let cell = &mut heat[row * width + col];
            if n > 0.0 {
                *cell += 0.25 * (sum / n - *cell);
            }
            *cell += rng.gen_range(-0.05..0.05);
        }
    }
}

fn move_boid(boid: &mut Boid, bounds: IntRect2D) {
    boid.x += boid.vx;
    boid.y += boid.vy;
    if boid.x < bounds.x0 as f64 || boid.x >= bounds.x1 as f64 {
        boid.vx = -boid.vx;
        boid.x = boid.x.clamp(bounds.x0 as f64, bounds.x1 as f64 - 0.001);
    }
    if boid.y < bounds.y0 as f64 || boid.y >= bounds.y1 as f64 {
        boid.vy = -boid.vy;
        boid.y = boid.y.clamp(bounds.y0 as f64, bounds.y1 as f64 - 0.001);
    }
}

#[async_trait]
impl PartitionEndpoint for SimPartition {
    async fn step_counter(&self) -> Result<u64, EnvError> {
        self.enter(&self.calls.step_queries).await?;
        let mut state = self.state.lock().unwrap();
        let step = state.step;
        self.race(&mut state);
        Ok(step)
    }

    async fn time(&self) -> Result<f64, EnvError> {
        self.enter(&self.calls.other).await?;
        Ok(self.state.lock().unwrap().time)
    }

    async fn world_bounds(&self) -> Result<IntRect2D, EnvError> {
        self.enter(&self.calls.other).await?;
        Ok(self.spec.world)
    }

    async fn partition_count(&self) -> Result<usize, EnvError> {
        self.enter(&self.calls.other).await?;
        Ok(self.spec.all_bounds.len())
    }

    async fn local_bounds(&self) -> Result<IntRect2D, EnvError> {
        self.enter(&self.calls.other).await?;
        Ok(self.spec.bounds())
    }

    async fn all_local_bounds(&self) -> Result<Vec<IntRect2D>, EnvError> {
        self.enter(&self.calls.other).await?;
        Ok(self.spec.all_bounds.clone())
    }

    async fn lock(&self) -> Result<(), EnvError> {
        self.enter(&self.calls.locks).await?;
        if !self.spec.pid.is_coordinator() {
            return Err(self.reject("lock is only served by the coordinator"));
        }
        if !self.hold.try_acquire() {
            return Err(self.reject("cluster already held"));
        }
        debug!(pid = %self.spec.pid, "cluster held");
        Ok(())
    }

    async fn unlock(&self) -> Result<(), EnvError> {
        self.enter(&self.calls.unlocks).await?;
        if !self.spec.pid.is_coordinator() {
            return Err(self.reject("unlock is only served by the coordinator"));
        }
        if !self.hold.release() {
            return Err(self.reject("cluster was not held"));
        }
        debug!(pid = %self.spec.pid, "cluster released");
        Ok(())
    }

    async fn field_storage(&self, index: usize) -> Result<FieldStorage, EnvError> {
        self.enter(&self.calls.fetches).await?;
        let mut state = self.state.lock().unwrap();
        self.race(&mut state);
        self.storage(&state, index)
    }

    async fn stat_batch(&self) -> Result<Vec<StatRecord>, EnvError> {
        self.enter(&self.calls.stat_calls).await?;
        let mut state = self.state.lock().unwrap();
        let mut batch: Vec<StatRecord> = state.stale_replay.take().into_iter().collect();
        batch.extend(std::mem::take(&mut state.published));
        state.delivered += batch.len() as u64;
        self.race(&mut state);
        Ok(batch)
    }
}
