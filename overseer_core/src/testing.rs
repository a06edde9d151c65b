//! Scripted partitions and directory for unit tests.

use async_trait::async_trait;
use overseer_env::{
    parse_partition_name, Directory, EnvError, FieldStorage, IntRect2D, ObserverContext,
    PartitionEndpoint, PartitionId, Point2D, StatRecord, StoragePayload,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A remote call as seen by a mock partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Call {
    StepCounter,
    Lock,
    Unlock,
    Fetch(usize),
    Stats,
    Other,
}

#[derive(Default)]
struct MockState {
    step: u64,
    pending_stats: Vec<StatRecord>,
    calls: Vec<Call>,
    fail_lock: bool,
    fail_fetch_at: Option<usize>,
    fail_stats: bool,
    fail_step_counter: bool,
    race_on_fetch: bool,
}

/// One scripted partition. Storage contents encode the step they were read at.
pub(crate) struct MockEndpoint {
    pid: PartitionId,
    bounds: Vec<IntRect2D>,
    world: IntRect2D,
    hold: Arc<AtomicBool>,
    state: Mutex<MockState>,
}

impl MockEndpoint {
    pub(crate) fn set_step(&self, step: u64) {
        self.state.lock().unwrap().step = step;
    }

    pub(crate) fn step(&self) -> u64 {
        self.state.lock().unwrap().step
    }

    pub(crate) fn push_stats(&self, records: Vec<StatRecord>) {
        self.state.lock().unwrap().pending_stats.extend(records);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub(crate) fn count(&self, call: Call) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub(crate) fn fail_lock(&self, fail: bool) {
        self.state.lock().unwrap().fail_lock = fail;
    }

    pub(crate) fn fail_fetch_at(&self, index: Option<usize>) {
        self.state.lock().unwrap().fail_fetch_at = index;
    }

    pub(crate) fn fail_stats(&self, fail: bool) {
        self.state.lock().unwrap().fail_stats = fail;
    }

    pub(crate) fn fail_step_counter(&self, fail: bool) {
        self.state.lock().unwrap().fail_step_counter = fail;
    }

    /// Makes the partition step on every unheld fetch.
    pub(crate) fn race_on_fetch(&self, race: bool) {
        self.state.lock().unwrap().race_on_fetch = race;
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn local(&self) -> IntRect2D {
        self.bounds[self.pid.index()]
    }
}

#[async_trait]
impl PartitionEndpoint for MockEndpoint {
    async fn step_counter(&self) -> Result<u64, EnvError> {
        self.record(Call::StepCounter);
        let state = self.state.lock().unwrap();
        if state.fail_step_counter {
            return Err(EnvError::unreachable(self.pid));
        }
        Ok(state.step)
    }

    async fn time(&self) -> Result<f64, EnvError> {
        self.record(Call::Other);
        Ok(self.step() as f64 * 0.5)
    }

    async fn world_bounds(&self) -> Result<IntRect2D, EnvError> {
        self.record(Call::Other);
        Ok(self.world)
    }

    async fn partition_count(&self) -> Result<usize, EnvError> {
        self.record(Call::Other);
        Ok(self.bounds.len())
    }

    async fn local_bounds(&self) -> Result<IntRect2D, EnvError> {
        self.record(Call::Other);
        Ok(self.local())
    }

    async fn all_local_bounds(&self) -> Result<Vec<IntRect2D>, EnvError> {
        self.record(Call::Other);
        Ok(self.bounds.clone())
    }

    async fn lock(&self) -> Result<(), EnvError> {
        self.record(Call::Lock);
        if self.state.lock().unwrap().fail_lock {
            return Err(EnvError::Timeout(100));
        }
        self.hold.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock(&self) -> Result<(), EnvError> {
        self.record(Call::Unlock);
        self.hold.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn field_storage(&self, index: usize) -> Result<FieldStorage, EnvError> {
        self.record(Call::Fetch(index));
        let local = self.local();
        let mut state = self.state.lock().unwrap();
        if state.fail_fetch_at == Some(index) {
            return Err(EnvError::network("connection reset"));
        }
        if state.race_on_fetch && !self.hold.load(Ordering::SeqCst) {
            state.step += 1;
        }
        let step = state.step;
        let payload = match index {
            0 => StoragePayload::DoubleGrid(vec![step as f64; local.area()]),
            1 => StoragePayload::IntGrid(vec![step as i64; local.area()]),
            2 => StoragePayload::Continuous(vec![Point2D {
                id: step,
                x: local.x0 as f64,
                y: local.y0 as f64,
            }]),
            _ => return Err(EnvError::BadStorageIndex { index, available: 3 }),
        };
        Ok(FieldStorage::new(local, step, payload))
    }

    async fn stat_batch(&self) -> Result<Vec<StatRecord>, EnvError> {
        self.record(Call::Stats);
        let mut state = self.state.lock().unwrap();
        if state.fail_stats {
            return Err(EnvError::network("stats stream closed"));
        }
        Ok(std::mem::take(&mut state.pending_stats))
    }
}

/// N scripted partitions splitting a 4N x 2 world into 4 x 2 strips.
pub(crate) struct MockCluster {
    endpoints: Vec<Arc<MockEndpoint>>,
}

impl MockCluster {
    pub(crate) fn new(partitions: usize) -> Self {
        let bounds: Vec<IntRect2D> = (0..partitions as i32)
            .map(|p| IntRect2D::new(p * 4, 0, p * 4 + 4, 2))
            .collect();
        let world = IntRect2D::with_size(partitions as i32 * 4, 2);
        let hold = Arc::new(AtomicBool::new(false));

        let endpoints = (0..partitions)
            .map(|p| {
                Arc::new(MockEndpoint {
                    pid: PartitionId::from_index(p),
                    bounds: bounds.clone(),
                    world,
                    hold: Arc::clone(&hold),
                    state: Mutex::new(MockState::default()),
                })
            })
            .collect();

        Self { endpoints }
    }

    pub(crate) fn endpoint(&self, pid: u32) -> Arc<MockEndpoint> {
        Arc::clone(&self.endpoints[pid as usize])
    }

    pub(crate) fn set_step_all(&self, step: u64) {
        for endpoint in &self.endpoints {
            endpoint.set_step(step);
        }
    }

    pub(crate) fn clear_calls(&self) {
        for endpoint in &self.endpoints {
            endpoint.clear_calls();
        }
    }

    /// Total calls of one kind across all partitions.
    pub(crate) fn count(&self, call: Call) -> usize {
        self.endpoints.iter().map(|e| e.count(call)).sum()
    }
}

/// Directory over a [`MockCluster`] that counts lookups.
pub(crate) struct MockDirectory {
    endpoints: Vec<Arc<MockEndpoint>>,
    lookups: Mutex<Vec<u64>>,
    unbound: Mutex<HashSet<PartitionId>>,
}

impl MockDirectory {
    pub(crate) fn shared(cluster: &MockCluster) -> Arc<Self> {
        Arc::new(Self {
            endpoints: cluster.endpoints.clone(),
            lookups: Mutex::new(vec![0; cluster.endpoints.len()]),
            unbound: Mutex::new(HashSet::new()),
        })
    }

    pub(crate) fn lookups(&self) -> u64 {
        self.lookups.lock().unwrap().iter().sum()
    }

    pub(crate) fn lookups_of(&self, pid: PartitionId) -> u64 {
        self.lookups.lock().unwrap()[pid.index()]
    }

    pub(crate) fn set_unbound(&self, pid: PartitionId, unbound: bool) {
        let mut set = self.unbound.lock().unwrap();
        if unbound {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn lookup(&self, name: &str) -> Result<Arc<dyn PartitionEndpoint>, EnvError> {
        let pid = parse_partition_name(name).ok_or_else(|| EnvError::NotBound(name.into()))?;
        if pid.index() >= self.endpoints.len() || self.unbound.lock().unwrap().contains(&pid) {
            return Err(EnvError::NotBound(name.into()));
        }
        self.lookups.lock().unwrap()[pid.index()] += 1;
        let endpoint: Arc<dyn PartitionEndpoint> = self.endpoints[pid.index()].clone();
        Ok(endpoint)
    }
}

/// Context whose clock only moves when someone sleeps.
pub(crate) struct ManualContext {
    now: Mutex<Duration>,
}

impl ManualContext {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Duration::ZERO),
        })
    }
}

#[async_trait]
impl ObserverContext for ManualContext {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration;
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }
}
