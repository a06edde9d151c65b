//! SimWorld - the partitioned simulation an observer watches.

use std::sync::Arc;
use std::time::Duration;

use overseer_env::{IntRect2D, PartitionId};

use crate::context::SimContext;
use crate::directory::SimDirectory;
use crate::network::SimNetworkController;
use crate::partition::{ClusterHold, PartitionSpec, SimPartition};

/// Configuration for the simulation.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of partitions
    pub partitions: usize,

    /// World size in cells
    pub width: i32,
    pub height: i32,

    /// Ticks between two steps, per partition (missing entries step every tick)
    pub step_periods: Vec<u64>,

    /// Probability that a partition reports stats on a given step
    pub stat_probability: f64,

    /// Simulated seconds per step
    pub step_dt: f64,

    /// Virtual milliseconds per world tick
    pub tick_ms: u64,

    /// Points per partition in the continuous field
    pub flock_size: usize,

    /// Partitions keep stepping while the observer reads unlocked
    pub racing: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            partitions: 4,
            width: 32,
            height: 8,
            step_periods: Vec::new(),
            stat_probability: 1.0,
            step_dt: 0.1,
            tick_ms: 100,
            flock_size: 6,
            racing: false,
        }
    }
}

impl SimConfig {
    /// Ticks between two steps of partition `index`.
    pub fn period(&self, index: usize) -> u64 {
        self.step_periods.get(index).copied().unwrap_or(1).max(1)
    }
}

/// Splits the world into vertical strips, one per partition.
///
/// The last strip takes the remainder when the width doesn't divide evenly.
pub fn strip_bounds(world: IntRect2D, partitions: usize) -> Vec<IntRect2D> {
    let n = partitions.max(1) as i32;
    let strip = (world.width() / n).max(1);
    (0..n)
        .map(|p| {
            let x0 = world.x0 + p * strip;
            let x1 = if p == n - 1 { world.x1 } else { x0 + strip };
            IntRect2D::new(x0, world.y0, x1, world.y1)
        })
        .collect()
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network controller for fault injection
    pub network: Arc<SimNetworkController>,

    /// Hold taken by the coordinator's lock
    pub hold: Arc<ClusterHold>,

    partitions: Vec<Arc<SimPartition>>,

    directory: Arc<SimDirectory>,

    /// Current tick count
    tick_count: u64,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let network = Arc::new(SimNetworkController::new(
            config.seed.wrapping_mul(0x517cc1b727220a95),
        ));
        let hold = Arc::new(ClusterHold::new());

        let world = IntRect2D::with_size(config.width, config.height);
        let all_bounds = strip_bounds(world, config.partitions);
        let partitions: Vec<Arc<SimPartition>> = (0..all_bounds.len())
            .map(|index| {
                let spec = PartitionSpec {
                    pid: PartitionId::from_index(index),
                    world,
                    all_bounds: all_bounds.clone(),
                    stat_probability: config.stat_probability,
                    step_dt: config.step_dt,
                    flock_size: config.flock_size,
                };
                let partition =
                    SimPartition::new(spec, context.clone(), network.clone(), hold.clone());
                partition.set_racing(config.racing);
                Arc::new(partition)
            })
            .collect();
        let directory = Arc::new(SimDirectory::new(partitions.clone(), network.clone()));

        Self {
            config,
            context,
            network,
            hold,
            partitions,
            directory,
            tick_count: 0,
        }
    }

    /// Advances the simulation by one tick. Returns how many partitions stepped.
    pub fn tick(&mut self) -> usize {
        self.context
            .advance_time(Duration::from_millis(self.config.tick_ms));
        self.tick_count += 1;

        let mut stepped = 0;
        for (index, partition) in self.partitions.iter().enumerate() {
            if self.tick_count % self.config.period(index) == 0 && partition.advance() {
                stepped += 1;
            }
        }
        stepped
    }

    pub fn partition(&self, pid: PartitionId) -> Option<&Arc<SimPartition>> {
        self.partitions.get(pid.index())
    }

    pub fn partitions(&self) -> &[Arc<SimPartition>] {
        &self.partitions
    }

    pub fn directory(&self) -> Arc<SimDirectory> {
        Arc::clone(&self.directory)
    }

    /// Step of the coordinating partition.
    pub fn coordinator_step(&self) -> u64 {
        self.partitions.first().map_or(0, |p| p.step())
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.time_ns() as f64 / 1e9
    }

    /// Returns the current tick count.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
