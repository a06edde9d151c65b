//! Simulated link faults between the observer and each partition.

use overseer_env::{EnvError, PartitionId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Latency of calls to one partition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkLatency {
    /// Mean latency in milliseconds
    pub base_ms: f64,

    /// Standard deviation in milliseconds
    pub jitter_ms: f64,
}

/// Counters of what the controller did to calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub calls: u64,
    pub refused: u64,
    pub dropped: u64,
}

/// Network controller for fault injection.
///
/// Every remote call on a simulated partition asks the controller first.
/// A call to an unreachable partition fails right away; a lost call fails
/// with a timeout; anything else is delivered after a sampled latency.
pub struct SimNetworkController {
    /// Partitions that refuse all calls (and lookups)
    unreachable: Mutex<HashSet<PartitionId>>,

    /// Per-partition latency
    latency: Mutex<HashMap<PartitionId, LinkLatency>>,

    /// Per-partition call loss rate (0.0 - 1.0)
    loss: Mutex<HashMap<PartitionId, f64>>,

    /// Timeout reported for a lost call
    loss_timeout_ms: u64,

    rng: Mutex<ChaCha8Rng>,

    calls: AtomicU64,
    refused: AtomicU64,
    dropped: AtomicU64,
}

impl SimNetworkController {
    /// Creates a controller with all links healthy.
    pub fn new(seed: u64) -> Self {
        Self {
            unreachable: Mutex::new(HashSet::new()),
            latency: Mutex::new(HashMap::new()),
            loss: Mutex::new(HashMap::new()),
            loss_timeout_ms: 1000,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            calls: AtomicU64::new(0),
            refused: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Makes a partition unreachable (or reachable again).
    pub fn set_unreachable(&self, pid: PartitionId, unreachable: bool) {
        let mut set = self.unreachable.lock().unwrap();
        if unreachable {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }

    pub fn is_unreachable(&self, pid: PartitionId) -> bool {
        self.unreachable.lock().unwrap().contains(&pid)
    }

    /// Sets latency for calls to a partition.
    pub fn set_latency(&self, pid: PartitionId, base_ms: f64, jitter_ms: f64) {
        let mut latency = self.latency.lock().unwrap();
        latency.insert(
            pid,
            LinkLatency {
                base_ms: base_ms.max(0.0),
                jitter_ms: jitter_ms.max(0.0),
            },
        );
    }

    /// Sets the call loss rate for a partition.
    pub fn set_loss(&self, pid: PartitionId, rate: f64) {
        let mut loss = self.loss.lock().unwrap();
        loss.insert(pid, rate.clamp(0.0, 1.0));
    }

    /// Heals every link: reachable, no latency, no loss.
    pub fn heal_all(&self) {
        self.unreachable.lock().unwrap().clear();
        self.latency.lock().unwrap().clear();
        self.loss.lock().unwrap().clear();
    }

    /// Decides the fate of one call to `pid`.
    ///
    /// Returns the latency to apply, or the error the caller sees.
    pub fn check(&self, pid: PartitionId) -> Result<Duration, EnvError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.is_unreachable(pid) {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::unreachable(pid));
        }

        let loss = self.loss.lock().unwrap().get(&pid).copied().unwrap_or(0.0);
        let latency = self.latency.lock().unwrap().get(&pid).copied();

        let mut rng = self.rng.lock().unwrap();
        if loss > 0.0 && rng.gen_bool(loss) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::Timeout(self.loss_timeout_ms));
        }

        let ms = match latency {
            Some(link) if link.jitter_ms > 0.0 => Normal::new(link.base_ms, link.jitter_ms)
                .map(|d| d.sample(&mut *rng))
                .unwrap_or(link.base_ms),
            Some(link) => link.base_ms,
            None => 0.0,
        };
        Ok(Duration::from_secs_f64(ms.max(0.0) / 1000.0))
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            calls: self.calls.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for SimNetworkController {
    fn default() -> Self {
        Self::new(0)
    }
}
