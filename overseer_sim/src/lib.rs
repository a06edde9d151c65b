//! Overseer Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a partitioned simulation for the observer to watch,
//! with every source of non-determinism under control:
//! - **Time**: one virtual clock shared by the world, the links and the poll loop
//! - **Network**: per-partition latency, loss and reachability
//! - **Randomness**: all entropy derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock + seeded RNG)              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │  ┌──────────┐  ┌──────────┐        ┌──────────┐             │
//! │  │    P0    │  │    P1    │  ...   │  P(N-1)  │             │
//! │  │ (coord.) │  │          │        │          │             │
//! │  └────▲─────┘  └────▲─────┘        └────▲─────┘             │
//! │       └─────── SimNetworkController ────┘                   │
//! │                       ▲                                     │
//! │                 SimDirectory                                │
//! └───────────────────────┼─────────────────────────────────────┘
//!                         │
//!              ObserverSession + PollLoop
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use overseer_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Blackout).await;
//! assert!(result.passed);
//! ```

mod context;
mod directory;
mod exporter;
mod network;
mod partition;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use directory::SimDirectory;
pub use exporter::{ExportError, SimEvent, SimExport, SimFrame};
pub use network::{LinkLatency, LinkStats, SimNetworkController};
pub use partition::{CallStats, ClusterHold, PartitionSpec, SimPartition, STORAGE_COUNT};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{strip_bounds, SimConfig, SimWorld};
