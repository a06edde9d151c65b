//! Overseer Environment Abstraction Layer
//!
//! This crate provides the seams that let the observer run against both
//! **Production** partitions (tokio + TCP) and the deterministic
//! **Simulation** harness.
//!
//! # Core Concept
//!
//! The observer never touches a socket or a clock directly:
//! - Time (`now()`, `sleep()`) goes through [`ObserverContext`]
//! - Partitions are reached through [`PartitionEndpoint`] handles
//! - Handles are located by name through a [`Directory`]
//!
//! # Example
//!
//! ```ignore
//! use overseer_env::{Directory, PartitionId, TcpDirectory};
//!
//! let directory = TcpDirectory::new("127.0.0.1:5000", Duration::from_secs(5));
//! let coordinator = directory.lookup(&PartitionId::COORDINATOR.registry_name()).await?;
//! let steps = coordinator.step_counter().await?;
//! ```

mod context;
mod endpoint;
mod error;
pub mod rpc;
mod tokio_impl;
mod types;

pub use context::ObserverContext;
pub use endpoint::{Directory, PartitionEndpoint};
pub use error::EnvError;
pub use rpc::{serve_endpoint, serve_registry, TcpDirectory, TcpEndpoint};
pub use tokio_impl::TokioContext;
pub use types::{
    parse_partition_name, partition_name, FieldStorage, IntRect2D, PartitionId, Point2D,
    StatRecord, StorageKind, StoragePayload,
};
