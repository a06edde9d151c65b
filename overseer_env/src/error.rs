//! Error types for the Overseer environment abstraction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the environment and transport layer.
///
/// Serializable so that a remote endpoint can report its failure
/// verbatim over the wire.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum EnvError {
    /// Network send/receive failed (connection refused, closed, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target partition is unreachable (simulated partition or dead process)
    #[error("Node unreachable: {0}")]
    NodeUnreachable(String),

    /// Directory has no binding for the requested name
    #[error("Name not bound: {0}")]
    NotBound(String),

    /// Request/response serialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The remote endpoint rejected the call
    #[error("Remote error: {0}")]
    Remote(String),

    /// Requested field storage index does not exist on the partition
    #[error("Storage index {index} out of range ({available} storages exposed)")]
    BadStorageIndex { index: usize, available: usize },

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(node: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(node.to_string())
    }

    /// Creates a remote rejection.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// True when the failure says the handle itself may be stale
    /// (connection-level), as opposed to a logical rejection.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            EnvError::NetworkError(_) | EnvError::NodeUnreachable(_) | EnvError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for EnvError {
    fn from(err: std::io::Error) -> Self {
        Self::NetworkError(err.to_string())
    }
}
