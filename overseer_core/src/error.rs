//! Observer error taxonomy.

use overseer_env::{EnvError, PartitionId};
use thiserror::Error;

/// Errors surfaced by the observation layer.
///
/// Transient remote failures (`EndpointUnavailable`, `SnapshotAborted`) are
/// recovered by the next poll cycle. Structural errors (`BadFieldIndex`,
/// `IndexOutOfRange`) are programmer errors and are never retried.
/// `OutOfOrderStats` is a protocol violation by one partition.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// Directory lookup or a call on a partition endpoint failed.
    #[error("Endpoint unavailable for {pid}: {source}")]
    EndpointUnavailable {
        pid: PartitionId,
        #[source]
        source: EnvError,
    },

    /// Lock or fetch failed mid-batch; no mirror was touched.
    #[error("Snapshot aborted: {reason}")]
    SnapshotAborted {
        reason: String,
        #[source]
        source: Option<EnvError>,
    },

    /// A registered field does not match what the partition exposes.
    #[error("Bad field index {index} on {pid}: {detail}")]
    BadFieldIndex {
        pid: PartitionId,
        index: usize,
        detail: String,
    },

    /// A partition reported a step the observer already consumed.
    #[error("{pid} reported stats out of order: step {step} after {last_known}")]
    OutOfOrderStats {
        pid: PartitionId,
        step: u64,
        last_known: u64,
    },

    /// Malformed partition id or queue index.
    #[error("{what} {index} out of range (limit {limit})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        limit: usize,
    },
}

impl ObserverError {
    pub fn endpoint(pid: PartitionId, source: EnvError) -> Self {
        Self::EndpointUnavailable { pid, source }
    }

    pub fn aborted(reason: impl Into<String>, source: Option<EnvError>) -> Self {
        Self::SnapshotAborted {
            reason: reason.into(),
            source,
        }
    }

    pub fn partition_out_of_range(pid: PartitionId, limit: usize) -> Self {
        Self::IndexOutOfRange {
            what: "partition",
            index: pid.index(),
            limit,
        }
    }

    /// True for failures the next poll cycle is expected to recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ObserverError::EndpointUnavailable { .. } | ObserverError::SnapshotAborted { .. }
        )
    }
}
