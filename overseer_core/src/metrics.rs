//! Observer Metrics
//! ================
//!
//! Running counters for a session. Cheap to copy and serializable, so the
//! simulation exporter and the CLI can dump them as they are.

use serde::Serialize;

use crate::error::ObserverError;

/// Counters accumulated over the life of an observer session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ObserverMetrics {
    /// Poll iterations (including throttled ones)
    pub cycles: u64,
    /// Iterations skipped by the refresh-interval gate
    pub throttled: u64,
    /// Remote queries that found the step counter unchanged
    pub unchanged: u64,
    /// Completed refreshes (snapshot + stats)
    pub refreshes: u64,
    /// Refreshes that ended in an error
    pub failures: u64,
    /// Snapshots aborted mid-batch
    pub aborted_snapshots: u64,
    /// Field storages fetched
    pub field_fetches: u64,
    /// Stat records accepted
    pub stat_records: u64,
    /// Carry-forward entries synthesized
    pub carried_entries: u64,
    /// Stat batches rejected for arriving out of order
    pub skipped_batches: u64,
}

impl ObserverMetrics {
    pub fn record_failure(&mut self, err: &ObserverError) {
        self.failures += 1;
        if matches!(err, ObserverError::SnapshotAborted { .. }) {
            self.aborted_snapshots += 1;
        }
    }

    /// Fraction of remote queries that led to a refresh.
    pub fn refresh_ratio(&self) -> f64 {
        let queries = self.unchanged + self.refreshes + self.failures;
        if queries == 0 {
            0.0
        } else {
            self.refreshes as f64 / queries as f64
        }
    }
}
