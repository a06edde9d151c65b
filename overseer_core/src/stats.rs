//! Stats reconciler - merges per-partition statistics into one timeline.
//!
//! Partitions report statistics asynchronously, at their own step rates, and
//! with gaps. Each partition gets a gap-free queue indexed by step:
//!
//! ```text
//!   step:   1     2     3     4     5
//!   P0:   [R1]  [R2]  [R3]  [R4]  [R5]
//!   P1:   [R1]  [↩1]  [↩1]  [R4]          ↩n = carried forward from step n
//!   P2:   [∅ ]  [∅ ]  [R3]                ∅  = nothing reported yet
//! ```
//!
//! A query for the table up to step S only returns rows every partition has
//! reached, so a fast partition never produces rows a slow one can't fill.

use overseer_env::{PartitionId, StatRecord};
use serde::Serialize;
use tracing::debug;

use crate::error::ObserverError;
use crate::table::{Cell, StatsRow, StatsTable};

/// One slot of a partition's queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEntry {
    /// Records the partition reported for this step
    Real { step: u64, records: Vec<StatRecord> },

    /// No report for this step; stands for the last real step, or nothing
    /// if the partition hasn't reported yet (`from: None`)
    CarryForward { from: Option<u64> },
}

impl QueueEntry {
    pub fn is_real(&self) -> bool {
        matches!(self, QueueEntry::Real { .. })
    }
}

/// Gap-free, step-indexed queue for one partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PartitionStatQueue {
    /// Step of `entries[0]`
    first_step: u64,

    entries: Vec<QueueEntry>,
}

impl PartitionStatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Step of the first entry.
    pub fn first_step(&self) -> u64 {
        self.first_step
    }

    /// Step of the last entry, or 0 if the queue is empty.
    pub fn last_known_step(&self) -> u64 {
        if self.entries.is_empty() {
            0
        } else {
            self.first_step + self.entries.len() as u64 - 1
        }
    }

    /// Step of the most recent `Real` entry.
    pub fn last_real_step(&self) -> Option<u64> {
        self.entries.iter().rev().find_map(|e| match e {
            QueueEntry::Real { step, .. } => Some(*step),
            QueueEntry::CarryForward { .. } => None,
        })
    }

    pub fn entry_at(&self, step: u64) -> Option<&QueueEntry> {
        let offset = step.checked_sub(self.first_step)?;
        self.entries.get(offset as usize)
    }

    /// Records standing for `step`, following a carry-forward to its source.
    pub fn records_at(&self, step: u64) -> Option<&[StatRecord]> {
        match self.entry_at(step)? {
            QueueEntry::Real { records, .. } => Some(records),
            QueueEntry::CarryForward { from: Some(from) } => match self.entry_at(*from)? {
                QueueEntry::Real { records, .. } => Some(records),
                QueueEntry::CarryForward { .. } => None,
            },
            QueueEntry::CarryForward { from: None } => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &QueueEntry)> {
        let first = self.first_step;
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, e)| (first + i as u64, e))
    }

    fn push_carry_until(&mut self, step: u64) {
        let from = self.last_real_step();
        while self.last_known_step() + 1 < step {
            self.entries.push(QueueEntry::CarryForward { from });
        }
    }
}

/// Summary of one accepted batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Records accepted
    pub records: usize,

    /// Real entries appended
    pub real_entries: usize,

    /// Carry-forward entries synthesized for gaps
    pub filled: usize,

    /// Records merged into an existing tail entry
    pub merged: usize,
}

/// Holds one queue per partition and produces the global table.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReconciler {
    queues: Vec<PartitionStatQueue>,
}

impl StatsReconciler {
    pub fn new(partitions: usize) -> Self {
        Self {
            queues: vec![PartitionStatQueue::new(); partitions],
        }
    }

    pub fn partition_count(&self) -> usize {
        self.queues.len()
    }

    pub fn queue(&self, pid: PartitionId) -> Option<&PartitionStatQueue> {
        self.queues.get(pid.index())
    }

    fn queue_mut(&mut self, pid: PartitionId) -> Result<&mut PartitionStatQueue, ObserverError> {
        let limit = self.queues.len();
        self.queues
            .get_mut(pid.index())
            .ok_or_else(|| ObserverError::partition_out_of_range(pid, limit))
    }

    /// Appends a batch from `pid`, filling skipped steps with carry-forwards.
    ///
    /// The batch must be sorted by step and must not start before the
    /// queue's last known step. A batch starting *at* the last step is
    /// merged into that entry. Rejected batches leave the queue unchanged.
    pub fn ingest(
        &mut self,
        pid: PartitionId,
        batch: Vec<StatRecord>,
    ) -> Result<IngestReport, ObserverError> {
        let queue = self.queue_mut(pid)?;
        let Some(first) = batch.first().map(|r| r.step) else {
            return Ok(IngestReport::default());
        };

        if let Some(bad) = batch.windows(2).find(|w| w[1].step < w[0].step) {
            return Err(ObserverError::OutOfOrderStats {
                pid,
                step: bad[1].step,
                last_known: bad[0].step,
            });
        }
        let last_known = queue.last_known_step();
        if !queue.is_empty() && first < last_known {
            return Err(ObserverError::OutOfOrderStats {
                pid,
                step: first,
                last_known,
            });
        }
        if queue.is_empty() {
            queue.first_step = first.min(1);
        }

        let mut report = IngestReport {
            records: batch.len(),
            ..IngestReport::default()
        };
        for record in batch {
            let step = record.step;
            // The tail is always real: carry-forwards only ever precede one.
            if !queue.is_empty() && step == queue.last_known_step() {
                if let Some(QueueEntry::Real { records, .. }) = queue.entries.last_mut() {
                    records.push(record);
                    report.merged += 1;
                    continue;
                }
            }

            let before = queue.len();
            queue.push_carry_until(step);
            report.filled += queue.len() - before;
            queue.entries.push(QueueEntry::Real {
                step,
                records: vec![record],
            });
            report.real_entries += 1;
        }

        debug!(
            %pid,
            records = report.records,
            filled = report.filled,
            last_step = queue.last_known_step(),
            "ingested stat batch"
        );
        Ok(report)
    }

    /// Highest step every partition has a real entry for.
    ///
    /// A partition that never reported counts as step 0, so it holds the
    /// horizon back until its first batch. `None` if no partition has reported.
    pub fn complete_through(&self) -> Option<u64> {
        self.latest_step()?;
        self.queues
            .iter()
            .map(|q| q.last_real_step().unwrap_or(0))
            .min()
    }

    /// Highest step any partition has reported.
    pub fn latest_step(&self) -> Option<u64> {
        self.queues.iter().filter_map(|q| q.last_real_step()).max()
    }

    /// Merged table of rows up to `upto`, clamped to [`complete_through`].
    ///
    /// [`complete_through`]: Self::complete_through
    pub fn global_table(&self, upto: u64) -> StatsTable {
        let complete = self.complete_through();
        if let Some(complete) = complete.filter(|c| *c < upto) {
            debug!(requested = upto, complete, "clamped stats table");
        }
        self.table_through(upto, complete.map(|c| c.min(upto)))
    }

    /// Every row any partition has reached, without clamping.
    ///
    /// Rows past [`complete_through`] hold `Absent` cells for the
    /// partitions that haven't got there yet.
    ///
    /// [`complete_through`]: Self::complete_through
    pub fn full_table(&self) -> StatsTable {
        let latest = self.latest_step();
        self.table_through(latest.unwrap_or(0), latest)
    }

    fn table_through(&self, requested: u64, last_row: Option<u64>) -> StatsTable {
        let rows = match last_row {
            Some(last) => {
                let first = self
                    .queues
                    .iter()
                    .filter(|q| !q.is_empty())
                    .map(|q| q.first_step())
                    .min()
                    .unwrap_or(last);
                (first..=last).map(|step| self.row(step)).collect()
            }
            None => Vec::new(),
        };

        StatsTable {
            requested_through: requested,
            complete_through: self.complete_through(),
            partition_count: self.queues.len(),
            rows,
        }
    }

    fn row(&self, step: u64) -> StatsRow {
        let cells = self
            .queues
            .iter()
            .map(|queue| match queue.entry_at(step) {
                Some(QueueEntry::Real { step, records }) => Cell::Real {
                    step: *step,
                    records: records.clone(),
                },
                Some(QueueEntry::CarryForward { from }) => Cell::Carried {
                    from: *from,
                    records: queue.records_at(step).map(<[_]>::to_vec).unwrap_or_default(),
                },
                None => Cell::Absent,
            })
            .collect();
        StatsRow { step, cells }
    }

    /// Hands over every queue as it stands and starts empty ones.
    pub fn drain_and_reset(&mut self) -> Vec<PartitionStatQueue> {
        let fresh = vec![PartitionStatQueue::new(); self.queues.len()];
        let drained = std::mem::replace(&mut self.queues, fresh);
        debug!(
            entries = drained.iter().map(PartitionStatQueue::len).sum::<usize>(),
            "drained stat queues"
        );
        drained
    }
}

impl From<Vec<PartitionStatQueue>> for StatsReconciler {
    fn from(queues: Vec<PartitionStatQueue>) -> Self {
        Self { queues }
    }
}
