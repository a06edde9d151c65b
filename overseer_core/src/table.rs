//! Global stats table and its text export.

use std::io;

use overseer_env::{PartitionId, StatRecord};
use serde::Serialize;

/// One partition's column at one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cell {
    /// The partition's queue doesn't cover this step
    Absent,

    /// Records reported for this step
    Real { step: u64, records: Vec<StatRecord> },

    /// Nothing reported; records of step `from` still stand (`None`: nothing yet)
    Carried {
        from: Option<u64>,
        records: Vec<StatRecord>,
    },
}

impl Cell {
    /// Text rendering: payloads joined by ` | `, or `__<step>__` for a carry-forward.
    pub fn render(&self) -> String {
        match self {
            Cell::Absent => String::new(),
            Cell::Real { records, .. } => records
                .iter()
                .map(StatRecord::render)
                .collect::<Vec<_>>()
                .join(" | "),
            Cell::Carried { from, .. } => format!("__{}__", from.unwrap_or(0)),
        }
    }

    /// Records standing at this step, carried or not.
    pub fn records(&self) -> &[StatRecord] {
        match self {
            Cell::Absent => &[],
            Cell::Real { records, .. } | Cell::Carried { records, .. } => records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsRow {
    pub step: u64,

    /// One cell per partition, in pid order
    pub cells: Vec<Cell>,
}

impl StatsRow {
    pub fn cell(&self, pid: PartitionId) -> Option<&Cell> {
        self.cells.get(pid.index())
    }
}

/// Merged per-step view across all partitions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsTable {
    /// Step the caller asked for
    pub requested_through: u64,

    /// Lowest latest-real step over all partitions (0 for one that never reported)
    pub complete_through: Option<u64>,

    pub partition_count: usize,

    pub rows: Vec<StatsRow>,
}

impl StatsTable {
    /// True if rows stop short of the requested step.
    pub fn is_clamped(&self) -> bool {
        self.last_step()
            .map_or(self.requested_through > 0, |last| last < self.requested_through)
    }

    pub fn last_step(&self) -> Option<u64> {
        self.rows.last().map(|r| r.step)
    }

    pub fn header(&self) -> Vec<String> {
        std::iter::once("step".to_string())
            .chain((0..self.partition_count).map(|p| PartitionId::from_index(p).to_string()))
            .collect()
    }

    /// Writes the table as CSV: `step,P0,…,P(N-1)` then one line per step.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.header())?;
        for row in &self.rows {
            let mut record = Vec::with_capacity(row.cells.len() + 1);
            record.push(row.step.to_string());
            record.extend(row.cells.iter().map(Cell::render));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StatsTable {
        StatsTable {
            requested_through: 4,
            complete_through: Some(2),
            partition_count: 3,
            rows: vec![
                StatsRow {
                    step: 1,
                    cells: vec![
                        Cell::Real {
                            step: 1,
                            records: vec![StatRecord::new(1, "a"), StatRecord::new(1, 3)],
                        },
                        Cell::Carried {
                            from: None,
                            records: vec![],
                        },
                        Cell::Absent,
                    ],
                },
                StatsRow {
                    step: 2,
                    cells: vec![
                        Cell::Carried {
                            from: Some(1),
                            records: vec![StatRecord::new(1, "a")],
                        },
                        Cell::Real {
                            step: 2,
                            records: vec![StatRecord::new(2, "x,y")],
                        },
                        Cell::Absent,
                    ],
                },
            ],
        }
    }

    #[test]
    fn test_csv_export() {
        let csv = table().to_csv().unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "step,P0,P1,P2");
        assert_eq!(lines[1], "1,a | 3,__0__,");
        // Payloads with separators are quoted
        assert_eq!(lines[2], "2,__1__,\"x,y\",");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_clamp_flag_and_cells() {
        let table = table();
        assert!(table.is_clamped());
        assert_eq!(table.last_step(), Some(2));
        let carried = table.rows[1].cell(PartitionId(0)).unwrap();
        assert_eq!(carried.records().len(), 1);
        assert!(table.rows[0].cell(PartitionId(2)).unwrap().records().is_empty());
    }
}
