//! JSON and CSV exporter for scenario runs.
//!
//! A run exports its sampled frames and final metrics as JSON, and the
//! observer's merged stats table as CSV.

use overseer_core::StatsTable;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use thiserror::Error;

use crate::runner::ScenarioMetrics;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV encoding failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("run has no stats table to export")]
    NoStats,
}

/// A single sampled tick of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimFrame {
    pub tick: u64,

    /// Simulation time in seconds
    pub time_sec: f64,

    /// Step of every partition, in pid order
    pub partition_steps: Vec<u64>,

    /// What the poll cycle did: throttled, unchanged, refreshed or error
    pub outcome: String,

    /// Step of the last committed snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_step: Option<u64>,

    /// Mean of the mirrored heat field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heat_mean: Option<f64>,

    /// Total of the mirrored bug counts
    pub bugs_total: i64,

    /// Faults applied and errors seen during this tick
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Some("warn".to_string()),
        }
    }
}

/// Complete export of one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// Sampled frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ScenarioMetrics>,

    /// Merged stats table at the end of the run
    #[serde(skip)]
    pub stats: Option<StatsTable>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
            metrics: None,
            stats: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(
        &mut self,
        passed: bool,
        failure_reason: Option<String>,
        metrics: ScenarioMetrics,
        stats: Option<StatsTable>,
    ) {
        self.passed = passed;
        self.failure_reason = failure_reason;
        self.metrics = Some(metrics);
        self.stats = stats;
    }

    /// Writes frames and results to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Writes the stats table to a CSV file.
    pub fn write_stats_csv(&self, path: &str) -> Result<(), ExportError> {
        let table = self.stats.as_ref().ok_or(ExportError::NoStats)?;
        let file = File::create(path)?;
        table.write_csv(file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tick: u64) -> SimFrame {
        SimFrame {
            tick,
            time_sec: tick as f64 * 0.1,
            partition_steps: vec![tick, tick],
            outcome: "refreshed".to_string(),
            snapshot_step: Some(tick),
            heat_mean: None,
            bugs_total: 3,
            events: Vec::new(),
        }
    }

    #[test]
    fn test_export_tracks_duration() {
        let mut export = SimExport::new("lockstep", 7);
        export.add_frame(frame(1));
        export.add_frame(frame(10));
        assert_eq!(export.frames.len(), 2);
        assert!((export.duration_sec - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_json_skips_empty_fields() {
        let json = serde_json::to_value(frame(2)).unwrap();
        assert!(json.get("heat_mean").is_none());
        assert!(json.get("events").is_none());
        assert_eq!(json["snapshot_step"], 2);
    }

    #[test]
    fn test_csv_without_stats_is_an_error() {
        let export = SimExport::new("blackout", 1);
        assert!(matches!(
            export.write_stats_csv("/nonexistent/stats.csv"),
            Err(ExportError::NoStats)
        ));
    }
}
