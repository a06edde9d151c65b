//! Common types shared by the observer and the partitions it watches.

use serde::{Deserialize, Serialize};

/// Identifier of one partition (worker process).
///
/// Partitions are numbered densely `0..N`. Partition 0 is the coordinating
/// partition, the authority for step-counter and world-metadata queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// The coordinating partition.
    pub const COORDINATOR: PartitionId = PartitionId(0);

    /// Creates a PartitionId from a dense index.
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Returns the dense index of this partition.
    pub fn index(&self) -> usize {
        self.0 as usize
    }

    /// Returns true if this is the coordinating partition.
    pub fn is_coordinator(&self) -> bool {
        self.0 == 0
    }

    /// Canonical name under which the partition registers with the directory.
    pub fn registry_name(&self) -> String {
        partition_name(*self)
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Canonical directory name for a partition endpoint.
pub fn partition_name(pid: PartitionId) -> String {
    format!("partition-{}", pid.0)
}

/// Parses a canonical directory name back into a PartitionId.
pub fn parse_partition_name(name: &str) -> Option<PartitionId> {
    name.strip_prefix("partition-")?
        .parse::<u32>()
        .ok()
        .map(PartitionId)
}

/// Axis-aligned integer rectangle, upper-left inclusive, bottom-right exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntRect2D {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IntRect2D {
    /// Creates a rectangle from its corners.
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Creates a rectangle anchored at the origin.
    pub fn with_size(width: i32, height: i32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn width(&self) -> i32 {
        (self.x1 - self.x0).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.y1 - self.y0).max(0)
    }

    /// Number of integer cells covered.
    pub fn area(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }
}

impl std::fmt::Display for IntRect2D {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})x[{},{})", self.x0, self.x1, self.y0, self.y1)
    }
}

/// A located entity in a continuous field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub id: u64,
    pub x: f64,
    pub y: f64,
}

/// The kind of storage a partition exposes at a given index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    DoubleGrid,
    IntGrid,
    Continuous,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageKind::DoubleGrid => "double-grid",
            StorageKind::IntGrid => "int-grid",
            StorageKind::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

/// Raw contents of one field storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum StoragePayload {
    /// Row-major grid of doubles covering `FieldStorage::bounds`.
    DoubleGrid(Vec<f64>),
    /// Row-major grid of integers covering `FieldStorage::bounds`.
    IntGrid(Vec<i64>),
    /// Located entities.
    Continuous(Vec<Point2D>),
}

impl StoragePayload {
    pub fn kind(&self) -> StorageKind {
        match self {
            StoragePayload::DoubleGrid(_) => StorageKind::DoubleGrid,
            StoragePayload::IntGrid(_) => StorageKind::IntGrid,
            StoragePayload::Continuous(_) => StorageKind::Continuous,
        }
    }

    /// Number of cells or entities.
    pub fn len(&self) -> usize {
        match self {
            StoragePayload::DoubleGrid(v) => v.len(),
            StoragePayload::IntGrid(v) => v.len(),
            StoragePayload::Continuous(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One field storage as exposed by a partition.
///
/// This is the opaque blob the observer fetches; only the mirror that
/// registered for it interprets the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStorage {
    /// Region covered by this storage (the partition's local bounds).
    pub bounds: IntRect2D,

    /// Partition step at which the storage was read.
    pub step: u64,

    /// The data itself
    pub payload: StoragePayload,
}

impl FieldStorage {
    pub fn new(bounds: IntRect2D, step: u64, payload: StoragePayload) -> Self {
        Self {
            bounds,
            step,
            payload,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.payload.kind()
    }
}

/// A statistics record produced by a partition.
///
/// The payload is opaque to the observer; it only aligns records by step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    /// Partition step at which the record was produced
    pub step: u64,

    /// Opaque payload
    pub payload: serde_json::Value,
}

impl StatRecord {
    pub fn new(step: u64, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            step,
            payload: payload.into(),
        }
    }

    /// Renders the payload for text export. Strings are emitted bare.
    pub fn render(&self) -> String {
        match &self.payload {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_name_roundtrip() {
        let pid = PartitionId(7);
        assert_eq!(partition_name(pid), "partition-7");
        assert_eq!(parse_partition_name("partition-7"), Some(pid));
        assert_eq!(parse_partition_name("processor-7"), None);
        assert_eq!(pid.to_string(), "P7");
    }

    #[test]
    fn test_rect_geometry() {
        let r = IntRect2D::new(10, 0, 20, 5);
        assert_eq!(r.width(), 10);
        assert_eq!(r.height(), 5);
        assert_eq!(r.area(), 50);
        assert!(r.contains(10, 0));
        assert!(!r.contains(20, 0));
    }

    #[test]
    fn test_stat_record_render() {
        assert_eq!(StatRecord::new(1, "agents=4").render(), "agents=4");
        assert_eq!(StatRecord::new(1, 4).render(), "4");
    }
}
