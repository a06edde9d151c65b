//! Field mirrors - local, observer-owned copies of remote field storages.
//!
//! A mirror is registered once with the [`SnapshotCoordinator`] and is then
//! overwritten wholesale after every successful snapshot. Mirrors are shared
//! behind an async `RwLock`, so a display task can read them while the poll
//! task runs; a reader never sees a half-written mirror.
//!
//! [`SnapshotCoordinator`]: crate::snapshot::SnapshotCoordinator

use std::sync::Arc;

use overseer_env::{FieldStorage, IntRect2D, PartitionId, Point2D, StorageKind, StoragePayload};
use tokio::sync::RwLock;

/// Where a registered mirror reads from: a storage index on one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldSource {
    pub pid: PartitionId,
    pub index: usize,
}

impl std::fmt::Display for FieldSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.pid, self.index)
    }
}

/// Everything fetched inside one lock/unlock bracket.
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    step: u64,
    world_bounds: IntRect2D,
    storages: Vec<(FieldSource, FieldStorage)>,
}

impl SnapshotContext {
    pub(crate) fn new(step: u64, world_bounds: IntRect2D) -> Self {
        Self {
            step,
            world_bounds,
            storages: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, source: FieldSource, storage: FieldStorage) {
        self.storages.push((source, storage));
    }

    /// Global step the snapshot was taken at (coordinator's counter).
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn world_bounds(&self) -> IntRect2D {
        self.world_bounds
    }

    /// The storage fetched for `source` in this snapshot.
    pub fn storage(&self, source: FieldSource) -> Option<&FieldStorage> {
        self.storages
            .iter()
            .find(|(s, _)| *s == source)
            .map(|(_, storage)| storage)
    }

    /// Number of storages fetched.
    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}

/// Consumer contract for snapshot data.
///
/// `update` is invoked once per successful snapshot and must fully replace
/// the visible representation from the context's fetch, never patch it.
pub trait FieldMirror: Send + Sync + 'static {
    /// Storage kind this mirror can represent.
    fn kind(&self) -> StorageKind;

    /// Checks that a fetched storage can be applied. Runs before any
    /// mirror is touched, so a rejection leaves every mirror unchanged.
    fn validate(&self, storage: &FieldStorage) -> Result<(), String> {
        if storage.kind() != self.kind() {
            return Err(format!(
                "expected {} storage, partition exposes {}",
                self.kind(),
                storage.kind()
            ));
        }
        Ok(())
    }

    /// Overwrites the mirror from the snapshot's fetch of `source`.
    fn update(&mut self, context: &SnapshotContext, source: FieldSource);
}

/// A mirror shared between the poll task and readers.
pub type SharedMirror = Arc<RwLock<dyn FieldMirror>>;

/// Wraps a mirror for registration while keeping a typed handle for reads.
pub fn shared<M: FieldMirror>(mirror: M) -> Arc<RwLock<M>> {
    Arc::new(RwLock::new(mirror))
}

// =============================================================================
// GRID MIRRORS
// =============================================================================

/// Cell types a [`GridMirror`] can hold.
pub trait GridCell: Copy + Default + PartialEq + Send + Sync + 'static {
    const KIND: StorageKind;

    fn cells(payload: &StoragePayload) -> Option<&[Self]>;
}

impl GridCell for f64 {
    const KIND: StorageKind = StorageKind::DoubleGrid;

    fn cells(payload: &StoragePayload) -> Option<&[Self]> {
        match payload {
            StoragePayload::DoubleGrid(cells) => Some(cells.as_slice()),
            _ => None,
        }
    }
}

impl GridCell for i64 {
    const KIND: StorageKind = StorageKind::IntGrid;

    fn cells(payload: &StoragePayload) -> Option<&[Self]> {
        match payload {
            StoragePayload::IntGrid(cells) => Some(cells.as_slice()),
            _ => None,
        }
    }
}

/// Mirror of a row-major grid over one partition's bounds.
///
/// Width and height are taken from the storage on every update; the
/// values given at construction don't matter.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMirror<T> {
    bounds: IntRect2D,
    step: Option<u64>,
    cells: Vec<T>,
}

pub type DoubleGridMirror = GridMirror<f64>;
pub type IntGridMirror = GridMirror<i64>;

impl<T: GridCell> GridMirror<T> {
    pub fn new() -> Self {
        Self {
            bounds: IntRect2D::default(),
            step: None,
            cells: Vec::new(),
        }
    }

    pub fn bounds(&self) -> IntRect2D {
        self.bounds
    }

    pub fn width(&self) -> i32 {
        self.bounds.width()
    }

    pub fn height(&self) -> i32 {
        self.bounds.height()
    }

    /// Partition step of the last applied storage, `None` before the first snapshot.
    pub fn step(&self) -> Option<u64> {
        self.step
    }

    pub fn cells(&self) -> &[T] {
        &self.cells
    }

    /// Cell at world coordinates `(x, y)`, if inside the mirrored bounds.
    pub fn get(&self, x: i32, y: i32) -> Option<T> {
        if !self.bounds.contains(x, y) {
            return None;
        }
        let col = (x - self.bounds.x0) as usize;
        let row = (y - self.bounds.y0) as usize;
        self.cells
            .get(row * self.bounds.width() as usize + col)
            .copied()
    }
}

impl<T: GridCell> Default for GridMirror<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl GridMirror<f64> {
    /// Mean cell value.
    pub fn mean(&self) -> Option<f64> {
        if self.cells.is_empty() {
            return None;
        }
        Some(self.cells.iter().sum::<f64>() / self.cells.len() as f64)
    }
}

impl GridMirror<i64> {
    /// Sum over all cells.
    pub fn total(&self) -> i64 {
        self.cells.iter().sum()
    }
}

impl<T: GridCell> FieldMirror for GridMirror<T> {
    fn kind(&self) -> StorageKind {
        T::KIND
    }

    fn validate(&self, storage: &FieldStorage) -> Result<(), String> {
        let cells = T::cells(&storage.payload).ok_or_else(|| {
            format!(
                "expected {} storage, partition exposes {}",
                T::KIND,
                storage.kind()
            )
        })?;
        if cells.len() != storage.bounds.area() {
            return Err(format!(
                "grid has {} cells but bounds {} cover {}",
                cells.len(),
                storage.bounds,
                storage.bounds.area()
            ));
        }
        Ok(())
    }

    fn update(&mut self, context: &SnapshotContext, source: FieldSource) {
        let Some(storage) = context.storage(source) else {
            return;
        };
        let Some(cells) = T::cells(&storage.payload) else {
            return;
        };
        self.bounds = storage.bounds;
        self.step = Some(storage.step);
        self.cells = cells.to_vec();
    }
}

// =============================================================================
// CONTINUOUS MIRROR
// =============================================================================

/// Mirror of a continuous field (located entities).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContinuousMirror {
    bounds: IntRect2D,
    step: Option<u64>,
    points: Vec<Point2D>,
}

impl ContinuousMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounds(&self) -> IntRect2D {
        self.bounds
    }

    pub fn step(&self) -> Option<u64> {
        self.step
    }

    pub fn points(&self) -> &[Point2D] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl FieldMirror for ContinuousMirror {
    fn kind(&self) -> StorageKind {
        StorageKind::Continuous
    }

    fn update(&mut self, context: &SnapshotContext, source: FieldSource) {
        let Some(storage) = context.storage(source) else {
            return;
        };
        if let StoragePayload::Continuous(points) = &storage.payload {
            self.bounds = storage.bounds;
            self.step = Some(storage.step);
            self.points = points.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_with(storage: FieldStorage) -> (SnapshotContext, FieldSource) {
        let source = FieldSource {
            pid: PartitionId(1),
            index: 0,
        };
        let mut context = SnapshotContext::new(7, IntRect2D::with_size(8, 2));
        context.insert(source, storage);
        (context, source)
    }

    #[test]
    fn test_grid_mirror_overwrites_wholesale() {
        let mut mirror = DoubleGridMirror::new();
        assert_eq!(mirror.step(), None);

        let (ctx, source) = context_with(FieldStorage::new(
            IntRect2D::new(4, 0, 6, 2),
            7,
            StoragePayload::DoubleGrid(vec![1.0, 2.0, 3.0, 4.0]),
        ));
        mirror.update(&ctx, source);

        assert_eq!(mirror.step(), Some(7));
        assert_eq!(mirror.width(), 2);
        assert_eq!(mirror.get(5, 1), Some(4.0));
        assert_eq!(mirror.get(0, 0), None);
        assert_eq!(mirror.mean(), Some(2.5));

        let (ctx, source) = context_with(FieldStorage::new(
            IntRect2D::new(0, 0, 1, 1),
            8,
            StoragePayload::DoubleGrid(vec![9.0]),
        ));
        mirror.update(&ctx, source);
        assert_eq!(mirror.cells(), &[9.0]);
        assert_eq!(mirror.bounds(), IntRect2D::new(0, 0, 1, 1));
    }

    #[test]
    fn test_grid_mirror_rejects_wrong_kind_and_shape() {
        let mirror = IntGridMirror::new();
        let wrong_kind = FieldStorage::new(
            IntRect2D::with_size(1, 1),
            0,
            StoragePayload::DoubleGrid(vec![0.0]),
        );
        assert!(mirror.validate(&wrong_kind).is_err());

        let wrong_shape = FieldStorage::new(
            IntRect2D::with_size(2, 2),
            0,
            StoragePayload::IntGrid(vec![1, 2, 3]),
        );
        assert!(mirror.validate(&wrong_shape).is_err());

        let ok = FieldStorage::new(
            IntRect2D::with_size(2, 1),
            0,
            StoragePayload::IntGrid(vec![1, 2]),
        );
        assert!(mirror.validate(&ok).is_ok());
    }

    #[test]
    fn test_continuous_mirror() {
        let mut mirror = ContinuousMirror::new();
        let (ctx, source) = context_with(FieldStorage::new(
            IntRect2D::with_size(4, 4),
            3,
            StoragePayload::Continuous(vec![Point2D {
                id: 1,
                x: 0.5,
                y: 1.5,
            }]),
        ));
        assert!(mirror
            .validate(ctx.storage(source).unwrap())
            .is_ok());
        mirror.update(&ctx, source);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.step(), Some(3));
    }
}
