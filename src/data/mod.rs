//! Dataset storage.
//!
//! Each rank holds a [`DatasetShard`]; a [`PointWindow`] makes all shards
//! readable from every rank for exact refinement.

mod shard;
mod window;

pub use shard::{block_range, DatasetShard};
pub use window::PointWindow;

/// Anything that can hand out fixed-length points by index.
pub trait PointSource: Sync {
    /// Number of points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensionality of every point.
    fn dims(&self) -> usize;

    /// Copy the coordinates of point `index` into `out` (`out.len() == dims()`).
    fn copy_point(&self, index: usize, out: &mut [f32]);
}

impl PointSource for [Vec<f32>] {
    fn len(&self) -> usize {
        <[Vec<f32>]>::len(self)
    }

    fn dims(&self) -> usize {
        self.first().map_or(0, Vec::len)
    }

    fn copy_point(&self, index: usize, out: &mut [f32]) {
        out.copy_from_slice(&self[index]);
    }
}
