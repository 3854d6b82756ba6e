//! One rank's portion of the dataset.

use aligned_vec::{AVec, ConstAlign};
use std::ops::Range;

use super::PointSource;
use crate::comm::Communicator;
use crate::config::MemoryLayout;
use crate::error::{LshError, Result};
use crate::index::{Aos, LinearIndexMapper, PointDim, Soa};
use crate::types::{PointId, Rank};

/// Global index range of `rank` when `total` points are spread over `size` ranks.
///
/// The first `total % size` ranks receive one extra point.
pub fn block_range(total: u64, size: usize, rank: Rank) -> Range<u64> {
    let size = size as u64;
    let rank = rank as u64;
    let base = total / size * rank + rank.min(total % size);
    let len = total / size + u64::from(rank < total % size);
    base..base + len
}

/// Points owned by one rank, stored in one 64-byte aligned buffer.
pub struct DatasetShard {
    data: AVec<f32, ConstAlign<64>>,
    num_points: usize,
    dims: usize,
    layout: MemoryLayout,
    rank: Rank,
    base: u64,
}

impl DatasetShard {
    /// Build the shard of `rank` whose first point has global index `base`.
    pub fn from_points(
        rank: Rank,
        base: u64,
        dims: usize,
        points: &[Vec<f32>],
        layout: MemoryLayout,
    ) -> Result<Self> {
        if dims == 0 {
            return Err(LshError::invalid_argument("Dimensionality cannot be 0"));
        }
        if let Some((i, p)) = points.iter().enumerate().find(|(_, p)| p.len() != dims) {
            return Err(LshError::invalid_argument(format!(
                "point {} has {} dimensions, expected {}",
                base + i as u64,
                p.len(),
                dims
            )));
        }

        let data: AVec<f32, ConstAlign<64>> = match layout {
            MemoryLayout::Aos => AVec::from_iter(64, points.iter().flat_map(|p| p.iter().copied())),
            MemoryLayout::Soa => AVec::from_iter(64, (0..dims).flat_map(|d| points.iter().map(move |p| p[d]))),
        };

        Ok(Self {
            data,
            num_points: points.len(),
            dims,
            layout,
            rank,
            base,
        })
    }

    /// Take this rank's block of a dataset every rank can see.
    pub fn from_global(comm: &Communicator, points: &[Vec<f32>], layout: MemoryLayout) -> Result<Self> {
        let dims = points.first().map(Vec::len).ok_or_else(|| {
            LshError::invalid_argument("cannot infer dimensionality of an empty dataset")
        })?;
        let range = block_range(points.len() as u64, comm.size(), comm.rank());
        let block = &points[range.start as usize..range.end as usize];
        Self::from_points(comm.rank(), range.start, dims, block, layout)
    }

    #[inline]
    fn offset(&self, point: usize, dim: usize) -> usize {
        match self.layout {
            MemoryLayout::Aos => PointDim::<Aos>::new(self.num_points, self.dims).flatten((point, dim)),
            MemoryLayout::Soa => PointDim::<Soa>::new(self.num_points, self.dims).flatten((point, dim)),
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn layout(&self) -> MemoryLayout {
        self.layout
    }

    /// Global index of the first point.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Id of the `index`-th local point.
    pub fn id(&self, index: usize) -> PointId {
        assert!(index < self.num_points, "point {} out of range", index);
        PointId::new(self.base + index as u64, self.rank)
    }

    pub fn ids(&self) -> impl Iterator<Item = PointId> + '_ {
        (0..self.num_points).map(move |i| self.id(i))
    }

    /// Local position of `id`, if this shard holds it.
    pub fn position_of(&self, id: PointId) -> Option<usize> {
        if id.owner != self.rank || id.global < self.base {
            return None;
        }
        let index = (id.global - self.base) as usize;
        (index < self.num_points).then_some(index)
    }

    /// Coordinates of the `index`-th local point.
    pub fn point(&self, index: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.dims];
        self.copy_point(index, &mut out);
        out
    }
}

impl PointSource for DatasetShard {
    fn len(&self) -> usize {
        self.num_points
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn copy_point(&self, index: usize, out: &mut [f32]) {
        match self.layout {
            MemoryLayout::Aos => {
                let start = self.offset(index, 0);
                out.copy_from_slice(&self.data[start..start + self.dims]);
            }
            MemoryLayout::Soa => {
                for (d, value) in out.iter_mut().enumerate() {
                    *value = self.data[self.offset(index, d)];
                }
            }
        }
    }
}

impl std::fmt::Debug for DatasetShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetShard")
            .field("rank", &self.rank)
            .field("base", &self.base)
            .field("num_points", &self.num_points)
            .field("dims", &self.dims)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_range_balanced() {
        let ranges: Vec<_> = (0..4).map(|r| block_range(10, 4, r)).collect();
        assert_eq!(ranges, vec![0..3, 3..6, 6..8, 8..10]);
        assert_eq!(block_range(1000, 4, 2), 500..750);
        assert_eq!(block_range(2, 4, 3), 2..2);
    }

    #[test]
    fn test_layouts_agree() {
        let points: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32, i as f32 * 10.0, -1.0]).collect();
        let aos = DatasetShard::from_points(1, 100, 3, &points, MemoryLayout::Aos).unwrap();
        let soa = DatasetShard::from_points(1, 100, 3, &points, MemoryLayout::Soa).unwrap();
        for i in 0..5 {
            assert_eq!(aos.point(i), points[i]);
            assert_eq!(soa.point(i), points[i]);
        }
        assert_eq!(aos.id(2), PointId::new(102, 1));
    }

    #[test]
    fn test_storage_aligned_in_layout_order() {
        let points: Vec<Vec<f32>> = (0..3).map(|i| vec![i as f32, 10.0 + i as f32]).collect();
        let aos = DatasetShard::from_points(0, 0, 2, &points, MemoryLayout::Aos).unwrap();
        let soa = DatasetShard::from_points(0, 0, 2, &points, MemoryLayout::Soa).unwrap();

        assert_eq!(aos.data.as_ptr() as usize % 64, 0);
        assert_eq!(soa.data.as_ptr() as usize % 64, 0);
        assert_eq!(&aos.data[..], &[0.0, 10.0, 1.0, 11.0, 2.0, 12.0]);
        assert_eq!(&soa.data[..], &[0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        for i in 0..3 {
            assert_eq!(aos.data[aos.offset(i, 1)], soa.data[soa.offset(i, 1)]);
        }

        let empty = DatasetShard::from_points(0, 0, 4, &[], MemoryLayout::Soa).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_position_of() {
        let points = vec![vec![0.0f32; 2]; 3];
        let shard = DatasetShard::from_points(2, 10, 2, &points, MemoryLayout::Aos).unwrap();
        assert_eq!(shard.position_of(PointId::new(11, 2)), Some(1));
        assert_eq!(shard.position_of(PointId::new(13, 2)), None);
        assert_eq!(shard.position_of(PointId::new(11, 0)), None);
        assert_eq!(shard.position_of(PointId::new(9, 2)), None);
    }

    #[test]
    fn test_rejects_ragged_points() {
        let points = vec![vec![0.0f32; 2], vec![0.0f32; 3]];
        let err = DatasetShard::from_points(0, 0, 2, &points, MemoryLayout::Aos).unwrap_err();
        assert!(err.message().contains("point 1"));
        assert!(DatasetShard::from_points(0, 0, 0, &[], MemoryLayout::Aos).is_err());
    }
}
