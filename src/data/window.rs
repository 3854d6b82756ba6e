//! Shards exposed for one-sided reads by other ranks.

use log::debug;
use std::sync::Arc;

use super::{DatasetShard, PointSource};
use crate::comm::Communicator;
use crate::config::MemoryLayout;
use crate::error::{LshError, Result};
use crate::types::{PointId, Rank};

/// Every rank's shards, readable from any rank.
///
/// A rank may hold several segments: the shard it was built from plus one
/// per collective [`PointWindow::extend`].
pub struct PointWindow {
    comm: Communicator,
    segments: Vec<Vec<Arc<DatasetShard>>>,
    dims: usize,
    total: u64,
}

impl PointWindow {
    /// Expose `shard` to all ranks. Collective.
    pub fn expose(comm: &Communicator, shard: Arc<DatasetShard>) -> Result<Self> {
        let dims = shard.dims();
        let shards = comm.all_gather(shard)?;
        if let Some(bad) = shards.iter().find(|s| s.dims() != dims) {
            return Err(LshError::invalid_argument(format!(
                "rank {} exposes {} dimensions, rank {} exposes {}",
                bad.rank(),
                bad.dims(),
                comm.rank(),
                dims
            )));
        }
        let total = shards.iter().map(|s| s.len() as u64).sum();
        debug!("[rank {}] exposed window over {} points", comm.rank(), total);

        Ok(Self {
            comm: comm.clone(),
            segments: shards.into_iter().map(|s| vec![s]).collect(),
            dims,
            total,
        })
    }

    /// Append new points on every rank and expose them. Collective.
    ///
    /// New points get global ids after all existing ones, in rank order.
    /// Returns this rank's new segment.
    pub fn extend(&mut self, points: &[Vec<f32>], layout: MemoryLayout) -> Result<Arc<DatasetShard>> {
        let counts = self.comm.all_gather(points.len() as u64)?;
        let base = self.total + counts[..self.comm.rank()].iter().sum::<u64>();
        let shard = Arc::new(DatasetShard::from_points(
            self.comm.rank(),
            base,
            self.dims,
            points,
            layout,
        )?);

        let shards = self.comm.all_gather(Arc::clone(&shard))?;
        for (rank, segment) in shards.into_iter().enumerate() {
            self.segments[rank].push(segment);
        }
        self.total += counts.iter().sum::<u64>();
        Ok(shard)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of points over all ranks.
    pub fn total_points(&self) -> u64 {
        self.total
    }

    /// This rank's original shard.
    pub fn local(&self) -> &Arc<DatasetShard> {
        &self.segments[self.comm.rank()][0]
    }

    /// Segments held by `rank`.
    pub fn segments(&self, rank: Rank) -> Result<&[Arc<DatasetShard>]> {
        self.comm.check_rank(rank)?;
        Ok(&self.segments[rank])
    }

    /// Read the coordinates of `id` from its owner.
    pub fn fetch(&self, id: PointId) -> Result<Vec<f32>> {
        self.segments(id.owner)?
            .iter()
            .find_map(|segment| segment.position_of(id).map(|i| segment.point(i)))
            .ok_or_else(|| {
                LshError::remote_resource(
                    self.comm.rank(),
                    format!("point {} is not exposed by rank {}", id, id.owner),
                )
            })
    }

    /// Coordinates of every id, in input order.
    pub fn fetch_many(&self, ids: &[PointId]) -> Result<Vec<Vec<f32>>> {
        ids.iter().map(|&id| self.fetch(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Cluster;
    use crate::config::CommConfig;
    use crate::error::ErrorKind;

    fn dataset() -> Vec<Vec<f32>> {
        (0..10).map(|i| vec![i as f32, -(i as f32)]).collect()
    }

    #[test]
    fn test_fetch_remote_points() {
        let results = Cluster::run(3, &CommConfig::default(), |comm| {
            let data = dataset();
            let shard = Arc::new(DatasetShard::from_global(&comm, &data, MemoryLayout::Soa)?);
            let window = PointWindow::expose(&comm, shard)?;
            assert_eq!(window.total_points(), 10);

            // point 9 lives on rank 2 (blocks 0..4, 4..7, 7..10)
            let remote = window.fetch(PointId::new(9, 2))?;
            assert_eq!(remote, data[9]);
            let many = window.fetch_many(&[PointId::new(0, 0), PointId::new(5, 1)])?;
            assert_eq!(many, vec![data[0].clone(), data[5].clone()]);

            let err = window.fetch(PointId::new(9, 0)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::RemoteResourceFailure);
            Ok(())
        });
        for result in results {
            result.unwrap();
        }
    }

    #[test]
    fn test_extend_assigns_ids_after_existing() {
        let results = Cluster::run(2, &CommConfig::default(), |comm| {
            let shard = Arc::new(DatasetShard::from_global(&comm, &dataset(), MemoryLayout::Aos)?);
            let mut window = PointWindow::expose(&comm, shard)?;
            let extra = vec![vec![100.0 + comm.rank() as f32, 0.0]; comm.rank() + 1];
            let segment = window.extend(&extra, MemoryLayout::Aos)?;
            assert_eq!(window.total_points(), 13);

            let fetched = window.fetch(PointId::new(12, 1))?;
            Ok((segment.base(), fetched))
        });
        let (base0, fetched) = results[0].as_ref().unwrap();
        assert_eq!(*base0, 10);
        assert_eq!(fetched, &vec![101.0, 0.0]);
        assert_eq!(results[1].as_ref().unwrap().0, 11);
    }
}
