//! Distributed LSH hash tables.
//!
//! [`DistributedHashTable::build`] is a collective: every rank hashes its
//! shard on the device, inserts each (point, table) pair into the bucket's
//! owner rank (locally or through a one-sided remote insert) and fences. Only
//! after the fence completes on all ranks is the table returned, opened for
//! one-sided reads. Any failure on any rank aborts the communicator so that
//! the remaining ranks fail instead of waiting.

use dashmap::DashSet;
use log::{debug, info};
use std::sync::Arc;

use crate::comm::Communicator;
use crate::compute::ComputeEngine;
use crate::config::LshConfig;
use crate::data::{DatasetShard, PointSource};
use crate::error::{LshError, Result};
use crate::hash_functions::{HashFunctions, LshHash};
use crate::index::{LinearIndexMapper, TableSlot};
use crate::logger::{RankLogger, Timer};
use crate::region::{Bucket, DistributedMemoryRegion, Epoch, EpochMode};
use crate::types::{HashValue, PointId, Signature};
use crate::utils::try_parallel_range;

/// Lifecycle of a table on one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Build or incremental insert in progress.
    Building,
    /// Open for queries.
    Ready,
    /// Regions released.
    Closed,
}

/// Deduplicated candidate ids of one query.
#[derive(Debug, Default)]
pub struct CandidateSet {
    ids: DashSet<PointId>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `id` was not present yet.
    pub fn insert(&self, id: PointId) -> bool {
        self.ids.insert(id)
    }

    pub fn extend(&self, ids: &[PointId]) {
        for &id in ids {
            self.ids.insert(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// All candidates in ascending id order.
    pub fn into_sorted_vec(self) -> Vec<PointId> {
        let mut ids: Vec<PointId> = self.ids.into_iter().collect();
        ids.sort_unstable();
        ids
    }
}

/// Local bucket occupancy of every table.
#[derive(Debug, Clone)]
pub struct BucketStats {
    mapper: TableSlot,
    sizes: Vec<usize>,
}

impl BucketStats {
    /// Number of ids in the bucket at `slot` of `table` on this rank.
    pub fn bucket_size(&self, table: usize, slot: usize) -> usize {
        self.sizes[self.mapper.flatten((table, slot))]
    }

    fn table(&self, table: usize) -> &[usize] {
        let (_, slots) = self.mapper.extents();
        let start = self.mapper.flatten((table, 0));
        &self.sizes[start..start + slots]
    }

    /// Ids stored in `table` on this rank.
    pub fn points(&self, table: usize) -> usize {
        self.table(table).iter().sum()
    }

    pub fn non_empty_buckets(&self, table: usize) -> usize {
        self.table(table).iter().filter(|&&s| s > 0).count()
    }

    pub fn max_bucket_size(&self, table: usize) -> usize {
        self.table(table).iter().copied().max().unwrap_or(0)
    }
}

/// L hash tables whose buckets are spread over all ranks.
pub struct DistributedHashTable {
    comm: Communicator,
    config: LshConfig,
    family: Arc<HashFunctions>,
    regions: Vec<DistributedMemoryRegion>,
    read_epochs: Vec<Epoch>,
    state: TableState,
}

impl DistributedHashTable {
    /// Build the tables over every rank's shard. Collective.
    ///
    /// All ranks must pass the same configuration; a mismatch is reported as
    /// a usage error on every rank.
    pub fn build(
        comm: &Communicator,
        engine: &ComputeEngine,
        shard: &DatasetShard,
        config: &LshConfig,
    ) -> Result<Self> {
        Self::build_inner(comm, engine, shard, config).map_err(|err| {
            comm.abort(&format!("hash table build failed: {}", err));
            err
        })
    }

    fn build_inner(
        comm: &Communicator,
        engine: &ComputeEngine,
        shard: &DatasetShard,
        config: &LshConfig,
    ) -> Result<Self> {
        let logger = RankLogger::new(comm);
        let timer = Timer::blocking(comm)?;
        config.validate()?;

        let dims = shard.dims();
        let description = format!("{:?} dims={}", config, dims);
        let descriptions = comm.all_gather(description.clone())?;
        if let Some(rank) = descriptions.iter().position(|d| *d != description) {
            return Err(LshError::usage(format!(
                "rank {} builds with a different configuration than rank {}",
                rank,
                comm.rank()
            ))
            .with_rank(comm.rank()));
        }

        let family = Arc::new(HashFunctions::create(config, dims, comm, engine, shard)?);
        let fingerprints = comm.all_gather(family.fingerprint())?;
        if fingerprints.iter().any(|&f| f != fingerprints[0]) {
            return Err(LshError::usage("hash function parameters differ between ranks").with_rank(comm.rank()));
        }
        logger.log_on_master(&format!("Created {} hash functions in {:?}.", family.kind(), timer.elapsed()));

        let regions = (0..config.num_hash_tables)
            .map(|t| DistributedMemoryRegion::create(comm, &format!("hash_table_{}", t), config.hash_table_size))
            .collect::<Result<Vec<_>>>()?;

        let mut table = Self {
            comm: comm.clone(),
            config: config.clone(),
            family,
            regions,
            read_epochs: Vec::new(),
            state: TableState::Building,
        };
        table.populate(engine, shard)?;
        table.open_for_reads()?;

        logger.log_on_master(&format!(
            "Created {} hash tables in {:?}.",
            config.num_hash_tables,
            timer.average_elapsed(comm)?
        ));
        Ok(table)
    }

    /// Hash `points` and insert them into their owners' buckets.
    fn populate(&self, engine: &ComputeEngine, points: &DatasetShard) -> Result<()> {
        let signatures = engine.compute_signatures_batch(points, &self.family)?;
        let epochs = self
            .regions
            .iter()
            .map(|r| r.open_epoch(EpochMode::ReadWrite))
            .collect::<Result<Vec<_>>>()?;

        let me = self.comm.rank();
        let mut remote = 0usize;
        for (i, signature) in signatures.iter().enumerate() {
            let id = points.id(i);
            for (region, &hash) in self.regions.iter().zip(signature.values()) {
                let owner = region.owner_rank(hash);
                if owner == me {
                    region.local_insert(hash, id)?;
                } else {
                    region.remote_insert(owner, hash, id)?;
                    remote += 1;
                }
            }
        }
        debug!(
            "[rank {}] inserted {} points, {} remote inserts",
            me,
            points.len(),
            remote
        );

        for epoch in epochs {
            epoch.close()?;
        }
        Ok(())
    }

    fn open_for_reads(&mut self) -> Result<()> {
        self.read_epochs = self
            .regions
            .iter()
            .map(|r| r.open_epoch(EpochMode::ReadOnly))
            .collect::<Result<Vec<_>>>()?;
        self.state = TableState::Ready;
        Ok(())
    }

    fn close_reads(&mut self) -> Result<()> {
        self.state = TableState::Building;
        for epoch in self.read_epochs.drain(..) {
            epoch.close()?;
        }
        Ok(())
    }

    /// Add `points` to the tables. Collective; every rank passes its own new points.
    pub fn insert(&mut self, engine: &ComputeEngine, points: &DatasetShard) -> Result<()> {
        let result = self.require_ready("insert").and_then(|()| self.reinsert(engine, points));
        result.map_err(|err| self.abort_with("insert", err))
    }

    /// Abort the communicator so peers blocked in a collective fail fast.
    fn abort_with(&self, op: &str, err: LshError) -> LshError {
        self.comm.abort(&format!("hash table {} failed: {}", op, err));
        err
    }

    fn reinsert(&mut self, engine: &ComputeEngine, points: &DatasetShard) -> Result<()> {
        self.close_reads()?;
        self.populate(engine, points)?;
        self.open_for_reads()
    }

    fn require_ready(&self, op: &str) -> Result<()> {
        match self.state {
            TableState::Ready => Ok(()),
            state => Err(LshError::usage(format!("{} on a {:?} hash table", op, state)).with_rank(self.comm.rank())),
        }
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn config(&self) -> &LshConfig {
        &self.config
    }

    pub fn family(&self) -> &Arc<HashFunctions> {
        &self.family
    }

    pub fn comm(&self) -> &Communicator {
        &self.comm
    }

    pub fn num_tables(&self) -> usize {
        self.regions.len()
    }

    /// Owner rank of `hash` in `table`.
    pub fn owner_rank(&self, table: usize, hash: HashValue) -> usize {
        self.regions[table].owner_rank(hash)
    }

    /// Read the bucket of `hash` in `table` from its owner.
    pub fn read_bucket(&self, table: usize, hash: HashValue) -> Result<Bucket> {
        self.require_ready("read_bucket")?;
        let region = self.regions.get(table).ok_or_else(|| {
            LshError::invalid_argument(format!("table {} of {}", table, self.regions.len()))
        })?;
        let owner = region.owner_rank(hash);
        if owner == self.comm.rank() {
            region.local_read(hash)
        } else {
            region.remote_read(owner, hash)
        }
    }

    /// Union of the buckets `signature` selects in every table, probed concurrently.
    pub fn gather_candidates(&self, signature: &Signature) -> Result<CandidateSet> {
        self.require_ready("gather_candidates")?;
        if signature.len() != self.num_tables() {
            return Err(LshError::invalid_argument(format!(
                "signature covers {} tables, expected {}",
                signature.len(),
                self.num_tables()
            )));
        }

        let candidates = CandidateSet::new();
        try_parallel_range(self.num_tables(), |t| {
            let bucket = self.read_bucket(t, signature.get(t))?;
            candidates.extend(bucket.ids());
            Ok::<_, LshError>(())
        })?;
        Ok(candidates)
    }

    /// Local occupancy of every table.
    pub fn bucket_stats(&self) -> Result<BucketStats> {
        let slots = self.regions.first().map_or(0, |r| r.slots_per_rank());
        let mapper = TableSlot::new(self.regions.len(), slots);
        let mut sizes = Vec::with_capacity(mapper.size());
        for region in &self.regions {
            sizes.extend(region.local_bucket_sizes()?);
        }
        Ok(BucketStats { mapper, sizes })
    }

    /// Number of ids stored in `table` over all ranks. Collective.
    pub fn total_points(&self, table: usize) -> Result<u64> {
        if table >= self.num_tables() {
            return Err(LshError::invalid_argument(format!("table {} of {}", table, self.num_tables())));
        }
        let local = self.bucket_stats()?.points(table) as u64;
        self.comm.all_reduce_sum(local)
    }

    /// End all epochs and release the regions. Collective.
    pub fn close(&mut self) -> Result<()> {
        let result = self.require_ready("close").and_then(|()| self.release());
        result.map_err(|err| self.abort_with("close", err))?;
        self.state = TableState::Closed;
        info!("[rank {}] closed hash tables", self.comm.rank());
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.close_reads()?;
        for region in &self.regions {
            region.free()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Cluster;
    use crate::config::{CommConfig, ComputeConfig, MemoryLayout};
    use crate::error::ErrorKind;
    use crate::utils::random_points;

    fn build(comm: &Communicator, data: &[Vec<f32>], config: &LshConfig) -> Result<DistributedHashTable> {
        let engine = ComputeEngine::new(comm.rank(), &ComputeConfig::default(), config.metric)?;
        let shard = DatasetShard::from_global(comm, data, config.memory_layout)?;
        DistributedHashTable::build(comm, &engine, &shard, config)
    }

    #[test]
    fn test_single_rank_build() {
        let comm = Communicator::solo(&CommConfig::default());
        let data = random_points(50, 4, 1);
        let config = LshConfig::new().with_num_hash_tables(3).with_hash_table_size(97);
        let table = build(&comm, &data, &config).unwrap();

        assert_eq!(table.state(), TableState::Ready);
        let stats = table.bucket_stats().unwrap();
        for t in 0..3 {
            assert_eq!(stats.points(t), 50);
            assert_eq!(table.total_points(t).unwrap(), 50);
            assert!(stats.max_bucket_size(t) >= 1);
        }

        // every point is found in its own buckets
        for (i, point) in data.iter().enumerate() {
            let signature = table.family().compute_signature(point).unwrap();
            let candidates = table.gather_candidates(&signature).unwrap();
            assert!(candidates.into_sorted_vec().contains(&PointId::new(i as u64, 0)));
        }
    }

    #[test]
    fn test_distributed_build_is_complete() {
        let data = random_points(300, 6, 2);
        let config = LshConfig::new()
            .with_num_hash_tables(2)
            .with_hash_table_size(31)
            .with_memory_layout(MemoryLayout::Soa);
        let results = Cluster::run(3, &CommConfig::default(), |comm| {
            let table = build(&comm, &data, &config)?;
            Ok((table.total_points(0)?, table.total_points(1)?, table.bucket_stats()?.points(0)))
        });
        let mut local_sum = 0;
        for result in results {
            let (t0, t1, local) = result.unwrap();
            assert_eq!((t0, t1), (300, 300));
            local_sum += local;
        }
        assert_eq!(local_sum, 300);
    }

    #[test]
    fn test_config_mismatch_is_usage_error() {
        let data = random_points(20, 3, 3);
        let results = Cluster::run(2, &CommConfig::default(), |comm| {
            let config = LshConfig::new().with_num_hash_tables(1 + comm.rank());
            build(&comm, &data, &config).map(|_| ())
        });
        for result in results {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::UsageError);
        }
    }

    #[test]
    fn test_close_then_query_fails() {
        let comm = Communicator::solo(&CommConfig::default());
        let data = random_points(10, 2, 4);
        let mut table = build(&comm, &data, &LshConfig::default()).unwrap();
        let signature = table.family().compute_signature(&data[0]).unwrap();
        table.close().unwrap();

        assert_eq!(table.state(), TableState::Closed);
        let err = table.gather_candidates(&signature).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
    }

    #[test]
    fn test_insert_on_unready_rank_aborts_peers() {
        let data = random_points(40, 3, 6);
        let config = LshConfig::new().with_num_hash_tables(2);
        let started = std::time::Instant::now();
        let results = Cluster::run(2, &CommConfig::default(), |comm| {
            let engine = ComputeEngine::new(comm.rank(), &ComputeConfig::default(), config.metric)?;
            let shard = DatasetShard::from_global(&comm, &data, config.memory_layout)?;
            let mut table = DistributedHashTable::build(&comm, &engine, &shard, &config)?;
            if comm.rank() == 1 {
                table.state = TableState::Closed;
            }
            let err = table.insert(&engine, &shard).unwrap_err();
            assert!(comm.is_aborted());
            Ok(err.kind())
        });

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(results[0].as_ref().unwrap(), &ErrorKind::CommunicationFailure);
        assert_eq!(results[1].as_ref().unwrap(), &ErrorKind::UsageError);
    }

    #[test]
    fn test_second_close_aborts() {
        let comm = Communicator::solo(&CommConfig::default());
        let mut table = build(&comm, &random_points(10, 2, 7), &LshConfig::default()).unwrap();
        table.close().unwrap();
        assert!(!comm.is_aborted());

        let err = table.close().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UsageError);
        assert!(comm.is_aborted());
        assert_eq!(table.state(), TableState::Closed);
    }

    #[test]
    fn test_signature_length_checked() {
        let comm = Communicator::solo(&CommConfig::default());
        let table = build(&comm, &random_points(5, 2, 5), &LshConfig::default()).unwrap();
        let err = table.gather_candidates(&Signature::new(vec![1])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_candidate_set_dedup() {
        let set = CandidateSet::new();
        assert!(set.insert(PointId::new(3, 0)));
        assert!(!set.insert(PointId::new(3, 0)));
        set.extend(&[PointId::new(1, 1), PointId::new(3, 0)]);
        assert_eq!(set.into_sorted_vec(), vec![PointId::new(1, 1), PointId::new(3, 0)]);
    }
}
