//! One-sided distributed bucket storage.
//!
//! A [`DistributedMemoryRegion`] spreads the buckets of one hash table over
//! all ranks. The owner of a hash value is `hash % size` and its slot on that
//! rank is `hash / size`, so any rank can locate any bucket without a
//! directory lookup.
//!
//! Access follows an epoch protocol: ranks collectively open an epoch,
//! read or write buckets, and collectively fence or close it. Remote writes
//! are queued at the target and only become visible at the next fence. Local
//! writes and snapshot reads of the same bucket are serialized by a per-bucket
//! lock.

use crossbeam::queue::SegQueue;
use log::{debug, trace};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::comm::{CommCode, Communicator};
use crate::error::{LshError, Result};
use crate::types::{HashValue, PointId, Rank};

/// Access mode of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochMode {
    /// Only reads are permitted.
    ReadOnly,
    /// Reads, local inserts and remote inserts are permitted.
    ReadWrite,
}

const EPOCH_CLOSED: u8 = 0;
const EPOCH_READ_ONLY: u8 = 1;
const EPOCH_READ_WRITE: u8 = 2;

impl EpochMode {
    fn encode(self) -> u8 {
        match self {
            EpochMode::ReadOnly => EPOCH_READ_ONLY,
            EpochMode::ReadWrite => EPOCH_READ_WRITE,
        }
    }
}

/// Snapshot of the ids stored under one hash value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    ids: Vec<PointId>,
}

impl Bucket {
    pub fn new(ids: Vec<PointId>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[PointId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn into_ids(self) -> Vec<PointId> {
        self.ids
    }
}

struct RankWindow {
    buckets: Vec<RwLock<Vec<PointId>>>,
    /// Remote writes targeting this rank, applied at the next fence.
    pending: SegQueue<(usize, PointId)>,
}

impl RankWindow {
    fn new(slots: usize) -> Self {
        Self {
            buckets: (0..slots).map(|_| RwLock::new(Vec::new())).collect(),
            pending: SegQueue::new(),
        }
    }
}

struct Window {
    name: String,
    slots_per_rank: usize,
    ranks: Vec<RankWindow>,
    freed: AtomicBool,
}

/// Per-rank handle on a distributed bucket array.
///
/// Clones share the rank's epoch state.
#[derive(Clone)]
pub struct DistributedMemoryRegion {
    comm: Communicator,
    window: Arc<Window>,
    epoch: Arc<AtomicU8>,
}

impl DistributedMemoryRegion {
    /// Allocate a region for hash values in `[0, hash_table_size)`. Collective.
    pub fn create(comm: &Communicator, name: &str, hash_table_size: u32) -> Result<Self> {
        let size = comm.size();
        let slots_per_rank = (hash_table_size as usize).div_ceil(size);

        let window = comm.is_master().then(|| {
            Arc::new(Window {
                name: name.to_string(),
                slots_per_rank,
                ranks: (0..size).map(|_| RankWindow::new(slots_per_rank)).collect(),
                freed: AtomicBool::new(false),
            })
        });
        let window = comm.broadcast(window, 0)?;
        if window.name != name || window.slots_per_rank != slots_per_rank {
            return Err(LshError::communication(
                comm.rank(),
                CommCode::CollectiveMismatch,
                format!("region '{}' created as '{}'", name, window.name),
            ));
        }

        debug!(
            "[rank {}] region '{}' with {} slots per rank",
            comm.rank(),
            name,
            slots_per_rank
        );
        Ok(Self {
            comm: comm.clone(),
            window,
            epoch: Arc::new(AtomicU8::new(EPOCH_CLOSED)),
        })
    }

    /// Region metadata. Fails once the region has been freed.
    pub fn name(&self) -> Result<&str> {
        self.check_alive()?;
        Ok(&self.window.name)
    }

    pub fn slots_per_rank(&self) -> usize {
        self.window.slots_per_rank
    }

    /// Rank owning the bucket of `hash`.
    #[inline]
    pub fn owner_rank(&self, hash: HashValue) -> Rank {
        hash as usize % self.comm.size()
    }

    #[inline]
    fn slot(&self, hash: HashValue) -> Result<usize> {
        let slot = hash as usize / self.comm.size();
        if slot >= self.window.slots_per_rank {
            return Err(LshError::invalid_argument(format!(
                "hash {} outside region '{}' of {} slots per rank",
                hash, self.window.name, self.window.slots_per_rank
            )));
        }
        Ok(slot)
    }

    fn check_alive(&self) -> Result<()> {
        if self.window.freed.load(Ordering::Acquire) {
            Err(LshError::remote_resource(
                self.comm.rank(),
                format!("{}: region '{}' has been freed", CommCode::InvalidWindow, self.window.name),
            ))
        } else {
            Ok(())
        }
    }

    fn mode(&self) -> Option<EpochMode> {
        match self.epoch.load(Ordering::Acquire) {
            EPOCH_READ_ONLY => Some(EpochMode::ReadOnly),
            EPOCH_READ_WRITE => Some(EpochMode::ReadWrite),
            _ => None,
        }
    }

    fn require_epoch(&self, op: &str, write: bool) -> Result<()> {
        self.check_alive()?;
        match self.mode() {
            None => Err(LshError::usage(format!("{} outside of an access epoch", op)).with_rank(self.comm.rank())),
            Some(EpochMode::ReadOnly) if write => Err(LshError::usage(format!(
                "{} inside a read-only epoch",
                op
            ))
            .with_rank(self.comm.rank())),
            Some(_) => Ok(()),
        }
    }

    fn require_owner(&self, op: &str, rank: Rank, hash: HashValue) -> Result<()> {
        self.comm.check_rank(rank)?;
        let owner = self.owner_rank(hash);
        if owner != rank {
            return Err(LshError::usage(format!(
                "{}: hash {} belongs to rank {}, not rank {}",
                op, hash, owner, rank
            ))
            .with_rank(self.comm.rank()));
        }
        Ok(())
    }

    /// Open an access epoch on every rank. Collective.
    pub fn open_epoch(&self, mode: EpochMode) -> Result<Epoch> {
        self.check_alive()?;
        if let Some(open) = self.mode() {
            return Err(LshError::usage(format!("epoch already open ({:?})", open)).with_rank(self.comm.rank()));
        }
        self.comm.barrier()?;
        self.epoch.store(mode.encode(), Ordering::Release);
        trace!("[rank {}] opened {:?} epoch on '{}'", self.comm.rank(), mode, self.window.name);
        Ok(Epoch {
            region: self.clone(),
            mode,
            closed: false,
        })
    }

    /// Insert into a bucket this rank owns. Visible immediately.
    pub fn local_insert(&self, hash: HashValue, id: PointId) -> Result<()> {
        self.require_epoch("local_insert", true)?;
        self.require_owner("local_insert", self.comm.rank(), hash)?;
        let slot = self.slot(hash)?;
        self.window.ranks[self.comm.rank()].buckets[slot].write().push(id);
        Ok(())
    }

    /// One-sided insert into a bucket owned by `rank`. Visible after the next fence.
    pub fn remote_insert(&self, rank: Rank, hash: HashValue, id: PointId) -> Result<()> {
        self.require_epoch("remote_insert", true)?;
        self.require_owner("remote_insert", rank, hash)?;
        let slot = self.slot(hash)?;
        self.window.ranks[rank].pending.push((slot, id));
        Ok(())
    }

    /// One-sided read of a consistent snapshot of a bucket owned by `rank`.
    pub fn remote_read(&self, rank: Rank, hash: HashValue) -> Result<Bucket> {
        self.require_epoch("remote_read", false)?;
        self.require_owner("remote_read", rank, hash)?;
        let slot = self.slot(hash)?;
        Ok(Bucket::new(self.window.ranks[rank].buckets[slot].read().clone()))
    }

    /// Read a bucket this rank owns.
    pub fn local_read(&self, hash: HashValue) -> Result<Bucket> {
        self.remote_read(self.comm.rank(), hash)
    }

    /// Sizes of all of this rank's buckets, by slot.
    pub fn local_bucket_sizes(&self) -> Result<Vec<usize>> {
        self.check_alive()?;
        Ok(self.window.ranks[self.comm.rank()]
            .buckets
            .iter()
            .map(|b| b.read().len())
            .collect())
    }

    fn fence(&self) -> Result<()> {
        self.comm.barrier()?;
        let own = &self.window.ranks[self.comm.rank()];
        let mut applied = 0usize;
        while let Some((slot, id)) = own.pending.pop() {
            own.buckets[slot].write().push(id);
            applied += 1;
        }
        trace!("[rank {}] fence applied {} remote writes", self.comm.rank(), applied);
        self.comm.barrier()
    }

    /// Release the region on every rank. Collective.
    pub fn free(&self) -> Result<()> {
        self.check_alive()?;
        self.comm.barrier()?;
        self.window.freed.store(true, Ordering::Release);
        for bucket in &self.window.ranks[self.comm.rank()].buckets {
            let mut ids = bucket.write();
            ids.clear();
            ids.shrink_to_fit();
        }
        self.epoch.store(EPOCH_CLOSED, Ordering::Release);
        debug!("[rank {}] freed region '{}'", self.comm.rank(), self.window.name);
        Ok(())
    }
}

/// Scoped access epoch.
///
/// Dropping an epoch without [`Epoch::close`] ends it on this rank only.
pub struct Epoch {
    region: DistributedMemoryRegion,
    mode: EpochMode,
    closed: bool,
}

impl Epoch {
    pub fn mode(&self) -> EpochMode {
        self.mode
    }

    /// Publish all pending remote writes. Collective.
    pub fn fence(&self) -> Result<()> {
        self.region.require_epoch("fence", false)?;
        self.region.fence()
    }

    /// Fence, then end the epoch on every rank. Collective.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        let result = self.fence();
        self.region.epoch.store(EPOCH_CLOSED, Ordering::Release);
        result
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Epoch")
            .field("region", &self.region.window.name)
            .field("rank", &self.region.comm.rank())
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        if !self.closed {
            debug!(
                "[rank {}] {:?} epoch on '{}' dropped without close",
                self.region.comm.rank(),
                self.mode,
                self.region.window.name
            );
            self.region.epoch.store(EPOCH_CLOSED, Ordering::Release);
        }
    }
}
