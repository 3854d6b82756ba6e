//! Rank handle and the shared transport behind it.

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::any::{type_name, Any};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::CommCode;
use crate::config::CommConfig;
use crate::error::{LshError, Result};
use crate::types::Rank;

/// Rank that reports on behalf of the cluster.
pub const MASTER_RANK: Rank = 0;

struct Deposit {
    op: &'static str,
    type_name: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

struct State {
    generation: u64,
    arrived: usize,
    deposits: Vec<Option<Deposit>>,
    /// Deposits of the most recently completed generation, in rank order.
    completed: Arc<Vec<Deposit>>,
    aborted: Option<(Rank, String)>,
}

/// Rendezvous point shared by all ranks of one cluster.
///
/// Every collective is an exchange: each rank deposits one value, the last
/// rank to arrive publishes all deposits and starts the next generation.
pub(crate) struct Transport {
    size: usize,
    timeout: Duration,
    state: Mutex<State>,
    cond: Condvar,
}

impl Transport {
    pub(crate) fn new(size: usize, config: &CommConfig) -> Self {
        Self {
            size,
            timeout: config.timeout,
            state: Mutex::new(State {
                generation: 0,
                arrived: 0,
                deposits: (0..size).map(|_| None).collect(),
                completed: Arc::new(Vec::new()),
                aborted: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn abort(&self, rank: Rank, reason: &str) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            warn!("[rank {}] aborting communicator: {}", rank, reason);
            state.aborted = Some((rank, reason.to_string()));
        }
        drop(state);
        self.cond.notify_all();
    }

    fn is_aborted(&self) -> bool {
        self.state.lock().aborted.is_some()
    }

    fn aborted_error(rank: Rank, origin: Rank, reason: &str, op: &str) -> LshError {
        LshError::communication(
            rank,
            CommCode::Aborted,
            format!("{} (aborted by rank {}: {})", op, origin, reason),
        )
    }

    fn exchange(&self, rank: Rank, deposit: Deposit) -> Result<Arc<Vec<Deposit>>> {
        let op = deposit.op;
        let mut state = self.state.lock();
        if let Some((origin, reason)) = &state.aborted {
            return Err(Self::aborted_error(rank, *origin, reason, op));
        }

        let generation = state.generation;
        state.deposits[rank] = Some(deposit);
        state.arrived += 1;
        trace!("[rank {}] {} arrived ({}/{})", rank, op, state.arrived, self.size);

        if state.arrived == self.size {
            let deposits: Vec<Deposit> = state.deposits.iter_mut().filter_map(Option::take).collect();
            state.completed = Arc::new(deposits);
            state.arrived = 0;
            state.generation += 1;
            let completed = Arc::clone(&state.completed);
            drop(state);
            self.cond.notify_all();
            return Ok(completed);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if state.generation != generation {
                return Ok(Arc::clone(&state.completed));
            }
            if let Some((origin, reason)) = &state.aborted {
                return Err(Self::aborted_error(rank, *origin, reason, op));
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.generation != generation {
                    return Ok(Arc::clone(&state.completed));
                }
                if state.aborted.is_none() {
                    let reason = format!("{} timed out after {:?}", op, self.timeout);
                    warn!("[rank {}] {}", rank, reason);
                    state.aborted = Some((rank, reason));
                }
                drop(state);
                self.cond.notify_all();
                return Err(LshError::communication(rank, CommCode::Timeout, op));
            }
        }
    }
}

/// One rank's handle on the cluster.
///
/// Cloning is cheap; clones refer to the same rank and transport.
#[derive(Clone)]
pub struct Communicator {
    rank: Rank,
    transport: Arc<Transport>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("size", &self.transport.size)
            .finish()
    }
}

impl Communicator {
    pub(crate) fn new(rank: Rank, transport: Arc<Transport>) -> Self {
        Self { rank, transport }
    }

    /// A communicator of a single-rank cluster.
    pub fn solo(config: &CommConfig) -> Self {
        Self::new(MASTER_RANK, Arc::new(Transport::new(1, config)))
    }

    /// This rank.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the cluster.
    #[inline]
    pub fn size(&self) -> usize {
        self.transport.size
    }

    /// True on the rank that reports for the cluster.
    #[inline]
    pub fn is_master(&self) -> bool {
        self.rank == MASTER_RANK
    }

    /// Upper bound of every collective wait.
    pub fn timeout(&self) -> Duration {
        self.transport.timeout
    }

    /// Fail with `InvalidRank` unless `rank` is part of the cluster.
    pub fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < self.size() {
            Ok(())
        } else {
            Err(LshError::communication(
                self.rank,
                CommCode::InvalidRank,
                format!("rank {} of {}", rank, self.size()),
            ))
        }
    }

    /// Gather one value from every rank, in rank order, on every rank.
    pub fn all_gather<T>(&self, value: T) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.exchange("all_gather", value)
    }

    /// Block until every rank has reached the barrier.
    pub fn barrier(&self) -> Result<()> {
        self.exchange("barrier", ()).map(|_| ())
    }

    /// Distribute the root's value to every rank.
    ///
    /// Non-root ranks pass `None`; the root must pass `Some`.
    pub fn broadcast<T>(&self, value: Option<T>, root: Rank) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.check_rank(root)?;
        let gathered = self.exchange("broadcast", value)?;
        gathered.into_iter().nth(root).flatten().ok_or_else(|| {
            LshError::communication(
                self.rank,
                CommCode::InvalidRoot,
                format!("broadcast root {} provided no value", root),
            )
        })
    }

    /// Combine one value per rank with `op`, in rank order, on every rank.
    pub fn all_reduce<T, F>(&self, value: T, op: F) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T, T) -> T,
    {
        let gathered = self.exchange("all_reduce", value)?;
        gathered.into_iter().reduce(op).ok_or_else(|| {
            LshError::communication(self.rank, CommCode::CollectiveMismatch, "all_reduce")
        })
    }

    /// Sum one count per rank.
    pub fn all_reduce_sum(&self, value: u64) -> Result<u64> {
        self.all_reduce(value, |a, b| a + b)
    }

    /// Gather one value per rank on `root`; other ranks receive `None`.
    pub fn gather<T>(&self, value: T, root: Rank) -> Result<Option<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.check_rank(root)?;
        let gathered = self.exchange("gather", value)?;
        Ok((self.rank == root).then_some(gathered))
    }

    /// Poison the communicator. Every rank blocked in, or later entering, a
    /// collective fails with a `CommunicationFailure`.
    pub fn abort(&self, reason: &str) {
        self.transport.abort(self.rank, reason);
    }

    /// True once any rank aborted or a collective timed out.
    pub fn is_aborted(&self) -> bool {
        self.transport.is_aborted()
    }

    fn exchange<T>(&self, op: &'static str, value: T) -> Result<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let deposit = Deposit {
            op,
            type_name: type_name::<T>(),
            payload: Box::new(value),
        };
        let completed = self.transport.exchange(self.rank, deposit)?;

        completed
            .iter()
            .enumerate()
            .map(|(rank, deposit)| {
                let value = if deposit.op == op {
                    deposit.payload.downcast_ref::<T>().cloned()
                } else {
                    None
                };
                value.ok_or_else(|| {
                    debug!(
                        "[rank {}] {}<{}> met {}<{}> from rank {}",
                        self.rank,
                        op,
                        type_name::<T>(),
                        deposit.op,
                        deposit.type_name,
                        rank
                    );
                    LshError::communication(
                        self.rank,
                        CommCode::CollectiveMismatch,
                        format!("{} with rank {}", op, rank),
                    )
                })
            })
            .collect()
    }
}
