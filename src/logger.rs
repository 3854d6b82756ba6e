//! Rank-aware logging and phase timing.
//!
//! [`RankLogger`] forwards to the `log` facade and decides per call which
//! rank emits the record, so a cluster of N ranks does not print every
//! message N times. It is built explicitly from a communicator.

use log::info;
use std::time::{Duration, Instant};

use crate::comm::Communicator;
use crate::error::Result;
use crate::types::Rank;

/// Log target of every record emitted through a [`RankLogger`].
pub const LOG_TARGET: &str = "dist_lsh::rank";

/// Diagnostic sink that knows which rank it runs on.
#[derive(Debug, Clone)]
pub struct RankLogger {
    comm: Communicator,
}

impl RankLogger {
    pub fn new(comm: &Communicator) -> Self {
        Self { comm: comm.clone() }
    }

    /// Emit `msg` only if this is rank `rank`. Returns whether it was emitted.
    pub fn log(&self, rank: Rank, msg: &str) -> bool {
        if rank == self.comm.rank() {
            info!(target: LOG_TARGET, "[rank {}] {}", rank, msg);
            true
        } else {
            false
        }
    }

    /// Emit `msg` on the master rank only.
    pub fn log_on_master(&self, msg: &str) -> bool {
        self.log(0, msg)
    }

    /// Collect one message from every rank and emit them together on the master.
    ///
    /// Collective. Returns the combined text on the master, `None` elsewhere.
    pub fn log_on_all(&self, msg: &str) -> Result<Option<String>> {
        let gathered = self.comm.gather(msg.to_string(), 0)?;
        Ok(gathered.map(|messages| {
            let combined = messages
                .iter()
                .enumerate()
                .map(|(rank, m)| format!("[rank {}] {}", rank, m))
                .collect::<Vec<_>>()
                .join("\n");
            info!(target: LOG_TARGET, "\n{}", combined);
            combined
        }))
    }
}

/// Measures the duration of a phase.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Start after all ranks reached a barrier.
    pub fn blocking(comm: &Communicator) -> Result<Self> {
        comm.barrier()?;
        Ok(Self::start())
    }

    pub fn restart(&mut self) {
        self.start = Instant::now();
    }

    /// Time since start on this rank.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Mean elapsed time over all ranks. Collective.
    pub fn average_elapsed(&self, comm: &Communicator) -> Result<Duration> {
        let micros = self.elapsed().as_micros() as u64;
        let total = comm.all_reduce_sum(micros)?;
        Ok(Duration::from_micros(total / comm.size() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Cluster;
    use crate::config::CommConfig;

    #[test]
    fn test_log_filters_by_rank() {
        let results = Cluster::run(3, &CommConfig::default(), |comm| {
            let logger = RankLogger::new(&comm);
            Ok((logger.log(1, "only rank one"), logger.log_on_master("master")))
        });
        let flags: Vec<(bool, bool)> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(flags, vec![(false, true), (true, false), (false, false)]);
    }

    #[test]
    fn test_log_on_all_combines_on_master() {
        let results = Cluster::run(2, &CommConfig::default(), |comm| {
            RankLogger::new(&comm).log_on_all(&format!("{} points", comm.rank() * 5))
        });
        let master = results[0].as_ref().unwrap().as_ref().unwrap();
        assert_eq!(master, "[rank 0] 0 points\n[rank 1] 5 points");
        assert!(results[1].as_ref().unwrap().is_none());
    }

    #[test]
    fn test_timer() {
        let comm = Communicator::solo(&CommConfig::default());
        let mut timer = Timer::blocking(&comm).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        assert!(timer.average_elapsed(&comm).unwrap() >= Duration::from_millis(5));
        timer.restart();
        assert!(timer.elapsed() < Duration::from_secs(5));
    }
}
