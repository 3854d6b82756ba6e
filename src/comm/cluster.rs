//! In-process cluster launcher.

use log::{error, info};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use super::communicator::{Communicator, Transport};
use super::CommCode;
use crate::config::CommConfig;
use crate::error::{LshError, Result};
use crate::utils::panic_message;

/// Launches a fixed number of ranks, one thread each, on a shared transport.
pub struct Cluster;

impl Cluster {
    /// Run `f` on `size` ranks and collect every rank's result in rank order.
    ///
    /// A rank that panics aborts the communicator so that the remaining ranks
    /// fail their next collective instead of waiting for it.
    pub fn run<F, R>(size: usize, config: &CommConfig, f: F) -> Vec<Result<R>>
    where
        F: Fn(Communicator) -> Result<R> + Sync,
        R: Send,
    {
        assert!(size > 0, "cluster needs at least one rank");
        info!("launching cluster with {} ranks", size);

        let transport = Arc::new(Transport::new(size, config));
        let f = &f;

        thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm = Communicator::new(rank, Arc::clone(&transport));
                    scope.spawn(move || {
                        let guard = comm.clone();
                        match panic::catch_unwind(AssertUnwindSafe(|| f(comm))) {
                            Ok(result) => result,
                            Err(payload) => {
                                let msg = panic_message(payload.as_ref());
                                error!("[rank {}] panicked: {}", rank, msg);
                                guard.abort(&format!("rank {} panicked: {}", rank, msg));
                                Err(LshError::communication(rank, CommCode::Aborted, msg))
                            }
                        }
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(LshError::communication(rank, CommCode::Aborted, "rank thread lost"))
                    })
                })
                .collect()
        })
    }
}
