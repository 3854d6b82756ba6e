//! Cluster communication.
//!
//! A cluster is a fixed set of ranks sharing one transport. Ranks talk to each
//! other only through a [`Communicator`]: collectives (barrier, broadcast,
//! all-gather, all-reduce) and the one-sided windows built on top of them in
//! [`crate::region`]. Every collective wait is bounded by
//! [`crate::config::CommConfig::timeout`]; a timeout or an explicit
//! [`Communicator::abort`] poisons the transport so that every rank fails
//! consistently instead of hanging.

mod cluster;
mod communicator;

pub use cluster::Cluster;
pub use communicator::{Communicator, MASTER_RANK};

use std::fmt;

/// Error codes reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommCode {
    /// No error.
    Success,
    /// A collective did not complete within the configured timeout.
    Timeout,
    /// The communicator was aborted by some rank.
    Aborted,
    /// A rank argument was outside `[0, size)`.
    InvalidRank,
    /// Ranks entered different collectives, or with different payload types.
    CollectiveMismatch,
    /// A memory window was used after it was freed or with a bad layout.
    InvalidWindow,
    /// A collective was called with an argument missing on the root.
    InvalidRoot,
}

impl CommCode {
    /// Human readable description of the code.
    pub fn error_string(&self) -> &'static str {
        match self {
            CommCode::Success => "No error",
            CommCode::Timeout => "Collective operation timed out",
            CommCode::Aborted => "Communicator has been aborted",
            CommCode::InvalidRank => "Invalid rank",
            CommCode::CollectiveMismatch => "Ranks disagree on the collective operation",
            CommCode::InvalidWindow => "Invalid window",
            CommCode::InvalidRoot => "Invalid root",
        }
    }
}

impl fmt::Display for CommCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error_string())
    }
}
