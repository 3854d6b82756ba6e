//! # dist-lsh - Distributed Locality-Sensitive Hashing
//!
//! Approximate nearest-neighbor search over a dataset sharded across the
//! ranks of a cluster.
//!
//! ## Overview
//!
//! - **Hash families**: random projections and entropy-based interval hashing,
//!   K functions per table drawn from a shared pool
//! - **Distributed hash tables**: L tables whose buckets are partitioned
//!   across ranks and filled with fenced one-sided writes
//! - **Compute engine**: batched signature and distance kernels on a
//!   per-rank thread pool with aggregated failure reporting
//! - **Queries**: candidate union over all tables, optional multi-probe of
//!   neighboring buckets, exact refinement
//!
//! ## Quick Start
//!
//! ```rust
//! use dist_lsh::prelude::*;
//! use std::sync::Arc;
//!
//! let data = dist_lsh::utils::random_points(200, 8, 7);
//! let config = LshConfig::new().with_num_hash_tables(3).with_seed(42);
//!
//! let results = Cluster::run(2, &CommConfig::default(), |comm| {
//!     let engine = ComputeEngine::new(comm.rank(), &ComputeConfig::default(), config.metric)?;
//!     let shard = Arc::new(DatasetShard::from_global(&comm, &data, config.memory_layout)?);
//!     let table = DistributedHashTable::build(&comm, &engine, &shard, &config)?;
//!     let window = PointWindow::expose(&comm, shard)?;
//!
//!     let queries = QueryEngine::new(&table, &engine, &window);
//!     queries.query(&data[5], 3, true)
//! });
//!
//! for neighbors in results {
//!     let neighbors = neighbors.unwrap();
//!     assert_eq!(neighbors[0].id.global, 5);
//!     assert_eq!(neighbors[0].distance, 0.0);
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`comm`]: communicator, collectives and the in-process cluster
//! - [`compute`]: device engine and SIMD kernels
//! - [`config`]: table, compute and communication configuration
//! - [`data`]: dataset shards and the distributed point window
//! - [`hash_functions`]: LSH families
//! - [`hash_table`]: distributed hash tables
//! - [`index`]: linear index mappers for flat buffers
//! - [`logger`]: rank-aware logging and timers
//! - [`query`]: nearest-neighbor queries
//! - [`region`]: one-sided bucket regions with epochs

#![allow(clippy::manual_div_ceil)]
#![allow(clippy::module_inception)]

pub mod comm;
pub mod compute;
pub mod config;
pub mod data;
pub mod hash_functions;
pub mod hash_table;
pub mod index;
pub mod logger;
pub mod query;
pub mod region;
pub mod utils;

mod error;
mod types;

pub use error::{ErrorKind, LshError, Result};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::comm::{Cluster, CommCode, Communicator, MASTER_RANK};
    pub use crate::compute::{ComputeEngine, DeviceInfo};
    pub use crate::config::{
        CommConfig, ComputeConfig, HashFamilyKind, LshConfig, MemoryLayout, Metric,
    };
    pub use crate::data::{block_range, DatasetShard, PointSource, PointWindow};
    pub use crate::error::{ErrorKind, LshError, Result};
    pub use crate::hash_functions::{EntropyBased, HashFunctions, LshHash, RandomProjections};
    pub use crate::hash_table::{BucketStats, CandidateSet, DistributedHashTable, TableState};
    pub use crate::index::{Aos, LinearIndexMapper, Soa};
    pub use crate::logger::{RankLogger, Timer};
    pub use crate::query::{QueryEngine, QueryState, QueryStats};
    pub use crate::region::{Bucket, DistributedMemoryRegion, Epoch, EpochMode};
    pub use crate::types::*;
}
