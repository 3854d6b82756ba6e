//! Core type definitions shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a participant in the cluster.
pub type Rank = usize;

/// A single reduced hash value of one table.
pub type HashValue = u32;

/// Dataset-wide identifier of a point together with the rank that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PointId {
    /// Index of the point in the whole dataset.
    pub global: u64,
    /// Rank whose shard holds the point.
    pub owner: Rank,
}

impl PointId {
    pub fn new(global: u64, owner: Rank) -> Self {
        Self { global, owner }
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.global, self.owner)
    }
}

/// One hash value per table for a single point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(pub Vec<HashValue>);

impl Signature {
    pub fn new(values: Vec<HashValue>) -> Self {
        Self(values)
    }

    /// Number of tables covered.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hash value of table `table`.
    #[inline]
    pub fn get(&self, table: usize) -> HashValue {
        self.0[table]
    }

    pub fn values(&self) -> &[HashValue] {
        &self.0
    }
}

/// A query result: a point and its exact distance to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: PointId,
    pub distance: f32,
}

impl Neighbor {
    pub fn new(id: PointId, distance: f32) -> Self {
        Self { id, distance }
    }
}
