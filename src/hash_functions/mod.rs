//! LSH hash function families.
//!
//! A family holds, for each of the L tables, K hash functions drawn from a
//! shared pool. The K function values of a table are folded with
//! [`hash_combine`] and reduced modulo the table size into one hash value.
//!
//! Available families:
//! - [`RandomProjections`]: `floor((a . x + b) / w)`
//! - [`EntropyBased`]: interval index of `a . x` among collectively
//!   estimated cut-off points

mod entropy_based;
mod random_projections;

pub use entropy_based::EntropyBased;
pub use random_projections::RandomProjections;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::comm::Communicator;
use crate::compute::{kernels, ComputeEngine};
use crate::config::{HashFamilyKind, LshConfig, MemoryLayout};
use crate::data::DatasetShard;
use crate::error::{LshError, Result};
use crate::index::{Aos, HashCoefficient, LinearIndexMapper, Soa};
use crate::types::{HashValue, Signature};

/// Fold one function value into a running table hash.
#[inline]
pub fn hash_combine(seed: u32, value: u32) -> u32 {
    seed ^ (value
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(seed << 6)
        .wrapping_add(seed >> 2))
}

/// Common interface of all hash function families.
pub trait LshHash: Send + Sync {
    /// Dimensionality of hashed points.
    fn dims(&self) -> usize;

    /// Number of tables (L).
    fn num_tables(&self) -> usize;

    /// Number of functions per table (K).
    fn num_functions(&self) -> usize;

    /// Number of distinct hash values per table.
    fn hash_table_size(&self) -> u32;

    /// Write the K function values of `table` for `point` into `out`.
    ///
    /// `point.len()` must equal [`LshHash::dims`].
    fn components_into(&self, table: usize, point: &[f32], out: &mut [i32]);

    /// Shift function `function` of `components` by `delta`.
    ///
    /// Returns false if the shifted value lies outside the function's range.
    fn perturb(&self, components: &mut [i32], function: usize, delta: i32) -> bool {
        components[function] = components[function].wrapping_add(delta);
        true
    }

    /// Digest of all parameters; equal on every rank holding the same family.
    fn fingerprint(&self) -> u64;

    /// The K function values of `table` for `point`.
    fn components(&self, table: usize, point: &[f32]) -> Vec<i32> {
        let mut out = vec![0; self.num_functions()];
        self.components_into(table, point, &mut out);
        out
    }

    /// Combine function values into the reduced table hash.
    fn combine(&self, components: &[i32]) -> HashValue {
        let combined = components
            .iter()
            .fold(self.num_functions() as u32, |seed, &v| hash_combine(seed, v as u32));
        combined % self.hash_table_size()
    }

    /// Hash value of `point` in `table`.
    fn hash(&self, table: usize, point: &[f32]) -> HashValue {
        let mut components = vec![0; self.num_functions()];
        self.components_into(table, point, &mut components);
        self.combine(&components)
    }

    /// Hash values of `point` in every table.
    fn compute_signature(&self, point: &[f32]) -> Result<Signature> {
        if point.len() != self.dims() {
            return Err(LshError::invalid_argument(format!(
                "point has {} dimensions, hash functions expect {}",
                point.len(),
                self.dims()
            )));
        }
        Ok(Signature::new((0..self.num_tables()).map(|t| self.hash(t, point)).collect()))
    }
}

/// Flat (table, function, coefficient) parameter buffer.
#[derive(Debug, Clone)]
pub(crate) struct Coefficients {
    data: Vec<f32>,
    layout: MemoryLayout,
    tables: usize,
    functions: usize,
    coefficients: usize,
}

impl Coefficients {
    pub(crate) fn zeroed(
        layout: MemoryLayout,
        tables: usize,
        functions: usize,
        coefficients: usize,
    ) -> Result<Self> {
        let len = tables
            .checked_mul(functions)
            .and_then(|n| n.checked_mul(coefficients))
            .ok_or_else(|| {
                LshError::invalid_argument(format!(
                    "{} tables x {} functions x {} coefficients overflow",
                    tables, functions, coefficients
                ))
            })?;
        Ok(Self {
            data: vec![0.0; len],
            layout,
            tables,
            functions,
            coefficients,
        })
    }

    #[inline]
    fn offset(&self, table: usize, function: usize, coefficient: usize) -> usize {
        let index = (table, function, coefficient);
        match self.layout {
            MemoryLayout::Aos => {
                HashCoefficient::<Aos>::new(self.tables, self.functions, self.coefficients).flatten(index)
            }
            MemoryLayout::Soa => {
                HashCoefficient::<Soa>::new(self.tables, self.functions, self.coefficients).flatten(index)
            }
        }
    }

    #[inline]
    pub(crate) fn get(&self, table: usize, function: usize, coefficient: usize) -> f32 {
        self.data[self.offset(table, function, coefficient)]
    }

    pub(crate) fn set(&mut self, table: usize, function: usize, coefficient: usize, value: f32) {
        let offset = self.offset(table, function, coefficient);
        self.data[offset] = value;
    }

    /// Inner product of `point` with the first `point.len()` coefficients of a function.
    ///
    /// Both layouts go through [`kernels::dot`], so the summation order is the
    /// one used when fitting cut-off points.
    #[inline]
    pub(crate) fn project(&self, table: usize, function: usize, point: &[f32]) -> f32 {
        match self.layout {
            MemoryLayout::Aos => {
                let start = self.offset(table, function, 0);
                kernels::dot(&self.data[start..start + point.len()], point)
            }
            MemoryLayout::Soa => {
                let column: Vec<f32> = (0..point.len()).map(|d| self.get(table, function, d)).collect();
                kernels::dot(&column, point)
            }
        }
    }

    /// Digest over the logical parameter order, independent of the layout.
    pub(crate) fn fingerprint(&self, extra: &[u64]) -> u64 {
        let mut hasher = DefaultHasher::new();
        extra.hash(&mut hasher);
        for t in 0..self.tables {
            for f in 0..self.functions {
                for c in 0..self.coefficients {
                    self.get(t, f, c).to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }
}

/// The hash functions of one distributed table set.
#[derive(Debug, Clone)]
pub enum HashFunctions {
    RandomProjections(RandomProjections),
    EntropyBased(EntropyBased),
}

impl HashFunctions {
    /// Create the configured family for `dims`-dimensional points. Collective.
    ///
    /// Random projections are generated locally from the shared seed;
    /// entropy-based cut-off points are estimated over all shards.
    pub fn create(
        config: &LshConfig,
        dims: usize,
        comm: &Communicator,
        engine: &ComputeEngine,
        shard: &DatasetShard,
    ) -> Result<Self> {
        match config.family {
            HashFamilyKind::RandomProjections => {
                Ok(HashFunctions::RandomProjections(RandomProjections::new(config, dims)?))
            }
            HashFamilyKind::EntropyBased => Ok(HashFunctions::EntropyBased(EntropyBased::fit(
                config, dims, comm, engine, shard,
            )?)),
        }
    }

    pub fn kind(&self) -> HashFamilyKind {
        match self {
            HashFunctions::RandomProjections(_) => HashFamilyKind::RandomProjections,
            HashFunctions::EntropyBased(_) => HashFamilyKind::EntropyBased,
        }
    }

    fn inner(&self) -> &dyn LshHash {
        match self {
            HashFunctions::RandomProjections(h) => h,
            HashFunctions::EntropyBased(h) => h,
        }
    }
}

impl LshHash for HashFunctions {
    fn dims(&self) -> usize {
        self.inner().dims()
    }

    fn num_tables(&self) -> usize {
        self.inner().num_tables()
    }

    fn num_functions(&self) -> usize {
        self.inner().num_functions()
    }

    fn hash_table_size(&self) -> u32 {
        self.inner().hash_table_size()
    }

    fn components_into(&self, table: usize, point: &[f32], out: &mut [i32]) {
        self.inner().components_into(table, point, out)
    }

    fn perturb(&self, components: &mut [i32], function: usize, delta: i32) -> bool {
        self.inner().perturb(components, function, delta)
    }

    fn fingerprint(&self) -> u64 {
        self.inner().fingerprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_hash_combine_matches_reference() {
        // seed 2, value 5: 2 ^ (5 + 0x9e3779b9 + 128 + 0)
        assert_eq!(hash_combine(2, 5), 2 ^ 0x9e37_7a3e);
        // wraps instead of overflowing
        let _ = hash_combine(u32::MAX, u32::MAX);
    }

    #[test]
    fn test_coefficients_size_overflow() {
        let err = Coefficients::zeroed(MemoryLayout::Aos, usize::MAX, 2, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_projection_bit_identical_across_layouts() {
        // long enough for the SIMD lanes and a scalar tail
        let (dims, functions) = (19, 5);
        let mut aos = Coefficients::zeroed(MemoryLayout::Aos, 1, functions, dims).unwrap();
        let mut soa = Coefficients::zeroed(MemoryLayout::Soa, 1, functions, dims).unwrap();
        for f in 0..functions {
            for d in 0..dims {
                let v = ((f * 31 + d * 7) as f32).sin() * 1e3;
                aos.set(0, f, d, v);
                soa.set(0, f, d, v);
            }
        }
        let point: Vec<f32> = (0..dims).map(|d| (d as f32 * 0.37).cos() * 1e-2).collect();
        for f in 0..functions {
            let column: Vec<f32> = (0..dims).map(|d| aos.get(0, f, d)).collect();
            let expected = kernels::dot(&column, &point);
            assert_eq!(aos.project(0, f, &point).to_bits(), expected.to_bits());
            assert_eq!(soa.project(0, f, &point).to_bits(), expected.to_bits());
        }
    }

    #[test]
    fn test_coefficients_layout_independent() {
        let mut aos = Coefficients::zeroed(MemoryLayout::Aos, 2, 3, 4).unwrap();
        let mut soa = Coefficients::zeroed(MemoryLayout::Soa, 2, 3, 4).unwrap();
        for t in 0..2 {
            for f in 0..3 {
                for c in 0..4 {
                    let v = (t * 100 + f * 10 + c) as f32;
                    aos.set(t, f, c, v);
                    soa.set(t, f, c, v);
                }
            }
        }
        let point = [1.0, 2.0, 3.0];
        assert_eq!(aos.project(1, 2, &point), soa.project(1, 2, &point));
        assert_eq!(aos.fingerprint(&[1]), soa.fingerprint(&[1]));
        assert_ne!(aos.fingerprint(&[1]), aos.fingerprint(&[2]));
    }

    #[test]
    fn test_family_dispatch() {
        let config = LshConfig::new().with_num_hash_tables(3);
        let family = HashFunctions::RandomProjections(RandomProjections::new(&config, 4).unwrap());
        assert_eq!(family.kind(), HashFamilyKind::RandomProjections);
        assert_eq!(family.num_tables(), 3);
        let point = [0.1, 0.2, 0.3, 0.4];
        let signature = family.compute_signature(&point).unwrap();
        assert_eq!(signature.len(), 3);
        assert!(signature.values().iter().all(|&h| h < config.hash_table_size));

        let err = family.compute_signature(&[0.1, 0.2, 0.3, 0.4, 0.5]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(family.compute_signature(&[0.1]).is_err());
    }
}
