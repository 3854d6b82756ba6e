//! Random projection hash functions.

use log::debug;

use super::{Coefficients, LshHash};
use crate::config::LshConfig;
use crate::error::Result;
use crate::utils::RandomSampler;

/// `h(x) = floor((a . x + b) / w)` with `a ~ N(0, 1)^D` and `b ~ U[0, w)`.
///
/// Each function occupies `dims + 1` coefficients: the projection vector
/// followed by the offset.
#[derive(Debug, Clone)]
pub struct RandomProjections {
    dims: usize,
    num_tables: usize,
    num_functions: usize,
    hash_table_size: u32,
    w: f32,
    coefficients: Coefficients,
}

impl RandomProjections {
    /// Generate the family from `config.seed`. Every rank calling this with
    /// the same configuration obtains identical parameters.
    pub fn new(config: &LshConfig, dims: usize) -> Result<Self> {
        config.validate()?;
        let mut sampler = RandomSampler::with_seed(config.seed);

        let pool: Vec<(Vec<f32>, f32)> = (0..config.hash_pool_size)
            .map(|_| {
                let a = sampler.normal_vector(dims);
                let b = sampler.uniform(0.0, config.w);
                (a, b)
            })
            .collect();

        let mut coefficients = Coefficients::zeroed(
            config.memory_layout,
            config.num_hash_tables,
            config.num_hash_functions,
            dims + 1,
        )?;
        for table in 0..config.num_hash_tables {
            let picks = sampler.sample_with_replacement(config.hash_pool_size, config.num_hash_functions);
            for (function, pick) in picks.into_iter().enumerate() {
                let (a, b) = &pool[pick];
                for (d, &value) in a.iter().enumerate() {
                    coefficients.set(table, function, d, value);
                }
                coefficients.set(table, function, dims, *b);
            }
        }

        debug!(
            "random projections: {} tables x {} functions from a pool of {}",
            config.num_hash_tables, config.num_hash_functions, config.hash_pool_size
        );

        Ok(Self {
            dims,
            num_tables: config.num_hash_tables,
            num_functions: config.num_hash_functions,
            hash_table_size: config.hash_table_size,
            w: config.w,
            coefficients,
        })
    }

    /// Bucket width.
    pub fn w(&self) -> f32 {
        self.w
    }
}

impl LshHash for RandomProjections {
    fn dims(&self) -> usize {
        self.dims
    }

    fn num_tables(&self) -> usize {
        self.num_tables
    }

    fn num_functions(&self) -> usize {
        self.num_functions
    }

    fn hash_table_size(&self) -> u32 {
        self.hash_table_size
    }

    fn components_into(&self, table: usize, point: &[f32], out: &mut [i32]) {
        for (function, value) in out.iter_mut().enumerate() {
            let projection = self.coefficients.project(table, function, point);
            let offset = self.coefficients.get(table, function, self.dims);
            *value = ((projection + offset) / self.w).floor() as i32;
        }
    }

    fn fingerprint(&self) -> u64 {
        self.coefficients.fingerprint(&[
            0,
            self.dims as u64,
            u64::from(self.hash_table_size),
            u64::from(self.w.to_bits()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLayout;

    fn config() -> LshConfig {
        LshConfig::new().with_num_hash_tables(3).with_seed(42)
    }

    #[test]
    fn test_deterministic_for_seed() {
        let a = RandomProjections::new(&config(), 8).unwrap();
        let b = RandomProjections::new(&config(), 8).unwrap();
        let point: Vec<f32> = (0..8).map(|i| i as f32 * 0.1).collect();
        assert_eq!(a.compute_signature(&point).unwrap(), b.compute_signature(&point).unwrap());
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = RandomProjections::new(&config().with_seed(43), 8).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_layout_does_not_change_hashes() {
        let aos = RandomProjections::new(&config(), 12).unwrap();
        let soa = RandomProjections::new(&config().with_memory_layout(MemoryLayout::Soa), 12).unwrap();
        let point: Vec<f32> = (0..12).map(|i| (i as f32).sin()).collect();
        for table in 0..3 {
            assert_eq!(aos.components(table, &point), soa.components(table, &point));
        }
    }

    #[test]
    fn test_floor_quantization() {
        let config = LshConfig::new()
            .with_hash_pool_size(1)
            .with_num_hash_functions(1)
            .with_num_hash_tables(1)
            .with_w(1.0);
        let family = RandomProjections::new(&config, 1).unwrap();
        let a = family.coefficients.get(0, 0, 0);
        let b = family.coefficients.get(0, 0, 1);

        // choose x so that a * x + b is slightly negative: floor gives -1, truncation 0
        let x = (-b - 0.25) / a;
        assert_eq!(family.components(0, &[x]), vec![-1]);
    }

    #[test]
    fn test_rejects_invalid_config() {
        assert!(RandomProjections::new(&LshConfig::new().with_w(-1.0), 4).is_err());
    }
}
