//! Entropy-based hash functions.
//!
//! A function projects a point onto a Gaussian vector and reports which of
//! `num_cut_off_points` equally populated intervals the projection falls into.
//! The interval boundaries are empirical quantiles of the projections of the
//! whole distributed dataset, so the family has to be fitted before use.

use log::debug;
use std::sync::Arc;

use super::{Coefficients, LshHash};
use crate::comm::Communicator;
use crate::compute::{kernels, ComputeEngine};
use crate::config::LshConfig;
use crate::data::{DatasetShard, PointSource};
use crate::error::{LshError, Result};
use crate::utils::RandomSampler;

/// Interval-index hash over collectively estimated cut-off points.
///
/// Each function occupies `dims + num_cut_off_points - 1` coefficients: the
/// projection vector followed by the ascending cut-off points.
#[derive(Debug, Clone)]
pub struct EntropyBased {
    dims: usize,
    num_tables: usize,
    num_functions: usize,
    hash_table_size: u32,
    intervals: usize,
    coefficients: Coefficients,
}

/// `intervals - 1` quantiles of `values`: the value at every `len / intervals`-th rank.
fn cut_off_points(mut values: Vec<f32>, intervals: usize) -> Vec<f32> {
    if values.is_empty() {
        return vec![0.0; intervals - 1];
    }
    values.sort_by(f32::total_cmp);
    let jump = values.len() / intervals;
    (1..intervals)
        .map(|c| values[(c * jump).min(values.len() - 1)])
        .collect()
}

impl EntropyBased {
    /// Pool of projection vectors (row-major) plus the sampler positioned
    /// for the per-table selection.
    fn pool(config: &LshConfig, dims: usize) -> (Vec<f32>, RandomSampler) {
        let mut sampler = RandomSampler::with_seed(config.seed);
        let pool = (0..config.hash_pool_size)
            .flat_map(|_| sampler.normal_vector(dims))
            .collect();
        (pool, sampler)
    }

    fn assemble(
        config: &LshConfig,
        dims: usize,
        pool: &[f32],
        cut_offs: &[Vec<f32>],
        mut sampler: RandomSampler,
    ) -> Result<Self> {
        let intervals = config.num_cut_off_points;
        let per_function = dims.checked_add(intervals - 1).ok_or_else(|| {
            LshError::invalid_argument(format!(
                "{} dimensions with {} cut-off points overflow",
                dims, intervals
            ))
        })?;
        let mut coefficients = Coefficients::zeroed(
            config.memory_layout,
            config.num_hash_tables,
            config.num_hash_functions,
            per_function,
        )?;

        for table in 0..config.num_hash_tables {
            let picks = sampler.sample_with_replacement(config.hash_pool_size, config.num_hash_functions);
            for (function, pick) in picks.into_iter().enumerate() {
                for (d, &value) in pool[pick * dims..(pick + 1) * dims].iter().enumerate() {
                    coefficients.set(table, function, d, value);
                }
                for (c, &cut) in cut_offs[pick].iter().enumerate() {
                    coefficients.set(table, function, dims + c, cut);
                }
            }
        }

        Ok(Self {
            dims,
            num_tables: config.num_hash_tables,
            num_functions: config.num_hash_functions,
            hash_table_size: config.hash_table_size,
            intervals,
            coefficients,
        })
    }

    /// Fit the family over the shards of all ranks. Collective.
    ///
    /// Each rank projects its shard on the device; the projections are
    /// gathered in rank order and every rank sorts the same values, so all
    /// ranks derive identical cut-off points.
    pub fn fit(
        config: &LshConfig,
        dims: usize,
        comm: &Communicator,
        engine: &ComputeEngine,
        shard: &DatasetShard,
    ) -> Result<Self> {
        config.validate()?;
        if shard.dims() != dims {
            return Err(LshError::invalid_argument(format!(
                "shard has {} dimensions, expected {}",
                shard.dims(),
                dims
            )));
        }

        let (pool, sampler) = Self::pool(config, dims);
        let pool = Arc::new(pool);
        let local = engine.compute_projections_batch(shard, &pool, config.hash_pool_size)?;
        let gathered = comm.all_gather(Arc::new(local))?;

        let cut_offs: Vec<Vec<f32>> = (0..config.hash_pool_size)
            .map(|f| {
                let values = gathered.iter().flat_map(|rank| rank[f].iter().copied()).collect();
                cut_off_points(values, config.num_cut_off_points)
            })
            .collect();

        debug!(
            "[rank {}] entropy-based cut-off points from {} projections per function",
            comm.rank(),
            gathered.iter().map(|rank| rank.first().map_or(0, Vec::len)).sum::<usize>()
        );

        Self::assemble(config, dims, &pool, &cut_offs, sampler)
    }

    /// Fit the family on a single in-memory sample.
    pub fn from_sample<P: PointSource + ?Sized>(config: &LshConfig, dims: usize, sample: &P) -> Result<Self> {
        config.validate()?;
        if !sample.is_empty() && sample.dims() != dims {
            return Err(LshError::invalid_argument(format!(
                "sample has {} dimensions, expected {}",
                sample.dims(),
                dims
            )));
        }

        let (pool, sampler) = Self::pool(config, dims);
        let mut point = vec![0.0f32; dims];
        let mut projections = vec![Vec::with_capacity(sample.len()); config.hash_pool_size];
        for i in 0..sample.len() {
            sample.copy_point(i, &mut point);
            for (f, values) in projections.iter_mut().enumerate() {
                values.push(kernels::dot(&pool[f * dims..(f + 1) * dims], &point));
            }
        }

        let cut_offs: Vec<Vec<f32>> = projections
            .into_iter()
            .map(|values| cut_off_points(values, config.num_cut_off_points))
            .collect();
        Self::assemble(config, dims, &pool, &cut_offs, sampler)
    }

    /// Ascending cut-off points of one function.
    pub fn cut_offs(&self, table: usize, function: usize) -> Vec<f32> {
        (0..self.intervals - 1)
            .map(|c| self.coefficients.get(table, function, self.dims + c))
            .collect()
    }
}

impl LshHash for EntropyBased {
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
            *value = (0..self.intervals - 1)
                .filter(|&c| projection > self.coefficients.get(table, function, self.dims + c))
                .count() as i32;
        }
    }

    fn perturb(&self, components: &mut [i32], function: usize, delta: i32) -> bool {
        let shifted = components[function] + delta;
        if (0..self.intervals as i32).contains(&shifted) {
            components[function] = shifted;
            true
        } else {
            false
        }
    }

    fn fingerprint(&self) -> u64 {
        self.coefficients.fingerprint(&[
            1,
            self.dims as u64,
            u64::from(self.hash_table_size),
            self.intervals as u64,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HashFamilyKind, MemoryLayout};
    use crate::utils::random_points;

    fn config() -> LshConfig {
        LshConfig::new()
            .with_family(HashFamilyKind::EntropyBased)
            .with_num_hash_tables(2)
            .with_num_cut_off_points(4)
            .with_seed(3)
    }

    #[test]
    fn test_cut_off_points_are_quantiles() {
        let values: Vec<f32> = (0..100).rev().map(|i| i as f32).collect();
        assert_eq!(cut_off_points(values, 4), vec![25.0, 50.0, 75.0]);
        assert_eq!(cut_off_points(Vec::new(), 3), vec![0.0, 0.0]);
        assert_eq!(cut_off_points(vec![1.0], 4), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_intervals_are_balanced() {
        let sample = random_points(400, 6, 11);
        let family = EntropyBased::from_sample(&config(), 6, sample.as_slice()).unwrap();

        let mut counts = [0usize; 4];
        for point in &sample {
            let components = family.components(0, point);
            assert!(components.iter().all(|&c| (0..4).contains(&c)));
            counts[components[0] as usize] += 1;
        }
        for count in counts {
            assert!((90..=110).contains(&count), "unbalanced interval: {:?}", counts);
        }
    }

    #[test]
    fn test_cut_offs_ascending_and_layout_independent() {
        let sample = random_points(200, 5, 1);
        let aos = EntropyBased::from_sample(&config(), 5, sample.as_slice()).unwrap();
        let soa = EntropyBased::from_sample(
            &config().with_memory_layout(MemoryLayout::Soa),
            5,
            sample.as_slice(),
        )
        .unwrap();
        let cuts = aos.cut_offs(1, 2);
        assert!(cuts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(cuts, soa.cut_offs(1, 2));
        assert_eq!(aos.fingerprint(), soa.fingerprint());
        assert_eq!(aos.compute_signature(&sample[7]).unwrap(), soa.compute_signature(&sample[7]).unwrap());
    }

    #[test]
    fn test_wide_points_hash_identically_in_both_layouts() {
        let config = LshConfig::new()
            .with_family(HashFamilyKind::EntropyBased)
            .with_num_hash_tables(4)
            .with_num_cut_off_points(8);
        let sample = random_points(500, 16, 5);
        let aos = EntropyBased::from_sample(&config, 16, sample.as_slice()).unwrap();
        let soa = EntropyBased::from_sample(&config.clone().with_memory_layout(MemoryLayout::Soa), 16, sample.as_slice())
            .unwrap();

        for point in &sample {
            for table in 0..4 {
                assert_eq!(aos.components(table, point), soa.components(table, point));
            }
        }
    }

    #[test]
    fn test_perturb_stays_in_range() {
        let family = EntropyBased::from_sample(&config(), 3, random_points(50, 3, 2).as_slice()).unwrap();
        let mut components = vec![0, 3, 1, 2];
        assert!(!family.perturb(&mut components, 0, -1));
        assert!(!family.perturb(&mut components, 1, 1));
        assert!(family.perturb(&mut components, 2, 1));
        assert_eq!(components, vec![0, 3, 2, 2]);
    }
}
