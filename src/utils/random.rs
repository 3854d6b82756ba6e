//! Seeded random sampling.
//!
//! Every rank creates its hash function parameters from the same seed, so all
//! draws go through [`RandomSampler`] with a fixed order of calls.

use rand::prelude::*;
use rand_distr::{StandardNormal, Uniform};

/// Deterministic source of hash function parameters.
pub struct RandomSampler {
    rng: StdRng,
}

impl RandomSampler {
    /// Create a sampler with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Vector of `dims` independent standard normal values.
    pub fn normal_vector(&mut self, dims: usize) -> Vec<f32> {
        (0..dims).map(|_| self.rng.sample::<f32, _>(StandardNormal)).collect()
    }

    /// Uniform value in `[low, high)`.
    pub fn uniform(&mut self, low: f32, high: f32) -> f32 {
        self.rng.gen_range(low..high)
    }

    /// Sample with replacement `k` indices from `[0, n)`.
    pub fn sample_with_replacement(&mut self, n: usize, k: usize) -> Vec<usize> {
        (0..k).map(|_| self.rng.gen_range(0..n)).collect()
    }
}

/// `num_points` points with coordinates uniform in `[0, 1)`, reproducible from `seed`.
pub fn random_points(num_points: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dist = Uniform::new(0.0f32, 1.0);
    (0..num_points)
        .map(|_| (0..dims).map(|_| dist.sample(&mut rng)).collect())
        .collect()
}
