//! SIMD kernels shared by the hash functions and the refinement step.
//!
//! All kernels process eight lanes at a time with `wide::f32x8` and finish the
//! remainder with scalar code.

use wide::f32x8;

use crate::config::Metric;

#[inline(always)]
fn load(chunk: &[f32]) -> f32x8 {
    f32x8::new([
        chunk[0], chunk[1], chunk[2], chunk[3],
        chunk[4], chunk[5], chunk[6], chunk[7],
    ])
}

/// Inner product of two equally long vectors.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let ca = a.chunks_exact(8);
    let cb = b.chunks_exact(8);
    let tail: f32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| x * y)
        .sum();

    let mut sum = f32x8::ZERO;
    for (x, y) in ca.zip(cb) {
        sum = sum + load(x) * load(y);
    }
    sum.reduce_add() + tail
}

/// Squared Euclidean distance.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let ca = a.chunks_exact(8);
    let cb = b.chunks_exact(8);
    let tail: f32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| (x - y) * (x - y))
        .sum();

    let mut sum = f32x8::ZERO;
    for (x, y) in ca.zip(cb) {
        let diff = load(x) - load(y);
        sum = sum + diff * diff;
    }
    sum.reduce_add() + tail
}

/// Manhattan distance.
#[inline]
pub fn l1(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let ca = a.chunks_exact(8);
    let cb = b.chunks_exact(8);
    let tail: f32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| (x - y).abs())
        .sum();

    let mut sum = f32x8::ZERO;
    for (x, y) in ca.zip(cb) {
        sum = sum + (load(x) - load(y)).abs();
    }
    sum.reduce_add() + tail
}

/// One minus the cosine similarity. Zero vectors are at distance 1.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let norms = (dot(a, a) * dot(b, b)).sqrt();
    if norms == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / norms
}

/// Distance between `a` and `b` under `metric`.
#[inline]
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        Metric::L2 => squared_l2(a, b).sqrt(),
        Metric::SquaredL2 => squared_l2(a, b),
        Metric::L1 => l1(a, b),
        Metric::Cosine => cosine(a, b),
    }
}
