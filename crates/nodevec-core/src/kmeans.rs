//! K-means training for the coarse quantizer
//!
//! Lloyd's algorithm with k-means++ seeding. Deterministic for a given seed:
//! all randomness comes from one `StdRng`, the parallel assignment step is a
//! pure map, and centroid sums are accumulated sequentially in input order.
//!
//! Training checks a [`CancelToken`] between iterations and returns `None`
//! when cancelled.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::cancel::CancelToken;
use crate::distance::l2_distance_squared;

/// Configuration for coarse quantizer training
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Number of centroids (clamped to the number of training points)
    pub k: usize,

    /// Maximum Lloyd iterations (default: 20)
    pub max_iters: usize,

    /// Stop when no centroid moves further than this (default: 1e-4)
    pub tolerance: f32,

    /// RNG seed
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 16,
            max_iters: 20,
            tolerance: 1e-4,
            seed: 42,
        }
    }
}

/// Index of the centroid nearest to `v` (lowest index wins ties).
#[inline]
pub fn nearest_centroid(centroids: &[f32], dim: usize, v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = l2_distance_squared(v, centroid);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}

/// Train `config.k` centroids over `data`, returned flattened as `[k * dim]`.
///
/// `data` must be non-empty.
pub fn train(data: &[&[f32]], dim: usize, config: &KMeansConfig, cancel: &CancelToken) -> Option<Vec<f32>> {
    debug_assert!(!data.is_empty());
    let n = data.len();
    let k = config.k.clamp(1, n);
    let mut rng = StdRng::seed_from_u64(config.seed);

    let mut centroids = kmeans_plus_plus_init(data, dim, k, &mut rng);
    let mut sums = vec![0.0f32; k * dim];
    let mut counts = vec![0usize; k];

    for iter in 0..config.max_iters {
        if cancel.is_cancelled() {
            return None;
        }

        let assignments: Vec<usize> = data
            .par_iter()
            .map(|v| nearest_centroid(&centroids, dim, v))
            .collect();

        sums.fill(0.0);
        counts.fill(0);
        for (v, &c) in data.iter().zip(&assignments) {
            counts[c] += 1;
            for (acc, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(v.iter()) {
                *acc += x;
            }
        }

        for c in 0..k {
            let slot = &mut sums[c * dim..(c + 1) * dim];
            if counts[c] > 0 {
                let inv = 1.0 / counts[c] as f32;
                slot.iter_mut().for_each(|x| *x *= inv);
            } else {
                // Dead centroid: reseed from a random training point
                slot.copy_from_slice(data[rng.gen_range(0..n)]);
            }
        }

        let max_movement = centroids
            .chunks_exact(dim)
            .zip(sums.chunks_exact(dim))
            .map(|(old, new)| l2_distance_squared(old, new))
            .fold(0.0f32, f32::max);

        std::mem::swap(&mut centroids, &mut sums);

        if max_movement < config.tolerance * config.tolerance {
            tracing::debug!(iterations = iter + 1, k, "k-means converged");
            break;
        }
    }

    Some(centroids)
}

/// K-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen centroid.
fn kmeans_plus_plus_init(data: &[&[f32]], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len();
    let mut centroids = vec![0.0f32; k * dim];
    centroids[0..dim].copy_from_slice(data[rng.gen_range(0..n)]);

    let mut min_dists = vec![f32::MAX; n];
    for c in 1..k {
        let last = &centroids[(c - 1) * dim..c * dim];
        for (d, v) in min_dists.iter_mut().zip(data) {
            *d = d.min(l2_distance_squared(v, last));
        }

        let total: f64 = min_dists.iter().map(|&d| d as f64).sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0f64;
            min_dists
                .iter()
                .position(|&d| {
                    cumulative += d as f64;
                    cumulative >= threshold
                })
                .unwrap_or(n - 1)
        };
        centroids[c * dim..(c + 1) * dim].copy_from_slice(data[chosen]);
    }

    centroids
}
