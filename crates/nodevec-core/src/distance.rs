//! Distance kernels and metrics
//!
//! Explicit SIMD for aarch64 (NEON) and x86_64 (AVX2+FMA, detected at runtime),
//! with a scalar fallback everywhere else.
//!
//! Every [`Metric`] is expressed as a *distance*: smaller means closer. Inner
//! product is negated and cosine is reported as `1 - cos(θ)` so that result
//! ordering is uniform across metrics.

use serde::{Deserialize, Serialize};

// ============================================================================
// aarch64 NEON
// ============================================================================

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let va = vld1q_f32(a.as_ptr().add(i * 4));
        let vb = vld1q_f32(b.as_ptr().add(i * 4));
        acc = vfmaq_f32(acc, va, vb);
    }
    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn l2_squared_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let chunks = a.len() / 4;
    let mut acc = vdupq_n_f32(0.0);
    for i in 0..chunks {
        let diff = vsubq_f32(
            vld1q_f32(a.as_ptr().add(i * 4)),
            vld1q_f32(b.as_ptr().add(i * 4)),
        );
        acc = vfmaq_f32(acc, diff, diff);
    }
    let mut sum = vaddvq_f32(acc);
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ============================================================================
// x86_64 AVX2
// ============================================================================

/// Horizontal sum of 8 lanes.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn hsum_avx2(acc: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let sum128 = _mm_add_ps(_mm256_castps256_ps128(acc), _mm256_extractf128_ps(acc, 1));
    let sums = _mm_add_ps(sum128, _mm_movehdup_ps(sum128));
    _mm_cvtss_f32(_mm_add_ss(sums, _mm_movehl_ps(sums, sums)))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        acc = _mm256_fmadd_ps(va, vb, acc);
    }
    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let chunks = a.len() / 8;
    let mut acc = _mm256_setzero_ps();
    for i in 0..chunks {
        let diff = _mm256_sub_ps(
            _mm256_loadu_ps(a.as_ptr().add(i * 8)),
            _mm256_loadu_ps(b.as_ptr().add(i * 8)),
        );
        acc = _mm256_fmadd_ps(diff, diff, acc);
    }
    let mut sum = hsum_avx2(acc);
    for i in chunks * 8..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

// ============================================================================
// Dispatch
// ============================================================================

#[inline(always)]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline(always)]
fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Dot product of two equal-length vectors.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { dot_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { dot_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_scalar(a, b)
}

/// Squared Euclidean distance `||a - b||²`.
#[inline(always)]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        return unsafe { l2_squared_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { l2_squared_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    l2_squared_scalar(a, b)
}

/// Euclidean norm accumulated in f64, so finite vectors never overflow.
#[inline]
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

#[inline]
fn dot_f64(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// `1 - cos(a, b)` given f64 norms. Falls back to an f64 dot product when
/// the f32 kernel overflows.
#[inline]
fn cosine_distance(a: &[f32], a_norm: f64, b: &[f32], b_norm: f64) -> f32 {
    let denom = a_norm * b_norm;
    if denom <= f32::EPSILON as f64 || !denom.is_finite() {
        return 1.0;
    }
    let mut dot = dot_product(a, b) as f64;
    if !dot.is_finite() {
        dot = dot_f64(a, b);
    }
    (1.0 - dot / denom) as f32
}

/// Normalize `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > f32::EPSILON as f64 {
        for x in v.iter_mut() {
            *x = (*x as f64 / norm) as f32;
        }
    }
}

/// Distance metric used for partitioning and ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance.
    #[default]
    L2Squared,
    /// Negated dot product.
    InnerProduct,
    /// `1 - cosine similarity`.
    Cosine,
}

impl Metric {
    /// Distance between `a` and `b` under this metric.
    ///
    /// For [`Metric::Cosine`] the norms are computed on the fly.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2Squared => l2_distance_squared(a, b),
            Metric::InnerProduct => -dot_product(a, b),
            Metric::Cosine => cosine_distance(a, l2_norm(a), b, l2_norm(b)),
        }
    }

    /// Distance given precomputed L2 norms of both operands.
    ///
    /// Partitions keep raw vectors plus their norms so every metric, including
    /// a per-query override, is evaluated against the original embedding.
    #[inline]
    pub fn distance_with_norms(self, a: &[f32], a_norm: f64, b: &[f32], b_norm: f64) -> f32 {
        match self {
            Metric::L2Squared => l2_distance_squared(a, b),
            Metric::InnerProduct => -dot_product(a, b),
            Metric::Cosine => cosine_distance(a, a_norm, b, b_norm),
        }
    }

    /// Whether training data is unit-normalized before clustering.
    pub fn normalizes(self) -> bool {
        matches!(self, Metric::Cosine)
    }

    /// Copy of `v` in the form the coarse quantizer is trained on.
    pub fn prepare(self, v: &[f32]) -> Vec<f32> {
        let mut out = v.to_vec();
        if self.normalizes() {
            l2_normalize(&mut out);
        }
        out
    }

    pub(crate) fn to_tag(self) -> u8 {
        match self {
            Metric::L2Squared => 0,
            Metric::InnerProduct => 1,
            Metric::Cosine => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Metric::L2Squared),
            1 => Some(Metric::InnerProduct),
            2 => Some(Metric::Cosine),
            _ => None,
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Metric::L2Squared => "l2_squared",
            Metric::InnerProduct => "inner_product",
            Metric::Cosine => "cosine",
        };
        f.write_str(name)
    }
}
