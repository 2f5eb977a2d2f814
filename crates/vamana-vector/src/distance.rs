//! L2 / dot-product distance, norms, and four-at-once batched variants.
//!
//! The batched variants exist because the graph search path groups
//! candidate neighbors in quartets to hide memory latency and maximize
//! SIMD throughput (one query vector loaded once, compared against four
//! candidates). Implementations use the widest SIMD lane the host supports,
//! detected once at first use and cached; a scalar tail handles any
//! remainder that doesn't fill a full lane.
//!
//! Both metrics return "smaller = closer": [`dot`] negates the raw inner
//! product so it sorts the same way [`l2`] does.

use std::sync::OnceLock;

/// Distance metric selector for the two built-in distance functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
    /// Negated dot product (so smaller is still closer).
    Dot,
}

impl Metric {
    /// Evaluate this metric between `a` and `b`.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::L2 => l2(a, b),
            Metric::Dot => dot(a, b),
        }
    }
}

fn has_avx2_fma() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    })
}

/// Squared L2 distance between `a` and `b`. Panics if lengths differ.
pub fn l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            return unsafe { avx2::l2(a, b) };
        }
    }
    l2_scalar(a, b)
}

/// Negated dot product between `a` and `b` (`-Σ aᵢbᵢ`), so that "smaller is
/// closer" holds the same way it does for [`l2`].
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    #[cfg(target_arch = "x86_64")]
    {
        if has_avx2_fma() {
            return unsafe { -avx2::dot(a, b) };
        }
    }
    -dot_scalar(a, b)
}

/// L2 norm (Euclidean length) of `v`.
pub fn l2_norm(v: &[f32]) -> f32 {
    dot_scalar(v, v).sqrt()
}

/// Write `v / norm` into `out`. `out` must be the same length as `v`.
/// A zero norm leaves `out` filled with zeroes rather than dividing by
/// zero.
pub fn normalize(v: &[f32], norm: f32, out: &mut [f32]) {
    debug_assert_eq!(v.len(), out.len());
    if norm == 0.0 {
        out.fill(0.0);
        return;
    }
    let inv = 1.0 / norm;
    for (o, x) in out.iter_mut().zip(v.iter()) {
        *o = x * inv;
    }
}

/// Evaluate `metric` between `query` and four candidates at once,
/// amortizing query-load overhead across the quartet.
pub fn distance_x4(metric: Metric, query: &[f32], candidates: [&[f32]; 4]) -> [f32; 4] {
    match metric {
        Metric::L2 => {
            let mut out = [0.0f32; 4];
            for (o, c) in out.iter_mut().zip(candidates.iter()) {
                *o = l2(query, c);
            }
            out
        }
        Metric::Dot => {
            let mut out = [0.0f32; 4];
            for (o, c) in out.iter_mut().zip(candidates.iter()) {
                *o = dot(query, c);
            }
            out
        }
    }
}

fn l2_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    #[target_feature(enable = "avx2", enable = "fma")]
    unsafe fn hsum256(v: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(v, 1);
        let lo = _mm256_castps256_ps128(v);
        let sum128 = _mm_add_ps(hi, lo);
        let shuf = _mm_movehdup_ps(sum128);
        let sums = _mm_add_ps(sum128, shuf);
        let shuf2 = _mm_movehl_ps(shuf, sums);
        let final_sum = _mm_add_ss(sums, shuf2);
        _mm_cvtss_f32(final_sum)
    }

    /// # Safety
    /// Caller must have confirmed `avx2` + `fma` are available, and `a.len() == b.len()`.
    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn l2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let lanes = n - (n % 8);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < lanes {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            let diff = _mm256_sub_ps(va, vb);
            acc = _mm256_fmadd_ps(diff, diff, acc);
            i += 8;
        }
        let mut sum = hsum256(acc);
        while i < n {
            let d = a[i] - b[i];
            sum += d * d;
            i += 1;
        }
        sum
    }

    /// # Safety
    /// Caller must have confirmed `avx2` + `fma` are available, and `a.len() == b.len()`.
    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let lanes = n - (n % 8);
        let mut acc = _mm256_setzero_ps();
        let mut i = 0;
        while i < lanes {
            let va = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb = _mm256_loadu_ps(b.as_ptr().add(i));
            acc = _mm256_fmadd_ps(va, vb, acc);
            i += 8;
        }
        let mut sum = hsum256(acc);
        while i < n {
            sum += a[i] * b[i];
            i += 1;
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_zero_for_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!(l2(&v, &v).abs() < 1e-6);
    }

    #[test]
    fn l2_matches_manual_computation() {
        let a = vec![0.0, 0.0, 0.0];
        let b = vec![1.0, 2.0, 2.0];
        assert!((l2(&a, &b) - 9.0).abs() < 1e-5);
    }

    #[test]
    fn dot_is_negated_inner_product() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((dot(&a, &b) - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn dot_orders_same_as_l2_for_closer_vector() {
        let q = vec![1.0, 1.0, 1.0, 1.0];
        let near = vec![1.0, 1.0, 1.0, 1.0];
        let far = vec![-1.0, -1.0, -1.0, -1.0];
        assert!(dot(&q, &near) < dot(&q, &far));
    }

    #[test]
    fn normalize_produces_unit_vector() {
        let v = vec![3.0, 4.0];
        let norm = l2_norm(&v);
        let mut out = vec![0.0; 2];
        normalize(&v, norm, &mut out);
        assert!((l2_norm(&out) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn normalize_zero_vector_is_zero() {
        let v = vec![0.0, 0.0];
        let mut out = vec![1.0, 1.0];
        normalize(&v, 0.0, &mut out);
        assert_eq!(out, vec![0.0, 0.0]);
    }

    #[test]
    fn distance_x4_matches_individual_calls() {
        let q = vec![1.0f32; 16];
        let c0 = vec![1.0f32; 16];
        let c1 = vec![2.0f32; 16];
        let c2 = vec![0.0f32; 16];
        let c3 = vec![-1.0f32; 16];
        let batched = distance_x4(Metric::L2, &q, [&c0, &c1, &c2, &c3]);
        assert!((batched[0] - l2(&q, &c0)).abs() < 1e-5);
        assert!((batched[1] - l2(&q, &c1)).abs() < 1e-5);
        assert!((batched[2] - l2(&q, &c2)).abs() < 1e-5);
        assert!((batched[3] - l2(&q, &c3)).abs() < 1e-5);
    }

    #[test]
    fn handles_non_multiple_of_eight_length() {
        let a: Vec<f32> = (0..13).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..13).map(|i| (i as f32) * 2.0).collect();
        let scalar = l2_scalar(&a, &b);
        assert!((l2(&a, &b) - scalar).abs() < 1e-3);
    }
}
