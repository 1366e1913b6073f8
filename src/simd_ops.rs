//! Vectorized reductions over real volumes
//!
//! Used by the convergence tracker and the coverage accumulators.
//! When the `simd` feature is enabled these use 256-bit `f64x4` lanes from
//! `wide`; otherwise plain iterator fallbacks are compiled.

#[cfg(feature = "simd")]
use wide::f64x4;

/// SIMD lane width (4 for f64x4)
#[cfg(feature = "simd")]
pub const SIMD_WIDTH: usize = 4;

#[cfg(not(feature = "simd"))]
pub const SIMD_WIDTH: usize = 1;

#[cfg(feature = "simd")]
#[inline(always)]
fn load(a: &[f64], idx: usize) -> f64x4 {
    f64x4::new([a[idx], a[idx + 1], a[idx + 2], a[idx + 3]])
}

// ============================================================================
// Dot Product Operations
// ============================================================================

/// Compute dot product: sum(a[i] * b[i])
#[cfg(feature = "simd")]
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / SIMD_WIDTH;

    let mut sum = f64x4::ZERO;
    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        sum += load(a, idx) * load(b, idx);
    }

    let mut result = sum.reduce_add();
    for i in chunks * SIMD_WIDTH..a.len() {
        result += a[i] * b[i];
    }
    result
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn dot_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&ai, &bi)| ai * bi).sum()
}

/// Compute squared norm: sum(a[i]^2)
#[inline]
pub fn norm_squared(a: &[f64]) -> f64 {
    dot_product(a, a)
}

/// Compute squared distance: sum((a[i] - b[i])^2)
#[cfg(feature = "simd")]
#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / SIMD_WIDTH;

    let mut sum = f64x4::ZERO;
    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let d = load(a, idx) - load(b, idx);
        sum += d * d;
    }

    let mut result = sum.reduce_add();
    for i in chunks * SIMD_WIDTH..a.len() {
        let d = a[i] - b[i];
        result += d * d;
    }
    result
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&ai, &bi)| (ai - bi) * (ai - bi)).sum()
}

// ============================================================================
// Vector Update Operations
// ============================================================================

/// a += alpha * b
#[cfg(feature = "simd")]
#[inline]
pub fn axpy(a: &mut [f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / SIMD_WIDTH;
    let va = f64x4::splat(alpha);

    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let r = load(a, idx) + va * load(b, idx);
        a[idx..idx + SIMD_WIDTH].copy_from_slice(&r.to_array());
    }
    for i in chunks * SIMD_WIDTH..a.len() {
        a[i] += alpha * b[i];
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn axpy(a: &mut [f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    for (ai, &bi) in a.iter_mut().zip(b.iter()) {
        *ai += alpha * bi;
    }
}
