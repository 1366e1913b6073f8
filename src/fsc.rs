//! Resolution estimation and reference post-processing
//!
//! Fourier shell correlation between two half-set reconstructions, the
//! resolution where it drops below 0.5, a raised-cosine low-pass and a
//! spherical solvent mask.

use num_complex::Complex64;

use crate::fft::{fftfreq, idx3d};
use crate::reference::COVERAGE_EPS;

/// FSC level defining the resolution
pub const FSC_THRESHOLD: f64 = 0.5;

/// Width of the raised-cosine edge in digital frequency
pub const RAISED_COSINE_WIDTH: f64 = 0.02;

/// Correlation per frequency shell
#[derive(Clone, Debug, PartialEq)]
pub struct FscCurve {
    /// Digital frequency of each shell
    pub freq: Vec<f64>,
    pub fsc: Vec<f64>,
}

impl FscCurve {
    /// Digital frequency where the curve first drops below `threshold`,
    /// linearly interpolated between shells
    ///
    /// A curve that never drops gives the last shell's frequency.
    pub fn resolution(&self, threshold: f64) -> f64 {
        for s in 1..self.fsc.len() {
            if self.fsc[s] < threshold {
                let (f0, f1) = (self.freq[s - 1], self.freq[s]);
                let (c0, c1) = (self.fsc[s - 1], self.fsc[s]);
                if c0 <= c1 {
                    return f0;
                }
                return f0 + (f1 - f0) * (c0 - threshold) / (c0 - c1);
            }
        }
        self.freq.last().copied().unwrap_or(0.5)
    }
}

/// Shell index of every coefficient, `None` beyond the Nyquist sphere
pub(crate) fn shell_indices(dim: usize) -> Vec<Option<usize>> {
    let freq = fftfreq(dim, 1.0);
    let n_shells = dim / 2 + 1;
    let mut shells = vec![None; dim * dim * dim];
    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                let r = (freq[i] * freq[i] + freq[j] * freq[j] + freq[k] * freq[k]).sqrt();
                let s = (r * dim as f64).round() as usize;
                if s < n_shells {
                    shells[idx3d(i, j, k, dim, dim)] = Some(s);
                }
            }
        }
    }
    shells
}

/// FSC of two spectra over the coefficients both halves observed
///
/// # Arguments
/// * `f1`, `f2` - Half-set spectra (dim³, unshifted)
/// * `w1`, `w2` - Coverage of each half; coefficients with no coverage in
///   either half are left out
/// * `dim` - Edge of the cube
pub fn fourier_shell_correlation(
    f1: &[Complex64],
    f2: &[Complex64],
    w1: &[f64],
    w2: &[f64],
    dim: usize,
) -> FscCurve {
    let n_shells = dim / 2 + 1;
    let mut num = vec![0.0; n_shells];
    let mut p1 = vec![0.0; n_shells];
    let mut p2 = vec![0.0; n_shells];

    for (idx, shell) in shell_indices(dim).into_iter().enumerate() {
        let Some(s) = shell else { continue };
        if w1[idx] <= COVERAGE_EPS || w2[idx] <= COVERAGE_EPS {
            continue;
        }
        num[s] += (f1[idx] * f2[idx].conj()).re;
        p1[s] += f1[idx].norm_sqr();
        p2[s] += f2[idx].norm_sqr();
    }

    let fsc = (0..n_shells)
        .map(|s| {
            let den = (p1[s] * p2[s]).sqrt();
            if den > 0.0 { num[s] / den } else { 0.0 }
        })
        .collect();
    let freq = (0..n_shells).map(|s| s as f64 / dim as f64).collect();
    FscCurve { freq, fsc }
}

/// Coverage-normalized spectrum of one half set
pub fn half_spectrum(wsumimg: &[Complex64], wsumwed: &[f64]) -> Vec<Complex64> {
    wsumimg
        .iter()
        .zip(wsumwed)
        .map(|(&s, &c)| if c > COVERAGE_EPS { s / c } else { Complex64::new(0.0, 0.0) })
        .collect()
}

/// Raised-cosine low-pass at digital frequency `cutoff`
pub fn low_pass_raised_cosine(spectrum: &mut [Complex64], dim: usize, cutoff: f64, width: f64) {
    let freq = fftfreq(dim, 1.0);
    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                let r = (freq[i] * freq[i] + freq[j] * freq[j] + freq[k] * freq[k]).sqrt();
                let gain = if r <= cutoff {
                    1.0
                } else if width > 0.0 && r < cutoff + width {
                    0.5 * (1.0 + (std::f64::consts::PI * (r - cutoff) / width).cos())
                } else {
                    0.0
                };
                spectrum[idx3d(i, j, k, dim, dim)] *= gain;
            }
        }
    }
}

/// Replace every voxel farther than `radius` from the centre by the mean of
/// those voxels
pub fn mask_spherical_average_outside(vol: &mut [f64], dim: usize, radius: f64) {
    let c = (dim / 2) as f64;
    let r2 = radius * radius;
    let outside = |i: usize, j: usize, k: usize| {
        let (x, y, z) = (i as f64 - c, j as f64 - c, k as f64 - c);
        x * x + y * y + z * z > r2
    };

    let mut sum = 0.0;
    let mut count = 0usize;
    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                if outside(i, j, k) {
                    sum += vol[idx3d(i, j, k, dim, dim)];
                    count += 1;
                }
            }
        }
    }
    if count == 0 {
        return;
    }

    let avg = sum / count as f64;
    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                if outside(i, j, k) {
                    vol[idx3d(i, j, k, dim, dim)] = avg;
                }
            }
        }
    }
}
