//! Fold reduced accumulators into new references and model parameters

use log::{debug, warn};
use num_complex::Complex64;

use super::accumulators::Accumulators;
use crate::config::{AlgorithmMode, ImputationPolicy};
use crate::fft::Fft3dWorkspace;
use crate::reference::{ReferenceSet, COVERAGE_EPS};

/// Which parameters the maximization step may re-estimate
#[derive(Clone, Copy, Debug)]
pub struct MaximizationParams {
    pub mode: AlgorithmMode,
    pub imputation: ImputationPolicy,
    pub fix_sigma_noise: bool,
    pub fix_sigma_offset: bool,
    pub fix_fractions: bool,
}

/// Model parameters after one maximization
#[derive(Clone, Debug, PartialEq)]
pub struct ModelUpdate {
    pub sigma_noise: f64,
    pub sigma_offset: f64,
    pub alpha: Vec<f64>,
    /// Total weight mass over all references
    pub sumw_allrefs: f64,
}

/// Coverage a coefficient of reference `k` needs before it is re-estimated
fn coverage_threshold(policy: ImputationPolicy, sumw: f64) -> f64 {
    match policy {
        ImputationPolicy::Divide { noimp_threshold } => COVERAGE_EPS.max(noimp_threshold * sumw),
        ImputationPolicy::Impute => COVERAGE_EPS,
    }
}

/// Divide weighted sums by coverage into `out`, keeping `previous` where the
/// coverage is too low
pub fn divide_by_coverage(
    wsumimg: &[Complex64],
    wsumwed: &[f64],
    previous: &[Complex64],
    threshold: f64,
    out: &mut [Complex64],
) -> usize {
    let mut kept = 0;
    for (((o, &s), &c), &p) in out.iter_mut().zip(wsumimg).zip(wsumwed).zip(previous) {
        if c > threshold {
            *o = s / c;
        } else {
            *o = p;
            kept += 1;
        }
    }
    kept
}

/// Update references and parameters in place
///
/// # Arguments
/// * `acc` - Accumulators reduced over all images
/// * `refs` - References to update
/// * `sigma_noise` - Current noise level, kept when fixed or not estimable
/// * `sigma_offset` - Current offset spread, kept when fixed or not estimable
/// * `params` - Mode and fix flags
/// * `ws` - FFT workspace of the reference size
pub fn maximization(
    acc: &Accumulators,
    refs: &mut ReferenceSet,
    sigma_noise: f64,
    sigma_offset: f64,
    params: &MaximizationParams,
    ws: &mut Fft3dWorkspace,
) -> ModelUpdate {
    let voxels = ws.len();
    let mut spectrum = vec![Complex64::new(0.0, 0.0); voxels];

    for k in 0..refs.len() {
        if acc.sumw[k] <= 0.0 {
            warn!("reference {} received no weight mass, keeping previous estimate", k);
            continue;
        }
        let threshold = coverage_threshold(params.imputation, acc.sumw[k]);
        let kept = divide_by_coverage(acc.wsumimg(k), acc.wsumwed(k), refs.fourier(k), threshold, &mut spectrum);
        debug!(
            "reference {}: sumw={:.4}, {} of {} coefficients kept from previous estimate",
            k, acc.sumw[k], kept, voxels
        );
        refs.replace(k, &spectrum, ws);
    }

    let ml = params.mode == AlgorithmMode::MaximumLikelihood;

    let sigma_noise = if ml && !params.fix_sigma_noise && acc.observed_coefficients > 0.0 {
        (acc.wsum_sigma_noise / acc.observed_coefficients).sqrt()
    } else {
        sigma_noise
    };

    let sigma_offset = if ml && !params.fix_sigma_offset && acc.n_images > 0 {
        (acc.wsum_sigma_offset / (2.0 * acc.n_images as f64)).sqrt()
    } else {
        sigma_offset
    };

    let sumw_allrefs = acc.sumw_allrefs();
    if !params.fix_fractions && sumw_allrefs > 0.0 {
        refs.set_alpha(acc.sumw.iter().map(|w| w / sumw_allrefs).collect());
    }

    ModelUpdate {
        sigma_noise,
        sigma_offset,
        alpha: refs.alpha().to_vec(),
        sumw_allrefs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> MaximizationParams {
        MaximizationParams {
            mode: AlgorithmMode::MaximumLikelihood,
            imputation: ImputationPolicy::default(),
            fix_sigma_noise: false,
            fix_sigma_offset: false,
            fix_fractions: false,
        }
    }

    #[test]
    fn test_divide_keeps_uncovered_coefficients() {
        let sums = vec![Complex64::new(2.0, 0.0), Complex64::new(5.0, 1.0), Complex64::new(9.0, 0.0)];
        let cover = vec![2.0, 0.0, 0.5];
        let prev = vec![Complex64::new(-1.0, 0.0); 3];
        let mut out = vec![Complex64::new(0.0, 0.0); 3];
        let kept = divide_by_coverage(&sums, &cover, &prev, 1.0, &mut out);
        assert_eq!(kept, 2);
        assert_eq!(out, vec![Complex64::new(1.0, 0.0), prev[1], prev[2]]);
    }

    #[test]
    fn test_alpha_sums_to_one() {
        let dim = 2;
        let mut refs = ReferenceSet::from_volumes(dim, vec![vec![1.0; 8], vec![2.0; 8], vec![3.0; 8]]).unwrap();
        let mut acc = Accumulators::new(3, 8, false);
        acc.sumw = vec![0.5, 2.0, 1.5];
        for k in 0..3 {
            let h = acc.handle(k);
            acc.wsumweds.get_mut(h).iter_mut().for_each(|w| *w = acc.sumw[k]);
        }
        acc.n_images = 4;
        let mut ws = Fft3dWorkspace::cubic(dim);
        let update = maximization(&acc, &mut refs, 1.0, 2.0, &params(), &mut ws);
        assert!((update.alpha.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((update.alpha[1] - 0.5).abs() < 1e-12);
        assert_eq!(update.alpha, refs.alpha());
    }

    #[test]
    fn test_zero_mass_reference_is_kept() {
        let dim = 2;
        let original = vec![0.25; 8];
        let mut refs = ReferenceSet::from_volumes(dim, vec![original.clone(), vec![1.0; 8]]).unwrap();
        let mut acc = Accumulators::new(2, 8, false);
        acc.sumw = vec![0.0, 1.0];
        let h = acc.handle(1);
        acc.wsumweds.get_mut(h).iter_mut().for_each(|w| *w = 1.0);
        acc.n_images = 1;
        let mut ws = Fft3dWorkspace::cubic(dim);
        let update = maximization(&acc, &mut refs, 1.0, 2.0, &params(), &mut ws);
        assert_eq!(refs.real(0), original.as_slice());
        assert!(refs.real(1).iter().all(|v| v.abs() < 1e-12));
        assert_eq!(update.alpha, vec![0.0, 1.0]);
    }

    #[test]
    fn test_sigma_updates_and_fix_flags() {
        let dim = 2;
        let mut refs = ReferenceSet::from_volumes(dim, vec![vec![0.0; 8]]).unwrap();
        let mut acc = Accumulators::new(1, 8, false);
        acc.sumw = vec![2.0];
        acc.wsum_sigma_noise = 64.0;
        acc.observed_coefficients = 16.0;
        acc.wsum_sigma_offset = 36.0;
        acc.n_images = 2;
        let mut ws = Fft3dWorkspace::cubic(dim);

        let update = maximization(&acc, &mut refs, 1.0, 1.0, &params(), &mut ws);
        assert!((update.sigma_noise - 2.0).abs() < 1e-12);
        assert!((update.sigma_offset - 3.0).abs() < 1e-12);

        let fixed = MaximizationParams { fix_sigma_noise: true, fix_sigma_offset: true, ..params() };
        let update = maximization(&acc, &mut refs, 1.0, 1.0, &fixed, &mut ws);
        assert_eq!((update.sigma_noise, update.sigma_offset), (1.0, 1.0));

        let cc = MaximizationParams { mode: AlgorithmMode::MaxConstrainedCorrelation, ..params() };
        let update = maximization(&acc, &mut refs, 0.7, 0.3, &cc, &mut ws);
        assert_eq!((update.sigma_noise, update.sigma_offset), (0.7, 0.3));
    }

    #[test]
    fn test_noimp_threshold_keeps_sparse_coefficients() {
        let dim = 2;
        let mut refs = ReferenceSet::from_volumes(dim, vec![vec![1.0; 8]]).unwrap();
        let before = refs.fourier(0).to_vec();
        let mut acc = Accumulators::new(1, 8, false);
        acc.sumw = vec![10.0];
        // every coefficient covered by a tenth of the mass
        let h = acc.handle(0);
        acc.wsumweds.get_mut(h).iter_mut().for_each(|w| *w = 1.0);
        acc.n_images = 10;
        let mut ws = Fft3dWorkspace::cubic(dim);
        let p = MaximizationParams { imputation: ImputationPolicy::Divide { noimp_threshold: 0.2 }, ..params() };
        maximization(&acc, &mut refs, 1.0, 1.0, &p, &mut ws);
        assert_eq!(refs.fourier(0), before.as_slice());
    }
}
