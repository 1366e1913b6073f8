//! Power-spectrum equalisation across tilt series
//!
//! Sub-volumes from different tilt series can differ in contrast and in how
//! their power falls off with frequency. The radially averaged power of each
//! series, taken over the coefficients that series observed, is rescaled
//! shell by shell to the average over all sub-volumes. Corner coefficients
//! beyond Nyquist join the outermost shell. The DC term is left alone so the
//! mean density is kept.

use log::debug;
use nalgebra::Matrix3;
use num_complex::Complex64;

use crate::fft::Fft3dWorkspace;
use crate::fsc::shell_indices;
use crate::missing::{MissingRegionId, MissingRegionModel};
use crate::volume::SubVolume;

/// Amplitude factors per tilt series and frequency shell
#[derive(Clone, Debug)]
pub struct SpectrumAdjustment {
    dim: usize,
    shells: Vec<usize>,
    /// `factors[series][shell]`; the last row holds untagged sub-volumes
    factors: Vec<Vec<f64>>,
}

impl SpectrumAdjustment {
    /// Measure the radial power of every series against the global average
    pub fn estimate(images: &[SubVolume], model: &MissingRegionModel) -> Self {
        let dim = model.dim();
        let voxels = dim * dim * dim;
        let n_shells = dim / 2 + 1;
        let n_series = model.len() + 1;
        let shells: Vec<usize> = shell_indices(dim).into_iter().map(|s| s.unwrap_or(n_shells - 1)).collect();
        let series = |id: Option<MissingRegionId>| id.map_or(n_series - 1, |id| id.0);

        let mut power = vec![vec![0.0; n_shells]; n_series];
        let mut count = vec![vec![0.0; n_shells]; n_series];
        let mut ws = Fft3dWorkspace::cubic(dim);
        let mut spectrum = vec![Complex64::new(0.0, 0.0); voxels];
        let mut mask = vec![0.0; voxels];

        for img in images {
            let s = series(img.missing_region);
            ws.forward_real(&img.data, &mut spectrum);
            model.mask_into(img.missing_region, &Matrix3::identity(), &mut mask);
            for (idx, &sh) in shells.iter().enumerate() {
                power[s][sh] += mask[idx] * spectrum[idx].norm_sqr();
                count[s][sh] += mask[idx];
            }
        }

        let global: Vec<f64> = (0..n_shells)
            .map(|sh| {
                let p: f64 = power.iter().map(|p| p[sh]).sum();
                let c: f64 = count.iter().map(|c| c[sh]).sum();
                if c > 0.0 { p / c } else { 0.0 }
            })
            .collect();

        let factors: Vec<Vec<f64>> = power
            .iter()
            .zip(&count)
            .map(|(p, c)| {
                (0..n_shells)
                    .map(|sh| {
                        if sh == 0 || c[sh] <= 0.0 || p[sh] <= 0.0 || global[sh] <= 0.0 {
                            1.0
                        } else {
                            (global[sh] * c[sh] / p[sh]).sqrt()
                        }
                    })
                    .collect()
            })
            .collect();

        for (s, f) in factors.iter().enumerate() {
            if count[s].iter().any(|&c| c > 0.0) {
                debug!("spectrum adjustment, series {}: factors {:?}", s, f);
            }
        }

        Self { dim, shells, factors }
    }

    /// Amplitude factor of series `id` at frequency shell `shell`
    pub fn factor(&self, id: Option<MissingRegionId>, shell: usize) -> f64 {
        self.factors[self.series(id)][shell]
    }

    fn series(&self, id: Option<MissingRegionId>) -> usize {
        id.map_or(self.factors.len() - 1, |id| id.0)
    }

    /// Rescale the spectrum of every sub-volume in place
    pub fn apply(&self, images: &mut [SubVolume]) {
        let voxels = self.dim * self.dim * self.dim;
        let mut ws = Fft3dWorkspace::cubic(self.dim);
        let mut spectrum = vec![Complex64::new(0.0, 0.0); voxels];
        let mut buf = vec![Complex64::new(0.0, 0.0); voxels];

        for img in images.iter_mut() {
            ws.forward_real(&img.data, &mut spectrum);
            let factors = &self.factors[self.series(img.missing_region)];
            for (c, &sh) in spectrum.iter_mut().zip(&self.shells) {
                *c *= factors[sh];
            }
            ws.inverse_real(&spectrum, &mut buf, &mut img.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::missing::{MissingRegionDescriptor, MissingRegionKind};

    fn zero_mean(dim: usize) -> Vec<f64> {
        let v: Vec<f64> = (0..dim * dim * dim).map(|i| ((i as f64) * 0.41).sin() + 0.3).collect();
        let mean = v.iter().sum::<f64>() / v.len() as f64;
        v.iter().map(|x| x - mean).collect()
    }

    fn open_cones(dim: usize) -> MissingRegionModel {
        MissingRegionModel::new(
            dim,
            MissingRegionKind::Cone,
            vec![MissingRegionDescriptor::Cone { theta_max: 90.0 }, MissingRegionDescriptor::Cone { theta_max: 90.0 }],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_series_contrast_is_equalised() {
        let dim = 6;
        let v = zero_mean(dim);
        let bright: Vec<f64> = v.iter().map(|x| 2.0 * x).collect();
        let mut images = vec![
            SubVolume::new(v.clone(), Some(MissingRegionId(0))),
            SubVolume::new(bright, Some(MissingRegionId(1))),
        ];
        let model = open_cones(dim);

        let adj = SpectrumAdjustment::estimate(&images, &model);
        assert!((adj.factor(Some(MissingRegionId(0)), 1) - 2.5f64.sqrt()).abs() < 1e-10);
        assert!((adj.factor(Some(MissingRegionId(1)), 1) - 0.625f64.sqrt()).abs() < 1e-10);
        assert_eq!(adj.factor(Some(MissingRegionId(0)), 0), 1.0);

        adj.apply(&mut images);
        for (i, (a, b)) in images[0].data.iter().zip(&images[1].data).enumerate() {
            assert!((a - b).abs() < 1e-9, "voxel {}: {} vs {}", i, a, b);
        }
    }

    #[test]
    fn test_matching_series_are_untouched() {
        let dim = 4;
        let v = zero_mean(dim);
        let mut images = vec![
            SubVolume::new(v.clone(), Some(MissingRegionId(0))),
            SubVolume::new(v.clone(), Some(MissingRegionId(1))),
        ];
        let adj = SpectrumAdjustment::estimate(&images, &open_cones(dim));
        adj.apply(&mut images);
        for img in &images {
            for (a, b) in img.data.iter().zip(&v) {
                assert!((a - b).abs() < 1e-10);
            }
        }
    }
}
