//! Reference volumes and mixture weights
//!
//! Each reference is kept both in real space and as its unshifted 3D
//! spectrum; the spectrum is what the expectation step compares against.
//! Both views live in volume arenas and are only mutated between
//! expectation passes.

use log::debug;
use nalgebra::Matrix3;
use num_complex::Complex64;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};
use crate::fft::{phase_shift_inplace, Fft3dWorkspace};
use crate::geometry::rotate_volume;
use crate::missing::MissingRegionModel;
use crate::volume::{SubVolume, VolumeArena, VolumeHandle};

/// Coverage below which a Fourier coefficient counts as unobserved
pub const COVERAGE_EPS: f64 = 1e-10;

/// Current class averages
#[derive(Clone, Debug)]
pub struct ReferenceSet {
    dim: usize,
    real: VolumeArena<f64>,
    fourier: VolumeArena<Complex64>,
    handles: Vec<VolumeHandle>,
    alpha: Vec<f64>,
}

impl ReferenceSet {
    /// Take ownership of supplied reference volumes, with uniform fractions
    pub fn from_volumes(dim: usize, volumes: Vec<Vec<f64>>) -> Result<Self> {
        if volumes.is_empty() {
            return Err(Error::NoReferences);
        }
        let voxels = dim * dim * dim;
        let mut ws = Fft3dWorkspace::cubic(dim);
        let mut real = VolumeArena::new(voxels);
        let mut fourier = VolumeArena::new(voxels);
        let mut handles = Vec::with_capacity(volumes.len());
        let mut spectrum = vec![Complex64::new(0.0, 0.0); voxels];

        for (index, vol) in volumes.iter().enumerate() {
            if vol.len() != voxels {
                return Err(Error::DimensionMismatch { index, dim, expected: voxels, got: vol.len() });
            }
            ws.forward_real(vol, &mut spectrum);
            let h = real.push(vol);
            let hf = fourier.push(&spectrum);
            debug_assert_eq!(h, hf);
            handles.push(h);
        }

        let n = volumes.len();
        Ok(Self {
            dim,
            real,
            fourier,
            handles,
            alpha: vec![1.0 / n as f64; n],
        })
    }

    /// Random subset averages of the input sub-volumes
    ///
    /// Images are shuffled and split into `nr_ref` contiguous groups. Each
    /// group is averaged in Fourier space over the coefficients its members
    /// observe. With `keep_angles`, images carrying a prior assignment are
    /// first moved back into the reference frame.
    pub fn from_random_subsets<R: Rng>(
        images: &[SubVolume],
        nr_ref: usize,
        model: &MissingRegionModel,
        keep_angles: bool,
        rng: &mut R,
    ) -> Result<Self> {
        if nr_ref == 0 {
            return Err(Error::NoReferences);
        }
        if images.len() < nr_ref {
            return Err(Error::invalid_parameter(
                "nr_ref",
                nr_ref,
                format!("cannot draw {} subsets from {} sub-volumes", nr_ref, images.len()),
            ));
        }

        let dim = model.dim();
        let voxels = dim * dim * dim;
        let mut order: Vec<usize> = (0..images.len()).collect();
        order.shuffle(rng);

        let mut ws = Fft3dWorkspace::cubic(dim);
        let mut rotated = vec![0.0; voxels];
        let mut spectrum = vec![Complex64::new(0.0, 0.0); voxels];
        let mut mask = vec![0.0; voxels];
        let mut buf = vec![Complex64::new(0.0, 0.0); voxels];
        let mut volumes = Vec::with_capacity(nr_ref);

        let per_ref = images.len() / nr_ref;
        let extra = images.len() % nr_ref;
        let mut start = 0;
        for k in 0..nr_ref {
            let len = per_ref + usize::from(k < extra);
            let members = &order[start..start + len];
            start += len;

            let mut sum = vec![Complex64::new(0.0, 0.0); voxels];
            let mut coverage = vec![0.0; voxels];
            for &i in members {
                let img = &images[i];
                let (rot, offset) = match (&img.prior, keep_angles) {
                    (Some(p), true) => (p.angle.matrix, p.offset),
                    _ => (Matrix3::identity(), [0, 0, 0]),
                };
                rotate_volume(&img.data, dim, &rot.transpose(), &mut rotated);
                ws.forward_real(&rotated, &mut spectrum);
                phase_shift_inplace(&mut spectrum, dim, [-offset[0], -offset[1], -offset[2]]);
                model.mask_into(img.missing_region, &rot, &mut mask);
                for v in 0..voxels {
                    sum[v] += spectrum[v] * mask[v];
                    coverage[v] += mask[v];
                }
            }

            for v in 0..voxels {
                sum[v] = if coverage[v] > COVERAGE_EPS { sum[v] / coverage[v] } else { Complex64::new(0.0, 0.0) };
            }
            let mut vol = vec![0.0; voxels];
            ws.inverse_real(&sum, &mut buf, &mut vol);
            debug!("initial reference {}: averaged {} random sub-volumes", k, members.len());
            volumes.push(vol);
        }

        Self::from_volumes(dim, volumes)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Real-space view of reference `k`
    #[inline]
    pub fn real(&self, k: usize) -> &[f64] {
        self.real.get(self.handles[k])
    }

    /// Spectrum of reference `k`
    #[inline]
    pub fn fourier(&self, k: usize) -> &[Complex64] {
        self.fourier.get(self.handles[k])
    }

    /// Mixture weights, summing to one
    #[inline]
    pub fn alpha(&self) -> &[f64] {
        &self.alpha
    }

    pub fn set_alpha(&mut self, alpha: Vec<f64>) {
        debug_assert_eq!(alpha.len(), self.len());
        self.alpha = alpha;
    }

    /// Install a new spectrum for reference `k` and refresh its real view
    pub fn replace(&mut self, k: usize, spectrum: &[Complex64], ws: &mut Fft3dWorkspace) {
        let h = self.handles[k];
        self.fourier.get_mut(h).copy_from_slice(spectrum);
        let mut buf = spectrum.to_vec();
        ws.inverse_real(spectrum, &mut buf, self.real.get_mut(h));
    }

    /// Install a new real-space volume for reference `k` and refresh its spectrum
    pub fn replace_real(&mut self, k: usize, volume: &[f64], ws: &mut Fft3dWorkspace) {
        let h = self.handles[k];
        self.real.get_mut(h).copy_from_slice(volume);
        ws.forward_real(volume, self.fourier.get_mut(h));
    }

    /// Copies of all real-space references
    pub fn real_volumes(&self) -> Vec<Vec<f64>> {
        self.handles.iter().map(|&h| self.real.get(h).to_vec()).collect()
    }
}
