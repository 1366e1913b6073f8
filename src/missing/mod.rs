//! Frequency-domain observability of sub-volumes
//!
//! [`MissingRegionModel`] owns the descriptor table of a run and turns a
//! (descriptor, orientation) pair into a mask over the unshifted Fourier grid.
//! Masks live in the reference frame: a reference frequency `k` is observed
//! when the image-frame frequency `A k` was sampled.
//!
//! [`MaskCache`] precomputes all masks for the current angular grid when they
//! fit in memory; otherwise masks are evaluated on the fly.

pub mod cache;
pub mod region;

pub use cache::MaskCache;
pub use region::{MissingRegionDescriptor, MissingRegionId, MissingRegionKind};

use nalgebra::{Matrix3, Vector3};

use crate::error::{Error, Result};
use crate::fft::{fftfreq, idx3d};

/// Descriptor table plus the Fourier grid they are evaluated on
#[derive(Clone, Debug)]
pub struct MissingRegionModel {
    dim: usize,
    kind: MissingRegionKind,
    descriptors: Vec<MissingRegionDescriptor>,
    freq: Vec<f64>,
    max_resolution: Option<f64>,
}

impl MissingRegionModel {
    /// Build and validate the descriptor table
    ///
    /// # Arguments
    /// * `dim` - Edge of the cubic volumes
    /// * `kind` - Kind every descriptor must have
    /// * `descriptors` - One entry per tilt series, addressed by `MissingRegionId(i)`
    /// * `max_resolution` - Digital frequency beyond which nothing counts as observed
    pub fn new(
        dim: usize,
        kind: MissingRegionKind,
        descriptors: Vec<MissingRegionDescriptor>,
        max_resolution: Option<f64>,
    ) -> Result<Self> {
        if kind == MissingRegionKind::None && !descriptors.is_empty() {
            return Err(Error::MissingRegionKindMismatch {
                id: 0,
                expected: kind.to_string(),
                found: descriptors[0].kind().to_string(),
            });
        }
        for (id, desc) in descriptors.iter().enumerate() {
            desc.validate(id)?;
            if desc.kind() != kind {
                return Err(Error::MissingRegionKindMismatch {
                    id,
                    expected: kind.to_string(),
                    found: desc.kind().to_string(),
                });
            }
        }

        Ok(Self {
            dim,
            kind,
            descriptors,
            freq: fftfreq(dim, 1.0),
            max_resolution,
        })
    }

    /// Model with full coverage everywhere
    pub fn full_coverage(dim: usize) -> Self {
        Self {
            dim,
            kind: MissingRegionKind::None,
            descriptors: Vec::new(),
            freq: fftfreq(dim, 1.0),
            max_resolution: None,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn kind(&self) -> MissingRegionKind {
        self.kind
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptor(&self, id: MissingRegionId) -> Option<&MissingRegionDescriptor> {
        self.descriptors.get(id.0)
    }

    /// Error unless `id` (used by sub-volume `image`) is in the table
    pub fn check_id(&self, image: usize, id: Option<MissingRegionId>) -> Result<()> {
        match id {
            Some(id) if id.0 >= self.descriptors.len() => {
                Err(Error::UnknownMissingRegion { image, id: id.0 })
            }
            _ => Ok(()),
        }
    }

    /// Observability mask in the reference frame for orientation `rot`
    pub fn mask(&self, id: Option<MissingRegionId>, rot: &Matrix3<f64>) -> Vec<f64> {
        let mut out = vec![0.0; self.dim * self.dim * self.dim];
        self.mask_into(id, rot, &mut out);
        out
    }

    /// Same as [`mask`](Self::mask), writing into `out` (dim³)
    pub fn mask_into(&self, id: Option<MissingRegionId>, rot: &Matrix3<f64>, out: &mut [f64]) {
        let n = self.dim;
        let desc = id.and_then(|id| self.descriptors.get(id.0));
        let res2 = self.max_resolution.map(|r| r * r);

        for k in 0..n {
            let fz = self.freq[k];
            for j in 0..n {
                let fy = self.freq[j];
                for i in 0..n {
                    let idx = idx3d(i, j, k, n, n);
                    // Copy from the -k partner so the mask stays Hermitian,
                    // including on the Nyquist planes
                    let partner = idx3d((n - i) % n, (n - j) % n, (n - k) % n, n, n);
                    if partner < idx {
                        out[idx] = out[partner];
                        continue;
                    }

                    let f = Vector3::new(self.freq[i], fy, fz);
                    let within = res2.map_or(true, |r2| f.norm_squared() <= r2);
                    let observed = within && desc.map_or(true, |d| d.observes(&(rot * f)));
                    out[idx] = if observed { 1.0 } else { 0.0 };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::euler_to_matrix;

    fn wedge_model(dim: usize) -> MissingRegionModel {
        MissingRegionModel::new(
            dim,
            MissingRegionKind::Wedge,
            vec![MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 }],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_no_descriptor_is_full_coverage() {
        let model = MissingRegionModel::full_coverage(6);
        let mask = model.mask(None, &Matrix3::identity());
        assert!(mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn test_mask_is_idempotent() {
        let model = wedge_model(8);
        let rot = euler_to_matrix(20.0, 40.0, 70.0);
        let a = model.mask(Some(MissingRegionId(0)), &rot);
        let b = model.mask(Some(MissingRegionId(0)), &rot);
        assert_eq!(a, b);
    }

    #[test]
    fn test_wedge_mask_is_hermitian() {
        let n = 8;
        let model = wedge_model(n);
        let mask = model.mask(Some(MissingRegionId(0)), &euler_to_matrix(10.0, 35.0, -20.0));
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let a = mask[idx3d(i, j, k, n, n)];
                    let b = mask[idx3d((n - i) % n, (n - j) % n, (n - k) % n, n, n)];
                    assert_eq!(a, b, "mask not symmetric at ({}, {}, {})", i, j, k);
                }
            }
        }
    }

    #[test]
    fn test_wedge_removes_kz_axis() {
        let n = 8;
        let model = wedge_model(n);
        let mask = model.mask(Some(MissingRegionId(0)), &Matrix3::identity());
        assert_eq!(mask[idx3d(0, 0, 2, n, n)], 0.0);
        assert_eq!(mask[idx3d(2, 0, 0, n, n)], 1.0);
        assert_eq!(mask[0], 1.0);
    }

    #[test]
    fn test_max_resolution_cuts_corners() {
        let n = 8;
        let model = MissingRegionModel::new(n, MissingRegionKind::None, vec![], Some(0.25)).unwrap();
        let mask = model.mask(None, &Matrix3::identity());
        assert_eq!(mask[idx3d(2, 0, 0, n, n)], 1.0);
        assert_eq!(mask[idx3d(3, 0, 0, n, n)], 0.0);
        assert_eq!(mask[idx3d(2, 2, 0, n, n)], 0.0);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let err = MissingRegionModel::new(
            4,
            MissingRegionKind::Cone,
            vec![MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 }],
            None,
        );
        assert!(matches!(err, Err(Error::MissingRegionKindMismatch { id: 0, .. })));

        let err = MissingRegionModel::new(
            4,
            MissingRegionKind::None,
            vec![MissingRegionDescriptor::Cone { theta_max: 60.0 }],
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_id() {
        let model = wedge_model(4);
        assert!(model.check_id(0, Some(MissingRegionId(0))).is_ok());
        assert!(model.check_id(0, None).is_ok());
        assert!(matches!(
            model.check_id(7, Some(MissingRegionId(3))),
            Err(Error::UnknownMissingRegion { image: 7, id: 3 })
        ));
    }
}
