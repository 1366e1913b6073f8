//! Per-worker partial sums of the expectation step
//!
//! Each worker owns one [`Accumulators`] and writes to nothing else while an
//! expectation pass is live. After the barrier the partials are combined by
//! [`reduce_partials`] into the global sums the maximization step reads.

use num_complex::Complex64;

use crate::simd_ops::axpy;
use crate::volume::{Assignment, VolumeArena, VolumeHandle};

/// Weighted image and coverage sums of one half of the data set
#[derive(Clone, Debug)]
pub struct HalfSums {
    pub wsumimgs: VolumeArena<Complex64>,
    pub wsumweds: VolumeArena<f64>,
}

impl HalfSums {
    fn new(nr_ref: usize, voxels: usize) -> Self {
        Self {
            wsumimgs: VolumeArena::filled(voxels, nr_ref, Complex64::new(0.0, 0.0)),
            wsumweds: VolumeArena::filled(voxels, nr_ref, 0.0),
        }
    }

    fn add(&mut self, other: &HalfSums) {
        self.wsumimgs.add_assign(&other.wsumimgs);
        self.wsumweds.add_assign(&other.wsumweds);
    }
}

/// Sufficient statistics gathered over a set of sub-volumes
#[derive(Clone, Debug)]
pub struct Accumulators {
    /// Weighted, un-shifted image spectra per reference
    pub wsumimgs: VolumeArena<Complex64>,
    /// Weighted coverage per reference
    pub wsumweds: VolumeArena<f64>,
    /// Total weight mass per reference
    pub sumw: Vec<f64>,
    pub wsum_sigma_noise: f64,
    pub wsum_sigma_offset: f64,
    /// Weighted count of observed Fourier coefficients entering `wsum_sigma_noise`
    pub observed_coefficients: f64,
    /// Log-likelihood (ML) or summed best correlation (maxCC)
    pub ll: f64,
    pub sumfracweight: f64,
    /// Number of sub-volumes folded in
    pub n_images: usize,
    /// Even / odd image sums, kept when FSC filtering is requested
    pub halves: Option<[HalfSums; 2]>,
}

impl Accumulators {
    /// Zeroed sums for `nr_ref` references of `voxels` coefficients
    pub fn new(nr_ref: usize, voxels: usize, track_halves: bool) -> Self {
        Self {
            wsumimgs: VolumeArena::filled(voxels, nr_ref, Complex64::new(0.0, 0.0)),
            wsumweds: VolumeArena::filled(voxels, nr_ref, 0.0),
            sumw: vec![0.0; nr_ref],
            wsum_sigma_noise: 0.0,
            wsum_sigma_offset: 0.0,
            observed_coefficients: 0.0,
            ll: 0.0,
            sumfracweight: 0.0,
            n_images: 0,
            halves: track_halves.then(|| [HalfSums::new(nr_ref, voxels), HalfSums::new(nr_ref, voxels)]),
        }
    }

    #[inline]
    pub fn nr_ref(&self) -> usize {
        self.sumw.len()
    }

    /// Handle of reference `k` in the per-reference arenas
    #[inline]
    pub fn handle(&self, k: usize) -> VolumeHandle {
        self.wsumimgs.handle(k)
    }

    #[inline]
    pub fn wsumimg(&self, k: usize) -> &[Complex64] {
        self.wsumimgs.get(self.handle(k))
    }

    #[inline]
    pub fn wsumwed(&self, k: usize) -> &[f64] {
        self.wsumweds.get(self.handle(k))
    }

    /// Fold one weighted contribution of image `image_index` into reference `k`
    ///
    /// # Arguments
    /// * `weighted_image` - Un-shifted spectrum already multiplied by weight and mask
    /// * `weighted_mask` - Coverage added for every coefficient
    /// * `weight` - Scalar weight mass of the contribution
    /// * `sigma_contribution` - Weighted squared difference for the noise estimate
    pub fn accumulate(
        &mut self,
        k: usize,
        image_index: usize,
        weighted_image: &[Complex64],
        weighted_mask: &[f64],
        weight: f64,
        sigma_contribution: f64,
    ) {
        let h = self.handle(k);
        for (a, &b) in self.wsumimgs.get_mut(h).iter_mut().zip(weighted_image) {
            *a += b;
        }
        axpy(self.wsumweds.get_mut(h), 1.0, weighted_mask);
        if let Some(halves) = self.halves.as_mut() {
            let half = &mut halves[image_index % 2];
            for (a, &b) in half.wsumimgs.get_mut(h).iter_mut().zip(weighted_image) {
                *a += b;
            }
            axpy(half.wsumweds.get_mut(h), 1.0, weighted_mask);
        }
        self.sumw[k] += weight;
        self.wsum_sigma_noise += sigma_contribution;
    }

    /// Add another partial into this one
    pub fn merge(&mut self, other: &Accumulators) {
        self.wsumimgs.add_assign(&other.wsumimgs);
        self.wsumweds.add_assign(&other.wsumweds);
        for (a, b) in self.sumw.iter_mut().zip(&other.sumw) {
            *a += b;
        }
        self.wsum_sigma_noise += other.wsum_sigma_noise;
        self.wsum_sigma_offset += other.wsum_sigma_offset;
        self.observed_coefficients += other.observed_coefficients;
        self.ll += other.ll;
        self.sumfracweight += other.sumfracweight;
        self.n_images += other.n_images;
        if let (Some(mine), Some(theirs)) = (self.halves.as_mut(), other.halves.as_ref()) {
            mine[0].add(&theirs[0]);
            mine[1].add(&theirs[1]);
        }
    }

    /// Total weight mass over all references
    pub fn sumw_allrefs(&self) -> f64 {
        self.sumw.iter().sum()
    }
}

/// Output of one worker: its sums plus the assignments of its partition in
/// image order
#[derive(Clone, Debug)]
pub struct PartialResult {
    pub acc: Accumulators,
    pub assignments: Vec<Assignment>,
}

/// Sum worker partials in partition order
///
/// Pure: the result depends only on the sequence of partials. Returns `None`
/// for an empty sequence.
pub fn reduce_partials(partials: Vec<PartialResult>) -> Option<PartialResult> {
    let mut iter = partials.into_iter();
    let mut total = iter.next()?;
    for p in iter {
        total.acc.merge(&p.acc);
        total.assignments.extend(p.assignments);
    }
    Some(total)
}
