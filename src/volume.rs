//! Sub-volumes and the fixed-size volume arena
//!
//! Every volume in a run is a cube of edge `dim`, stored flat in Fortran
//! order. Long-lived collections of such volumes (references, cached masks)
//! live in a [`VolumeArena`] and are addressed by [`VolumeHandle`]s.

use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::missing::MissingRegionId;
use crate::sampling::AngleEntry;

/// Stable index of a volume slot inside a [`VolumeArena`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeHandle(usize);

impl VolumeHandle {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Contiguous storage of equally sized volumes
#[derive(Clone, Debug)]
pub struct VolumeArena<T> {
    voxels: usize,
    data: Vec<T>,
}

impl<T: Clone> VolumeArena<T> {
    /// Empty arena for volumes of `voxels` elements each
    pub fn new(voxels: usize) -> Self {
        Self { voxels, data: Vec::new() }
    }

    /// Arena holding `count` copies of `fill`
    pub fn filled(voxels: usize, count: usize, fill: T) -> Self {
        Self { voxels, data: vec![fill; voxels * count] }
    }

    /// Append a volume and return its handle
    ///
    /// Panics if `volume` does not have the arena's slot size.
    pub fn push(&mut self, volume: &[T]) -> VolumeHandle {
        assert_eq!(volume.len(), self.voxels, "volume size does not match arena slot");
        let handle = VolumeHandle(self.len());
        self.data.extend_from_slice(volume);
        handle
    }

    #[inline]
    pub fn get(&self, handle: VolumeHandle) -> &[T] {
        let start = handle.0 * self.voxels;
        &self.data[start..start + self.voxels]
    }

    #[inline]
    pub fn get_mut(&mut self, handle: VolumeHandle) -> &mut [T] {
        let start = handle.0 * self.voxels;
        &mut self.data[start..start + self.voxels]
    }

    /// Number of volumes stored
    #[inline]
    pub fn len(&self) -> usize {
        if self.voxels == 0 { 0 } else { self.data.len() / self.voxels }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn voxels(&self) -> usize {
        self.voxels
    }

    /// Handle of the `index`-th slot
    #[inline]
    pub fn handle(&self, index: usize) -> VolumeHandle {
        assert!(index < self.len(), "slot {} out of range", index);
        VolumeHandle(index)
    }

    pub fn handles(&self) -> impl Iterator<Item = VolumeHandle> {
        (0..self.len()).map(VolumeHandle)
    }

    /// Iterate over all slots in handle order
    pub fn iter(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks(self.voxels.max(1))
    }
}

impl<T: Copy + AddAssign> VolumeArena<T> {
    /// Element-wise `self += other` over all slots
    pub fn add_assign(&mut self, other: &Self) {
        assert_eq!(self.data.len(), other.data.len(), "arena layouts differ");
        for (a, &b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }
}

/// Best hidden-variable assignment of one sub-volume
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    /// Reference class
    pub ref_id: usize,
    /// Orientation (the angle itself, so it survives grid perturbation)
    pub angle: AngleEntry,
    /// Integer offset in voxels (x, y, z)
    pub offset: [i64; 3],
    /// Share of the image's weight mass carried by the best candidate
    pub fracweight: f64,
    /// Log-likelihood contribution (ML) or constrained correlation (maxCC)
    pub score: f64,
}

/// One observed sub-tomogram
#[derive(Clone, Debug)]
pub struct SubVolume {
    /// Density, dim³ voxels in Fortran order
    pub data: Vec<f64>,
    /// Missing-region descriptor, `None` for full coverage
    pub missing_region: Option<MissingRegionId>,
    /// Assignment from a previous iteration, seeds the local search
    pub prior: Option<Assignment>,
}

impl SubVolume {
    pub fn new(data: Vec<f64>, missing_region: Option<MissingRegionId>) -> Self {
        Self { data, missing_region, prior: None }
    }

    pub fn with_prior(mut self, prior: Assignment) -> Self {
        self.prior = Some(prior);
        self
    }
}

/// Edge length of a cubic volume of `voxels` elements
pub fn cube_edge(voxels: usize) -> Option<usize> {
    let dim = (voxels as f64).cbrt().round() as usize;
    (dim > 0 && dim * dim * dim == voxels).then_some(dim)
}

/// Check that all sub-volumes are cubes of the same edge and return it
pub fn common_dim(images: &[SubVolume]) -> Result<usize> {
    let first = images.first().ok_or(Error::EmptyImageSet)?;
    let dim = cube_edge(first.data.len()).ok_or(Error::DimensionMismatch {
        index: 0,
        dim: 0,
        expected: 0,
        got: first.data.len(),
    })?;
    let expected = dim * dim * dim;
    for (index, img) in images.iter().enumerate() {
        if img.data.len() != expected {
            return Err(Error::DimensionMismatch { index, dim, expected, got: img.data.len() });
        }
    }
    Ok(dim)
}
