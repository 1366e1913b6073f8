//! Precomputed observability masks
//!
//! Built single-threaded after the angular grid of an iteration is fixed and
//! shared read-only with all expectation workers.

use log::debug;

use super::{MissingRegionId, MissingRegionModel};
use crate::sampling::AngularSamplingGrid;
use crate::volume::{VolumeArena, VolumeHandle};

/// Masks for every (descriptor, grid entry) pair plus the descriptor-free mask
pub struct MaskCache {
    n_angles: usize,
    arena: VolumeArena<f64>,
    handles: Vec<VolumeHandle>,
}

impl MaskCache {
    /// Bytes needed to cache all masks of `model` over `grid`
    pub fn required_bytes(model: &MissingRegionModel, grid: &AngularSamplingGrid) -> usize {
        let voxels = model.dim().pow(3);
        (1 + model.len() * grid.len()) * voxels * std::mem::size_of::<f64>()
    }

    /// Precompute all masks, or `None` when they exceed `budget_bytes`
    pub fn build(
        model: &MissingRegionModel,
        grid: &AngularSamplingGrid,
        budget_bytes: usize,
    ) -> Option<Self> {
        let required = Self::required_bytes(model, grid);
        if required > budget_bytes {
            debug!(
                "mask cache skipped: {} descriptors x {} angles need {} bytes (budget {})",
                model.len(), grid.len(), required, budget_bytes
            );
            return None;
        }

        let voxels = model.dim().pow(3);
        let mut arena = VolumeArena::new(voxels);
        let mut handles = Vec::with_capacity(1 + model.len() * grid.len());
        let mut buf = vec![0.0; voxels];

        // Descriptor-free mask only depends on the resolution limit
        model.mask_into(None, &nalgebra::Matrix3::identity(), &mut buf);
        handles.push(arena.push(&buf));

        for id in 0..model.len() {
            for entry in grid.iter() {
                model.mask_into(Some(MissingRegionId(id)), &entry.matrix, &mut buf);
                handles.push(arena.push(&buf));
            }
        }

        debug!("mask cache built: {} masks, {} bytes", handles.len(), required);
        Some(Self { n_angles: grid.len(), arena, handles })
    }

    /// Cached mask of descriptor `id` at grid entry `angle_index`
    #[inline]
    pub fn get(&self, id: Option<MissingRegionId>, angle_index: usize) -> &[f64] {
        let slot = match id {
            None => 0,
            Some(id) => 1 + id.0 * self.n_angles + angle_index,
        };
        self.arena.get(self.handles[slot])
    }
}

/// Mask of (`id`, grid entry `angle_index`) from the cache when present,
/// otherwise evaluated into `scratch`
pub fn lookup_mask<'a>(
    model: &MissingRegionModel,
    cache: Option<&'a MaskCache>,
    grid: &AngularSamplingGrid,
    id: Option<MissingRegionId>,
    angle_index: usize,
    scratch: &'a mut [f64],
) -> &'a [f64] {
    match cache {
        Some(cache) => cache.get(id, angle_index),
        None => {
            model.mask_into(id, &grid.get(angle_index).matrix, scratch);
            scratch
        }
    }
}
