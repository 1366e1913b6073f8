//! Prior over integer offsets
//!
//! Offsets are searched on the cube `[-max_shift, max_shift]³` with an
//! isotropic Gaussian prior of width `sigma_offset`, renormalized over the
//! grid. The grid is rebuilt whenever `sigma_offset` is re-estimated.

use log::debug;

/// Gaussian-weighted discrete offset grid
#[derive(Clone, Debug)]
pub struct TranslationPrior {
    offsets: Vec<[i64; 3]>,
    weights: Vec<f64>,
    max_shift: usize,
    sigma: f64,
}

impl TranslationPrior {
    /// Build the grid and its normalized weights
    ///
    /// `sigma_offset == 0` or `max_shift == 0` collapses the grid to the
    /// zero offset.
    pub fn new(max_shift: usize, sigma_offset: f64) -> Self {
        if max_shift == 0 || sigma_offset <= 0.0 {
            return Self {
                offsets: vec![[0, 0, 0]],
                weights: vec![1.0],
                max_shift: 0,
                sigma: sigma_offset.max(0.0),
            };
        }

        let r = max_shift as i64;
        let two_sigma2 = 2.0 * sigma_offset * sigma_offset;
        let mut offsets = Vec::with_capacity((2 * max_shift + 1).pow(3));
        let mut weights = Vec::with_capacity(offsets.capacity());

        for z in -r..=r {
            for y in -r..=r {
                for x in -r..=r {
                    let r2 = (x * x + y * y + z * z) as f64;
                    offsets.push([x, y, z]);
                    weights.push((-r2 / two_sigma2).exp());
                }
            }
        }

        let total: f64 = weights.iter().sum();
        for w in weights.iter_mut() {
            *w /= total;
        }

        debug!(
            "translation prior: {} offsets within +-{} voxels, sigma_offset={:.3}",
            offsets.len(), max_shift, sigma_offset
        );

        Self { offsets, weights, max_shift, sigma: sigma_offset }
    }

    /// Prior mass of `offset` (zero off the grid)
    pub fn weight(&self, offset: [i64; 3]) -> f64 {
        let r = self.max_shift as i64;
        if offset.iter().any(|&c| c.abs() > r) {
            return 0.0;
        }
        let side = 2 * r + 1;
        let idx = (offset[0] + r) + (offset[1] + r) * side + (offset[2] + r) * side * side;
        self.weights[idx as usize]
    }

    #[inline]
    pub fn offsets(&self) -> &[[i64; 3]] {
        &self.offsets
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

/// Squared length of an offset
#[inline]
pub fn offset_norm2(o: [i64; 3]) -> f64 {
    (o[0] * o[0] + o[1] * o[1] + o[2] * o[2]) as f64
}
