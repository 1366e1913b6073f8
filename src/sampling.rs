//! Discrete orientation search set
//!
//! Directions (rot, tilt) are laid out on tilt rings with a rot spacing that
//! shrinks with `sin(tilt)`, giving roughly uniform coverage of the sphere.
//! Every direction is combined with a full psi circle. Cyclic symmetry `Cn`
//! restricts rot to `[0, 360/n)`.

use nalgebra::Matrix3;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Symmetry;
use crate::geometry::{angular_distance, euler_to_matrix};

/// Extra radius (degrees) added to the local search window
pub const SMALLANGLE: f64 = 2.75;

/// One orientation of the search set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AngleEntry {
    pub rot: f64,
    pub tilt: f64,
    pub psi: f64,
    /// Index of the (rot, tilt) projection direction this entry belongs to
    pub direction: usize,
    /// Rotation matrix of (rot, tilt, psi)
    pub matrix: Matrix3<f64>,
}

impl AngleEntry {
    pub fn new(rot: f64, tilt: f64, psi: f64, direction: usize) -> Self {
        Self {
            rot,
            tilt,
            psi,
            direction,
            matrix: euler_to_matrix(rot, tilt, psi),
        }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 0)
    }
}

/// Ordered orientation set of one iteration
#[derive(Clone, Debug)]
pub struct AngularSamplingGrid {
    entries: Vec<AngleEntry>,
    step: f64,
    psi_step: f64,
    symmetry: Symmetry,
}

impl AngularSamplingGrid {
    /// Generate the full grid
    ///
    /// # Arguments
    /// * `step` - rot/tilt spacing in degrees
    /// * `psi_step` - psi spacing in degrees
    /// * `symmetry` - Cyclic symmetry restricting rot
    /// * `tilt_range` - [min, max] tilt in degrees
    pub fn generate(step: f64, psi_step: f64, symmetry: Symmetry, tilt_range: [f64; 2]) -> Self {
        let [t0, tf] = tilt_range;
        let rot_range = 360.0 / symmetry.order().max(1) as f64;
        let n_tilt = ((tf - t0) / step + 1e-9).floor() as usize;
        let n_psi = ((360.0 / psi_step).round() as usize).max(1);

        let mut entries = Vec::new();
        let mut direction = 0;
        for it in 0..=n_tilt {
            let tilt = t0 + it as f64 * step;
            let sin_tilt = tilt.to_radians().sin();
            let n_rot = if sin_tilt.abs() < 1e-6 {
                1
            } else {
                ((rot_range * sin_tilt / step).round() as usize).max(1)
            };
            for ir in 0..n_rot {
                let rot = ir as f64 * rot_range / n_rot as f64;
                for ip in 0..n_psi {
                    let psi = ip as f64 * 360.0 / n_psi as f64;
                    entries.push(AngleEntry::new(rot, tilt, psi, direction));
                }
                direction += 1;
            }
        }

        Self { entries, step, psi_step, symmetry }
    }

    /// Grid made of explicit orientations
    pub fn from_entries(entries: Vec<AngleEntry>, step: f64) -> Self {
        Self {
            entries,
            step,
            psi_step: step,
            symmetry: Symmetry::C1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> &AngleEntry {
        &self.entries[index]
    }

    pub fn entries(&self) -> &[AngleEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &AngleEntry> {
        self.entries.iter()
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Copy of the grid with every angle shifted by one random fraction of
    /// the sampling step
    pub fn perturbed<R: Rng>(&self, rng: &mut R) -> Self {
        let d_rot = rng.gen_range(-0.5..0.5) * self.step;
        let d_tilt = rng.gen_range(-0.5..0.5) * self.step;
        let d_psi = rng.gen_range(-0.5..0.5) * self.psi_step;

        let entries = self
            .entries
            .iter()
            .map(|e| AngleEntry::new(e.rot + d_rot, e.tilt + d_tilt, e.psi + d_psi, e.direction))
            .collect();

        Self {
            entries,
            step: self.step,
            psi_step: self.psi_step,
            symmetry: self.symmetry,
        }
    }

    /// Indices of entries within `radius` degrees of `prior`, symmetry-aware
    pub fn local(&self, prior: &AngleEntry, radius: f64) -> Vec<usize> {
        let order = self.symmetry.order().max(1);
        let sym_ops: Vec<Matrix3<f64>> = (0..order)
            .map(|k| euler_to_matrix(k as f64 * 360.0 / order as f64, 0.0, 0.0))
            .collect();

        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                sym_ops
                    .iter()
                    .any(|s| angular_distance(&prior.matrix, &(e.matrix * s)) <= radius)
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Index of the entry closest to `angle`
    pub fn nearest(&self, angle: &AngleEntry) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, angular_distance(&angle.matrix, &e.matrix)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generate_counts() {
        let grid = AngularSamplingGrid::generate(90.0, 90.0, Symmetry::C1, [0.0, 180.0]);
        // tilt 0: 1 rot, tilt 90: 4 rot, tilt 180: 1 rot; 4 psi each
        assert_eq!(grid.len(), (1 + 4 + 1) * 4);
        assert_eq!(grid.get(0).tilt, 0.0);
        assert_eq!(grid.iter().map(|e| e.direction).max(), Some(5));
    }

    #[test]
    fn test_generate_is_restartable() {
        let a = AngularSamplingGrid::generate(30.0, 45.0, Symmetry::C1, [0.0, 180.0]);
        let b = AngularSamplingGrid::generate(30.0, 45.0, Symmetry::C1, [0.0, 180.0]);
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn test_cyclic_symmetry_restricts_rot() {
        let grid = AngularSamplingGrid::generate(20.0, 90.0, Symmetry::Cyclic(4), [0.0, 180.0]);
        assert!(grid.iter().all(|e| e.rot < 90.0));
        let full = AngularSamplingGrid::generate(20.0, 90.0, Symmetry::C1, [0.0, 180.0]);
        assert!(grid.len() < full.len());
    }

    #[test]
    fn test_local_neighbourhood() {
        let grid = AngularSamplingGrid::generate(15.0, 15.0, Symmetry::C1, [0.0, 180.0]);
        let prior = grid.get(grid.len() / 2).clone();
        let local = grid.local(&prior, 20.0);
        assert!(!local.is_empty());
        assert!(local.len() < grid.len());
        for &i in &local {
            assert!(angular_distance(&prior.matrix, &grid.get(i).matrix) <= 20.0);
        }
        assert_eq!(grid.nearest(&prior).map(|i| grid.get(i).clone()), Some(prior));
    }

    #[test]
    fn test_perturbation_is_bounded() {
        let grid = AngularSamplingGrid::generate(30.0, 30.0, Symmetry::C1, [0.0, 180.0]);
        let mut rng = StdRng::seed_from_u64(7);
        let moved = grid.perturbed(&mut rng);
        assert_eq!(moved.len(), grid.len());
        for (a, b) in grid.iter().zip(moved.iter()) {
            assert!((a.rot - b.rot).abs() <= 15.0);
            assert!((a.tilt - b.tilt).abs() <= 15.0);
            assert!((a.psi - b.psi).abs() <= 15.0);
            assert_eq!(a.direction, b.direction);
        }
    }
}
