//! Coverage-dependent damping of the references
//!
//! The damping weight follows a linear ramp from `reg0` to `reg_final` over
//! `reg_steps` iterations. Each Fourier coefficient of reference `k` is
//! scaled by `c / (c + reg)` with `c` its accumulated coverage, so poorly
//! sampled frequencies are attenuated most. Coefficients nobody observed
//! and references that received no mass keep their previous estimate.

use log::debug;
use num_complex::Complex64;

use super::accumulators::Accumulators;
use crate::config::RegularizationSchedule;
use crate::fft::Fft3dWorkspace;
use crate::reference::{ReferenceSet, COVERAGE_EPS};

#[derive(Clone, Copy, Debug)]
pub struct RegularizationController {
    schedule: RegularizationSchedule,
}

impl RegularizationController {
    pub fn new(schedule: RegularizationSchedule) -> Self {
        Self { schedule }
    }

    /// Damping weight at iteration `iter`
    pub fn reg_at(&self, iter: usize) -> f64 {
        let s = &self.schedule;
        if s.reg_steps == 0 {
            return s.reg_final;
        }
        let t = iter.min(s.reg_steps) as f64 / s.reg_steps as f64;
        s.reg0 + (s.reg_final - s.reg0) * t
    }

    /// Damp every reference by its coverage; returns `false` when `reg` is zero
    pub fn regularize(
        &self,
        reg: f64,
        acc: &Accumulators,
        refs: &mut ReferenceSet,
        ws: &mut Fft3dWorkspace,
    ) -> bool {
        if reg <= 0.0 {
            return false;
        }
        let mut spectrum = vec![Complex64::new(0.0, 0.0); ws.len()];
        for k in 0..refs.len() {
            if acc.sumw[k] <= 0.0 {
                continue;
            }
            for ((s, &f), &c) in spectrum.iter_mut().zip(refs.fourier(k)).zip(acc.wsumwed(k)) {
                *s = if c > COVERAGE_EPS { f * (c / (c + reg)) } else { f };
            }
            refs.replace(k, &spectrum, ws);
        }
        debug!("regularized {} references with weight {:.4}", refs.len(), reg);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(reg0: f64, reg_final: f64, reg_steps: usize) -> RegularizationController {
        RegularizationController::new(RegularizationSchedule { reg0, reg_final, reg_steps })
    }

    #[test]
    fn test_ramp() {
        let c = controller(10.0, 0.0, 5);
        assert_eq!(c.reg_at(0), 10.0);
        assert!((c.reg_at(2) - 6.0).abs() < 1e-12);
        assert_eq!(c.reg_at(5), 0.0);
        assert_eq!(c.reg_at(50), 0.0);

        let up = controller(1.0, 3.0, 4);
        assert!((up.reg_at(1) - 1.5).abs() < 1e-12);
        assert_eq!(controller(4.0, 2.0, 0).reg_at(0), 2.0);
    }

    #[test]
    fn test_damping_follows_coverage() {
        let dim = 2;
        let mut refs = ReferenceSet::from_volumes(dim, vec![vec![1.0, 2.0, 0.5, -1.0, 3.0, 0.0, 1.5, 2.5]]).unwrap();
        let before = refs.fourier(0).to_vec();
        let mut acc = Accumulators::new(1, 8, false);
        let h = acc.handle(0);
        acc.wsumweds.get_mut(h).copy_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        acc.sumw[0] = 7.0;
        let mut ws = Fft3dWorkspace::cubic(dim);

        assert!(controller(1.0, 1.0, 0).regularize(1.0, &acc, &mut refs, &mut ws));
        for (i, (a, b)) in refs.fourier(0).iter().zip(&before).enumerate() {
            let c = i as f64;
            let expected = if i == 0 { *b } else { *b * (c / (c + 1.0)) };
            assert!((*a - expected).norm() < 1e-12, "coefficient {}: {} vs {}", i, a, expected);
        }
    }

    #[test]
    fn test_zero_weight_is_noop() {
        let dim = 2;
        let mut refs = ReferenceSet::from_volumes(dim, vec![vec![1.0; 8]]).unwrap();
        let before = refs.real(0).to_vec();
        let acc = Accumulators::new(1, 8, false);
        let mut ws = Fft3dWorkspace::cubic(dim);
        assert!(!controller(0.0, 0.0, 5).regularize(0.0, &acc, &mut refs, &mut ws));
        assert_eq!(refs.real(0), before.as_slice());
    }

    #[test]
    fn test_empty_reference_is_left_alone() {
        let dim = 2;
        let vols = vec![vec![1.0, 2.0, 0.5, -1.0, 3.0, 0.0, 1.5, 2.5], vec![0.5, -2.0, 1.0, 4.0, 0.0, 1.0, 2.0, -1.5]];
        let mut refs = ReferenceSet::from_volumes(dim, vols).unwrap();
        let empty_before = refs.real(1).to_vec();
        let mut acc = Accumulators::new(2, 8, false);
        let h = acc.handle(0);
        acc.wsumweds.get_mut(h).fill(3.0);
        acc.sumw[0] = 3.0;
        let mut ws = Fft3dWorkspace::cubic(dim);

        assert!(controller(1.0, 1.0, 0).regularize(1.0, &acc, &mut refs, &mut ws));
        for (a, b) in refs.real(1).iter().zip(&empty_before) {
            assert!((a - b).abs() < 1e-12, "empty reference changed: {} vs {}", a, b);
        }
        let damped: f64 = refs.real(0).iter().map(|v| v * v).sum();
        assert!(damped > 0.0);
    }
}
