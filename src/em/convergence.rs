//! Relative change of the references between iterations

use crate::simd_ops::{norm_squared, squared_distance};

/// Relative squared change `Σ(new - old)² / Σ old²`
///
/// An all-zero `old` gives zero when `new` is zero too and infinity otherwise.
pub fn relative_change(old: &[f64], new: &[f64]) -> f64 {
    let num = squared_distance(new, old);
    let den = norm_squared(old);
    if den > 0.0 {
        num / den
    } else if num == 0.0 {
        0.0
    } else {
        f64::INFINITY
    }
}

/// Per-iteration convergence history
#[derive(Clone, Debug)]
pub struct ConvergenceTracker {
    eps: f64,
    history: Vec<Vec<f64>>,
}

impl ConvergenceTracker {
    pub fn new(eps: f64) -> Self {
        Self { eps, history: Vec::new() }
    }

    /// Record the change of every reference; true when all fall below `eps`
    pub fn check<'a, I>(&mut self, old: &[Vec<f64>], new: I) -> bool
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let conv: Vec<f64> = old.iter().zip(new).map(|(o, n)| relative_change(o, n)).collect();
        let converged = conv.iter().all(|&c| c < self.eps);
        self.history.push(conv);
        converged
    }

    /// Changes of the latest check
    pub fn latest(&self) -> Option<&[f64]> {
        self.history.last().map(|v| v.as_slice())
    }

    pub fn history(&self) -> &[Vec<f64>] {
        &self.history
    }
}
