//! Run configuration for ML sub-tomogram averaging
//!
//! All knobs are gathered in [`MlTomoConfig`], which deserializes from JSON
//! with every field optional (missing fields take their defaults). The
//! configuration is validated once, when a run is set up.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::missing::MissingRegionKind;

/// Probabilistic model used by the expectation step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmMode {
    /// Full integration over (reference, orientation, offset)
    #[default]
    MaximumLikelihood,
    /// Best constrained cross-correlation only, no probabilistic weighting
    MaxConstrainedCorrelation,
}

/// How unobserved Fourier coefficients enter the reference update
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum ImputationPolicy {
    /// Accumulate observed data only and divide by coverage.
    ///
    /// Coefficients whose coverage is at most `noimp_threshold * sumw[k]`
    /// keep their previous value.
    Divide { noimp_threshold: f64 },
    /// Fill unobserved coefficients with the current reference
    Impute,
}

impl Default for ImputationPolicy {
    fn default() -> Self {
        ImputationPolicy::Divide { noimp_threshold: 0.0 }
    }
}

/// Point-group symmetry used to reduce the orientation search
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Symmetry {
    #[default]
    C1,
    /// n-fold rotation about z
    Cyclic(u32),
}

impl Symmetry {
    pub fn order(&self) -> u32 {
        match self {
            Symmetry::C1 => 1,
            Symmetry::Cyclic(n) => *n,
        }
    }
}

/// Linear regularization ramp `reg0 -> reg_final` over `reg_steps` iterations
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationSchedule {
    pub reg0: f64,
    pub reg_final: f64,
    pub reg_steps: usize,
}

impl Default for RegularizationSchedule {
    fn default() -> Self {
        Self {
            reg0: 0.0,
            reg_final: 0.0,
            reg_steps: 5,
        }
    }
}

/// Restrict the orientation search around the previous optimum
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSearch {
    /// Search radius in degrees
    pub ang_search: f64,
    /// Widen the radius by `SMALLANGLE`; switch off for noiseless phantoms
    pub small_angle: bool,
}

impl Default for LocalSearch {
    fn default() -> Self {
        Self {
            ang_search: 15.0,
            small_angle: true,
        }
    }
}

/// Run-wide parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlTomoConfig {
    /// Number of reference classes
    pub nr_ref: usize,
    pub mode: AlgorithmMode,
    /// Missing-region kind shared by every descriptor of the run
    pub missing_region: MissingRegionKind,
    /// Initial noise standard deviation
    pub sigma_noise: f64,
    /// Initial offset standard deviation (voxels)
    pub sigma_offset: f64,
    pub fix_sigma_noise: bool,
    pub fix_sigma_offset: bool,
    pub fix_fractions: bool,
    /// Angular step for rot/tilt in degrees
    pub angular_sampling: f64,
    /// Angular step for psi in degrees, defaults to `angular_sampling`
    pub psi_sampling: Option<f64>,
    pub symmetry: Symmetry,
    /// Allowed tilt range [min, max] in degrees
    pub tilt_range: [f64; 2],
    pub local_search: Option<LocalSearch>,
    /// Randomly shift the angular grid every iteration
    pub perturb: bool,
    /// Radius (voxels) of the integer offset search cube
    pub max_shift: usize,
    pub regularization: RegularizationSchedule,
    pub imputation: ImputationPolicy,
    /// Highest digital frequency (<= 0.5) taken into account
    pub max_resolution: Option<f64>,
    /// Low-pass references at their FSC = 0.5 resolution
    pub filter_at_fsc: bool,
    /// Radius of the spherical solvent mask applied to new references
    pub mask_radius: Option<f64>,
    /// Precompute (descriptor, orientation) masks when they fit in this many bytes
    pub mask_cache_bytes: usize,
    /// Undo the prior orientation of each image when generating references
    pub keep_angles: bool,
    /// Equalise the radial power spectrum of every tilt series to the average
    pub adjust_spectra: bool,
    /// Number of expectation workers
    pub threads: usize,
    /// First iteration index (0-based)
    pub istart: usize,
    /// Iteration index at which the run stops
    pub n_iter: usize,
    /// Convergence threshold on the relative reference change
    pub eps: f64,
    /// Seed for random subset generation and grid perturbation
    pub seed: u64,
}

impl Default for MlTomoConfig {
    fn default() -> Self {
        Self {
            nr_ref: 1,
            mode: AlgorithmMode::MaximumLikelihood,
            missing_region: MissingRegionKind::None,
            sigma_noise: 1.0,
            sigma_offset: 3.0,
            fix_sigma_noise: false,
            fix_sigma_offset: false,
            fix_fractions: false,
            angular_sampling: 10.0,
            psi_sampling: None,
            symmetry: Symmetry::C1,
            tilt_range: [0.0, 180.0],
            local_search: None,
            perturb: false,
            max_shift: 3,
            regularization: RegularizationSchedule::default(),
            imputation: ImputationPolicy::default(),
            max_resolution: None,
            filter_at_fsc: false,
            mask_radius: None,
            mask_cache_bytes: 256 << 20,
            keep_angles: false,
            adjust_spectra: false,
            threads: 1,
            istart: 0,
            n_iter: 25,
            eps: 5e-5,
            seed: 0,
        }
    }
}

impl MlTomoConfig {
    /// Effective psi step
    pub fn psi_step(&self) -> f64 {
        self.psi_sampling.unwrap_or(self.angular_sampling)
    }

    /// Check parameter ranges and consistency
    pub fn validate(&self) -> Result<()> {
        if self.nr_ref == 0 {
            return Err(Error::NoReferences);
        }
        if !(self.sigma_noise.is_finite() && self.sigma_noise > 0.0) {
            return Err(Error::invalid_parameter("sigma_noise", self.sigma_noise, "must be positive"));
        }
        if !(self.sigma_offset.is_finite() && self.sigma_offset >= 0.0) {
            return Err(Error::invalid_parameter("sigma_offset", self.sigma_offset, "must be non-negative"));
        }
        if !(self.angular_sampling.is_finite() && self.angular_sampling > 0.0) {
            return Err(Error::invalid_parameter("angular_sampling", self.angular_sampling, "must be positive"));
        }
        let psi = self.psi_step();
        if !(psi.is_finite() && psi > 0.0) {
            return Err(Error::invalid_parameter("psi_sampling", psi, "must be positive"));
        }
        let [t0, tf] = self.tilt_range;
        if !(0.0..=180.0).contains(&t0) || !(0.0..=180.0).contains(&tf) || t0 > tf {
            return Err(Error::invalid_parameter(
                "tilt_range",
                format!("[{t0}, {tf}]"),
                "must satisfy 0 <= min <= max <= 180",
            ));
        }
        if self.symmetry.order() == 0 {
            return Err(Error::invalid_parameter("symmetry", "C0", "order must be at least 1"));
        }
        if let Some(local) = &self.local_search {
            if !(local.ang_search.is_finite() && local.ang_search > 0.0) {
                return Err(Error::invalid_parameter("ang_search", local.ang_search, "must be positive"));
            }
        }
        let reg = &self.regularization;
        if !(reg.reg0 >= 0.0 && reg.reg_final >= 0.0) {
            return Err(Error::invalid_parameter(
                "regularization",
                format!("{} -> {}", reg.reg0, reg.reg_final),
                "weights must be non-negative",
            ));
        }
        if let ImputationPolicy::Divide { noimp_threshold } = self.imputation {
            if !(0.0..1.0).contains(&noimp_threshold) {
                return Err(Error::invalid_parameter("noimp_threshold", noimp_threshold, "must lie in [0, 1)"));
            }
        }
        if let Some(res) = self.max_resolution {
            if !(res > 0.0 && res <= 0.5) {
                return Err(Error::invalid_parameter("max_resolution", res, "digital frequency must lie in (0, 0.5]"));
            }
        }
        if let Some(radius) = self.mask_radius {
            if !(radius > 0.0) {
                return Err(Error::invalid_parameter("mask_radius", radius, "must be positive"));
            }
        }
        if self.threads == 0 {
            return Err(Error::invalid_parameter("threads", 0, "at least one worker is required"));
        }
        if self.istart > self.n_iter {
            return Err(Error::invalid_parameter(
                "istart",
                self.istart,
                format!("must not exceed n_iter = {}", self.n_iter),
            ));
        }
        if !(self.eps >= 0.0) {
            return Err(Error::invalid_parameter("eps", self.eps, "must be non-negative"));
        }
        Ok(())
    }
}

/// Load a configuration from a JSON file
pub fn load_config(path: &Path) -> Result<MlTomoConfig> {
    let contents = fs::read_to_string(path)?;
    let config: MlTomoConfig = serde_json::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
