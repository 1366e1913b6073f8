//! Iteration driver
//!
//! [`MlTomo`] validates a run at construction (configuration, volume sizes,
//! missing-region table, initial references) and then cycles through
//! expectation, maximization, regularization, optional post-processing and
//! the convergence check until the references stop moving or `n_iter` is
//! reached. Every completed iteration is reported to a caller-supplied
//! callback.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::config::{AlgorithmMode, MlTomoConfig};
use crate::em::accumulators::Accumulators;
use crate::em::expectation::SIGMA_NOISE_EPS;
use crate::em::parallel::{build_pool, expectation};
use crate::em::{
    maximization, ConvergenceTracker, ExpectationContext, ExpectationParams, MaximizationParams,
    RegularizationController,
};
use crate::error::{Error, Result};
use crate::fft::Fft3dWorkspace;
use crate::fsc::{
    fourier_shell_correlation, half_spectrum, low_pass_raised_cosine, mask_spherical_average_outside,
    FSC_THRESHOLD, RAISED_COSINE_WIDTH,
};
use crate::missing::{MaskCache, MissingRegionDescriptor, MissingRegionModel};
use crate::reference::{ReferenceSet, COVERAGE_EPS};
use crate::sampling::{AngularSamplingGrid, SMALLANGLE};
use crate::spectra::SpectrumAdjustment;
use crate::translation::TranslationPrior;
use crate::volume::{common_dim, Assignment, SubVolume};

/// Where the first references come from
#[derive(Clone, Debug)]
pub enum InitialReferences {
    /// Exactly `nr_ref` volumes of the sub-volume size
    Supplied(Vec<Vec<f64>>),
    /// Averages of random disjoint subsets of the sub-volumes
    RandomSubsets,
}

/// Stage of the iteration state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Init,
    Expectation,
    Maximization,
    Regularization,
    ConvergenceCheck,
    Done,
}

/// Model parameters after an iteration
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IterationState {
    /// Index of the iteration that produced this state
    pub iter: usize,
    pub sigma_noise: f64,
    pub sigma_offset: f64,
    pub alpha: Vec<f64>,
    pub reg_current: f64,
    pub log_likelihood: f64,
    /// Relative change per reference
    pub conv: Vec<f64>,
}

/// Everything a caller gets to see after one iteration
#[derive(Clone, Debug, Serialize)]
pub struct IterationReport {
    pub iter: usize,
    pub log_likelihood: f64,
    pub avg_fracweight: f64,
    pub sigma_noise: f64,
    pub sigma_offset: f64,
    pub alpha: Vec<f64>,
    pub reg_current: f64,
    pub conv: Vec<f64>,
    /// Digital frequency at FSC = 0.5 per reference, when filtering is on;
    /// `None` for a reference whose half sets could not be compared
    pub resolution: Option<Vec<Option<f64>>>,
    pub converged: bool,
    pub assignments: Vec<Assignment>,
    pub references: Vec<Vec<f64>>,
}

/// Final state of a run
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub references: Vec<Vec<f64>>,
    pub alpha: Vec<f64>,
    pub history: Vec<IterationState>,
    /// Last assignment of every sub-volume, empty when no iteration ran
    pub assignments: Vec<Assignment>,
    pub iterations: usize,
    pub converged: bool,
}

/// ML refinement of a set of sub-volumes
pub struct MlTomo {
    config: MlTomoConfig,
    images: Vec<SubVolume>,
    model: MissingRegionModel,
    grid: AngularSamplingGrid,
    refs: ReferenceSet,
    sigma_noise: f64,
    sigma_offset: f64,
    next_iter: usize,
    history: Vec<IterationState>,
    assignments: Vec<Assignment>,
    regularization: RegularizationController,
    convergence: ConvergenceTracker,
    pool: rayon::ThreadPool,
    rng: StdRng,
    fft: Fft3dWorkspace,
    phase: Phase,
    converged: bool,
}

impl MlTomo {
    /// Validate inputs and build all run-wide structures
    ///
    /// # Arguments
    /// * `config` - Run parameters
    /// * `images` - Sub-volumes, all cubes of the same edge
    /// * `missing_regions` - Descriptor table, addressed by `MissingRegionId(i)`
    /// * `initial` - Source of the first references
    pub fn new(
        config: MlTomoConfig,
        mut images: Vec<SubVolume>,
        missing_regions: Vec<MissingRegionDescriptor>,
        initial: InitialReferences,
    ) -> Result<Self> {
        config.validate()?;
        let dim = common_dim(&images)?;
        // offsets beyond half the edge alias under periodic wrapping
        if 2 * config.max_shift >= dim {
            return Err(Error::invalid_parameter(
                "max_shift",
                config.max_shift,
                format!("must be below half the volume edge {}", dim),
            ));
        }

        let model = MissingRegionModel::new(dim, config.missing_region, missing_regions, config.max_resolution)?;
        for (i, img) in images.iter().enumerate() {
            model.check_id(i, img.missing_region)?;
        }
        if config.adjust_spectra {
            SpectrumAdjustment::estimate(&images, &model).apply(&mut images);
            info!("equalised power spectra over {} tilt series", model.len());
        }

        let grid = AngularSamplingGrid::generate(
            config.angular_sampling,
            config.psi_step(),
            config.symmetry,
            config.tilt_range,
        );
        if grid.is_empty() {
            return Err(Error::invalid_parameter(
                "angular_sampling",
                config.angular_sampling,
                "produces no orientations",
            ));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let refs = match initial {
            InitialReferences::Supplied(volumes) => {
                if volumes.len() != config.nr_ref {
                    return Err(Error::invalid_parameter(
                        "nr_ref",
                        config.nr_ref,
                        format!("{} reference volumes supplied", volumes.len()),
                    ));
                }
                ReferenceSet::from_volumes(dim, volumes)?
            }
            InitialReferences::RandomSubsets => {
                ReferenceSet::from_random_subsets(&images, config.nr_ref, &model, config.keep_angles, &mut rng)?
            }
        };

        let pool = build_pool(config.threads)?;

        info!(
            "mltomo: {} sub-volumes of {}^3, {} references, {} orientations, {} missing regions ({}), {} threads",
            images.len(),
            dim,
            refs.len(),
            grid.len(),
            model.len(),
            model.kind(),
            config.threads
        );

        Ok(Self {
            sigma_noise: config.sigma_noise,
            sigma_offset: config.sigma_offset,
            next_iter: config.istart,
            regularization: RegularizationController::new(config.regularization),
            convergence: ConvergenceTracker::new(config.eps),
            fft: Fft3dWorkspace::cubic(dim),
            history: Vec::new(),
            assignments: Vec::new(),
            phase: Phase::Init,
            converged: false,
            config,
            images,
            model,
            grid,
            refs,
            pool,
            rng,
        })
    }

    pub fn config(&self) -> &MlTomoConfig {
        &self.config
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.refs
    }

    pub fn images(&self) -> &[SubVolume] {
        &self.images
    }

    pub fn grid(&self) -> &AngularSamplingGrid {
        &self.grid
    }

    pub fn model(&self) -> &MissingRegionModel {
        &self.model
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn history(&self) -> &[IterationState] {
        &self.history
    }

    /// Current (sigma_noise, sigma_offset)
    pub fn sigmas(&self) -> (f64, f64) {
        (self.sigma_noise, self.sigma_offset)
    }

    /// True once the run has converged or reached `n_iter`
    pub fn is_done(&self) -> bool {
        self.converged || self.next_iter >= self.config.n_iter
    }

    fn local_radius(&self) -> Option<f64> {
        self.config
            .local_search
            .map(|l| l.ang_search + if l.small_angle { SMALLANGLE } else { 0.0 })
    }

    /// Run one full iteration
    pub fn step(&mut self) -> Result<IterationReport> {
        let iter = self.next_iter;
        let ml = self.config.mode == AlgorithmMode::MaximumLikelihood;

        // Expectation
        self.phase = Phase::Expectation;
        let perturbed;
        let grid = if self.config.perturb {
            perturbed = self.grid.perturbed(&mut self.rng);
            &perturbed
        } else {
            &self.grid
        };
        let prior = TranslationPrior::new(self.config.max_shift, self.sigma_offset);
        let masks = MaskCache::build(&self.model, grid, self.config.mask_cache_bytes);
        if ml && self.sigma_noise < SIGMA_NOISE_EPS {
            warn!(
                "iteration {}: sigma_noise {:.3e} is below {:.0e}, assignments are hard",
                iter, self.sigma_noise, SIGMA_NOISE_EPS
            );
        }

        let ctx = ExpectationContext {
            refs: &self.refs,
            grid,
            model: &self.model,
            masks: masks.as_ref(),
            prior: &prior,
            params: ExpectationParams {
                mode: self.config.mode,
                sigma_noise: self.sigma_noise,
                imputation: self.config.imputation,
                local_radius: self.local_radius(),
            },
        };
        let result = expectation(&self.pool, &self.images, &ctx, self.config.threads, self.config.filter_at_fsc)?;
        let acc = result.acc;

        for (img, a) in self.images.iter_mut().zip(&result.assignments) {
            img.prior = Some(a.clone());
        }
        self.assignments = result.assignments;

        // Maximization
        self.phase = Phase::Maximization;
        let old = self.refs.real_volumes();
        let update = maximization(
            &acc,
            &mut self.refs,
            self.sigma_noise,
            self.sigma_offset,
            &MaximizationParams {
                mode: self.config.mode,
                imputation: self.config.imputation,
                fix_sigma_noise: self.config.fix_sigma_noise,
                fix_sigma_offset: self.config.fix_sigma_offset,
                fix_fractions: self.config.fix_fractions,
            },
            &mut self.fft,
        );
        self.sigma_noise = update.sigma_noise;
        self.sigma_offset = update.sigma_offset;

        // Regularization and post-processing
        self.phase = Phase::Regularization;
        let reg_current = self.regularization.reg_at(iter);
        self.regularization.regularize(reg_current, &acc, &mut self.refs, &mut self.fft);
        let resolution = if self.config.filter_at_fsc {
            Some(self.filter_at_fsc(&acc))
        } else {
            None
        };
        if let Some(radius) = self.config.mask_radius {
            self.apply_solvent_mask(radius);
        }

        // Convergence
        self.phase = Phase::ConvergenceCheck;
        let refs = &self.refs;
        let converged = self
            .convergence
            .check(&old, (0..refs.len()).map(|k| refs.real(k)));
        let conv = self.convergence.latest().map(|c| c.to_vec()).unwrap_or_default();

        let avg_fracweight = if acc.n_images > 0 {
            acc.sumfracweight / acc.n_images as f64
        } else {
            0.0
        };
        let max_conv = conv.iter().copied().fold(0.0, f64::max);
        info!(
            "iteration {}: LL={:.6e} <fracweight>={:.4} sigma_noise={:.4e} sigma_offset={:.4} reg={:.3} max conv={:.3e}",
            iter, acc.ll, avg_fracweight, self.sigma_noise, self.sigma_offset, reg_current, max_conv
        );
        debug!("iteration {}: alpha={:?}", iter, update.alpha);

        let state = IterationState {
            iter,
            sigma_noise: self.sigma_noise,
            sigma_offset: self.sigma_offset,
            alpha: update.alpha.clone(),
            reg_current,
            log_likelihood: acc.ll,
            conv: conv.clone(),
        };
        self.history.push(state);
        self.next_iter = iter + 1;
        self.converged = converged;
        self.phase = if self.is_done() { Phase::Done } else { Phase::Expectation };

        Ok(IterationReport {
            iter,
            log_likelihood: acc.ll,
            avg_fracweight,
            sigma_noise: self.sigma_noise,
            sigma_offset: self.sigma_offset,
            alpha: update.alpha,
            reg_current,
            conv,
            resolution,
            converged,
            assignments: self.assignments.clone(),
            references: self.refs.real_volumes(),
        })
    }

    /// Low-pass every reference at its half-set FSC = 0.5 resolution
    ///
    /// References without mass in both half sets are left untouched.
    fn filter_at_fsc(&mut self, acc: &Accumulators) -> Vec<Option<f64>> {
        let Some(halves) = acc.halves.as_ref() else {
            return Vec::new();
        };
        let dim = self.refs.dim();
        let mut resolutions = Vec::with_capacity(self.refs.len());
        for k in 0..self.refs.len() {
            let h = acc.handle(k);
            let (w1, w2) = (halves[0].wsumweds.get(h), halves[1].wsumweds.get(h));
            let covered = |w: &[f64]| w.iter().any(|&c| c > COVERAGE_EPS);
            if acc.sumw[k] <= 0.0 || !covered(w1) || !covered(w2) {
                debug!("reference {}: a half set is empty, skipping FSC filter", k);
                resolutions.push(None);
                continue;
            }
            let f1 = half_spectrum(halves[0].wsumimgs.get(h), w1);
            let f2 = half_spectrum(halves[1].wsumimgs.get(h), w2);
            let res = fourier_shell_correlation(&f1, &f2, w1, w2, dim).resolution(FSC_THRESHOLD);

            let mut spectrum = self.refs.fourier(k).to_vec();
            low_pass_raised_cosine(&mut spectrum, dim, res, RAISED_COSINE_WIDTH);
            self.refs.replace(k, &spectrum, &mut self.fft);
            debug!("reference {}: FSC=0.5 at digital frequency {:.4}", k, res);
            resolutions.push(Some(res));
        }
        resolutions
    }

    fn apply_solvent_mask(&mut self, radius: f64) {
        let dim = self.refs.dim();
        for k in 0..self.refs.len() {
            let mut vol = self.refs.real(k).to_vec();
            mask_spherical_average_outside(&mut vol, dim, radius);
            self.refs.replace_real(k, &vol, &mut self.fft);
        }
    }

    /// Iterate until convergence or `n_iter`, reporting every iteration
    pub fn run<F>(mut self, mut on_iteration: F) -> Result<RunOutcome>
    where
        F: FnMut(&IterationReport),
    {
        while !self.is_done() {
            let report = self.step()?;
            on_iteration(&report);
            if report.converged {
                info!("converged after iteration {}", report.iter);
            }
        }
        self.phase = Phase::Done;
        Ok(self.into_outcome())
    }

    pub fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            references: self.refs.real_volumes(),
            alpha: self.refs.alpha().to_vec(),
            iterations: self.history.len(),
            history: self.history,
            assignments: self.assignments,
            converged: self.converged,
        }
    }
}
