//! Per-image hidden-variable integration
//!
//! For one sub-volume the engine scores every candidate (reference,
//! orientation, offset), turns the scores into weights and folds the weighted
//! data into the worker's [`Accumulators`].
//!
//! The image is rotated into the reference frame once per orientation. The
//! masked squared difference to a reference is then available for all
//! offsets at once:
//!
//! ```text
//! diff(o) = (Σ m|X'|² + Σ m|R|²) / N - 2 Re ifft(m X' conj(R))[o]
//! ```
//!
//! Scoring and accumulation are two passes. The first pass stores all
//! scores so the minimum difference (`trymindiff`) is known before any
//! weight is exponentiated; the second pass revisits only the
//! (reference, orientation) pairs carrying a significant share of the mass.

use num_complex::Complex64;

use super::accumulators::Accumulators;
use crate::config::{AlgorithmMode, ImputationPolicy};
use crate::error::{Error, Result};
use crate::fft::{idx3d, wrap_index, Fft3dWorkspace};
use crate::geometry::rotate_volume;
use crate::missing::cache::lookup_mask;
use crate::missing::{MaskCache, MissingRegionModel};
use crate::reference::ReferenceSet;
use crate::sampling::AngularSamplingGrid;
use crate::translation::{offset_norm2, TranslationPrior};
use crate::volume::{Assignment, SubVolume};

/// Weight share below which a candidate is neither searched locally nor accumulated
pub const SIGNIFICANT_WEIGHT_LOW: f64 = 1e-8;

/// Noise level below which assignments are hard
pub const SIGMA_NOISE_EPS: f64 = 1e-12;

/// Scalar parameters of one expectation pass
#[derive(Clone, Copy, Debug)]
pub struct ExpectationParams {
    pub mode: AlgorithmMode,
    pub sigma_noise: f64,
    pub imputation: ImputationPolicy,
    /// Local search radius in degrees, `None` for exhaustive search
    pub local_radius: Option<f64>,
}

/// Read-only snapshot shared by all workers of a pass
#[derive(Clone, Copy)]
pub struct ExpectationContext<'a> {
    pub refs: &'a ReferenceSet,
    pub grid: &'a AngularSamplingGrid,
    pub model: &'a MissingRegionModel,
    pub masks: Option<&'a MaskCache>,
    pub prior: &'a TranslationPrior,
    pub params: ExpectationParams,
}

/// Scratch buffers of one worker
pub struct ImageWorkspace {
    dim: usize,
    fft: Fft3dWorkspace,
    rotated: Vec<f64>,
    spectrum: Vec<Complex64>,
    product: Vec<Complex64>,
    mask: Vec<f64>,
    cross: Vec<f64>,
    weighted_image: Vec<Complex64>,
    weighted_mask: Vec<f64>,
}

impl ImageWorkspace {
    pub fn new(dim: usize) -> Self {
        Self::with_fft(Fft3dWorkspace::cubic(dim))
    }

    /// Buffers around an existing transform workspace, whose plans are kept
    pub fn with_fft(fft: Fft3dWorkspace) -> Self {
        let dim = fft.dims()[0];
        let n = fft.len();
        Self {
            dim,
            fft,
            rotated: vec![0.0; n],
            spectrum: vec![Complex64::new(0.0, 0.0); n],
            product: vec![Complex64::new(0.0, 0.0); n],
            mask: vec![0.0; n],
            cross: Vec::new(),
            weighted_image: vec![Complex64::new(0.0, 0.0); n],
            weighted_mask: vec![0.0; n],
        }
    }

    /// Spectrum of `data` brought into the reference frame of orientation `rot`
    fn load_rotated(&mut self, data: &[f64], rot: &nalgebra::Matrix3<f64>) {
        rotate_volume(data, self.dim, &rot.transpose(), &mut self.rotated);
        self.fft.forward_real(&self.rotated, &mut self.spectrum);
    }
}

/// Scores of one candidate orientation
#[derive(Clone, Debug)]
pub struct AngleScores {
    /// Index into the angular grid
    pub angle_index: usize,
    /// Number of observed Fourier coefficients at this orientation
    pub n_obs: f64,
    /// `values[k * n_offsets + o]`: masked squared difference (ML) or
    /// normalized correlation (maxCC)
    pub values: Vec<f64>,
}

/// First-pass result for one image
#[derive(Clone, Debug)]
pub struct ImageScores {
    pub angles: Vec<AngleScores>,
    pub nr_ref: usize,
    pub n_offsets: usize,
}

/// Position of a candidate inside [`ImageScores`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// Slot in `ImageScores::angles`
    pub slot: usize,
    pub ref_id: usize,
    pub offset_index: usize,
}

/// Un-normalized weights of one image plus the quantities derived from them
#[derive(Clone, Debug)]
pub struct CandidateWeights {
    /// Same layout as `AngleScores::values`
    pub weights: Vec<Vec<f64>>,
    /// Sum of all weights
    pub total: f64,
    pub max_weight: f64,
    pub best: Candidate,
    /// Minimum difference subtracted before exponentiation (ML only)
    pub trymindiff: f64,
    /// Log-likelihood contribution (ML) or best correlation (maxCC)
    pub score: f64,
}

impl CandidateWeights {
    pub fn fracweight(&self) -> f64 {
        self.max_weight / self.total
    }
}

/// Orientations searched for `img`
pub fn candidate_angles(ctx: &ExpectationContext, img: &SubVolume) -> Vec<usize> {
    if let (Some(radius), Some(prior)) = (ctx.params.local_radius, &img.prior) {
        if prior.fracweight > SIGNIFICANT_WEIGHT_LOW {
            let local = ctx.grid.local(&prior.angle, radius);
            if !local.is_empty() {
                return local;
            }
        }
    }
    (0..ctx.grid.len()).collect()
}

#[inline]
fn masked_power(spectrum: &[Complex64], mask: &[f64]) -> f64 {
    spectrum.iter().zip(mask).map(|(c, &m)| m * c.norm_sqr()).sum()
}

/// `cross[o] = Re Σ_f m X'_f conj(R_f) e^{+2πi f·o/N} / N` for every offset
fn masked_cross(
    fft: &mut Fft3dWorkspace,
    x: &[Complex64],
    r: &[Complex64],
    mask: &[f64],
    offsets: &[[i64; 3]],
    dim: usize,
    product: &mut [Complex64],
    cross: &mut Vec<f64>,
) {
    let n = x.len() as f64;
    cross.clear();

    if offsets.len() == 1 && offsets[0] == [0, 0, 0] {
        let c: f64 = x
            .iter()
            .zip(r)
            .zip(mask)
            .map(|((a, b), &m)| m * (a * b.conj()).re)
            .sum();
        cross.push(c / n);
        return;
    }

    for (((p, a), b), &m) in product.iter_mut().zip(x).zip(r).zip(mask) {
        *p = a * b.conj() * m;
    }
    fft.ifft3d(product);
    for o in offsets {
        cross.push(product[offset_index(*o, dim)].re);
    }
}

/// Storage index of a lattice offset, wrapped into a cube of edge `dim`
#[inline]
fn offset_index(o: [i64; 3], dim: usize) -> usize {
    idx3d(wrap_index(o[0], dim), wrap_index(o[1], dim), wrap_index(o[2], dim), dim, dim)
}

/// First pass: score every (reference, orientation, offset) candidate
pub fn score_image(
    ctx: &ExpectationContext,
    image_index: usize,
    img: &SubVolume,
    ws: &mut ImageWorkspace,
) -> Result<ImageScores> {
    let refs = ctx.refs;
    let offsets = ctx.prior.offsets();
    let n_off = offsets.len();
    let nr_ref = refs.len();
    let n = (ws.dim * ws.dim * ws.dim) as f64;
    let candidates = candidate_angles(ctx, img);

    let mut angles = Vec::with_capacity(candidates.len());
    for a in candidates {
        ws.load_rotated(&img.data, &ctx.grid.get(a).matrix);
        let mask = lookup_mask(ctx.model, ctx.masks, ctx.grid, img.missing_region, a, &mut ws.mask);
        let n_obs: f64 = mask.iter().sum();
        let xa2 = masked_power(&ws.spectrum, mask) / n;

        let mut values = vec![0.0; nr_ref * n_off];
        for k in 0..nr_ref {
            let r = refs.fourier(k);
            let ra2 = masked_power(r, mask) / n;
            masked_cross(
                &mut ws.fft,
                &ws.spectrum,
                r,
                mask,
                offsets,
                ws.dim,
                &mut ws.product,
                &mut ws.cross,
            );

            let row = &mut values[k * n_off..(k + 1) * n_off];
            match ctx.params.mode {
                AlgorithmMode::MaximumLikelihood => {
                    for (v, &c) in row.iter_mut().zip(&ws.cross) {
                        let d = xa2 + ra2 - 2.0 * c;
                        // rounding can push an exact match below zero
                        *v = if d < 0.0 { 0.0 } else { d };
                    }
                }
                AlgorithmMode::MaxConstrainedCorrelation => {
                    let denom = (xa2 * ra2).sqrt();
                    for (v, &c) in row.iter_mut().zip(&ws.cross) {
                        *v = if denom == 0.0 { 0.0 } else { c / denom };
                    }
                }
            }
        }

        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(Error::Numerical {
                image: image_index,
                reason: format!("non-finite score {} at orientation {}", bad, a),
            });
        }
        angles.push(AngleScores { angle_index: a, n_obs, values });
    }

    Ok(ImageScores { angles, nr_ref, n_offsets: n_off })
}

/// Turn first-pass scores into candidate weights
pub fn weigh_candidates(
    ctx: &ExpectationContext,
    image_index: usize,
    scores: &ImageScores,
) -> Result<CandidateWeights> {
    let alpha = ctx.refs.alpha();
    let prior_w = ctx.prior.weights();
    let n_off = scores.n_offsets;
    let sigma = ctx.params.sigma_noise;

    // maxCC ignores the priors, so a class with alpha = 0 can still win
    let ml = ctx.params.mode == AlgorithmMode::MaximumLikelihood;
    let eligible = |k: usize, o: usize| !ml || (alpha[k] > 0.0 && prior_w[o] > 0.0);

    // Extremum over eligible candidates
    let mut best: Option<(Candidate, f64)> = None;
    for (slot, s) in scores.angles.iter().enumerate() {
        for k in 0..scores.nr_ref {
            for o in 0..n_off {
                if !eligible(k, o) {
                    continue;
                }
                let v = s.values[k * n_off + o];
                let better = match (ctx.params.mode, best) {
                    (_, None) => true,
                    (AlgorithmMode::MaximumLikelihood, Some((_, b))) => v < b,
                    (AlgorithmMode::MaxConstrainedCorrelation, Some((_, b))) => v > b,
                };
                if better {
                    best = Some((Candidate { slot, ref_id: k, offset_index: o }, v));
                }
            }
        }
    }
    let (best, extremum) = best.ok_or_else(|| Error::Numerical {
        image: image_index,
        reason: "no candidate with positive prior mass".to_string(),
    })?;

    let one_hot = |best: Candidate| -> Vec<Vec<f64>> {
        scores
            .angles
            .iter()
            .enumerate()
            .map(|(slot, s)| {
                let mut w = vec![0.0; s.values.len()];
                if slot == best.slot {
                    w[best.ref_id * n_off + best.offset_index] = 1.0;
                }
                w
            })
            .collect()
    };

    let soft = ml && sigma >= SIGMA_NOISE_EPS;
    if !soft {
        let score = match ctx.params.mode {
            AlgorithmMode::MaximumLikelihood => -extremum,
            AlgorithmMode::MaxConstrainedCorrelation => extremum,
        };
        return Ok(CandidateWeights {
            weights: one_hot(best),
            total: 1.0,
            max_weight: 1.0,
            best,
            trymindiff: extremum,
            score,
        });
    }

    let trymindiff = extremum;
    let two_sigma2 = 2.0 * sigma * sigma;
    let mut total = 0.0;
    let mut max_weight = 0.0;
    let mut best_soft = best;
    let mut weights = Vec::with_capacity(scores.angles.len());
    for (slot, s) in scores.angles.iter().enumerate() {
        let mut w = vec![0.0; s.values.len()];
        for k in 0..scores.nr_ref {
            for o in 0..n_off {
                if !eligible(k, o) {
                    continue;
                }
                let i = k * n_off + o;
                let wi = alpha[k] * prior_w[o] * (-(s.values[i] - trymindiff) / two_sigma2).exp();
                w[i] = wi;
                total += wi;
                if wi > max_weight {
                    max_weight = wi;
                    best_soft = Candidate { slot, ref_id: k, offset_index: o };
                }
            }
        }
        weights.push(w);
    }

    if !(total > 0.0 && total.is_finite()) {
        return Err(Error::Numerical {
            image: image_index,
            reason: format!("weight mass {} is not positive", total),
        });
    }

    let n_obs = scores.angles[best_soft.slot].n_obs;
    let score = total.ln()
        - trymindiff / two_sigma2
        - n_obs * (sigma * (2.0 * std::f64::consts::PI).sqrt()).ln();

    Ok(CandidateWeights {
        weights,
        total,
        max_weight,
        best: best_soft,
        trymindiff,
        score,
    })
}

/// Second pass: fold the normalized weights of one image into `acc`
pub fn accumulate_image(
    ctx: &ExpectationContext,
    image_index: usize,
    img: &SubVolume,
    scores: &ImageScores,
    weights: &CandidateWeights,
    ws: &mut ImageWorkspace,
    acc: &mut Accumulators,
) {
    let refs = ctx.refs;
    let offsets = ctx.prior.offsets();
    let n_off = scores.n_offsets;
    let dim = ws.dim;
    let ml = ctx.params.mode == AlgorithmMode::MaximumLikelihood;
    let impute = ctx.params.imputation == ImputationPolicy::Impute;
    let single_offset = n_off == 1 && offsets[0] == [0, 0, 0];

    for (s, w) in scores.angles.iter().zip(&weights.weights) {
        let mass_of = |k: usize| w[k * n_off..(k + 1) * n_off].iter().sum::<f64>() / weights.total;
        if (0..scores.nr_ref).all(|k| mass_of(k) <= SIGNIFICANT_WEIGHT_LOW) {
            continue;
        }

        ws.load_rotated(&img.data, &ctx.grid.get(s.angle_index).matrix);
        let region = img.missing_region;
        let mask = lookup_mask(ctx.model, ctx.masks, ctx.grid, region, s.angle_index, &mut ws.mask);

        for k in 0..scores.nr_ref {
            let mass = mass_of(k);
            if mass <= SIGNIFICANT_WEIGHT_LOW {
                continue;
            }
            let row = &w[k * n_off..(k + 1) * n_off];

            // kernel(f) = Σ_o w_o e^{+2πi f·o/N} undoes the offsets
            if single_offset {
                for p in ws.product.iter_mut() {
                    *p = Complex64::new(mass, 0.0);
                }
            } else {
                for p in ws.product.iter_mut() {
                    *p = Complex64::new(0.0, 0.0);
                }
                for (o, &wo) in offsets.iter().zip(row) {
                    ws.product[offset_index(*o, dim)].re += wo / weights.total;
                }
                ws.fft.fft3d(&mut ws.product);
                for p in ws.product.iter_mut() {
                    *p = p.conj();
                }
            }

            let r = refs.fourier(k);
            for f in 0..ws.spectrum.len() {
                let m = mask[f];
                ws.weighted_image[f] = ws.spectrum[f] * ws.product[f] * m;
                ws.weighted_mask[f] = mass * m;
                if impute {
                    ws.weighted_image[f] += r[f] * (mass * (1.0 - m));
                    ws.weighted_mask[f] += mass * (1.0 - m);
                }
            }

            let mut sigma_contribution = 0.0;
            if ml {
                for (&wo, &d) in row.iter().zip(&s.values[k * n_off..(k + 1) * n_off]) {
                    sigma_contribution += wo / weights.total * d;
                }
                acc.observed_coefficients += mass * s.n_obs;
            }
            for (o, &wo) in offsets.iter().zip(row) {
                acc.wsum_sigma_offset += wo / weights.total * offset_norm2(*o);
            }

            acc.accumulate(
                k,
                image_index,
                &ws.weighted_image,
                &ws.weighted_mask,
                mass,
                sigma_contribution,
            );
        }
    }
}

/// Full expectation of one sub-volume: score, weigh, accumulate
///
/// Returns the image's new best assignment.
pub fn expectation_single_image(
    ctx: &ExpectationContext,
    image_index: usize,
    img: &SubVolume,
    ws: &mut ImageWorkspace,
    acc: &mut Accumulators,
) -> Result<Assignment> {
    let scores = score_image(ctx, image_index, img, ws)?;
    let weights = weigh_candidates(ctx, image_index, &scores)?;
    accumulate_image(ctx, image_index, img, &scores, &weights, ws, acc);

    let best = weights.best;
    let fracweight = weights.fracweight();
    acc.ll += weights.score;
    acc.sumfracweight += fracweight;
    acc.n_images += 1;

    Ok(Assignment {
        ref_id: best.ref_id,
        angle: ctx.grid.get(scores.angles[best.slot].angle_index).clone(),
        offset: ctx.prior.offsets()[best.offset_index],
        fracweight,
        score: weights.score,
    })
}
