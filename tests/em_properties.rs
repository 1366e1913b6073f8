//! End-to-end properties of the EM engine

use mltomo::config::{LocalSearch, MlTomoConfig};
use mltomo::em::expectation::{score_image, weigh_candidates, ImageWorkspace};
use mltomo::em::parallel::{build_pool, expectation};
use mltomo::em::{ExpectationContext, ExpectationParams, PartialResult};
use mltomo::geometry::rotate_volume;
use mltomo::translation::TranslationPrior;
use mltomo::{
    AlgorithmMode, AngleEntry, AngularSamplingGrid, Assignment, ImputationPolicy, InitialReferences,
    MissingRegionDescriptor, MissingRegionId, MissingRegionKind, MissingRegionModel, MlTomo, ReferenceSet,
    SubVolume, Symmetry,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn gaussians(dim: usize, centres: &[[f64; 3]], width: f64) -> Vec<f64> {
    let mut v = vec![0.0; dim * dim * dim];
    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                let mut s = 0.0;
                for c in centres {
                    let d2 = (i as f64 - c[0]).powi(2) + (j as f64 - c[1]).powi(2) + (k as f64 - c[2]).powi(2);
                    s += (-d2 / (2.0 * width * width)).exp();
                }
                v[i + j * dim + k * dim * dim] = s;
            }
        }
    }
    v
}

fn with_noise(v: &[f64], amplitude: f64, rng: &mut StdRng) -> Vec<f64> {
    v.iter().map(|x| x + amplitude * rng.gen_range(-1.0..1.0)).collect()
}

fn params(sigma_noise: f64) -> ExpectationParams {
    ExpectationParams {
        mode: AlgorithmMode::MaximumLikelihood,
        sigma_noise,
        imputation: ImputationPolicy::default(),
        local_radius: None,
    }
}

/// Two references, a small orientation grid and wedge-limited noisy images
struct Scene {
    images: Vec<SubVolume>,
    refs: ReferenceSet,
    grid: AngularSamplingGrid,
    model: MissingRegionModel,
    prior: TranslationPrior,
}

fn scene(dim: usize, n_images: usize) -> Scene {
    let mut rng = StdRng::seed_from_u64(42);
    let r0 = gaussians(dim, &[[4.0, 4.0, 4.0], [5.5, 4.0, 3.0]], 1.0);
    let r1 = gaussians(dim, &[[3.0, 5.0, 4.0]], 1.2);
    let model = MissingRegionModel::new(
        dim,
        MissingRegionKind::Wedge,
        vec![
            MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 },
            MissingRegionDescriptor::WedgeY { thy0: -45.0, thy_f: 50.0 },
        ],
        None,
    )
    .unwrap();
    let images = (0..n_images)
        .map(|i| {
            let base = if i % 2 == 0 { &r0 } else { &r1 };
            SubVolume::new(with_noise(base, 0.2, &mut rng), Some(MissingRegionId(i % 2)))
        })
        .collect();
    Scene {
        images,
        refs: ReferenceSet::from_volumes(dim, vec![r0, r1]).unwrap(),
        grid: AngularSamplingGrid::generate(90.0, 90.0, Symmetry::C1, [0.0, 180.0]),
        model,
        prior: TranslationPrior::new(1, 1.0),
    }
}

impl Scene {
    fn ctx(&self, sigma_noise: f64) -> ExpectationContext<'_> {
        ExpectationContext {
            refs: &self.refs,
            grid: &self.grid,
            model: &self.model,
            masks: None,
            prior: &self.prior,
            params: params(sigma_noise),
        }
    }

    fn run(&self, threads: usize) -> PartialResult {
        let pool = build_pool(threads).unwrap();
        expectation(&pool, &self.images, &self.ctx(2.0), threads, false).unwrap()
    }
}

fn rel_close(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol * a.abs().max(b.abs()).max(1.0)
}

#[test]
fn weights_are_non_negative_and_match_total_mass() {
    let s = scene(8, 3);
    let ctx = s.ctx(1.5);
    let mut ws = ImageWorkspace::new(8);
    for (i, img) in s.images.iter().enumerate() {
        let scores = score_image(&ctx, i, img, &mut ws).unwrap();
        let weights = weigh_candidates(&ctx, i, &scores).unwrap();
        let all: Vec<f64> = weights.weights.iter().flatten().copied().collect();
        assert!(all.iter().all(|&w| w >= 0.0));
        let sum: f64 = all.iter().sum();
        assert!(rel_close(sum, weights.total, 1e-12), "sum {} vs total {}", sum, weights.total);
        let max = all.iter().copied().fold(0.0, f64::max);
        assert_eq!(max, weights.max_weight);
        assert!(weights.fracweight() > 0.0 && weights.fracweight() <= 1.0);
    }
}

#[test]
fn coverage_stays_within_image_count() {
    let s = scene(8, 6);
    let result = s.run(2);
    let n = s.images.len() as f64;
    assert_eq!(result.acc.n_images, s.images.len());
    for k in 0..2 {
        for &w in result.acc.wsumwed(k) {
            assert!(w >= 0.0 && w <= n + 1e-9, "coverage {} outside [0, {}]", w, n);
        }
    }
    // only candidates below the significance cut are dropped
    assert!(rel_close(result.acc.sumw_allrefs(), n, 1e-4));
}

#[test]
fn thread_count_does_not_change_reduced_sums() {
    let s = scene(8, 7);
    let one = s.run(1);
    let three = s.run(3);

    assert_eq!(one.acc.n_images, three.acc.n_images);
    for k in 0..2 {
        assert!(rel_close(one.acc.sumw[k], three.acc.sumw[k], 1e-12));
        for (a, b) in one.acc.wsumimg(k).iter().zip(three.acc.wsumimg(k)) {
            assert!((a - b).norm() <= 1e-9 * a.norm().max(1.0));
        }
        for (a, b) in one.acc.wsumwed(k).iter().zip(three.acc.wsumwed(k)) {
            assert!(rel_close(*a, *b, 1e-12));
        }
    }
    assert!(rel_close(one.acc.ll, three.acc.ll, 1e-10));
    assert!(rel_close(one.acc.wsum_sigma_noise, three.acc.wsum_sigma_noise, 1e-10));
    assert!(rel_close(one.acc.wsum_sigma_offset, three.acc.wsum_sigma_offset, 1e-10));
    assert_eq!(one.assignments, three.assignments);
}

fn identity_only(nr_ref: usize) -> MlTomoConfig {
    MlTomoConfig {
        nr_ref,
        angular_sampling: 360.0,
        tilt_range: [0.0, 0.0],
        max_shift: 0,
        fix_fractions: true,
        n_iter: 1,
        ..Default::default()
    }
}

#[test]
fn identical_inputs_converge_in_one_iteration() {
    let dim = 6;
    let v = gaussians(dim, &[[3.0, 2.0, 3.0], [2.0, 4.0, 3.0]], 1.0);
    let images: Vec<SubVolume> = (0..5).map(|_| SubVolume::new(v.clone(), None)).collect();
    let run = MlTomo::new(identity_only(1), images, Vec::new(), InitialReferences::RandomSubsets).unwrap();

    let mut reports = Vec::new();
    let outcome = run.run(|r| reports.push(r.clone())).unwrap();
    assert_eq!(outcome.iterations, 1);
    for (a, b) in outcome.references[0].iter().zip(&v) {
        assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
    }
    assert!(reports[0].sigma_noise < 1e-6, "sigma_noise {}", reports[0].sigma_noise);
    assert_eq!(outcome.alpha, vec![1.0]);
}

#[test]
fn single_orientation_reference_is_the_mean() {
    let dim = 6;
    let mut rng = StdRng::seed_from_u64(5);
    let base = gaussians(dim, &[[3.0, 3.0, 3.0]], 1.0);
    let inputs: Vec<Vec<f64>> = (0..5).map(|_| with_noise(&base, 0.3, &mut rng)).collect();
    let mean: Vec<f64> = (0..base.len()).map(|i| inputs.iter().map(|v| v[i]).sum::<f64>() / 5.0).collect();

    let images = inputs.into_iter().map(|v| SubVolume::new(v, None)).collect();
    let run = MlTomo::new(
        identity_only(1),
        images,
        Vec::new(),
        InitialReferences::Supplied(vec![base.clone()]),
    )
    .unwrap();
    let outcome = run.run(|_| {}).unwrap();
    for (a, b) in outcome.references[0].iter().zip(&mean) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn complementary_wedges_cover_everything() {
    let dim = 8;
    let v = gaussians(dim, &[[4.0, 4.0, 4.0]], 1.5);
    let model = MissingRegionModel::new(
        dim,
        MissingRegionKind::Wedge,
        vec![
            MissingRegionDescriptor::WedgeY { thy0: -90.0, thy_f: 0.0 },
            MissingRegionDescriptor::WedgeY { thy0: 0.0, thy_f: 90.0 },
        ],
        None,
    )
    .unwrap();
    let images = vec![
        SubVolume::new(v.clone(), Some(MissingRegionId(0))),
        SubVolume::new(v.clone(), Some(MissingRegionId(1))),
    ];
    let refs = ReferenceSet::from_volumes(dim, vec![v]).unwrap();
    let grid = AngularSamplingGrid::from_entries(vec![AngleEntry::identity()], 10.0);
    let prior = TranslationPrior::new(0, 0.0);
    let ctx = ExpectationContext {
        refs: &refs,
        grid: &grid,
        model: &model,
        masks: None,
        prior: &prior,
        params: params(1.0),
    };
    let pool = build_pool(1).unwrap();
    let result = expectation(&pool, &images, &ctx, 1, false).unwrap();
    assert!(result.acc.wsumwed(0).iter().all(|&w| w == 1.0));
}

fn asymmetric(dim: usize) -> Vec<f64> {
    gaussians(dim, &[[4.0, 4.0, 4.0], [5.5, 4.0, 4.0], [4.0, 2.5, 4.5], [3.0, 4.0, 3.0]], 0.7)
}

fn pruning_run(local_search: Option<LocalSearch>) -> (Vec<Vec<f64>>, Vec<Assignment>) {
    let dim = 8;
    let reference = asymmetric(dim);
    let grid = AngularSamplingGrid::generate(90.0, 90.0, Symmetry::C1, [0.0, 180.0]);
    let images: Vec<SubVolume> = [0usize, 5, 13, 21]
        .iter()
        .map(|&a| {
            let entry = grid.get(a).clone();
            let mut data = vec![0.0; dim * dim * dim];
            rotate_volume(&reference, dim, &entry.matrix, &mut data);
            SubVolume::new(data, None).with_prior(Assignment {
                ref_id: 0,
                angle: entry,
                offset: [0, 0, 0],
                fracweight: 1.0,
                score: 0.0,
            })
        })
        .collect();

    let cfg = MlTomoConfig {
        angular_sampling: 90.0,
        max_shift: 0,
        sigma_noise: 0.05,
        fix_sigma_noise: true,
        local_search,
        n_iter: 2,
        eps: 0.0,
        ..Default::default()
    };
    let run = MlTomo::new(cfg, images, Vec::new(), InitialReferences::Supplied(vec![reference])).unwrap();
    let outcome = run.run(|_| {}).unwrap();
    (outcome.references, outcome.assignments)
}

#[test]
fn local_search_matches_exhaustive_search() {
    let (full_refs, full_assign) = pruning_run(None);
    let (local_refs, local_assign) = pruning_run(Some(LocalSearch { ang_search: 10.0, small_angle: true }));

    assert_eq!(full_assign.len(), local_assign.len());
    for (a, b) in full_assign.iter().zip(&local_assign) {
        assert_eq!(a.ref_id, b.ref_id);
        assert_eq!(a.angle, b.angle);
        assert_eq!(a.offset, b.offset);
    }
    for (a, b) in full_refs[0].iter().zip(&local_refs[0]) {
        assert!((a - b).abs() < 1e-8, "{} vs {}", a, b);
    }
}

#[test]
fn alpha_sums_to_one_every_iteration() {
    let s = scene(8, 8);
    let cfg = MlTomoConfig {
        nr_ref: 3,
        missing_region: MissingRegionKind::Wedge,
        angular_sampling: 90.0,
        max_shift: 1,
        sigma_offset: 1.0,
        sigma_noise: 2.0,
        n_iter: 3,
        eps: 0.0,
        threads: 2,
        seed: 11,
        ..Default::default()
    };
    let descriptors = vec![
        MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 },
        MissingRegionDescriptor::WedgeY { thy0: -45.0, thy_f: 50.0 },
    ];
    let run = MlTomo::new(cfg, s.images, descriptors, InitialReferences::RandomSubsets).unwrap();
    let mut sums = Vec::new();
    run.run(|r| sums.push(r.alpha.iter().sum::<f64>())).unwrap();
    assert_eq!(sums.len(), 3);
    for s in sums {
        assert!((s - 1.0).abs() < 1e-12);
    }
}
