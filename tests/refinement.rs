//! Integration tests of the refinement engine on synthetic geometry:
//! convergence to ground truth, robustness to planted outliers, composite
//! photometric parameterizations and accumulation-strategy consistency.

use nalgebra::{DVector, Vector2, Vector3, Vector6};
use pose_servo::manifold::sl3::SL3Tangent;
use pose_servo::manifold::{LieGroup, SE3, SL3};
use pose_servo::residual::{
    PatchSample, PhotometricPatch, PlanarMatch, PlanarPoint, PointCorrespondence,
    PointReprojection, RefinementState,
};
use pose_servo::robust::MEstimator;
use pose_servo::vvs::{VvsConfig, VvsSolver, VvsStatus};
use pose_servo::AccumulationStrategy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn ground_truth_pose() -> SE3 {
    SE3::exp(&Vector6::new(0.2, -0.3, 0.4, 0.12, -0.08, 0.15))
}

/// Noise-free 3D-2D correspondences seen from `pose`, with `outliers`
/// corrupted observations appended at the end.
fn point_scene(pose: &SE3, inliers: usize, outliers: usize, seed: u64) -> Vec<PointCorrespondence> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut correspondences = Vec::new();
    for _ in 0..inliers {
        let world = Vector3::new(
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-1.5..1.5),
            rng.gen_range(3.0..7.0),
        );
        let camera_point = pose.act(&world);
        let image = Vector2::new(
            camera_point.x / camera_point.z,
            camera_point.y / camera_point.z,
        );
        correspondences.push(PointCorrespondence::from_image_point(world, image));
    }
    for _ in 0..outliers {
        let world = Vector3::new(
            rng.gen_range(-1.5..1.5),
            rng.gen_range(-1.5..1.5),
            rng.gen_range(3.0..7.0),
        );
        let camera_point = pose.act(&world);
        let image = Vector2::new(
            camera_point.x / camera_point.z + rng.gen_range(0.3..0.8),
            camera_point.y / camera_point.z - rng.gen_range(0.3..0.8),
        );
        correspondences.push(PointCorrespondence::from_image_point(world, image));
    }
    correspondences
}

#[test]
fn converges_to_ground_truth_from_perturbed_pose() {
    let truth = ground_truth_pose();
    let model = PointReprojection::new(point_scene(&truth, 30, 0, 11));
    let perturbation = Vector6::new(0.06, -0.04, 0.05, 0.03, -0.02, 0.04);
    let mut state = RefinementState::new(truth.right_plus(&perturbation));

    let report = VvsSolver::new().refine(&mut state, &model).unwrap();

    assert_eq!(report.status, VvsStatus::Converged);
    assert!(report.iterations < 30);
    let recovered = state.transform.as_se3().unwrap();
    assert!(
        recovered.rotation().angle_to(truth.rotation()) < 1e-4,
        "rotation error too large"
    );
    assert!(
        (recovered.translation() - truth.translation()).norm() < 1e-4,
        "translation error too large"
    );
}

#[test]
fn tukey_weights_suppress_planted_outliers() {
    let truth = ground_truth_pose();
    // 30% outliers appended after index 27.
    let model = PointReprojection::new(point_scene(&truth, 28, 12, 23));
    let perturbation = Vector6::new(0.03, 0.02, -0.03, 0.015, -0.02, 0.02);
    let mut state = RefinementState::new(truth.right_plus(&perturbation));

    let solver = VvsSolver::with_config(VvsConfig::new().with_estimator(MEstimator::tukey()));
    let report = solver.refine(&mut state, &model).unwrap();

    assert_eq!(report.status, VvsStatus::Converged);
    let recovered = state.transform.as_se3().unwrap();
    assert!(recovered.rotation().angle_to(truth.rotation()) < 1e-4);
    assert!((recovered.translation() - truth.translation()).norm() < 1e-4);

    // Final weights double as an inlier mask: every planted outlier must be
    // driven to zero. Near a perfect fit the robust scale contracts to the
    // numerical noise floor, so a couple of inliers may land beyond the
    // Tukey cutoff of that tiny scale; the bulk must keep weight.
    let retained = report.weights[..28]
        .iter()
        .filter(|&&weight| weight > 0.1)
        .count();
    assert!(retained >= 26, "only {retained}/28 inliers kept weight");
    for (index, weight) in report.weights.iter().enumerate().skip(28) {
        assert!(*weight < 1e-6, "outlier {index} kept weight {weight}");
    }
}

#[test]
fn accumulation_strategies_refine_identically() {
    let truth = ground_truth_pose();
    let model = PointReprojection::new(point_scene(&truth, 24, 0, 31));
    let perturbation = Vector6::new(0.04, -0.02, 0.03, 0.02, 0.01, -0.03);

    let mut outer_state = RefinementState::new(truth.right_plus(&perturbation));
    let mut factored_state = RefinementState::new(truth.right_plus(&perturbation));

    let outer = VvsSolver::with_config(
        VvsConfig::new().with_accumulation(AccumulationStrategy::Outer),
    )
    .refine(&mut outer_state, &model)
    .unwrap();
    let factored = VvsSolver::with_config(
        VvsConfig::new().with_accumulation(AccumulationStrategy::Factored),
    )
    .refine(&mut factored_state, &model)
    .unwrap();

    assert_eq!(outer.status, VvsStatus::Converged);
    assert_eq!(factored.status, VvsStatus::Converged);

    let a = outer_state.transform.as_se3().unwrap();
    let b = factored_state.transform.as_se3().unwrap();
    assert!((a.translation() - b.translation()).norm() < 1e-7);
    assert!(a.rotation().angle_to(b.rotation()) < 1e-7);
}

#[test]
fn parallel_evaluation_matches_sequential() {
    let truth = ground_truth_pose();
    let model = PointReprojection::new(point_scene(&truth, 40, 0, 41));
    let perturbation = Vector6::new(0.02, 0.03, -0.02, 0.01, -0.015, 0.02);

    let mut sequential_state = RefinementState::new(truth.right_plus(&perturbation));
    let mut parallel_state = RefinementState::new(truth.right_plus(&perturbation));

    VvsSolver::with_config(VvsConfig::new().with_parallel(false))
        .refine(&mut sequential_state, &model)
        .unwrap();
    VvsSolver::with_config(VvsConfig::new().with_parallel(true))
        .refine(&mut parallel_state, &model)
        .unwrap();

    let a = sequential_state.transform.as_se3().unwrap();
    let b = parallel_state.transform.as_se3().unwrap();
    assert!((a.translation() - b.translation()).norm() < 1e-9);
}

#[test]
fn planar_homography_refinement_converges() {
    let truth = SL3::exp(&SL3Tangent::from_column_slice(&[
        0.08, -0.04, 0.06, 0.03, -0.05, 0.04, 0.015, -0.01,
    ]));
    let mut rng = StdRng::seed_from_u64(53);
    let matches: Vec<PlanarMatch> = (0..25)
        .map(|_| {
            let reference = Vector2::new(rng.gen_range(-0.6..0.6), rng.gen_range(-0.6..0.6));
            PlanarMatch::new(reference, truth.apply(&reference).unwrap())
        })
        .collect();
    let model = PlanarPoint::new(matches);

    let perturbation = SL3Tangent::from_column_slice(&[
        0.02, 0.01, -0.015, 0.008, 0.01, -0.012, 0.004, 0.003,
    ]);
    let mut state = RefinementState::new(truth.right_plus(&perturbation));

    let report = VvsSolver::new().refine(&mut state, &model).unwrap();
    assert_eq!(report.status, VvsStatus::Converged);

    let recovered = state.transform.as_sl3().unwrap();
    assert!(recovered.is_valid(1e-9), "determinant drifted off 1");
    assert!((recovered.matrix() - truth.matrix()).norm() < 1e-6);
}

#[test]
fn photometric_patch_recovers_warp_and_illumination() {
    // Smooth synthetic scene with analytic gradient.
    let scene = |u: f64, v: f64| {
        let intensity = (2.0 * u).sin() * (1.5 * v).cos() + 0.4 * u - 0.2 * v;
        let grad_u = 2.0 * (2.0 * u).cos() * (1.5 * v).cos() + 0.4;
        let grad_v = -1.5 * (2.0 * u).sin() * (1.5 * v).sin() - 0.2;
        Some((intensity, grad_u, grad_v))
    };

    let truth_warp = SL3::exp(&SL3Tangent::from_column_slice(&[
        0.05, -0.03, 0.04, 0.02, -0.03, 0.025, 0.008, -0.006,
    ]));
    let truth_gain = 1.3;
    let truth_bias = -0.2;

    // Reference patch rendered through the ground-truth warp and lighting.
    let mut reference = Vec::new();
    for i in -3..=3 {
        for j in -3..=3 {
            let x = 0.08 * f64::from(i);
            let y = 0.08 * f64::from(j);
            let warped = truth_warp.apply(&Vector2::new(x, y)).unwrap();
            let (intensity, _, _) = scene(warped.x, warped.y).unwrap();
            reference.push(PatchSample::new(
                x,
                y,
                truth_gain * intensity + truth_bias,
            ));
        }
    }
    let model = PhotometricPatch::new(reference, scene);

    let perturbation =
        SL3Tangent::from_column_slice(&[0.01, 0.005, -0.008, 0.004, 0.006, -0.005, 0.002, 0.001]);
    let mut state = RefinementState::with_nuisance(
        truth_warp.right_plus(&perturbation),
        DVector::from_vec(vec![1.0, 0.0]),
    );

    let solver = VvsSolver::with_config(
        VvsConfig::new()
            .with_max_iterations(60)
            .with_estimator(MEstimator::None),
    );
    let report = solver.refine(&mut state, &model).unwrap();

    assert_eq!(report.status, VvsStatus::Converged);
    assert!((state.nuisance[0] - truth_gain).abs() < 1e-4, "gain error");
    assert!((state.nuisance[1] - truth_bias).abs() < 1e-4, "bias error");
    let recovered = state.transform.as_sl3().unwrap();
    assert!((recovered.matrix() - truth_warp.matrix()).norm() < 1e-4);
}

#[test]
fn refinement_is_idempotent_at_convergence() {
    let truth = ground_truth_pose();
    let model = PointReprojection::new(point_scene(&truth, 30, 0, 67));
    let perturbation = Vector6::new(0.03, -0.02, 0.04, 0.01, 0.02, -0.02);
    let mut state = RefinementState::new(truth.right_plus(&perturbation));

    let solver = VvsSolver::new();
    let first = solver.refine(&mut state, &model).unwrap();
    assert_eq!(first.status, VvsStatus::Converged);

    let converged = state.clone();
    let second = solver.refine(&mut state, &model).unwrap();
    assert_eq!(second.status, VvsStatus::Converged);

    let a = converged.transform.as_se3().unwrap();
    let b = state.transform.as_se3().unwrap();
    assert!(
        (a.translation() - b.translation()).norm() < solver.config().convergence_threshold * 10.0
    );
    assert!(a.rotation().angle_to(b.rotation()) < solver.config().convergence_threshold * 10.0);
}
