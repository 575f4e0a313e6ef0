//! Seven-point multi-camera rig pose solver.
//!
//! Estimates the pose of a calibrated multi-camera rig (cameras with known
//! extrinsics, fields of view not required to overlap) from 3D-2D
//! correspondences spread across the cameras. Each observation constrains
//! the rig pose through the generalized projection
//!
//! ```text
//! [b]ₓ · ( R_c (R w + t) + t_c ) = 0
//! ```
//!
//! which is linear in the twelve entries of [R|t]: two independent rows per
//! observation, solved in least squares over the seven-point sample by SVD,
//! after which the rotation block is projected onto SO(3). Because the
//! camera offsets `t_c` make the system inhomogeneous, the scale of the
//! solution is fixed — this is what makes the non-overlapping case solvable
//! at all; a rig whose cameras share a single center carries no scale
//! information and is rejected.

use crate::manifold::so3::skew;
use crate::manifold::{LieGroup, SE3, SO3};
use crate::ransac::MinimalSolver;
use nalgebra::{DMatrix, DVector, Matrix3, Unit, Vector3};

/// Ratio bound between the largest and smallest singular value of the raw
/// rotation block beyond which the linear solution is considered degenerate.
const ROTATION_CONDITION_BOUND: f64 = 3.0;

/// Singular-value ratio below which the sampled world points are treated as
/// collinear.
const COLLINEAR_RATIO: f64 = 1e-6;

/// One observation from a rig camera: which camera saw it, the world point,
/// and the observed direction in that camera's frame.
#[derive(Debug, Clone)]
pub struct RigObservation {
    /// Index into the rig's camera extrinsics
    pub camera: usize,
    /// Model-side 3D point in world coordinates
    pub world: Vector3<f64>,
    /// Observed direction in the camera frame (unit vector)
    pub bearing: Unit<Vector3<f64>>,
}

impl RigObservation {
    /// Construct an observation.
    pub fn new(camera: usize, world: Vector3<f64>, bearing: Unit<Vector3<f64>>) -> Self {
        RigObservation {
            camera,
            world,
            bearing,
        }
    }
}

/// Linear rig-pose solver over seven observations.
#[derive(Debug, Clone)]
pub struct RigPoseSolver {
    /// Camera-from-rig extrinsic of every camera in the rig
    cameras: Vec<SE3>,
}

impl RigPoseSolver {
    /// Build the solver for a rig. At least two camera centers must differ
    /// for the pose scale to be observable.
    pub fn new(cameras: Vec<SE3>) -> Self {
        RigPoseSolver { cameras }
    }

    /// The rig's camera extrinsics.
    pub fn cameras(&self) -> &[SE3] {
        &self.cameras
    }

    /// Camera-frame point of an observation under a candidate rig pose.
    fn camera_point(&self, pose: &SE3, observation: &RigObservation) -> Option<Vector3<f64>> {
        let extrinsic = self.cameras.get(observation.camera)?;
        Some(extrinsic.act(&pose.act(&observation.world)))
    }
}

impl MinimalSolver for RigPoseSolver {
    type Datum = RigObservation;
    type Model = SE3;

    fn sample_size(&self) -> usize {
        7
    }

    /// Collinear world points leave the rotation block underdetermined.
    fn is_degenerate(&self, data: &[Self::Datum], sample: &[usize]) -> bool {
        let mut centroid = Vector3::zeros();
        for &index in sample {
            centroid += data[index].world;
        }
        centroid /= sample.len() as f64;

        let mut spread = DMatrix::zeros(3, sample.len());
        for (column, &index) in sample.iter().enumerate() {
            spread
                .column_mut(column)
                .copy_from(&(data[index].world - centroid));
        }
        let singular_values = spread.svd(false, false).singular_values;
        if singular_values[0] <= f64::EPSILON {
            return true;
        }
        // Rank below 2: all points on one line.
        singular_values[1] / singular_values[0] < COLLINEAR_RATIO
    }

    fn solve(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model> {
        // Two rows of [b]ₓ R_c per observation; unknowns ordered as
        // [R00..R22 row-major, t0, t1, t2].
        let rows = 2 * sample.len();
        let mut system = DMatrix::zeros(rows, 12);
        let mut rhs = DVector::zeros(rows);

        for (pair, &index) in sample.iter().enumerate() {
            let observation = &data[index];
            let Some(extrinsic) = self.cameras.get(observation.camera) else {
                return Vec::new();
            };
            let annihilator = skew(&observation.bearing.into_inner());
            let coefficient = annihilator * extrinsic.rotation().rotation_matrix();
            let offset = annihilator * extrinsic.translation();
            let w = observation.world;

            for local_row in 0..2 {
                let row = 2 * pair + local_row;
                for j in 0..3 {
                    for k in 0..3 {
                        system[(row, 3 * j + k)] = coefficient[(local_row, j)] * w[k];
                    }
                    system[(row, 9 + j)] = coefficient[(local_row, j)];
                }
                rhs[row] = -offset[local_row];
            }
        }

        let Ok(solution) = system.svd(true, true).solve(&rhs, 1e-12) else {
            return Vec::new();
        };
        if solution.iter().any(|value| !value.is_finite()) {
            return Vec::new();
        }

        let raw_rotation = Matrix3::from_row_slice(&solution.as_slice()[0..9]);
        let translation = Vector3::new(solution[9], solution[10], solution[11]);

        // Guard against a collapsed or wildly skewed rotation block before
        // projecting onto SO(3).
        let singular_values = raw_rotation.svd(false, false).singular_values;
        if singular_values[2] <= f64::EPSILON
            || singular_values[0] / singular_values[2] > ROTATION_CONDITION_BOUND
        {
            return Vec::new();
        }

        let rotation = SO3::from_matrix(&raw_rotation);
        let pose = SE3::from_parts(translation, rotation);

        // Every sample observation must look at its point from the front.
        let all_in_front = sample.iter().all(|&index| {
            let observation = &data[index];
            self.camera_point(&pose, observation)
                .is_some_and(|point| point.dot(&observation.bearing.into_inner()) > 0.0)
        });
        if !all_in_front {
            return Vec::new();
        }

        vec![pose]
    }

    /// Chordal direction distance in the observing camera.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> Option<f64> {
        let point = self.camera_point(model, datum)?;
        let norm = point.norm();
        if norm <= f64::EPSILON || point.dot(&datum.bearing.into_inner()) <= 0.0 {
            return None;
        }
        Some((point / norm - datum.bearing.into_inner()).norm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector6;

    /// Two-camera rig looking forward and sideways with offset centers.
    fn test_rig() -> Vec<SE3> {
        vec![
            SE3::from_parts(Vector3::new(0.2, 0.0, 0.0), SO3::identity()),
            SE3::from_parts(
                Vector3::new(-0.2, 0.1, 0.0),
                SO3::exp(&Vector3::new(0.0, 0.8, 0.0)),
            ),
        ]
    }

    fn synthetic_observations(rig: &[SE3], pose: &SE3, count: usize) -> Vec<RigObservation> {
        (0..count)
            .map(|i| {
                let camera = i % rig.len();
                let offset = i as f64;
                // Place each point in front of its assigned camera by pulling
                // it back through the ground-truth transforms.
                let camera_point = Vector3::new(
                    0.8 * (offset * 0.9).sin(),
                    0.7 * (offset * 1.2).cos(),
                    3.0 + 0.4 * (offset * 0.6).sin(),
                );
                let world = pose
                    .inverse()
                    .act(&rig[camera].inverse().act(&camera_point));
                RigObservation::new(camera, world, Unit::new_normalize(camera_point))
            })
            .collect()
    }

    #[test]
    fn recovers_rig_pose_from_seven_points() {
        let rig = test_rig();
        let truth = SE3::exp(&Vector6::new(0.3, -0.1, 0.2, 0.1, -0.05, 0.15));
        let data = synthetic_observations(&rig, &truth, 9);
        let solver = RigPoseSolver::new(rig);

        let poses = solver.solve(&data, &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(poses.len(), 1);
        let pose = &poses[0];
        assert!((pose.translation() - truth.translation()).norm() < 1e-8);
        assert!(pose.rotation().angle_to(truth.rotation()) < 1e-8);
    }

    #[test]
    fn recovered_pose_scores_all_observations() {
        let rig = test_rig();
        let truth = SE3::exp(&Vector6::new(-0.2, 0.15, 0.1, 0.05, 0.1, -0.1));
        let data = synthetic_observations(&rig, &truth, 10);
        let solver = RigPoseSolver::new(rig);
        let poses = solver.solve(&data, &[0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(poses.len(), 1);
        for datum in &data {
            let residual = solver.residual(&poses[0], datum).unwrap();
            assert!(residual < 1e-8, "direction residual {residual}");
        }
    }

    #[test]
    fn collinear_world_points_are_degenerate() {
        let rig = test_rig();
        let data: Vec<RigObservation> = (0..7)
            .map(|i| {
                let t = i as f64;
                RigObservation::new(
                    i % 2,
                    Vector3::new(t, 2.0 * t, -t),
                    Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                )
            })
            .collect();
        let solver = RigPoseSolver::new(rig);
        assert!(solver.is_degenerate(&data, &[0, 1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn unknown_camera_index_yields_no_model() {
        let rig = test_rig();
        let truth = SE3::identity();
        let mut data = synthetic_observations(&rig, &truth, 8);
        data[3].camera = 9;
        let solver = RigPoseSolver::new(rig);
        assert!(solver.solve(&data, &[0, 1, 2, 3, 4, 5, 6]).is_empty());
    }
}
