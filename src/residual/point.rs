//! Point-feature residual models: 3D point reprojection under SE(3) and
//! direction alignment under SO(3).

use crate::manifold::so3::skew;
use crate::manifold::{Parameterization, SE3, Transform};
use crate::residual::{projection_jacobian, Evaluation, RefinementState, ResidualModel};
use nalgebra::{DMatrix, DVector, Unit, Vector2, Vector3};

/// Depth below which a camera-frame point counts as behind the camera.
const MIN_DEPTH: f64 = 1e-6;

/// One 3D-2D correspondence: a known world point and the unit bearing of its
/// observation in the camera frame.
///
/// The bearing encodes the observed direction; for a pinhole observation it
/// is the normalized homogeneous image point. An optional scalar confidence
/// (default 1.0) scales the correspondence's influence in addition to the
/// per-iteration robust weight.
#[derive(Debug, Clone)]
pub struct PointCorrespondence {
    /// Model-side 3D point in world coordinates
    pub world: Vector3<f64>,
    /// Observed direction in the camera frame (unit vector)
    pub bearing: Unit<Vector3<f64>>,
    /// Caller-supplied prior confidence
    pub confidence: f64,
}

impl PointCorrespondence {
    /// Correspondence with unit confidence.
    pub fn new(world: Vector3<f64>, bearing: Unit<Vector3<f64>>) -> Self {
        PointCorrespondence {
            world,
            bearing,
            confidence: 1.0,
        }
    }

    /// Correspondence from a world point and a normalized image-plane
    /// observation (x, y) with implicit depth 1.
    pub fn from_image_point(world: Vector3<f64>, image: Vector2<f64>) -> Self {
        let bearing = Unit::new_normalize(Vector3::new(image.x, image.y, 1.0));
        PointCorrespondence::new(world, bearing)
    }

    /// Override the prior confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Normalized image-plane coordinates of the observation, `None` when the
    /// bearing points away from the image plane.
    pub fn image_point(&self) -> Option<Vector2<f64>> {
        let b = self.bearing.into_inner();
        if b.z <= MIN_DEPTH {
            return None;
        }
        Some(Vector2::new(b.x / b.z, b.y / b.z))
    }
}

/// Project a world point through a world-to-camera pose onto the normalized
/// image plane. Returns the image point and the camera-frame point, or `None`
/// for non-positive depth.
///
/// Shared by the reprojection residual model and the consensus scoring of the
/// pose solvers.
pub fn project(pose: &SE3, world: &Vector3<f64>) -> Option<(Vector2<f64>, Vector3<f64>)> {
    let p_cam = pose.act(world);
    if p_cam.z <= MIN_DEPTH {
        return None;
    }
    Some((Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z), p_cam))
}

/// Reprojection residual of 3D world points under a world-to-camera SE(3)
/// pose.
///
/// Residual: `π(T·w) − observed` on the normalized image plane (2
/// components). Jacobian w.r.t. the right-multiplicative update `T ← T·Exp(δ)`:
/// `Jπ(p) · [R  −R[w]ₓ]`.
pub struct PointReprojection {
    correspondences: Vec<PointCorrespondence>,
}

impl PointReprojection {
    /// Build the model over a correspondence set.
    pub fn new(correspondences: Vec<PointCorrespondence>) -> Self {
        PointReprojection { correspondences }
    }

    /// Access the correspondence set.
    pub fn correspondences(&self) -> &[PointCorrespondence] {
        &self.correspondences
    }
}

impl ResidualModel for PointReprojection {
    fn parameterization(&self) -> Parameterization {
        Parameterization::se3()
    }

    fn len(&self) -> usize {
        self.correspondences.len()
    }

    fn residual_dim(&self) -> usize {
        2
    }

    fn confidence(&self, index: usize) -> f64 {
        self.correspondences[index].confidence
    }

    fn evaluate(&self, state: &RefinementState, index: usize) -> Option<Evaluation> {
        let pose = state.transform.as_se3()?;
        let correspondence = &self.correspondences[index];
        let observed = correspondence.image_point()?;
        let (predicted, p_cam) = project(pose, &correspondence.world)?;

        let residual = predicted - observed;

        let rotation = pose.rotation().rotation_matrix();
        let j_projection = projection_jacobian(&p_cam);
        let j_point_translation = rotation;
        let j_point_rotation = -rotation * skew(&correspondence.world);

        let mut jacobian = DMatrix::zeros(2, 6);
        jacobian
            .view_mut((0, 0), (2, 3))
            .copy_from(&(j_projection * j_point_translation));
        jacobian
            .view_mut((0, 3), (2, 3))
            .copy_from(&(j_projection * j_point_rotation));

        Some(Evaluation {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobian,
        })
    }
}

/// One direction pair for rotation-only alignment: a reference direction and
/// its observation in the rotated frame.
#[derive(Debug, Clone)]
pub struct DirectionMatch {
    /// Reference-frame direction
    pub reference: Unit<Vector3<f64>>,
    /// Observed direction
    pub observed: Unit<Vector3<f64>>,
    /// Caller-supplied prior confidence
    pub confidence: f64,
}

impl DirectionMatch {
    /// Pair with unit confidence.
    pub fn new(reference: Unit<Vector3<f64>>, observed: Unit<Vector3<f64>>) -> Self {
        DirectionMatch {
            reference,
            observed,
            confidence: 1.0,
        }
    }
}

/// Rotation-only residual over direction pairs (gyroscope-free attitude
/// tracking, panorama alignment).
///
/// Residual: `R·a − b` (3 components). Jacobian for `R ← R·Exp(θ)`:
/// `−R[a]ₓ`.
pub struct BearingAlignment {
    pairs: Vec<DirectionMatch>,
}

impl BearingAlignment {
    /// Build the model over a set of direction pairs.
    pub fn new(pairs: Vec<DirectionMatch>) -> Self {
        BearingAlignment { pairs }
    }
}

impl ResidualModel for BearingAlignment {
    fn parameterization(&self) -> Parameterization {
        Parameterization::so3()
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn residual_dim(&self) -> usize {
        3
    }

    fn confidence(&self, index: usize) -> f64 {
        self.pairs[index].confidence
    }

    fn evaluate(&self, state: &RefinementState, index: usize) -> Option<Evaluation> {
        let rotation = match &state.transform {
            Transform::SO3(r) => r,
            _ => return None,
        };
        let pair = &self.pairs[index];
        let reference = pair.reference.into_inner();
        let residual = rotation.act(&reference) - pair.observed.into_inner();

        let jacobian_fixed = -rotation.rotation_matrix() * skew(&reference);
        let mut jacobian = DMatrix::zeros(3, 3);
        jacobian.view_mut((0, 0), (3, 3)).copy_from(&jacobian_fixed);

        Some(Evaluation {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{LieGroup, SO3};
    use crate::residual::test_support::check_jacobian;
    use approx::assert_relative_eq;
    use nalgebra::Vector6;

    fn sample_pose() -> SE3 {
        SE3::exp(&Vector6::new(0.1, -0.2, 0.3, 0.05, -0.1, 0.15))
    }

    fn synthetic_correspondences(pose: &SE3, count: usize) -> Vec<PointCorrespondence> {
        (0..count)
            .map(|i| {
                let offset = i as f64;
                let world = Vector3::new(
                    0.5 * (offset * 0.7).sin(),
                    0.4 * (offset * 1.3).cos(),
                    3.0 + 0.3 * offset,
                );
                let (image, _) = project(pose, &world).unwrap();
                PointCorrespondence::from_image_point(world, image)
            })
            .collect()
    }

    #[test]
    fn reprojection_residual_is_zero_at_ground_truth() {
        let pose = sample_pose();
        let model = PointReprojection::new(synthetic_correspondences(&pose, 6));
        let state = RefinementState::new(pose);
        for index in 0..model.len() {
            let evaluation = model.evaluate(&state, index).unwrap();
            assert!(evaluation.residual.norm() < 1e-12);
        }
    }

    #[test]
    fn reprojection_jacobian_matches_finite_differences() {
        let pose = sample_pose();
        let model = PointReprojection::new(synthetic_correspondences(&pose, 4));
        // Check at a state away from the ground truth so residuals are nonzero.
        let perturbed = pose.right_plus(&Vector6::new(0.02, -0.01, 0.03, 0.01, 0.02, -0.01));
        let state = RefinementState::new(perturbed);
        for index in 0..model.len() {
            check_jacobian(&model, &state, index);
        }
    }

    #[test]
    fn point_behind_camera_is_unobservable() {
        let model = PointReprojection::new(vec![PointCorrespondence::from_image_point(
            Vector3::new(0.0, 0.0, -5.0),
            Vector2::new(0.0, 0.0),
        )]);
        let state = RefinementState::new(SE3::identity());
        assert!(model.evaluate(&state, 0).is_none());
    }

    #[test]
    fn bearing_alignment_zero_residual_at_ground_truth() {
        let rotation = SO3::exp(&Vector3::new(0.2, -0.3, 0.4));
        let pairs: Vec<DirectionMatch> = (0..5)
            .map(|i| {
                let offset = i as f64;
                let reference = Unit::new_normalize(Vector3::new(
                    (offset * 0.9).sin() + 0.2,
                    (offset * 1.1).cos(),
                    1.0,
                ));
                let observed = Unit::new_normalize(rotation.act(&reference.into_inner()));
                DirectionMatch::new(reference, observed)
            })
            .collect();
        let model = BearingAlignment::new(pairs);
        let state = RefinementState::new(rotation);
        for index in 0..model.len() {
            let evaluation = model.evaluate(&state, index).unwrap();
            assert_relative_eq!(evaluation.residual.norm(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn bearing_alignment_jacobian_matches_finite_differences() {
        let rotation = SO3::exp(&Vector3::new(0.2, -0.3, 0.4));
        let pairs: Vec<DirectionMatch> = (0..3)
            .map(|i| {
                let offset = i as f64;
                let reference =
                    Unit::new_normalize(Vector3::new(0.3 + offset, 1.0 - offset * 0.4, 2.0));
                let observed = Unit::new_normalize(Vector3::new(0.1, offset * 0.2 - 0.5, 1.5));
                DirectionMatch::new(reference, observed)
            })
            .collect();
        let model = BearingAlignment::new(pairs);
        let state = RefinementState::new(rotation);
        for index in 0..model.len() {
            check_jacobian(&model, &state, index);
        }
    }
}
