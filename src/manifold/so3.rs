//! SO(3) - Special Orthogonal Group in 3D
//!
//! This module implements the Special Orthogonal group SO(3), which represents
//! rotations in 3D space.
//!
//! SO(3) elements are represented using nalgebra's UnitQuaternion internally.
//! SO(3) tangent elements are axis-angle vectors in R³, where the direction
//! gives the axis of rotation and the magnitude gives the angle.

use crate::manifold::LieGroup;
use nalgebra::{Matrix3, Quaternion, Unit, UnitQuaternion, Vector3};
use std::fmt;

/// Angle below which the closed-form small-angle series replaces the exact
/// trigonometric expressions.
const SMALL_ANGLE: f64 = 1e-8;

/// Skew-symmetric matrix of a 3-vector: the hat operator [v]ₓ ∈ so(3).
///
/// [v]ₓ w = v × w for all w.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// SO(3) group element representing rotations in 3D.
///
/// Internally represented using nalgebra's UnitQuaternion<f64>.
#[derive(Clone, Debug, PartialEq)]
pub struct SO3 {
    /// Internal representation as a unit quaternion
    quaternion: UnitQuaternion<f64>,
}

impl fmt::Display for SO3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let q = self.quaternion.quaternion();
        write!(
            f,
            "SO3(quaternion: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            q.w, q.i, q.j, q.k
        )
    }
}

impl SO3 {
    /// Create a new SO(3) element from a unit quaternion.
    pub fn new(quaternion: UnitQuaternion<f64>) -> Self {
        SO3 { quaternion }
    }

    /// Create SO(3) from axis-angle representation.
    pub fn from_axis_angle(axis: &Vector3<f64>, angle: f64) -> Self {
        let unit_axis = Unit::new_normalize(*axis);
        SO3::new(UnitQuaternion::from_axis_angle(&unit_axis, angle))
    }

    /// Create SO(3) from a rotation matrix.
    ///
    /// The input is orthonormalized iteratively, so a slightly off-manifold
    /// matrix (e.g. the output of a linear solver) is accepted.
    pub fn from_matrix(matrix: &Matrix3<f64>) -> Self {
        SO3::new(UnitQuaternion::from_matrix(matrix))
    }

    /// Get the quaternion representation.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        self.quaternion
    }

    /// Get the rotation matrix (3x3).
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.quaternion.to_rotation_matrix().into_inner()
    }

    /// Rotate a vector: R v.
    pub fn act(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.quaternion * vector
    }

    /// Rotation angle (radians) between this rotation and another.
    pub fn angle_to(&self, other: &SO3) -> f64 {
        self.quaternion.angle_to(&other.quaternion)
    }

    /// Logarithmic map: axis-angle vector θ = Log(R) ∈ R³.
    ///
    /// Computed from the quaternion as θu = (2 / ‖v‖) · v · atan2(‖v‖, w),
    /// with the small-angle coefficient 2 when the vector part vanishes.
    pub fn log(&self) -> Vector3<f64> {
        let q = self.quaternion.quaternion();
        let sin_angle_squared = q.i * q.i + q.j * q.j + q.k * q.k;

        let log_coeff = if sin_angle_squared > f64::EPSILON {
            let sin_angle = sin_angle_squared.sqrt();
            let cos_angle = q.w;

            // cos_angle < 0 means the quaternion encodes an angle >= pi;
            // flip both arguments so the recovered angle stays in [0, pi].
            let two_angle = 2.0
                * if cos_angle < 0.0 {
                    f64::atan2(-sin_angle, -cos_angle)
                } else {
                    f64::atan2(sin_angle, cos_angle)
                };

            two_angle / sin_angle
        } else {
            2.0
        };

        Vector3::new(q.i * log_coeff, q.j * log_coeff, q.k * log_coeff)
    }

    /// Left Jacobian Jl(θ) of the SO(3) exponential map.
    ///
    /// Jl(θ) = I + (1 - cos θ)/θ² [θ]ₓ + (θ - sin θ)/θ³ [θ]ₓ²
    ///
    /// This is also the V(θ) matrix mapping the translational tangent
    /// component to the translation of Exp on SE(3).
    pub fn left_jacobian(theta: &Vector3<f64>) -> Matrix3<f64> {
        let angle = theta.norm();
        let theta_hat = skew(theta);
        let theta_hat2 = theta_hat * theta_hat;

        if angle < SMALL_ANGLE {
            // Second-order Taylor expansion of the coefficients.
            return Matrix3::identity() + 0.5 * theta_hat + theta_hat2 / 6.0;
        }

        let angle2 = angle * angle;
        let a = (1.0 - angle.cos()) / angle2;
        let b = (angle - angle.sin()) / (angle2 * angle);
        Matrix3::identity() + a * theta_hat + b * theta_hat2
    }

    /// Inverse of the left Jacobian Jl(θ)⁻¹.
    ///
    /// Jl(θ)⁻¹ = I - (1/2)[θ]ₓ + (1/θ² - (1 + cos θ)/(2 θ sin θ)) [θ]ₓ²
    pub fn left_jacobian_inv(theta: &Vector3<f64>) -> Matrix3<f64> {
        let angle = theta.norm();
        let theta_hat = skew(theta);
        let theta_hat2 = theta_hat * theta_hat;

        if angle < SMALL_ANGLE {
            return Matrix3::identity() - 0.5 * theta_hat + theta_hat2 / 12.0;
        }

        let angle2 = angle * angle;
        let coeff = 1.0 / angle2 - (1.0 + angle.cos()) / (2.0 * angle * angle.sin());
        Matrix3::identity() - 0.5 * theta_hat + coeff * theta_hat2
    }
}

impl LieGroup for SO3 {
    type TangentVector = Vector3<f64>;

    const DOF: usize = 3;

    fn identity() -> Self {
        SO3 {
            quaternion: UnitQuaternion::identity(),
        }
    }

    /// SO(3) inverse: R⁻¹ = Rᵀ, for quaternions q⁻¹ = q*.
    fn inverse(&self) -> Self {
        SO3 {
            quaternion: self.quaternion.inverse(),
        }
    }

    fn compose(&self, other: &Self) -> Self {
        SO3 {
            quaternion: self.quaternion * other.quaternion,
        }
    }

    /// Exponential map: R = exp([θ]ₓ).
    ///
    /// Near-zero rotation axes with non-zero angle cannot be normalized
    /// reliably; below the small-angle threshold a first-order quaternion
    /// linearization (renormalized) is used instead of the trigonometric
    /// closed form.
    fn exp(theta: &Self::TangentVector) -> Self {
        let angle = theta.norm();
        if angle < SMALL_ANGLE {
            let q = Quaternion::new(1.0, 0.5 * theta.x, 0.5 * theta.y, 0.5 * theta.z);
            return SO3::new(UnitQuaternion::from_quaternion(q));
        }
        SO3::new(UnitQuaternion::from_scaled_axis(*theta))
    }

    fn normalize(&mut self) {
        let q = self.quaternion.quaternion().normalize();
        self.quaternion = UnitQuaternion::from_quaternion(q);
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.quaternion.quaternion().norm() - 1.0).abs() < tolerance
    }
}
