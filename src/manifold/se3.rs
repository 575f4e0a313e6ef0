//! SE(3) - Special Euclidean Group in 3D
//!
//! This module implements the Special Euclidean group SE(3), which represents
//! rigid body transformations in 3D space (rotation + translation).
//!
//! SE(3) elements are represented as a combination of SO(3) rotation and
//! Vector3 translation. SE(3) tangent elements are [rho(3), theta(3)] = 6
//! components, where rho is the translational component and theta the
//! rotational component.

use crate::manifold::so3::SO3;
use crate::manifold::LieGroup;
use nalgebra::{Matrix4, Vector3, Vector6};
use std::fmt;

/// SE(3) group element representing rigid body transformations in 3D.
#[derive(Clone, Debug, PartialEq)]
pub struct SE3 {
    /// Rotation part as SO(3) element
    rotation: SO3,
    /// Translation part
    translation: Vector3<f64>,
}

impl fmt::Display for SE3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.translation();
        let q = self.rotation.quaternion();
        write!(
            f,
            "SE3(translation: [{:.4}, {:.4}, {:.4}], rotation: [w: {:.4}, x: {:.4}, y: {:.4}, z: {:.4}])",
            t.x, t.y, t.z, q.w, q.i, q.j, q.k
        )
    }
}

impl SE3 {
    /// Create a new SE(3) element from translation and rotation.
    pub fn from_parts(translation: Vector3<f64>, rotation: SO3) -> Self {
        SE3 {
            rotation,
            translation,
        }
    }

    /// Get the translation part.
    pub fn translation(&self) -> Vector3<f64> {
        self.translation
    }

    /// Get the rotation part.
    pub fn rotation(&self) -> &SO3 {
        &self.rotation
    }

    /// Get the homogeneous transformation matrix (4x4).
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.rotation_matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Transform a point: R p + t.
    pub fn act(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation.act(point) + self.translation
    }

    /// Logarithmic map: τ = Log(M) = [V(θ)⁻¹ t, Log(R)].
    pub fn log(&self) -> Vector6<f64> {
        let theta = self.rotation.log();
        let rho = SO3::left_jacobian_inv(&theta) * self.translation;
        let mut tau = Vector6::zeros();
        tau.fixed_rows_mut::<3>(0).copy_from(&rho);
        tau.fixed_rows_mut::<3>(3).copy_from(&theta);
        tau
    }
}

impl LieGroup for SE3 {
    type TangentVector = Vector6<f64>;

    const DOF: usize = 6;

    fn identity() -> Self {
        SE3 {
            rotation: SO3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// SE(3) inverse: M⁻¹ = [Rᵀ, -Rᵀ t; 0, 1].
    fn inverse(&self) -> Self {
        let rotation_inv = self.rotation.inverse();
        let translation_inv = -rotation_inv.act(&self.translation);
        SE3 {
            rotation: rotation_inv,
            translation: translation_inv,
        }
    }

    /// Composition: Mₐ M_b = [Rₐ R_b, Rₐ t_b + tₐ; 0, 1].
    fn compose(&self, other: &Self) -> Self {
        SE3 {
            rotation: self.rotation.compose(&other.rotation),
            translation: self.rotation.act(&other.translation) + self.translation,
        }
    }

    /// Exponential map: M = Exp(τ) = [R(θ), V(θ) ρ; 0, 1]
    /// where V(θ) is the SO(3) left Jacobian.
    ///
    /// The V matrix carries its own small-angle series, so the degenerate
    /// zero-rotation case reduces to a pure translation without a separate
    /// code path.
    fn exp(tau: &Self::TangentVector) -> Self {
        let rho = tau.fixed_rows::<3>(0).into_owned();
        let theta = tau.fixed_rows::<3>(3).into_owned();
        let rotation = SO3::exp(&theta);
        let translation = SO3::left_jacobian(&theta) * rho;
        SE3 {
            rotation,
            translation,
        }
    }

    fn normalize(&mut self) {
        self.rotation.normalize();
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        self.rotation.is_valid(tolerance)
            && self.translation.iter().all(|component| component.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exp_log_round_trip() {
        let tau = Vector6::new(0.5, -0.3, 0.8, 0.2, -0.4, 0.1);
        let pose = SE3::exp(&tau);
        assert_relative_eq!(pose.log(), tau, epsilon = 1e-10);
    }

    #[test]
    fn exp_pure_translation() {
        let tau = Vector6::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0);
        let pose = SE3::exp(&tau);
        assert_relative_eq!(pose.translation(), Vector3::new(1.0, 2.0, 3.0));
        assert!(pose.rotation().angle_to(&SO3::identity()) < 1e-15);
    }

    #[test]
    fn compose_with_inverse_is_identity() {
        let pose = SE3::exp(&Vector6::new(0.3, 1.0, -0.5, 0.2, 0.1, -0.3));
        let product = pose.compose(&pose.inverse());
        assert!(product.translation().norm() < 1e-12);
        assert!(product.rotation().angle_to(&SO3::identity()) < 1e-12);
    }

    #[test]
    fn act_matches_homogeneous_matrix() {
        let pose = SE3::exp(&Vector6::new(0.1, -0.2, 0.3, 0.4, 0.5, -0.6));
        let p = Vector3::new(2.0, -1.0, 3.0);
        let homogeneous = pose.matrix() * nalgebra::Vector4::new(p.x, p.y, p.z, 1.0);
        assert_relative_eq!(
            pose.act(&p),
            homogeneous.fixed_rows::<3>(0).into_owned(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn right_plus_round_trip() {
        let pose = SE3::exp(&Vector6::new(0.4, 0.7, -0.2, 0.1, -0.1, 0.2));
        let delta = Vector6::new(0.01, -0.02, 0.03, 0.004, 0.005, -0.006);
        let there = pose.right_plus(&delta);
        let back = there.right_plus(&(-delta));
        assert!((back.translation() - pose.translation()).norm() < 1e-10);
        assert!(back.rotation().angle_to(pose.rotation()) < 1e-10);
    }
}
