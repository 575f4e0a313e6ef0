//! Manifold representations for optimization on non-Euclidean spaces.
//!
//! This module provides the matrix Lie groups used by the refinement engine:
//! - **SE(3)**: Special Euclidean group (rigid body transformations)
//! - **SO(3)**: Special Orthogonal group (rotations)
//! - **SL(3)**: Special Linear group (planar projective transformations,
//!   i.e. homographies with unit determinant)
//!
//! Lie group M,° | size | dim | X ∈ M                | Constraint | T_X M    | Exp(T)
//! ------------- | ---- | --- | -------------------- | ---------- | -------- | ---------
//! Rotation      | SO(3)| 3   | R                    | RᵀR = I    | θ ∈ R³   | R = exp([θ]ₓ)
//! Rigid motion  | SE(3)| 6   | M = [R t; 0 1]       | RᵀR = I    | τ ∈ R⁶   | Exp([τ])
//! Homography    | SL(3)| 8   | H ∈ R³ˣ³             | det H = 1  | δ ∈ R⁸   | exp(Σδₖ Gₖ)
//!
//! All groups use the right-multiplicative update convention
//! `X ← X ∘ Exp(δ)`: the tangent increment is expressed in the moving
//! (camera) frame. SL(3) additionally renormalizes its determinant to +1
//! after every composition so that scale drift cannot accumulate over long
//! tracking sequences.
//!
//! Applications that estimate non-geometric nuisance parameters alongside the
//! transformation (photometric gain/bias, affine illumination correction)
//! describe their state with a [`Parameterization`] carrying a trailing
//! additive block; see [`Parameterization::with_nuisance`].

use std::fmt;
use std::fmt::Debug;

pub mod se3;
pub mod sl3;
pub mod so3;

pub use se3::SE3;
pub use sl3::SL3;
pub use so3::SO3;

/// Errors that can occur during manifold operations.
#[derive(Debug, Clone, PartialEq)]
pub enum ManifoldError {
    /// Invalid tangent vector dimension
    InvalidTangentDimension { expected: usize, actual: usize },
    /// Numerical instability in computation
    NumericalInstability(String),
    /// Invalid manifold element
    InvalidElement(String),
}

impl fmt::Display for ManifoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldError::InvalidTangentDimension { expected, actual } => {
                write!(
                    f,
                    "Invalid tangent dimension: expected {expected}, got {actual}"
                )
            }
            ManifoldError::NumericalInstability(msg) => {
                write!(f, "Numerical instability: {msg}")
            }
            ManifoldError::InvalidElement(msg) => {
                write!(f, "Invalid manifold element: {msg}")
            }
        }
    }
}

impl std::error::Error for ManifoldError {}

/// Result type for manifold operations.
pub type ManifoldResult<T> = Result<T, ManifoldError>;

/// Core trait for Lie group operations.
///
/// Each group provides composition, inversion, the exponential map from its
/// tangent space, and the right-plus update used by the iteration controller.
/// The logarithmic map is provided as an inherent method on the groups that
/// need it (SO(3), SE(3)); the engine itself never requires it.
pub trait LieGroup: Clone + Debug + PartialEq {
    /// The tangent space vector type (e.g. `Vector6<f64>` for SE(3))
    type TangentVector: Clone + Debug;

    /// Degrees of freedom - dimension of the tangent space
    const DOF: usize;

    /// Get the identity element of the group.
    fn identity() -> Self;

    /// Compute the inverse of this element: g⁻¹ such that g ∘ g⁻¹ = e.
    fn inverse(&self) -> Self;

    /// Compose this element with another (group multiplication g₁ ∘ g₂).
    fn compose(&self, other: &Self) -> Self;

    /// Exponential map from tangent space to the group: exp(τ^∧).
    fn exp(tangent: &Self::TangentVector) -> Self;

    /// Right plus operation: g ⊞ τ = g ∘ exp(τ^∧).
    fn right_plus(&self, tangent: &Self::TangentVector) -> Self {
        let mut result = self.compose(&Self::exp(tangent));
        result.normalize();
        result
    }

    /// Project the element back onto the manifold (re-orthonormalize the
    /// rotation, renormalize the determinant).
    fn normalize(&mut self);

    /// Check if the element satisfies the manifold constraints.
    fn is_valid(&self, tolerance: f64) -> bool;
}

/// Closed set of supported transformation groups.
///
/// Adding a new group means adding a variant here together with its entry in
/// every `match` below; the engine itself is group-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifoldType {
    /// Rigid body motion in 3D (6 DoF)
    SE3,
    /// Rotation in 3D (3 DoF)
    SO3,
    /// Planar projective transformation (8 DoF)
    SL3,
}

impl ManifoldType {
    /// Tangent space dimension of the group.
    pub fn dof(&self) -> usize {
        match self {
            ManifoldType::SE3 => SE3::DOF,
            ManifoldType::SO3 => SO3::DOF,
            ManifoldType::SL3 => SL3::DOF,
        }
    }
}

impl fmt::Display for ManifoldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifoldType::SE3 => write!(f, "SE(3)"),
            ManifoldType::SO3 => write!(f, "SO(3)"),
            ManifoldType::SL3 => write!(f, "SL(3)"),
        }
    }
}

/// Full state parameterization: a transformation group plus an optional
/// trailing block of additively-updated nuisance parameters.
///
/// The composite tangent vector is `[geometric(dof), nuisance(n)]`: the
/// leading block goes through the exponential map, the trailing block is
/// added component-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parameterization {
    /// The transformation group of the geometric block
    pub manifold: ManifoldType,
    /// Number of additively-updated trailing parameters
    pub nuisance_dim: usize,
}

impl Parameterization {
    /// Rigid-motion parameterization (6 DoF, no nuisance block).
    pub fn se3() -> Self {
        Parameterization {
            manifold: ManifoldType::SE3,
            nuisance_dim: 0,
        }
    }

    /// Rotation-only parameterization (3 DoF, no nuisance block).
    pub fn so3() -> Self {
        Parameterization {
            manifold: ManifoldType::SO3,
            nuisance_dim: 0,
        }
    }

    /// Planar projective parameterization (8 DoF, no nuisance block).
    pub fn sl3() -> Self {
        Parameterization {
            manifold: ManifoldType::SL3,
            nuisance_dim: 0,
        }
    }

    /// Append `dim` additively-updated nuisance parameters.
    pub fn with_nuisance(mut self, dim: usize) -> Self {
        self.nuisance_dim = dim;
        self
    }

    /// Dimension of the geometric (exponential-map) block.
    pub fn geometric_dim(&self) -> usize {
        self.manifold.dof()
    }

    /// Total tangent dimension (geometric + nuisance).
    pub fn dim(&self) -> usize {
        self.manifold.dof() + self.nuisance_dim
    }
}

impl fmt::Display for Parameterization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nuisance_dim == 0 {
            write!(f, "{}", self.manifold)
        } else {
            write!(f, "{} + {} nuisance", self.manifold, self.nuisance_dim)
        }
    }
}

/// A transformation belonging to one of the supported groups.
///
/// This is the pose type mutated in place by each refinement iteration. The
/// tagged representation keeps dispatch closed: dimension, exponential map
/// and renormalization are all resolved by matching on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// Rigid body motion
    SE3(SE3),
    /// Pure rotation
    SO3(SO3),
    /// Planar projective transformation
    SL3(SL3),
}

impl Transform {
    /// The group this transformation belongs to.
    pub fn manifold_type(&self) -> ManifoldType {
        match self {
            Transform::SE3(_) => ManifoldType::SE3,
            Transform::SO3(_) => ManifoldType::SO3,
            Transform::SL3(_) => ManifoldType::SL3,
        }
    }

    /// Tangent space dimension of the underlying group.
    pub fn dof(&self) -> usize {
        self.manifold_type().dof()
    }

    /// Apply a tangent-space increment: `X ← X ∘ Exp(δ)`, followed by
    /// renormalization.
    ///
    /// The tangent slice length must equal [`Transform::dof`]; a mismatch is
    /// reported rather than truncated.
    pub fn compose_increment(&self, tangent: &[f64]) -> ManifoldResult<Transform> {
        if tangent.len() != self.dof() {
            return Err(ManifoldError::InvalidTangentDimension {
                expected: self.dof(),
                actual: tangent.len(),
            });
        }
        Ok(match self {
            Transform::SE3(g) => {
                let tau = nalgebra::Vector6::from_column_slice(tangent);
                Transform::SE3(g.right_plus(&tau))
            }
            Transform::SO3(g) => {
                let theta = nalgebra::Vector3::from_column_slice(tangent);
                Transform::SO3(g.right_plus(&theta))
            }
            Transform::SL3(g) => {
                let delta = nalgebra::SVector::<f64, 8>::from_column_slice(tangent);
                Transform::SL3(g.right_plus(&delta))
            }
        })
    }

    /// Project back onto the manifold.
    pub fn normalize(&mut self) {
        match self {
            Transform::SE3(g) => g.normalize(),
            Transform::SO3(g) => g.normalize(),
            Transform::SL3(g) => g.normalize(),
        }
    }

    /// Check the manifold constraints up to `tolerance`.
    pub fn is_valid(&self, tolerance: f64) -> bool {
        match self {
            Transform::SE3(g) => g.is_valid(tolerance),
            Transform::SO3(g) => g.is_valid(tolerance),
            Transform::SL3(g) => g.is_valid(tolerance),
        }
    }

    /// Borrow the SE(3) element, if this is a rigid motion.
    pub fn as_se3(&self) -> Option<&SE3> {
        match self {
            Transform::SE3(g) => Some(g),
            _ => None,
        }
    }

    /// Borrow the SO(3) element, if this is a rotation.
    pub fn as_so3(&self) -> Option<&SO3> {
        match self {
            Transform::SO3(g) => Some(g),
            _ => None,
        }
    }

    /// Borrow the SL(3) element, if this is a homography.
    pub fn as_sl3(&self) -> Option<&SL3> {
        match self {
            Transform::SL3(g) => Some(g),
            _ => None,
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::SE3(g) => write!(f, "{g}"),
            Transform::SO3(g) => write!(f, "{g}"),
            Transform::SL3(g) => write!(f, "{g}"),
        }
    }
}

impl From<SE3> for Transform {
    fn from(g: SE3) -> Self {
        Transform::SE3(g)
    }
}

impl From<SO3> for Transform {
    fn from(g: SO3) -> Self {
        Transform::SO3(g)
    }
}

impl From<SL3> for Transform {
    fn from(g: SL3) -> Self {
        Transform::SL3(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn parameterization_dimensions() {
        assert_eq!(Parameterization::se3().dim(), 6);
        assert_eq!(Parameterization::so3().dim(), 3);
        assert_eq!(Parameterization::sl3().dim(), 8);
        let composite = Parameterization::sl3().with_nuisance(2);
        assert_eq!(composite.geometric_dim(), 8);
        assert_eq!(composite.dim(), 10);
    }

    #[test]
    fn compose_increment_rejects_wrong_dimension() {
        let pose = Transform::SE3(SE3::identity());
        let result = pose.compose_increment(&[0.0; 3]);
        assert_eq!(
            result,
            Err(ManifoldError::InvalidTangentDimension {
                expected: 6,
                actual: 3
            })
        );
    }

    #[test]
    fn compose_increment_round_trip() {
        // Exp(δ) followed by Exp(-δ) must return to the start for every group.
        let tangents: [(Transform, Vec<f64>); 3] = [
            (
                Transform::SE3(SE3::from_parts(
                    Vector3::new(0.3, -0.2, 1.4),
                    SO3::exp(&Vector3::new(0.1, 0.2, -0.3)),
                )),
                vec![0.05, -0.02, 0.03, 0.01, -0.04, 0.02],
            ),
            (
                Transform::SO3(SO3::exp(&Vector3::new(0.4, -0.1, 0.2))),
                vec![0.02, 0.03, -0.01],
            ),
            (
                Transform::SL3(SL3::exp(&nalgebra::SVector::<f64, 8>::from_column_slice(
                    &[0.01, -0.02, 0.03, 0.005, -0.01, 0.02, 0.001, -0.002],
                ))),
                vec![0.02, 0.01, -0.03, 0.004, 0.006, -0.01, 0.002, 0.001],
            ),
        ];

        for (pose, delta) in tangents {
            let forward = pose.compose_increment(&delta).unwrap();
            let neg: Vec<f64> = delta.iter().map(|v| -v).collect();
            let back = forward.compose_increment(&neg).unwrap();
            assert!(back.is_valid(1e-9));
            match (&pose, &back) {
                (Transform::SE3(a), Transform::SE3(b)) => {
                    assert!((a.translation() - b.translation()).norm() < 1e-9);
                    assert!(a.rotation().angle_to(b.rotation()) < 1e-9);
                }
                (Transform::SO3(a), Transform::SO3(b)) => {
                    assert!(a.angle_to(b) < 1e-9);
                }
                (Transform::SL3(a), Transform::SL3(b)) => {
                    assert!((a.matrix() - b.matrix()).norm() < 1e-9);
                }
                _ => unreachable!(),
            }
        }
    }
}
