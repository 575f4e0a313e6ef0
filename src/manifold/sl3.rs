//! SL(3) - Special Linear Group in 3D
//!
//! This module implements the Special Linear group SL(3): 3x3 real matrices
//! with determinant +1, used here as the group of planar projective
//! transformations (homographies) for plane-induced tracking.
//!
//! SL(3) tangent elements are 8-vectors over a fixed basis of trace-free
//! generator matrices: two translations, two rotation/shear components, two
//! scalings and two projective components. The exponential map is the matrix
//! exponential of the generator combination; every composition is followed by
//! a determinant renormalization so that the unit-determinant constraint
//! cannot drift over long tracking sequences.

use crate::manifold::LieGroup;
use nalgebra::{Matrix3, SVector, Vector2, Vector3};
use std::fmt;

/// Tangent vector type for SL(3): coefficients over the 8 generators.
pub type SL3Tangent = SVector<f64, 8>;

/// Squared-norm threshold below which the quadratic series truncation of the
/// matrix exponential is used directly, without scaling-and-squaring.
const SERIES_DIRECT_NORM: f64 = 0.5;

/// SL(3) group element representing a planar projective transformation.
///
/// The stored matrix always has determinant +1.
#[derive(Clone, Debug, PartialEq)]
pub struct SL3 {
    /// Internal 3x3 representation, det = +1
    matrix: Matrix3<f64>,
}

impl fmt::Display for SL3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.matrix;
        write!(
            f,
            "SL3([{:.4} {:.4} {:.4}; {:.4} {:.4} {:.4}; {:.4} {:.4} {:.4}])",
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)]
        )
    }
}

impl SL3 {
    /// Create an SL(3) element from an arbitrary invertible 3x3 matrix,
    /// renormalizing its determinant to +1.
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        let mut element = SL3 { matrix };
        element.normalize();
        element
    }

    /// Get the 3x3 matrix representation.
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    /// The fixed generator basis of sl(3): trace-free 3x3 matrices ordered as
    /// [x-translation, y-translation, x-shear, y-shear, anisotropic scale,
    /// scale/projective mix, x-projective, y-projective].
    pub fn generators() -> [Matrix3<f64>; 8] {
        [
            Matrix3::new(0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0),
            Matrix3::new(0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            Matrix3::new(0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            Matrix3::new(1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 0.0),
            Matrix3::new(0.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0),
            Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0),
            Matrix3::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0),
        ]
    }

    /// Hat operator: the generator combination δ^∧ = Σ δₖ Gₖ ∈ sl(3).
    pub fn hat(tangent: &SL3Tangent) -> Matrix3<f64> {
        let generators = Self::generators();
        let mut algebra = Matrix3::zeros();
        for (coefficient, generator) in tangent.iter().zip(generators.iter()) {
            algebra += *coefficient * generator;
        }
        algebra
    }

    /// Matrix exponential of a 3x3 matrix by scaling-and-squaring over a
    /// Horner-evaluated truncated series.
    ///
    /// For the small tangents produced by a converging refinement loop the
    /// series is evaluated directly; larger inputs are halved until their
    /// norm drops below the direct threshold and squared back afterwards.
    fn matrix_exp(algebra: &Matrix3<f64>) -> Matrix3<f64> {
        let mut scaled = *algebra;
        let mut squarings = 0u32;
        while scaled.norm() > SERIES_DIRECT_NORM {
            scaled /= 2.0;
            squarings += 1;
        }

        // Horner evaluation of I + m (I + m/2 (I + m/3 (... ))).
        let mut result = Matrix3::identity();
        for k in (1..=12u32).rev() {
            result = Matrix3::identity() + (scaled * result) / f64::from(k);
        }

        for _ in 0..squarings {
            result *= result;
        }
        result
    }

    /// Transfer a 2D point through the homography.
    ///
    /// Returns `None` when the point maps to the line at infinity (vanishing
    /// homogeneous scale), which callers treat as an unobservable
    /// correspondence rather than an error.
    pub fn apply(&self, point: &Vector2<f64>) -> Option<Vector2<f64>> {
        let q = self.matrix * Vector3::new(point.x, point.y, 1.0);
        if q.z.abs() < f64::EPSILON {
            return None;
        }
        Some(Vector2::new(q.x / q.z, q.y / q.z))
    }

    /// Transfer a homogeneous point without dehomogenization.
    pub fn apply_homogeneous(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * point
    }

    /// Signed cube root, used by the determinant renormalization.
    fn real_cbrt(value: f64) -> f64 {
        value.signum() * value.abs().cbrt()
    }
}

impl LieGroup for SL3 {
    type TangentVector = SL3Tangent;

    const DOF: usize = 8;

    fn identity() -> Self {
        SL3 {
            matrix: Matrix3::identity(),
        }
    }

    /// Inverse via the adjugate: for det H = 1, H⁻¹ equals the transposed
    /// cofactor matrix exactly, so no factorization is needed.
    fn inverse(&self) -> Self {
        let m = &self.matrix;
        let cof = Matrix3::new(
            m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)],
            m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)],
            m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
            m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)],
            m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)],
            m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)],
            m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)],
            m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)],
            m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
        );
        SL3::from_matrix(cof)
    }

    fn compose(&self, other: &Self) -> Self {
        SL3::from_matrix(self.matrix * other.matrix)
    }

    /// Exponential map: H = exp(Σ δₖ Gₖ).
    fn exp(tangent: &Self::TangentVector) -> Self {
        SL3::from_matrix(Self::matrix_exp(&Self::hat(tangent)))
    }

    /// Divide by the real cube root of the determinant, restoring det = +1.
    fn normalize(&mut self) {
        let det = self.matrix.determinant();
        if det.abs() > f64::EPSILON {
            self.matrix /= Self::real_cbrt(det);
        }
    }

    fn is_valid(&self, tolerance: f64) -> bool {
        (self.matrix.determinant() - 1.0).abs() < tolerance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_tangent() -> SL3Tangent {
        SL3Tangent::from_column_slice(&[0.02, -0.01, 0.03, 0.015, -0.02, 0.01, 0.002, -0.003])
    }

    #[test]
    fn generators_are_trace_free() {
        for generator in SL3::generators() {
            assert!(generator.trace().abs() < 1e-15);
        }
    }

    #[test]
    fn exp_zero_is_identity() {
        let h = SL3::exp(&SL3Tangent::zeros());
        assert_relative_eq!(*h.matrix(), Matrix3::identity(), epsilon = 1e-14);
    }

    #[test]
    fn exp_preserves_unit_determinant() {
        let h = SL3::exp(&sample_tangent());
        assert!(h.is_valid(1e-10));

        // A larger tangent goes through the scaling-and-squaring path.
        let h_large = SL3::exp(&(10.0 * sample_tangent()));
        assert!(h_large.is_valid(1e-8));
    }

    #[test]
    fn exp_of_negated_tangent_is_inverse() {
        let delta = sample_tangent();
        let h = SL3::exp(&delta);
        let h_neg = SL3::exp(&(-delta));
        let product = h.compose(&h_neg);
        assert_relative_eq!(*product.matrix(), Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn inverse_matches_matrix_inverse() {
        let h = SL3::exp(&sample_tangent());
        let inv = h.inverse();
        let product = h.compose(&inv);
        assert_relative_eq!(*product.matrix(), Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn apply_identity_is_noop() {
        let p = Vector2::new(0.7, -0.3);
        let q = SL3::identity().apply(&p).unwrap();
        assert_relative_eq!(p, q, epsilon = 1e-15);
    }

    #[test]
    fn translation_generators_translate() {
        let mut tangent = SL3Tangent::zeros();
        tangent[0] = 0.5;
        tangent[1] = -0.25;
        let h = SL3::exp(&tangent);
        let q = h.apply(&Vector2::new(0.0, 0.0)).unwrap();
        assert_relative_eq!(q, Vector2::new(0.5, -0.25), epsilon = 1e-12);
    }
}
