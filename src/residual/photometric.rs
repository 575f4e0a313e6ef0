//! Photometric patch residual under SL(3) with affine illumination
//! compensation.
//!
//! Template/photoframe tracking minimizes intensity differences between a
//! reference patch and the current image warped through a homography. The
//! illumination of the scene is not constant, so a gain/bias pair (α, β) is
//! estimated alongside the warp as additively-updated nuisance parameters:
//! the full parameterization is SL(3) + 2.
//!
//! Image access is outside this crate: the caller supplies a sampling closure
//! returning the interpolated intensity and image gradient at a warped
//! coordinate, or `None` when the coordinate falls outside the valid domain
//! (the sample is then skipped for that iteration).

use crate::manifold::{Parameterization, SL3};
use crate::residual::{projection_jacobian, Evaluation, RefinementState, ResidualModel};
use nalgebra::{DMatrix, DVector, RowVector2, Vector3};

/// One reference-patch sample: a plane coordinate and its template intensity.
#[derive(Debug, Clone, Copy)]
pub struct PatchSample {
    /// Patch coordinate (normalized plane units)
    pub x: f64,
    /// Patch coordinate (normalized plane units)
    pub y: f64,
    /// Template intensity at this coordinate
    pub intensity: f64,
}

impl PatchSample {
    /// Construct a sample.
    pub fn new(x: f64, y: f64, intensity: f64) -> Self {
        PatchSample { x, y, intensity }
    }
}

/// Photometric residual over a planar patch.
///
/// Residual (1 component per sample): `α·I(π(H·q)) + β − I_ref`.
/// Jacobian: geometric block `α·∇I·Jπ(H q)·H·Gₖ·q` over the eight sl(3)
/// generators, then `∂r/∂α = I(π(H·q))` and `∂r/∂β = 1`.
pub struct PhotometricPatch<F>
where
    F: Fn(f64, f64) -> Option<(f64, f64, f64)> + Send + Sync,
{
    reference: Vec<PatchSample>,
    /// Caller-supplied image access: `(u, v) -> (intensity, grad_u, grad_v)`
    sampler: F,
}

impl<F> PhotometricPatch<F>
where
    F: Fn(f64, f64) -> Option<(f64, f64, f64)> + Send + Sync,
{
    /// Build the model from a reference patch and an image sampling closure.
    pub fn new(reference: Vec<PatchSample>, sampler: F) -> Self {
        PhotometricPatch { reference, sampler }
    }

    /// Initial state for this model: a starting homography with neutral
    /// illumination (α = 1, β = 0).
    pub fn initial_state(&self, homography: SL3) -> RefinementState {
        RefinementState::with_nuisance(homography, DVector::from_vec(vec![1.0, 0.0]))
    }
}

impl<F> ResidualModel for PhotometricPatch<F>
where
    F: Fn(f64, f64) -> Option<(f64, f64, f64)> + Send + Sync,
{
    fn parameterization(&self) -> Parameterization {
        Parameterization::sl3().with_nuisance(2)
    }

    fn len(&self) -> usize {
        self.reference.len()
    }

    fn residual_dim(&self) -> usize {
        1
    }

    fn evaluate(&self, state: &RefinementState, index: usize) -> Option<Evaluation> {
        let homography = state.transform.as_sl3()?;
        if state.nuisance.len() != 2 {
            return None;
        }
        let gain = state.nuisance[0];
        let bias = state.nuisance[1];

        let sample = &self.reference[index];
        let q = Vector3::new(sample.x, sample.y, 1.0);
        let warped = homography.apply_homogeneous(&q);
        if warped.z.abs() < f64::EPSILON {
            return None;
        }
        let u = warped.x / warped.z;
        let v = warped.y / warped.z;

        let (intensity, grad_u, grad_v) = (self.sampler)(u, v)?;
        let residual = gain * intensity + bias - sample.intensity;

        let gradient = RowVector2::new(grad_u, grad_v);
        let j_projection = projection_jacobian(&warped);
        let h = homography.matrix();
        let generators = SL3::generators();

        let mut jacobian = DMatrix::zeros(1, 10);
        for (k, generator) in generators.iter().enumerate() {
            let direction = h * generator * q;
            jacobian[(0, k)] = gain * (gradient * j_projection * direction)[(0, 0)];
        }
        jacobian[(0, 8)] = intensity;
        jacobian[(0, 9)] = 1.0;

        Some(Evaluation {
            residual: DVector::from_element(1, residual),
            jacobian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::sl3::SL3Tangent;
    use crate::manifold::LieGroup;
    use crate::residual::test_support::check_jacobian;
    use nalgebra::Vector2;

    /// Smooth synthetic scene with analytic gradient.
    fn scene(u: f64, v: f64) -> Option<(f64, f64, f64)> {
        let intensity = (3.0 * u).sin() * (2.0 * v).cos() + 0.5 * u;
        let grad_u = 3.0 * (3.0 * u).cos() * (2.0 * v).cos() + 0.5;
        let grad_v = -2.0 * (3.0 * u).sin() * (2.0 * v).sin();
        Some((intensity, grad_u, grad_v))
    }

    fn reference_patch(homography: &SL3, gain: f64, bias: f64) -> Vec<PatchSample> {
        let mut samples = Vec::new();
        for i in -2..=2 {
            for j in -2..=2 {
                let x = 0.1 * f64::from(i);
                let y = 0.1 * f64::from(j);
                let warped = homography.apply(&Vector2::new(x, y)).unwrap();
                let (intensity, _, _) = scene(warped.x, warped.y).unwrap();
                samples.push(PatchSample::new(x, y, gain * intensity + bias));
            }
        }
        samples
    }

    #[test]
    fn residual_is_zero_at_ground_truth() {
        let homography = SL3::exp(&SL3Tangent::from_column_slice(&[
            0.03, -0.01, 0.02, 0.01, -0.02, 0.015, 0.002, -0.001,
        ]));
        let model = PhotometricPatch::new(reference_patch(&homography, 1.0, 0.0), scene);
        let state = RefinementState::with_nuisance(homography, DVector::from_vec(vec![1.0, 0.0]));
        for index in 0..model.len() {
            let evaluation = model.evaluate(&state, index).unwrap();
            assert!(evaluation.residual.norm() < 1e-12);
        }
    }

    #[test]
    fn jacobian_matches_finite_differences() {
        let homography = SL3::exp(&SL3Tangent::from_column_slice(&[
            0.02, 0.01, -0.02, 0.005, 0.01, -0.01, 0.003, 0.001,
        ]));
        let model = PhotometricPatch::new(reference_patch(&homography, 1.2, -0.1), scene);
        let perturbed = homography.right_plus(&SL3Tangent::from_column_slice(&[
            0.01, -0.005, 0.008, 0.002, -0.004, 0.006, 0.001, 0.0005,
        ]));
        let state = RefinementState::with_nuisance(perturbed, DVector::from_vec(vec![1.1, 0.05]));
        for index in 0..model.len() {
            check_jacobian(&model, &state, index);
        }
    }
}
