//! Residual models: the pluggable measurement layer of the refinement engine.
//!
//! A residual model maps a candidate state and one correspondence to a
//! residual vector and its Jacobian with respect to the tangent space (the
//! interaction matrix). Everything downstream — weighting, normal-equation
//! assembly, the iteration controller — is agnostic to what is being
//! measured; odometry, edge tracking and template identification differ only
//! in the model they plug in here.
//!
//! A model reports a correspondence as unobservable from the current state
//! (projects behind the camera, outside the sampling domain, onto the line at
//! infinity) by returning `None` from [`ResidualModel::evaluate`]; such
//! correspondences are excluded from that iteration without error and may
//! become observable again later.

use crate::error::{ServoError, ServoResult};
use crate::manifold::{Parameterization, Transform};
use nalgebra::{DMatrix, DVector, Matrix2x3, Vector3};

pub mod photometric;
pub mod planar;
pub mod point;

pub use photometric::{PatchSample, PhotometricPatch};
pub use planar::{PlanarMatch, PlanarPoint};
pub use point::{BearingAlignment, DirectionMatch, PointCorrespondence, PointReprojection};

/// Residual and Jacobian of one correspondence at one state.
///
/// Transient: produced by [`ResidualModel::evaluate`], consumed by the
/// assembler, never retained across iterations.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Residual vector (1-3 components, observed minus predicted convention
    /// up to sign — each model documents its own)
    pub residual: DVector<f64>,
    /// Jacobian of the residual w.r.t. the full composite tangent
    /// (`residual_dim` x `parameterization.dim()`)
    pub jacobian: DMatrix<f64>,
}

/// Full estimation state: a transformation plus the additively-updated
/// nuisance block of a composite parameterization.
///
/// Owned by the caller and mutated in place by each refinement iteration.
#[derive(Debug, Clone)]
pub struct RefinementState {
    /// The geometric transformation
    pub transform: Transform,
    /// Nuisance parameters (empty unless the parameterization is composite)
    pub nuisance: DVector<f64>,
}

impl RefinementState {
    /// State with a purely geometric parameterization.
    pub fn new(transform: impl Into<Transform>) -> Self {
        RefinementState {
            transform: transform.into(),
            nuisance: DVector::zeros(0),
        }
    }

    /// State with trailing nuisance parameters (e.g. photometric gain/bias).
    pub fn with_nuisance(transform: impl Into<Transform>, nuisance: DVector<f64>) -> Self {
        RefinementState {
            transform: transform.into(),
            nuisance,
        }
    }

    /// The parameterization this state realizes.
    pub fn parameterization(&self) -> Parameterization {
        Parameterization {
            manifold: self.transform.manifold_type(),
            nuisance_dim: self.nuisance.len(),
        }
    }

    /// Total tangent dimension (geometric + nuisance).
    pub fn dim(&self) -> usize {
        self.transform.dof() + self.nuisance.len()
    }

    /// Apply a full composite step: the leading block goes through the
    /// exponential map, the trailing block is added component-wise.
    pub fn apply_step(&mut self, step: &DVector<f64>) -> ServoResult<()> {
        if step.len() != self.dim() {
            return Err(ServoError::DimensionMismatch {
                expected: self.dim(),
                actual: step.len(),
            });
        }
        let dof = self.transform.dof();
        self.transform = self.transform.compose_increment(&step.as_slice()[..dof])?;
        for (nuisance, delta) in self.nuisance.iter_mut().zip(step.iter().skip(dof)) {
            *nuisance += delta;
        }
        Ok(())
    }
}

/// The measurement contract supplied per application.
///
/// Implementations must be `Send + Sync`: the controller may fan evaluation
/// out across worker threads, each correspondence being read-only with
/// respect to the shared state.
pub trait ResidualModel: Send + Sync {
    /// The parameterization this model's Jacobians are taken with respect to.
    fn parameterization(&self) -> Parameterization;

    /// Number of correspondences in the set (stable indexing: masks returned
    /// by the controller line up with these indices).
    fn len(&self) -> usize;

    /// Whether the correspondence set is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Residual vector dimension per correspondence (1-3).
    fn residual_dim(&self) -> usize;

    /// Caller-supplied prior confidence of a correspondence, multiplied into
    /// its robust weight during assembly.
    fn confidence(&self, _index: usize) -> f64 {
        1.0
    }

    /// Evaluate one correspondence at the given state.
    ///
    /// Returns `None` when the correspondence is not observable from this
    /// state; the iteration simply skips it.
    fn evaluate(&self, state: &RefinementState, index: usize) -> Option<Evaluation>;
}

/// Jacobian of the pinhole dehomogenization π(p) = (p.x/p.z, p.y/p.z) with
/// respect to p, shared by the point, planar and photometric models.
pub(crate) fn projection_jacobian(p: &Vector3<f64>) -> Matrix2x3<f64> {
    let inv_z = 1.0 / p.z;
    let inv_z2 = inv_z * inv_z;
    Matrix2x3::new(inv_z, 0.0, -p.x * inv_z2, 0.0, inv_z, -p.y * inv_z2)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{LieGroup, SE3};

    #[test]
    fn state_dimensions() {
        let state = RefinementState::new(SE3::identity());
        assert_eq!(state.dim(), 6);
        assert_eq!(state.parameterization(), Parameterization::se3());

        let composite =
            RefinementState::with_nuisance(crate::manifold::SL3::identity(), DVector::from_vec(vec![1.0, 0.0]));
        assert_eq!(composite.dim(), 10);
        assert_eq!(
            composite.parameterization(),
            Parameterization::sl3().with_nuisance(2)
        );
    }

    #[test]
    fn apply_step_rejects_wrong_length() {
        let mut state = RefinementState::new(SE3::identity());
        let result = state.apply_step(&DVector::zeros(4));
        assert!(matches!(
            result,
            Err(ServoError::DimensionMismatch {
                expected: 6,
                actual: 4
            })
        ));
    }

    #[test]
    fn apply_step_updates_nuisance_additively() {
        let mut state = RefinementState::with_nuisance(
            crate::manifold::SL3::identity(),
            DVector::from_vec(vec![1.0, 0.0]),
        );
        let mut step = DVector::zeros(10);
        step[8] = 0.25;
        step[9] = -0.5;
        state.apply_step(&step).unwrap();
        assert_eq!(state.nuisance[0], 1.25);
        assert_eq!(state.nuisance[1], -0.5);
    }
}
