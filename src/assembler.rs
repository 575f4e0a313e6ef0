//! Weighted normal-equation assembly.
//!
//! Accumulates, over all observable correspondences of a residual model, the
//! Gauss-Newton system
//!
//! ```text
//! A = Σ wᵢcᵢ · Jᵢᵀ Jᵢ          g = −Σ wᵢcᵢ · Jᵢᵀ eᵢ
//! ```
//!
//! where `wᵢ` is the per-iteration robust weight and `cᵢ` the caller-supplied
//! confidence, so that the controller can solve `A·Δ = g` and apply `Δ`
//! directly.
//!
//! Two accumulation strategies are provided. They are algebraically
//! equivalent and must stay numerically consistent within solver tolerance —
//! any observed divergence between them is a correctness bug, not a tuning
//! difference:
//! - [`AccumulationStrategy::Outer`]: per-correspondence rank-k updates,
//!   no intermediate storage.
//! - [`AccumulationStrategy::Factored`]: stacks all rows, scales once by
//!   √(w·c), and forms the system with a single triple product. Fewer
//!   passes over memory for models with many rows per state (dense planar
//!   patches).
//!
//! Evaluation is the expensive part and is embarrassingly parallel: with
//! `parallel = true` the per-correspondence evaluations fan out across the
//! rayon pool, then the (tiny) reduction is performed sequentially.

use crate::residual::{Evaluation, RefinementState, ResidualModel};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

/// Strategy used to accumulate the weighted normal equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationStrategy {
    /// Per-correspondence outer-product accumulation
    #[default]
    Outer,
    /// Stacked premultiplied form (single triple product)
    Factored,
}

/// The assembled system plus the per-correspondence bookkeeping the
/// controller needs for the next iteration.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// Gauss-Newton approximation of the Hessian: Σ w c JᵀJ
    pub hessian: DMatrix<f64>,
    /// Negated weighted gradient: −Σ w c Jᵀe
    pub gradient: DVector<f64>,
    /// Total weighted cost: Σ w c ‖e‖²
    pub cost: f64,
    /// Number of correspondences observable at this state
    pub valid: usize,
    /// Residual norm per correspondence, NaN where unobservable
    pub residual_norms: Vec<f64>,
}

impl NormalEquations {
    /// Mean weighted cost over the observable correspondences.
    pub fn mean_cost(&self) -> f64 {
        if self.valid == 0 {
            f64::INFINITY
        } else {
            self.cost / self.valid as f64
        }
    }
}

/// Assemble the weighted normal equations of `model` at `state`.
///
/// `weights` must have one entry per correspondence; the caller obtains it
/// from the robust weight pass (uniform on the first iteration). The state is
/// not mutated.
pub fn assemble(
    model: &dyn ResidualModel,
    state: &RefinementState,
    weights: &[f64],
    strategy: AccumulationStrategy,
    parallel: bool,
) -> NormalEquations {
    debug_assert_eq!(weights.len(), model.len());
    let count = model.len();

    let evaluations: Vec<Option<Evaluation>> = if parallel {
        (0..count)
            .into_par_iter()
            .map(|index| model.evaluate(state, index))
            .collect()
    } else {
        (0..count).map(|index| model.evaluate(state, index)).collect()
    };

    match strategy {
        AccumulationStrategy::Outer => accumulate_outer(model, state, weights, &evaluations),
        AccumulationStrategy::Factored => accumulate_factored(model, state, weights, &evaluations),
    }
}

fn accumulate_outer(
    model: &dyn ResidualModel,
    state: &RefinementState,
    weights: &[f64],
    evaluations: &[Option<Evaluation>],
) -> NormalEquations {
    let dim = state.dim();
    let mut hessian = DMatrix::zeros(dim, dim);
    let mut gradient = DVector::zeros(dim);
    let mut cost = 0.0;
    let mut valid = 0;
    let mut residual_norms = vec![f64::NAN; evaluations.len()];

    for (index, evaluation) in evaluations.iter().enumerate() {
        let Some(evaluation) = evaluation else {
            continue;
        };
        let weight = weights[index] * model.confidence(index);
        residual_norms[index] = evaluation.residual.norm();
        valid += 1;
        if weight <= 0.0 {
            continue;
        }

        let jt = evaluation.jacobian.transpose();
        hessian += weight * &jt * &evaluation.jacobian;
        gradient -= weight * &jt * &evaluation.residual;
        cost += weight * evaluation.residual.norm_squared();
    }

    NormalEquations {
        hessian,
        gradient,
        cost,
        valid,
        residual_norms,
    }
}

fn accumulate_factored(
    model: &dyn ResidualModel,
    state: &RefinementState,
    weights: &[f64],
    evaluations: &[Option<Evaluation>],
) -> NormalEquations {
    let dim = state.dim();
    let residual_dim = model.residual_dim();
    let mut residual_norms = vec![f64::NAN; evaluations.len()];

    // First pass: count the rows contributed by observable correspondences
    // with non-zero weight.
    let mut rows = 0;
    let mut valid = 0;
    for (index, evaluation) in evaluations.iter().enumerate() {
        if let Some(evaluation) = evaluation {
            residual_norms[index] = evaluation.residual.norm();
            valid += 1;
            if weights[index] * model.confidence(index) > 0.0 {
                rows += residual_dim;
            }
        }
    }

    // Stack √(w·c)-scaled Jacobian rows and residuals, then form the system
    // with one triple product each.
    let mut stacked_jacobian = DMatrix::zeros(rows, dim);
    let mut stacked_residual = DVector::zeros(rows);
    let mut cursor = 0;
    for (index, evaluation) in evaluations.iter().enumerate() {
        let Some(evaluation) = evaluation else {
            continue;
        };
        let weight = weights[index] * model.confidence(index);
        if weight <= 0.0 {
            continue;
        }
        let sqrt_weight = weight.sqrt();
        stacked_jacobian
            .view_mut((cursor, 0), (residual_dim, dim))
            .copy_from(&(sqrt_weight * &evaluation.jacobian));
        stacked_residual
            .rows_mut(cursor, residual_dim)
            .copy_from(&(sqrt_weight * &evaluation.residual));
        cursor += residual_dim;
    }

    let jt = stacked_jacobian.transpose();
    let hessian = &jt * &stacked_jacobian;
    let gradient = -(&jt * &stacked_residual);
    let cost = stacked_residual.norm_squared();

    NormalEquations {
        hessian,
        gradient,
        cost,
        valid,
        residual_norms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{LieGroup, SE3};
    use crate::residual::point::{project, PointCorrespondence, PointReprojection};
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector6};

    fn synthetic_model(pose: &SE3, count: usize) -> PointReprojection {
        let correspondences = (0..count)
            .map(|i| {
                let offset = i as f64;
                let world = Vector3::new(
                    (offset * 0.9).sin(),
                    (offset * 0.6).cos() * 0.8,
                    4.0 + 0.2 * offset,
                );
                let (image, _) = project(pose, &world).unwrap();
                PointCorrespondence::from_image_point(world, image)
                    .with_confidence(1.0 + 0.1 * offset)
            })
            .collect();
        PointReprojection::new(correspondences)
    }

    #[test]
    fn strategies_agree() {
        let pose = SE3::exp(&Vector6::new(0.2, -0.1, 0.4, 0.1, -0.05, 0.2));
        let model = synthetic_model(&pose, 12);
        let state = RefinementState::new(
            pose.right_plus(&Vector6::new(0.03, 0.01, -0.02, 0.01, 0.02, -0.01)),
        );
        let weights: Vec<f64> = (0..model.len()).map(|i| 0.5 + 0.04 * i as f64).collect();

        let outer = assemble(
            &model,
            &state,
            &weights,
            AccumulationStrategy::Outer,
            false,
        );
        let factored = assemble(
            &model,
            &state,
            &weights,
            AccumulationStrategy::Factored,
            false,
        );

        assert_eq!(outer.valid, factored.valid);
        assert_relative_eq!(outer.hessian, factored.hessian, epsilon = 1e-9);
        assert_relative_eq!(outer.gradient, factored.gradient, epsilon = 1e-9);
        assert_relative_eq!(outer.cost, factored.cost, epsilon = 1e-9);
    }

    #[test]
    fn parallel_matches_sequential() {
        let pose = SE3::exp(&Vector6::new(-0.1, 0.2, 0.1, 0.05, 0.1, -0.15));
        let model = synthetic_model(&pose, 32);
        let state = RefinementState::new(pose);
        let weights = vec![1.0; model.len()];

        let sequential = assemble(
            &model,
            &state,
            &weights,
            AccumulationStrategy::Outer,
            false,
        );
        let parallel = assemble(&model, &state, &weights, AccumulationStrategy::Outer, true);

        assert_relative_eq!(sequential.hessian, parallel.hessian, epsilon = 1e-12);
        assert_relative_eq!(sequential.gradient, parallel.gradient, epsilon = 1e-12);
    }

    #[test]
    fn zero_weight_excludes_without_removing() {
        let pose = SE3::exp(&Vector6::new(0.1, 0.1, 0.1, 0.0, 0.0, 0.0));
        let model = synthetic_model(&pose, 6);
        let state = RefinementState::new(pose);
        let mut weights = vec![1.0; model.len()];
        weights[2] = 0.0;

        let system = assemble(
            &model,
            &state,
            &weights,
            AccumulationStrategy::Outer,
            false,
        );
        // Still observable (a norm is recorded), just not contributing.
        assert_eq!(system.valid, 6);
        assert!(system.residual_norms[2].is_finite());
    }

    #[test]
    fn mean_cost_of_empty_system_is_infinite() {
        let system = NormalEquations {
            hessian: DMatrix::zeros(6, 6),
            gradient: DVector::zeros(6),
            cost: 0.0,
            valid: 0,
            residual_norms: Vec::new(),
        };
        assert!(system.mean_cost().is_infinite());
    }
}
