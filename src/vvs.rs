//! Iteratively reweighted pose refinement (virtual visual servoing).
//!
//! The controller drives the refinement state machine
//! `INIT → ITERATE → {CONVERGED | DIVERGED | MAX_ITERS} → DONE`:
//! every iteration recomputes robust weights from the previous residual
//! distribution, assembles the weighted normal equations over the residual
//! model, solves for the tangent-space step (Cholesky with SVD fallback) and
//! applies it through the exponential map.
//!
//! Non-convergence is an honest terminal status, never an error: reaching the
//! iteration cap or the wall-clock budget returns the last state with
//! [`VvsStatus::MaxIterations`]. A step that increases the mean weighted
//! residual is rejected — the state reverts and retries with the halved
//! previous step; a bounded number of consecutive rejections (or an
//! unrecoverable linear solve) yields [`VvsStatus::Diverged`] with the last
//! accepted state. Only structurally unusable input (parameterization
//! mismatch, underdetermined correspondence set) is reported as an error
//! before iterating.

use crate::assembler::{assemble, AccumulationStrategy};
use crate::error::{ServoError, ServoResult};
use crate::linalg::solve_normal_equations;
use crate::residual::{RefinementState, ResidualModel};
use crate::robust::{compute_weights, MEstimator};
use nalgebra::DVector;
use std::fmt;
use std::time::{Duration, Instant};

/// Terminal status of a refinement call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VvsStatus {
    /// Step norm fell below the convergence threshold
    Converged,
    /// Iteration cap or wall-clock budget reached; result is usable but
    /// unconverged
    MaxIterations,
    /// Repeated step rejections or an unrecoverable solve; the last accepted
    /// state is returned
    Diverged,
}

impl fmt::Display for VvsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VvsStatus::Converged => write!(f, "Converged"),
            VvsStatus::MaxIterations => write!(f, "Maximum iterations reached"),
            VvsStatus::Diverged => write!(f, "Diverged"),
        }
    }
}

/// Configuration of the refinement controller.
#[derive(Debug, Clone)]
pub struct VvsConfig {
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence threshold on the tangent-space step norm ‖Δ‖
    pub convergence_threshold: f64,
    /// Relative mean-cost increase beyond which a step is rejected
    pub divergence_tolerance: f64,
    /// Consecutive rejected (halved) steps before declaring divergence
    pub max_rejected_steps: usize,
    /// Robust weight function
    pub estimator: MEstimator,
    /// Normal-equation accumulation strategy
    pub accumulation: AccumulationStrategy,
    /// Fan residual evaluation out across the rayon pool
    pub parallel: bool,
    /// Optional wall-clock budget, checked at each iteration head
    pub timeout: Option<Duration>,
}

impl Default for VvsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            convergence_threshold: 1e-8,
            divergence_tolerance: 1e-9,
            max_rejected_steps: 5,
            estimator: MEstimator::tukey(),
            accumulation: AccumulationStrategy::default(),
            parallel: false,
            timeout: None,
        }
    }
}

impl VvsConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap preset used to polish a consensus hypothesis from its inliers:
    /// few iterations, light robustification.
    pub fn polish() -> Self {
        Self {
            max_iterations: 5,
            estimator: MEstimator::huber(),
            ..Self::default()
        }
    }

    /// Set the maximum number of iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the convergence threshold on ‖Δ‖.
    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    /// Set the relative cost-increase tolerance for step rejection.
    pub fn with_divergence_tolerance(mut self, tolerance: f64) -> Self {
        self.divergence_tolerance = tolerance;
        self
    }

    /// Set the bound on consecutive rejected steps.
    pub fn with_max_rejected_steps(mut self, max_rejected_steps: usize) -> Self {
        self.max_rejected_steps = max_rejected_steps;
        self
    }

    /// Set the robust weight function.
    pub fn with_estimator(mut self, estimator: MEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    /// Set the accumulation strategy.
    pub fn with_accumulation(mut self, accumulation: AccumulationStrategy) -> Self {
        self.accumulation = accumulation;
        self
    }

    /// Enable or disable parallel residual evaluation.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a refinement call.
#[derive(Debug, Clone)]
pub struct VvsReport {
    /// Terminal status
    pub status: VvsStatus,
    /// Iterations performed
    pub iterations: usize,
    /// Mean weighted cost at the starting state
    pub initial_cost: f64,
    /// Mean weighted cost at the final state
    pub final_cost: f64,
    /// Final per-correspondence weights; 0.0 marks correspondences that were
    /// unobservable or fully down-weighted at the end — usable as an inlier
    /// mask with the model's stable indexing
    pub weights: Vec<f64>,
    /// Norm of the last computed step
    pub final_step_norm: f64,
    /// Total time elapsed
    pub elapsed: Duration,
}

impl fmt::Display for VvsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} iterations: cost {:.6e} -> {:.6e}, last step {:.3e}, {:?}",
            self.status,
            self.iterations,
            self.initial_cost,
            self.final_cost,
            self.final_step_norm,
            self.elapsed
        )
    }
}

/// The refinement controller.
///
/// Stateless between calls: all per-call scratch lives on the stack of
/// [`VvsSolver::refine`], so one solver may serve multiple tracked targets
/// from different threads.
#[derive(Debug, Clone, Default)]
pub struct VvsSolver {
    config: VvsConfig,
}

impl VvsSolver {
    /// Solver with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Solver with a custom configuration.
    pub fn with_config(config: VvsConfig) -> Self {
        VvsSolver { config }
    }

    /// Access the configuration.
    pub fn config(&self) -> &VvsConfig {
        &self.config
    }

    /// Refine `state` against `model` until convergence, divergence, or the
    /// iteration/time budget runs out.
    ///
    /// The state is mutated in place; on `Diverged` it holds the last
    /// accepted (not the rejected) state.
    pub fn refine(
        &self,
        state: &mut RefinementState,
        model: &dyn ResidualModel,
    ) -> ServoResult<VvsReport> {
        let start = Instant::now();
        let parameterization = model.parameterization();
        if parameterization != state.parameterization() {
            return Err(ServoError::InvalidInput(format!(
                "model parameterization {} does not match state {}",
                parameterization,
                state.parameterization()
            )));
        }

        let dim = parameterization.dim();
        let required = dim.div_ceil(model.residual_dim());
        if model.len() < required {
            return Err(ServoError::InsufficientCorrespondences {
                required,
                actual: model.len(),
            });
        }

        let mut weights = vec![1.0; model.len()];
        let mut residual_norms: Vec<f64> = Vec::new();
        let mut prev_mean_cost = f64::INFINITY;
        let mut initial_cost = f64::NAN;
        let mut final_cost = f64::NAN;
        let mut final_step_norm = f64::NAN;
        let mut rejected = 0usize;
        let mut prev_state: Option<RefinementState> = None;
        let mut last_step: Option<DVector<f64>> = None;
        let mut status = VvsStatus::MaxIterations;
        let mut iterations = 0usize;

        for iteration in 0..self.config.max_iterations {
            iterations = iteration + 1;

            if let Some(timeout) = self.config.timeout {
                if start.elapsed() >= timeout {
                    tracing::debug!(iteration, "refinement timeout reached");
                    iterations = iteration;
                    break;
                }
            }

            if iteration > 0 {
                weights = compute_weights(&residual_norms, self.config.estimator);
            }

            let system = assemble(
                model,
                state,
                &weights,
                self.config.accumulation,
                self.config.parallel,
            );

            if system.valid < required {
                if iteration == 0 {
                    return Err(ServoError::InsufficientCorrespondences {
                        required,
                        actual: system.valid,
                    });
                }
                tracing::debug!(
                    iteration,
                    valid = system.valid,
                    "observable correspondences collapsed below the tangent dimension"
                );
                status = VvsStatus::Diverged;
                break;
            }

            let mean_cost = system.mean_cost();
            if iteration == 0 {
                initial_cost = mean_cost;
                final_cost = mean_cost;
            }

            // Step rejection: the previous step increased the mean weighted
            // residual beyond tolerance. Revert and retry with half the step.
            if mean_cost > prev_mean_cost * (1.0 + self.config.divergence_tolerance) {
                if let (Some(prev), Some(step)) = (&prev_state, &mut last_step) {
                    rejected += 1;
                    if rejected > self.config.max_rejected_steps {
                        tracing::debug!(iteration, rejected, "step rejection bound exhausted");
                        *state = prev.clone();
                        status = VvsStatus::Diverged;
                        break;
                    }
                    *step *= 0.5;
                    let mut damped = prev.clone();
                    damped.apply_step(step)?;
                    *state = damped;
                    tracing::trace!(iteration, rejected, "step rejected, retrying halved");
                    continue;
                }
            } else {
                rejected = 0;
                prev_mean_cost = mean_cost;
                final_cost = mean_cost;
                residual_norms = system.residual_norms.clone();
            }

            let step = match solve_normal_equations(&system.hessian, &system.gradient) {
                Ok(step) => step,
                Err(error) => {
                    tracing::debug!(iteration, %error, "normal-equation solve failed");
                    status = VvsStatus::Diverged;
                    break;
                }
            };

            let step_norm = step.norm();
            final_step_norm = step_norm;
            tracing::trace!(iteration, mean_cost, step_norm, "refinement iteration");

            prev_state = Some(state.clone());
            state.apply_step(&step)?;
            last_step = Some(step);

            if step_norm < self.config.convergence_threshold {
                status = VvsStatus::Converged;
                break;
            }
        }

        // Final weights double as an inlier mask: zero out correspondences
        // that were unobservable at the last accepted state.
        let mut final_weights = if residual_norms.is_empty() {
            weights
        } else {
            compute_weights(&residual_norms, self.config.estimator)
        };
        for (weight, norm) in final_weights.iter_mut().zip(residual_norms.iter()) {
            if !norm.is_finite() {
                *weight = 0.0;
            }
        }

        Ok(VvsReport {
            status,
            iterations,
            initial_cost,
            final_cost,
            weights: final_weights,
            final_step_norm,
            elapsed: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::{LieGroup, SE3};
    use crate::residual::point::{project, PointCorrespondence, PointReprojection};
    use nalgebra::{Vector3, Vector6};

    fn ground_truth_pose() -> SE3 {
        SE3::exp(&Vector6::new(0.1, -0.2, 0.5, 0.1, 0.05, -0.1))
    }

    fn synthetic_model(pose: &SE3, count: usize) -> PointReprojection {
        let correspondences = (0..count)
            .map(|i| {
                let offset = i as f64;
                let world = Vector3::new(
                    1.5 * (offset * 0.7).sin(),
                    1.2 * (offset * 1.1).cos(),
                    4.0 + 0.5 * (offset * 0.4).sin(),
                );
                let (image, _) = project(pose, &world).unwrap();
                PointCorrespondence::from_image_point(world, image)
            })
            .collect();
        PointReprojection::new(correspondences)
    }

    #[test]
    fn converges_on_noise_free_data() {
        let truth = ground_truth_pose();
        let model = synthetic_model(&truth, 20);
        let perturbed = truth.right_plus(&Vector6::new(0.05, -0.03, 0.04, 0.02, -0.03, 0.02));
        let mut state = RefinementState::new(perturbed);

        let solver = VvsSolver::new();
        let report = solver.refine(&mut state, &model).unwrap();

        assert_eq!(report.status, VvsStatus::Converged);
        let recovered = state.transform.as_se3().unwrap();
        assert!((recovered.translation() - truth.translation()).norm() < 1e-6);
        assert!(recovered.rotation().angle_to(truth.rotation()) < 1e-6);
        assert!(report.final_cost <= report.initial_cost);
    }

    #[test]
    fn refuses_parameterization_mismatch() {
        let truth = ground_truth_pose();
        let model = synthetic_model(&truth, 10);
        let mut state = RefinementState::new(crate::manifold::SO3::identity());
        let result = VvsSolver::new().refine(&mut state, &model);
        assert!(matches!(result, Err(ServoError::InvalidInput(_))));
    }

    #[test]
    fn refuses_underdetermined_problem() {
        let truth = ground_truth_pose();
        // 2 correspondences x 2 residual rows < 6 tangent dimensions.
        let model = synthetic_model(&truth, 2);
        let mut state = RefinementState::new(truth);
        let result = VvsSolver::new().refine(&mut state, &model);
        assert!(matches!(
            result,
            Err(ServoError::InsufficientCorrespondences { required: 3, .. })
        ));
    }

    #[test]
    fn max_iterations_is_a_status_not_an_error() {
        let truth = ground_truth_pose();
        let model = synthetic_model(&truth, 15);
        let perturbed = truth.right_plus(&Vector6::new(0.3, -0.2, 0.25, 0.15, -0.1, 0.2));
        let mut state = RefinementState::new(perturbed);

        let solver = VvsSolver::with_config(VvsConfig::new().with_max_iterations(1));
        let report = solver.refine(&mut state, &model).unwrap();
        assert_eq!(report.status, VvsStatus::MaxIterations);
        assert_eq!(report.iterations, 1);
    }

    #[test]
    fn second_refinement_is_idempotent() {
        let truth = ground_truth_pose();
        let model = synthetic_model(&truth, 20);
        let perturbed = truth.right_plus(&Vector6::new(0.04, 0.02, -0.03, 0.01, 0.02, -0.02));
        let mut state = RefinementState::new(perturbed);

        let solver = VvsSolver::new();
        let first = solver.refine(&mut state, &model).unwrap();
        assert_eq!(first.status, VvsStatus::Converged);

        let before = state.clone();
        let second = solver.refine(&mut state, &model).unwrap();
        assert_eq!(second.status, VvsStatus::Converged);

        let a = before.transform.as_se3().unwrap();
        let b = state.transform.as_se3().unwrap();
        assert!(
            (a.translation() - b.translation()).norm()
                < solver.config().convergence_threshold * 10.0
        );
    }
}
