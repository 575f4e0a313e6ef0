//! Robust consensus estimation: a solver-agnostic RANSAC driver over a bank
//! of minimal solvers.
//!
//! The driver repeatedly draws minimal correspondence subsets, rejects
//! degenerate samples before invoking the solver, scores every returned
//! hypothesis by inlier count (ties broken by lower total residual), and
//! keeps the best. The trial budget is tightened adaptively from the current
//! best inlier ratio using the standard termination bound
//! `N = log(1−confidence) / log(1−ratio^k)`.
//!
//! If no hypothesis reaches the minimum support, the driver reports
//! [`crate::error::ServoError::ConsensusFailed`] instead of returning a
//! low-confidence model. The winning hypothesis can optionally be polished
//! from its inlier set with the refinement machinery before being handed to
//! the full controller.

use crate::error::{ServoError, ServoResult};
use std::time::{Duration, Instant};

pub mod essential;
pub mod homography;
pub mod p3p;
pub mod rig;
pub mod sampler;

pub use essential::{BearingMatch, FivePointSolver};
pub use homography::FourPointHomography;
pub use p3p::P3PSolver;
pub use rig::{RigObservation, RigPoseSolver};
pub use sampler::UniformSampler;

/// A minimal solver paired with its consensus metric.
///
/// Implementations produce 0..N candidate models from a minimal sample and
/// evaluate a scalar residual per correspondence for scoring. The optional
/// [`MinimalSolver::polish`] hook re-estimates a model from an inlier set
/// using the refinement machinery in capped form.
pub trait MinimalSolver: Send + Sync {
    /// Correspondence type consumed by this solver
    type Datum;
    /// Hypothesis type produced by this solver
    type Model: Clone;

    /// Size of the minimal sample.
    fn sample_size(&self) -> usize;

    /// Reject samples that are ill-conditioned for the solver (collinear,
    /// coincident, rank-deficient) before attempting to solve.
    fn is_degenerate(&self, _data: &[Self::Datum], _sample: &[usize]) -> bool {
        false
    }

    /// Produce candidate models from a minimal sample. Invalid roots must be
    /// filtered out here (complex solutions, negative depths).
    fn solve(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model>;

    /// Consensus residual of one correspondence under a model; `None` when
    /// the correspondence is not observable under the model.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> Option<f64>;

    /// Optional least-squares re-estimation from an inlier set.
    fn polish(
        &self,
        _model: &Self::Model,
        _data: &[Self::Datum],
        _inliers: &[usize],
    ) -> Option<Self::Model> {
        None
    }
}

/// Configuration of the consensus driver.
#[derive(Debug, Clone)]
pub struct RansacConfig {
    /// Hard cap on the number of trials
    pub max_trials: usize,
    /// Trials always performed before adaptive termination may stop early
    pub min_trials: usize,
    /// Target confidence for the adaptive termination bound
    pub confidence: f64,
    /// Inlier threshold in the solver's residual units
    pub inlier_threshold: f64,
    /// Minimum support for a hypothesis to be accepted at all
    pub min_inliers: usize,
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    /// Optional wall-clock budget, checked at each trial head
    pub timeout: Option<Duration>,
    /// Re-estimate the winning hypothesis from its inliers before returning
    pub polish: bool,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_trials: 1000,
            min_trials: 32,
            confidence: 0.99,
            inlier_threshold: 0.01,
            min_inliers: 6,
            seed: None,
            timeout: None,
            polish: false,
        }
    }
}

impl RansacConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trial cap.
    pub fn with_max_trials(mut self, max_trials: usize) -> Self {
        self.max_trials = max_trials;
        self
    }

    /// Set the minimum trial count.
    pub fn with_min_trials(mut self, min_trials: usize) -> Self {
        self.min_trials = min_trials;
        self
    }

    /// Set the termination confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set the inlier threshold.
    pub fn with_inlier_threshold(mut self, inlier_threshold: f64) -> Self {
        self.inlier_threshold = inlier_threshold;
        self
    }

    /// Set the minimum accepted support.
    pub fn with_min_inliers(mut self, min_inliers: usize) -> Self {
        self.min_inliers = min_inliers;
        self
    }

    /// Fix the RNG seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable the final inlier polish.
    pub fn with_polish(mut self, polish: bool) -> Self {
        self.polish = polish;
        self
    }
}

/// The surviving hypothesis of a consensus run.
#[derive(Debug, Clone)]
pub struct RansacEstimate<M> {
    /// Best-scoring model
    pub model: M,
    /// Indices of its inliers in the caller's correspondence order
    pub inliers: Vec<usize>,
    /// Inlier count (same as `inliers.len()`, kept for reporting)
    pub support: usize,
    /// Sum of inlier residuals (tie-break criterion)
    pub total_residual: f64,
    /// Trials actually performed
    pub trials: usize,
}

/// Solver-agnostic consensus driver.
pub struct Ransac<S: MinimalSolver> {
    config: RansacConfig,
    solver: S,
}

impl<S: MinimalSolver> Ransac<S> {
    /// Driver with the default configuration.
    pub fn new(solver: S) -> Self {
        Ransac {
            config: RansacConfig::default(),
            solver,
        }
    }

    /// Driver with a custom configuration.
    pub fn with_config(solver: S, config: RansacConfig) -> Self {
        Ransac { config, solver }
    }

    /// Access the configuration.
    pub fn config(&self) -> &RansacConfig {
        &self.config
    }

    /// Access the wrapped solver.
    pub fn solver(&self) -> &S {
        &self.solver
    }

    /// Run the consensus search over a correspondence set.
    pub fn estimate(&self, data: &[S::Datum]) -> ServoResult<RansacEstimate<S::Model>> {
        let start = Instant::now();
        let sample_size = self.solver.sample_size();
        if data.len() < sample_size {
            return Err(ServoError::InsufficientCorrespondences {
                required: sample_size,
                actual: data.len(),
            });
        }

        let mut sampler = match self.config.seed {
            Some(seed) => UniformSampler::from_seed(seed),
            None => UniformSampler::new(),
        };
        let mut sample = vec![0usize; sample_size];

        let mut best: Option<RansacEstimate<S::Model>> = None;
        let mut adaptive_bound = self.config.max_trials;
        let mut trial = 0usize;

        while trial < adaptive_bound.max(self.config.min_trials) && trial < self.config.max_trials {
            if let Some(timeout) = self.config.timeout {
                if start.elapsed() >= timeout {
                    tracing::debug!(trial, "consensus timeout reached");
                    break;
                }
            }
            trial += 1;

            if !sampler.sample_unique(data.len(), &mut sample) {
                break;
            }
            if self.solver.is_degenerate(data, &sample) {
                tracing::trace!(trial, "degenerate sample skipped");
                continue;
            }

            for model in self.solver.solve(data, &sample) {
                let (inliers, total_residual) = self.score(&model, data);
                let improved = match &best {
                    None => !inliers.is_empty(),
                    Some(current) => {
                        inliers.len() > current.support
                            || (inliers.len() == current.support
                                && total_residual < current.total_residual)
                    }
                };
                if !improved {
                    continue;
                }

                let support = inliers.len();
                tracing::debug!(trial, support, "consensus hypothesis improved");
                best = Some(RansacEstimate {
                    model,
                    inliers,
                    support,
                    total_residual,
                    trials: trial,
                });
                adaptive_bound = self
                    .trials_needed(support, data.len(), sample_size)
                    .min(self.config.max_trials);
            }
        }

        let required = self.config.min_inliers.max(sample_size);
        let mut estimate = match best {
            Some(estimate) if estimate.support >= required => estimate,
            other => {
                return Err(ServoError::ConsensusFailed {
                    best_support: other.map(|estimate| estimate.support).unwrap_or(0),
                    required,
                });
            }
        };
        estimate.trials = trial;

        if self.config.polish {
            if let Some(polished) = self
                .solver
                .polish(&estimate.model, data, &estimate.inliers)
            {
                let (inliers, total_residual) = self.score(&polished, data);
                if inliers.len() >= estimate.support {
                    estimate.model = polished;
                    estimate.support = inliers.len();
                    estimate.inliers = inliers;
                    estimate.total_residual = total_residual;
                }
            }
        }

        Ok(estimate)
    }

    /// Count inliers of a hypothesis and sum their residuals.
    fn score(&self, model: &S::Model, data: &[S::Datum]) -> (Vec<usize>, f64) {
        let mut inliers = Vec::new();
        let mut total = 0.0;
        for (index, datum) in data.iter().enumerate() {
            if let Some(residual) = self.solver.residual(model, datum) {
                if residual < self.config.inlier_threshold {
                    inliers.push(index);
                    total += residual;
                }
            }
        }
        (inliers, total)
    }

    /// Standard adaptive termination bound for the current best support.
    fn trials_needed(&self, support: usize, population: usize, sample_size: usize) -> usize {
        if population == 0 {
            return self.config.max_trials;
        }
        let ratio = (support as f64 / population as f64).clamp(0.0, 1.0);
        let p_good = ratio.powi(sample_size as i32);
        if p_good <= 0.0 || p_good >= 1.0 {
            return if p_good >= 1.0 { self.config.min_trials } else { self.config.max_trials };
        }
        let needed = (1.0 - self.config.confidence).ln() / (1.0 - p_good).ln();
        if !needed.is_finite() {
            return self.config.max_trials;
        }
        (needed.ceil().max(1.0) as usize).max(self.config.min_trials)
    }
}
