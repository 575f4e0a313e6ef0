//! Robust weight functions (M-estimators) for iteratively reweighted least
//! squares.
//!
//! In standard least squares the cost is the squared norm of residuals:
//! `cost = Σ ||r_i||²`. An M-estimator replaces the quadratic loss with a
//! function ρ(r) that grows sub-quadratically for large residuals; solving
//! the resulting problem by IRLS amounts to multiplying each correspondence
//! by a weight `w(r) = ρ'(r)/r` recomputed every iteration.
//!
//! The weight is evaluated on the *scaled* residual `r/σ`, where σ is a
//! robust scale estimate obtained from the median absolute deviation of the
//! current residual distribution (see [`robust_scale`]). Correspondences
//! driven to zero weight remain in the set and may regain influence in later
//! iterations when the state estimate improves.
//!
//! # Available estimators
//!
//! - [`MEstimator::Tukey`]: hard redescending; residuals beyond c·σ receive
//!   exactly zero weight. The default for tracking.
//! - [`MEstimator::Huber`]: quadratic for inliers, linear for outliers; never
//!   fully rejects.
//! - [`MEstimator::Cauchy`]: smooth heavy suppression, non-convex.
//! - [`MEstimator::None`]: uniform weights (plain least squares), used for
//!   the short polish pass after consensus estimation.

/// Normal-consistency factor for the median absolute deviation: for Gaussian
/// residuals, σ ≈ 1.4826 · MAD.
const MAD_NORMAL_CONSISTENCY: f64 = 1.4826;

/// Robust weight function applied per correspondence each iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MEstimator {
    /// Uniform weights: plain (non-robust) least squares.
    None,
    /// Tukey biweight: w = (1 - (r/(c·σ))²)² for |r| < c·σ, else 0.
    Tukey {
        /// Tuning constant c (4.685 gives ~95% Gaussian efficiency)
        constant: f64,
    },
    /// Huber: w = 1 for |r| ≤ k·σ, else k·σ/|r|.
    Huber {
        /// Tuning constant k (1.345 gives ~95% Gaussian efficiency)
        constant: f64,
    },
    /// Cauchy (Lorentzian): w = 1 / (1 + (r/(c·σ))²).
    Cauchy {
        /// Tuning constant c (2.3849 gives ~95% Gaussian efficiency)
        constant: f64,
    },
}

impl MEstimator {
    /// Tukey biweight with the standard 95%-efficiency constant.
    pub fn tukey() -> Self {
        MEstimator::Tukey { constant: 4.685 }
    }

    /// Huber with the standard 95%-efficiency constant.
    pub fn huber() -> Self {
        MEstimator::Huber { constant: 1.345 }
    }

    /// Cauchy with the standard 95%-efficiency constant.
    pub fn cauchy() -> Self {
        MEstimator::Cauchy { constant: 2.3849 }
    }

    /// Evaluate the weight for a residual magnitude `r` under scale `scale`.
    ///
    /// A vanishing scale means a near-perfect fit; every estimator then
    /// returns uniform weight 1.0 to avoid dividing by zero.
    pub fn weight(&self, r: f64, scale: f64) -> f64 {
        if matches!(self, MEstimator::None) {
            return 1.0;
        }
        if scale <= f64::EPSILON {
            return 1.0;
        }
        let r = r.abs();
        match *self {
            MEstimator::None => 1.0,
            MEstimator::Tukey { constant } => {
                let cutoff = constant * scale;
                if r < cutoff {
                    let u = r / cutoff;
                    let v = 1.0 - u * u;
                    v * v
                } else {
                    0.0
                }
            }
            MEstimator::Huber { constant } => {
                let cutoff = constant * scale;
                if r <= cutoff {
                    1.0
                } else {
                    cutoff / r
                }
            }
            MEstimator::Cauchy { constant } => {
                let u = r / (constant * scale);
                1.0 / (1.0 + u * u)
            }
        }
    }
}

impl Default for MEstimator {
    fn default() -> Self {
        MEstimator::tukey()
    }
}

/// Robust scale estimate of a residual distribution: 1.4826 × median
/// absolute deviation of the finite entries.
///
/// Returns 0.0 when fewer than two finite residuals are available or when
/// the spread underflows (near-perfect fit); callers treat a zero scale as
/// "use uniform weights".
pub fn robust_scale(residual_norms: &[f64]) -> f64 {
    let mut finite: Vec<f64> = residual_norms
        .iter()
        .copied()
        .filter(|r| r.is_finite())
        .collect();
    if finite.len() < 2 {
        return 0.0;
    }

    let median = median_in_place(&mut finite);
    let mut deviations: Vec<f64> = finite.iter().map(|r| (r - median).abs()).collect();
    let mad = median_in_place(&mut deviations);
    MAD_NORMAL_CONSISTENCY * mad
}

/// Compute per-correspondence weights from the previous iteration's residual
/// norms.
///
/// Invalid correspondences (NaN norm: unobservable in the previous iteration)
/// re-enter with neutral weight 1.0 — if they are still unobservable they are
/// skipped during assembly anyway.
pub fn compute_weights(residual_norms: &[f64], estimator: MEstimator) -> Vec<f64> {
    let scale = robust_scale(residual_norms);
    residual_norms
        .iter()
        .map(|&r| {
            if r.is_finite() {
                estimator.weight(r, scale)
            } else {
                1.0
            }
        })
        .collect()
}

fn median_in_place(values: &mut [f64]) -> f64 {
    let mid = values.len() / 2;
    let (_, pivot, _) =
        values.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    *pivot
}
