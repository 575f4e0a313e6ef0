//! Dense linear-algebra backend for the refinement engine.
//!
//! Every linear system solved here is a symmetric positive-(semi)definite
//! normal-equation matrix of the tangent dimension (at most 10x10 for the
//! composite parameterizations), so dense nalgebra decompositions are the
//! right tool: Cholesky on the fast path, an SVD pseudo-inverse solve as the
//! robust fallback for rank-deficient systems arising from insufficient or
//! degenerate correspondences.
//!
//! All scratch state is local to the call; refinement calls for different
//! tracked targets may run concurrently on different threads.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Relative singular-value cutoff for the pseudo-inverse fallback.
const SVD_EPSILON: f64 = 1e-12;

/// Errors local to the linear-algebra backend.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// The system is singular beyond what the pseudo-inverse can recover
    #[error("Singular system: {0}")]
    Singular(String),
    /// The inputs are structurally inconsistent
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
}

/// Solve the normal equations `A·Δ = b` for a symmetric
/// positive-(semi)definite `A`.
///
/// Tries a Cholesky factorization first; if `A` is not numerically positive
/// definite (rank-deficient or ill-conditioned), falls back to an SVD
/// pseudo-inverse solve. Only when even the fallback produces non-finite
/// values is an error returned — the caller maps it to a divergence status
/// rather than aborting.
pub fn solve_normal_equations(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
) -> Result<DVector<f64>, LinAlgError> {
    if !a.is_square() || a.nrows() != b.len() {
        return Err(LinAlgError::ShapeMismatch(format!(
            "A is {}x{}, b has length {}",
            a.nrows(),
            a.ncols(),
            b.len()
        )));
    }

    if let Some(cholesky) = a.clone().cholesky() {
        let solution = cholesky.solve(b);
        if solution.iter().all(|v| v.is_finite()) {
            return Ok(solution);
        }
    }

    // Robust path: rank-revealing pseudo-inverse.
    let svd = a.clone().svd(true, true);
    let solution = svd
        .solve(b, SVD_EPSILON)
        .map_err(|msg| LinAlgError::Singular(msg.to_string()))?;
    if solution.iter().all(|v| v.is_finite()) {
        Ok(solution)
    } else {
        Err(LinAlgError::Singular(
            "pseudo-inverse solve produced non-finite values".to_string(),
        ))
    }
}
