//! Error types for the pose-servo library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! Non-convergence of the refinement loop is deliberately *not* an error: the
//! controller reports it through [`crate::vvs::VvsStatus`] together with the
//! last valid state. Only conditions that prevent producing any usable result
//! (underdetermined input, consensus failure, unrecoverable linear algebra)
//! surface as `ServoError`.

use crate::linalg::LinAlgError;
use crate::manifold::ManifoldError;
use thiserror::Error;

/// Main result type used throughout the pose-servo library
pub type ServoResult<T> = Result<T, ServoError>;

/// Main error type for the pose-servo library
#[derive(Debug, Clone, Error)]
pub enum ServoError {
    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A tangent/parameter vector did not match the active parameterization
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Fewer correspondences than the problem needs to be determined
    #[error("Insufficient correspondences: need at least {required}, got {actual}")]
    InsufficientCorrespondences { required: usize, actual: usize },

    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Manifold operation errors
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// Consensus search ended without a hypothesis reaching the minimum support
    #[error("Consensus failed: best support {best_support} below required {required}")]
    ConsensusFailed { best_support: usize, required: usize },
}

// Convert module-specific errors to ServoError

impl From<LinAlgError> for ServoError {
    fn from(err: LinAlgError) -> Self {
        ServoError::LinearAlgebra(err.to_string())
    }
}

impl From<ManifoldError> for ServoError {
    fn from(err: ManifoldError) -> Self {
        ServoError::Manifold(err.to_string())
    }
}
