//! Planar point-transfer residual model under SL(3).
//!
//! Used by single-plane odometry and template identification: points on a
//! reference plane are transferred through a homography and compared against
//! their observations in the current image.

use crate::manifold::{Parameterization, SL3};
use crate::residual::{projection_jacobian, Evaluation, RefinementState, ResidualModel};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};

/// One 2D-2D correspondence between the reference plane and the observation.
#[derive(Debug, Clone)]
pub struct PlanarMatch {
    /// Point on the reference plane (normalized coordinates)
    pub reference: Vector2<f64>,
    /// Observed point in the current view
    pub observed: Vector2<f64>,
    /// Caller-supplied prior confidence
    pub confidence: f64,
}

impl PlanarMatch {
    /// Match with unit confidence.
    pub fn new(reference: Vector2<f64>, observed: Vector2<f64>) -> Self {
        PlanarMatch {
            reference,
            observed,
            confidence: 1.0,
        }
    }

    /// Override the prior confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// Point-transfer residual under a homography.
///
/// Residual: `π(H·q) − observed` with `q = [u, v, 1]` (2 components).
/// Jacobian for `H ← H·Exp(δ)`: column k is `Jπ(H q) · H · Gₖ · q` over the
/// eight sl(3) generators.
pub struct PlanarPoint {
    matches: Vec<PlanarMatch>,
}

impl PlanarPoint {
    /// Build the model over a match set.
    pub fn new(matches: Vec<PlanarMatch>) -> Self {
        PlanarPoint { matches }
    }

    /// Access the match set.
    pub fn matches(&self) -> &[PlanarMatch] {
        &self.matches
    }
}

impl ResidualModel for PlanarPoint {
    fn parameterization(&self) -> Parameterization {
        Parameterization::sl3()
    }

    fn len(&self) -> usize {
        self.matches.len()
    }

    fn residual_dim(&self) -> usize {
        2
    }

    fn confidence(&self, index: usize) -> f64 {
        self.matches[index].confidence
    }

    fn evaluate(&self, state: &RefinementState, index: usize) -> Option<Evaluation> {
        let homography = state.transform.as_sl3()?;
        let m = &self.matches[index];

        let q = Vector3::new(m.reference.x, m.reference.y, 1.0);
        let transferred = homography.apply_homogeneous(&q);
        if transferred.z.abs() < f64::EPSILON {
            return None;
        }
        let predicted = Vector2::new(transferred.x / transferred.z, transferred.y / transferred.z);
        let residual = predicted - m.observed;

        let j_projection = projection_jacobian(&transferred);
        let h = homography.matrix();
        let generators = SL3::generators();

        let mut jacobian = DMatrix::zeros(2, 8);
        for (k, generator) in generators.iter().enumerate() {
            let direction = h * generator * q;
            let column = j_projection * direction;
            jacobian[(0, k)] = column.x;
            jacobian[(1, k)] = column.y;
        }

        Some(Evaluation {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobian,
        })
    }
}
