//! Four-point homography minimal solver.
//!
//! Direct linear transformation in inhomogeneous form: the lower-right entry
//! is pinned to 1, turning the minimal problem into an 8x8 linear system
//! solved by full-pivot LU. The model is returned as an [`SL3`] element
//! (determinant-normalized), ready for refinement by the planar residual
//! model.

use crate::manifold::{LieGroup, SL3};
use crate::ransac::MinimalSolver;
use crate::residual::planar::{PlanarMatch, PlanarPoint};
use crate::residual::RefinementState;
use crate::vvs::{VvsConfig, VvsSolver, VvsStatus};
use nalgebra::{Matrix3, SMatrix, SVector, Vector2};

/// Determinant window outside which a raw DLT solution is considered
/// numerically unusable (near-singular or wildly scaled).
const MIN_DETERMINANT: f64 = 1e-4;
const MAX_DETERMINANT: f64 = 1e4;

/// Relative tolerance of the three-point collinearity test.
const COLLINEAR_EPSILON: f64 = 1e-6;

/// Minimal homography estimator from four point pairs.
#[derive(Debug, Clone, Default)]
pub struct FourPointHomography;

impl FourPointHomography {
    /// Construct the solver.
    pub fn new() -> Self {
        FourPointHomography
    }

    /// Three-point collinearity test on one side of the matches.
    fn any_three_collinear(points: &[Vector2<f64>; 4]) -> bool {
        for i in 0..4 {
            for j in (i + 1)..4 {
                for k in (j + 1)..4 {
                    let e1 = points[j] - points[i];
                    let e2 = points[k] - points[i];
                    let cross = e1.x * e2.y - e1.y * e2.x;
                    let scale = e1.norm() * e2.norm();
                    if cross.abs() <= COLLINEAR_EPSILON * scale.max(f64::EPSILON) {
                        return true;
                    }
                }
            }
        }
        false
    }
}

impl MinimalSolver for FourPointHomography {
    type Datum = PlanarMatch;
    type Model = SL3;

    fn sample_size(&self) -> usize {
        4
    }

    /// Three collinear points on either side make the DLT rank-deficient.
    fn is_degenerate(&self, data: &[Self::Datum], sample: &[usize]) -> bool {
        let references = [
            data[sample[0]].reference,
            data[sample[1]].reference,
            data[sample[2]].reference,
            data[sample[3]].reference,
        ];
        let observations = [
            data[sample[0]].observed,
            data[sample[1]].observed,
            data[sample[2]].observed,
            data[sample[3]].observed,
        ];
        Self::any_three_collinear(&references) || Self::any_three_collinear(&observations)
    }

    fn solve(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model> {
        // Each match contributes two rows of the inhomogeneous system
        //   [u  v  1  0  0  0  -u'u  -u'v] h = u'
        //   [0  0  0  u  v  1  -v'u  -v'v] h = v'
        // with h the first eight entries of H and H[2][2] = 1.
        let mut system = SMatrix::<f64, 8, 8>::zeros();
        let mut rhs = SVector::<f64, 8>::zeros();
        for (row_pair, &index) in sample.iter().take(4).enumerate() {
            let m = &data[index];
            let (u, v) = (m.reference.x, m.reference.y);
            let (up, vp) = (m.observed.x, m.observed.y);

            let row = 2 * row_pair;
            system[(row, 0)] = u;
            system[(row, 1)] = v;
            system[(row, 2)] = 1.0;
            system[(row, 6)] = -up * u;
            system[(row, 7)] = -up * v;
            rhs[row] = up;

            system[(row + 1, 3)] = u;
            system[(row + 1, 4)] = v;
            system[(row + 1, 5)] = 1.0;
            system[(row + 1, 6)] = -vp * u;
            system[(row + 1, 7)] = -vp * v;
            rhs[row + 1] = vp;
        }

        let Some(h) = system.full_piv_lu().solve(&rhs) else {
            return Vec::new();
        };
        if h.iter().any(|value| !value.is_finite()) {
            return Vec::new();
        }

        let raw = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        let determinant = raw.determinant();
        if determinant.abs() < MIN_DETERMINANT || determinant.abs() > MAX_DETERMINANT {
            return Vec::new();
        }

        vec![SL3::from_matrix(raw)]
    }

    /// Forward transfer error in the observation plane.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> Option<f64> {
        let transferred = model.apply(&datum.reference)?;
        Some((transferred - datum.observed).norm())
    }

    /// Least-squares re-estimation over the inlier set through the planar
    /// residual model and the capped refinement controller.
    fn polish(
        &self,
        model: &Self::Model,
        data: &[Self::Datum],
        inliers: &[usize],
    ) -> Option<Self::Model> {
        let matches: Vec<PlanarMatch> = inliers.iter().map(|&index| data[index].clone()).collect();
        let residual_model = PlanarPoint::new(matches);
        let mut state = RefinementState::new(model.clone());
        let solver = VvsSolver::with_config(VvsConfig::polish());
        let report = solver.refine(&mut state, &residual_model).ok()?;
        if report.status == VvsStatus::Diverged {
            return None;
        }
        state.transform.as_sl3().cloned()
    }
}
