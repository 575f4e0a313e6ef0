//! Perspective-three-point minimal solver.
//!
//! Computes the camera pose from three 3D-2D correspondences using the
//! Lambda-Twist formulation (Persson & Nordberg, ECCV 2018): the three point
//! depths are recovered from a cubic resolvent sharpened by Newton
//! iterations and a quadratic per eigenvalue-ratio branch, each valid depth
//! triplet is refined by a few Gauss-Newton steps, and the rigid pose is
//! reassembled from the two point triangles. Up to four pose hypotheses are
//! returned.

use crate::manifold::{LieGroup, SE3, SO3};
use crate::ransac::MinimalSolver;
use crate::residual::point::{project, PointCorrespondence, PointReprojection};
use crate::residual::RefinementState;
use crate::vvs::{VvsConfig, VvsSolver, VvsStatus};
use arrayvec::ArrayVec;
use nalgebra::{Matrix3, Vector3};

/// Relative tolerance for the collinearity test on the world triangle.
const COLLINEAR_EPSILON: f64 = 1e-6;

/// P3P solver producing world-to-camera pose hypotheses.
#[derive(Debug, Clone)]
pub struct P3PSolver {
    /// Gauss-Newton iterations spent refining each depth triplet. The method
    /// rarely improves after two; the reference formulation uses five.
    pub depth_refinement_iterations: usize,
}

impl P3PSolver {
    /// Solver with the standard refinement budget.
    pub fn new() -> Self {
        P3PSolver {
            depth_refinement_iterations: 5,
        }
    }

    fn poses_from_sample(&self, sample: [&PointCorrespondence; 3]) -> ArrayVec<SE3, 4> {
        let mut poses = ArrayVec::new();
        let worlds = [sample[0].world, sample[1].world, sample[2].world];
        let bearings = [
            sample[0].bearing.into_inner(),
            sample[1].bearing.into_inner(),
            sample[2].bearing.into_inner(),
        ];

        // Edges of the world triangle and their squared lengths.
        let d12 = worlds[0] - worlds[1];
        let d13 = worlds[0] - worlds[2];
        let d23 = worlds[1] - worlds[2];
        let d12_x_d13 = d12.cross(&d13);
        let a12 = d12.norm_squared();
        let a13 = d13.norm_squared();
        let a23 = d23.norm_squared();

        // Cosines between the observed bearings.
        let c12 = bearings[0].dot(&bearings[1]);
        let c23 = bearings[1].dot(&bearings[2]);
        let c31 = bearings[2].dot(&bearings[0]);
        let blob = c12 * c23 * c31 - 1.0;

        let s12_sq = 1.0 - c12 * c12;
        let s23_sq = 1.0 - c23 * c23;
        let s31_sq = 1.0 - c31 * c31;

        let b12 = -2.0 * c12;
        let b13 = -2.0 * c31;
        let b23 = -2.0 * c23;

        // Cubic resolvent coefficients (the depth-ratio polynomial).
        let p3 = a13 * (a23 * s31_sq - a13 * s23_sq);
        let p2 = 2.0 * blob * a23 * a13
            + a13 * (2.0 * a12 + a13) * s23_sq
            + a23 * (a23 - a12) * s31_sq;
        let p1 = a23 * (a13 - a23) * s12_sq
            - a12 * a12 * s23_sq
            - 2.0 * a12 * (blob * a23 + a13 * s23_sq);
        let p0 = a12 * (a12 * s23_sq - a23 * s12_sq);

        if p3.abs() < f64::EPSILON {
            return poses;
        }
        let gamma = sharpest_cubic_root(p2 / p3, p1 / p3, p0 / p3);
        if !gamma.is_finite() {
            return poses;
        }

        // The singular matrix whose null structure carries the depth ratios.
        let d0_01 = -(a23 * c12);
        let d0_02 = a23 * c31 * gamma;
        let d0_12 = -c23 * (a13 * gamma - a12);
        let d0 = Matrix3::new(
            a23 * (1.0 - gamma),
            d0_01,
            d0_02,
            d0_01,
            a23 - a12 + a13 * gamma,
            d0_12,
            d0_02,
            d0_12,
            gamma * (a13 - a23) - a12,
        );

        let (eigenvectors, eigenvalues) = eigen_decomposition_singular(&d0);
        if eigenvalues[0].abs() < f64::EPSILON {
            return poses;
        }
        let eigen_ratio = (0.0f64.max(-eigenvalues[1] / eigenvalues[0])).sqrt();

        // Depth triplets from the quadratic of each ratio branch.
        let mut depth_candidates: ArrayVec<Vector3<f64>, 4> = ArrayVec::new();
        for ratio in [eigen_ratio, -eigen_ratio] {
            let denominator = ratio * eigenvectors[(0, 1)] - eigenvectors[(0, 0)];
            if denominator.abs() < f64::EPSILON {
                continue;
            }
            let w2 = 1.0 / denominator;
            let w0 = w2 * (eigenvectors[(1, 0)] - ratio * eigenvectors[(1, 1)]);
            let w1 = w2 * (eigenvectors[(2, 0)] - ratio * eigenvectors[(2, 1)]);

            let scale = (a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12;
            if scale.abs() < f64::EPSILON {
                continue;
            }
            let inv_scale = 1.0 / scale;
            let q_b = inv_scale * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
            let q_c = inv_scale * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);

            if q_b * q_b - 4.0 * q_c < 0.0 {
                continue;
            }
            let (_, tau_1, tau_2) = two_real_roots(q_b, q_c);
            for tau in [tau_1, tau_2] {
                if tau <= 0.0 {
                    continue;
                }
                let d = a23 / (tau * (b23 + tau) + 1.0);
                if d <= 0.0 {
                    continue;
                }
                let l2 = d.sqrt();
                let l3 = tau * l2;
                let l1 = w0 * l2 + w1 * l3;
                if l1 >= 0.0 && !depth_candidates.is_full() {
                    depth_candidates.push(Vector3::new(l1, l2, l3));
                }
            }
        }

        // Rigid pose from the refined depths: R maps the world triangle onto
        // the back-projected camera triangle.
        let x_mat = Matrix3::from_columns(&[d12, d13, d12_x_d13]);
        let Some(x_inv) = x_mat.try_inverse() else {
            return poses;
        };

        for depths in depth_candidates {
            let refined = self.refine_depths(depths, a12, a13, a23, b12, b13, b23);

            let ry1 = refined[0] * bearings[0];
            let ry2 = refined[1] * bearings[1];
            let ry3 = refined[2] * bearings[2];
            let yd1 = ry1 - ry2;
            let yd2 = ry1 - ry3;
            let y_mat = Matrix3::from_columns(&[yd1, yd2, yd1.cross(&yd2)]);

            let rotation = SO3::from_matrix(&(y_mat * x_inv));
            let translation = ry1 - rotation.act(&worlds[0]);
            poses.push(SE3::from_parts(translation, rotation));
        }
        poses
    }

    /// Gauss-Newton refinement of a depth triplet against the three squared
    /// triangle-edge constraints.
    #[allow(clippy::too_many_arguments)]
    fn refine_depths(
        &self,
        depths: Vector3<f64>,
        a12: f64,
        a13: f64,
        a23: f64,
        b12: f64,
        b13: f64,
        b23: f64,
    ) -> Vector3<f64> {
        let residual = |l: &Vector3<f64>| {
            Vector3::new(
                l.x * l.x + l.y * l.y + b12 * l.x * l.y - a12,
                l.x * l.x + l.z * l.z + b13 * l.x * l.z - a13,
                l.y * l.y + l.z * l.z + b23 * l.y * l.z - a23,
            )
        };

        let mut current = depths;
        let mut current_residual = residual(&current);
        for _ in 0..self.depth_refinement_iterations {
            if current_residual.lp_norm(1) < 1e-10 {
                break;
            }
            let (l1, l2, l3) = (current.x, current.y, current.z);
            let dr1_dl1 = 2.0 * l1 + b12 * l2;
            let dr1_dl2 = 2.0 * l2 + b12 * l1;
            let dr2_dl1 = 2.0 * l1 + b13 * l3;
            let dr2_dl3 = 2.0 * l3 + b13 * l1;
            let dr3_dl2 = 2.0 * l2 + b23 * l3;
            let dr3_dl3 = 2.0 * l3 + b23 * l2;

            // Closed-form inverse times residual for the sparse 3x3 Jacobian
            // [dr1_dl1 dr1_dl2 0; dr2_dl1 0 dr2_dl3; 0 dr3_dl2 dr3_dl3].
            let det = -dr1_dl1 * dr2_dl3 * dr3_dl2 - dr1_dl2 * dr2_dl1 * dr3_dl3;
            if det.abs() < f64::EPSILON {
                break;
            }
            let adjugate = Matrix3::new(
                -dr2_dl3 * dr3_dl2,
                -dr1_dl2 * dr3_dl3,
                dr1_dl2 * dr2_dl3,
                -dr2_dl1 * dr3_dl3,
                dr1_dl1 * dr3_dl3,
                -dr1_dl1 * dr2_dl3,
                dr2_dl1 * dr3_dl2,
                -dr1_dl1 * dr3_dl2,
                -dr1_dl2 * dr2_dl1,
            );
            let next = current - (adjugate * current_residual) / det;
            let next_residual = residual(&next);
            if next_residual.lp_norm(1) > current_residual.lp_norm(1) {
                break;
            }
            current = next;
            current_residual = next_residual;
        }
        current
    }
}

impl Default for P3PSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimalSolver for P3PSolver {
    type Datum = PointCorrespondence;
    type Model = SE3;

    fn sample_size(&self) -> usize {
        3
    }

    /// Collinear world points and coincident observations leave the pose
    /// unconstrained; such samples are rejected before solving.
    fn is_degenerate(&self, data: &[Self::Datum], sample: &[usize]) -> bool {
        let w0 = data[sample[0]].world;
        let w1 = data[sample[1]].world;
        let w2 = data[sample[2]].world;
        let e1 = w1 - w0;
        let e2 = w2 - w0;
        let cross = e1.cross(&e2);
        let area_scale = e1.norm_squared() * e2.norm_squared();
        if cross.norm_squared() <= COLLINEAR_EPSILON * COLLINEAR_EPSILON * area_scale {
            return true;
        }

        for i in 0..3 {
            for j in (i + 1)..3 {
                let dot = data[sample[i]]
                    .bearing
                    .into_inner()
                    .dot(&data[sample[j]].bearing.into_inner());
                if dot.abs() > 1.0 - 1e-12 {
                    return true;
                }
            }
        }
        false
    }

    fn solve(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model> {
        self.poses_from_sample([&data[sample[0]], &data[sample[1]], &data[sample[2]]])
            .into_iter()
            .collect()
    }

    /// Normalized image-plane reprojection distance; shares the projection
    /// with the point residual model.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> Option<f64> {
        let observed = datum.image_point()?;
        let (predicted, _) = project(model, &datum.world)?;
        Some((predicted - observed).norm())
    }

    /// Non-robust least-squares re-estimation over the inlier set, reusing
    /// the refinement controller in capped form.
    fn polish(
        &self,
        model: &Self::Model,
        data: &[Self::Datum],
        inliers: &[usize],
    ) -> Option<Self::Model> {
        let correspondences: Vec<PointCorrespondence> =
            inliers.iter().map(|&index| data[index].clone()).collect();
        let residual_model = PointReprojection::new(correspondences);
        let mut state = RefinementState::new(model.clone());
        let solver = VvsSolver::with_config(VvsConfig::polish());
        let report = solver.refine(&mut state, &residual_model).ok()?;
        if report.status == VvsStatus::Diverged {
            return None;
        }
        state.transform.as_se3().cloned()
    }
}

/// Real roots of `r² + b·r + c = 0`, evaluated in the numerically favorable
/// order.
fn two_real_roots(b: f64, c: f64) -> (bool, f64, f64) {
    let discriminant = b * b - 4.0 * c;
    if discriminant < 0.0 {
        let root = 0.5 * b;
        (false, root, root)
    } else if b < 0.0 {
        let y = discriminant.sqrt();
        (true, 0.5 * (-b + y), 0.5 * (-b - y))
    } else {
        let y = discriminant.sqrt();
        (true, 2.0 * c / (-b + y), 2.0 * c / (-b - y))
    }
}

/// A single real root of `r³ + b·r² + c·r + d = 0`, chosen where the
/// derivative is largest so that the Newton iteration is well conditioned.
///
/// The starting point considers the stationary points t1 < t2 of the cubic:
/// when the cubic is monotonic the inflection point serves as the seed;
/// otherwise the seed is placed on the outer side of whichever stationary
/// point brackets the sharpest root.
fn sharpest_cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let mut root = if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k1 = ((t1 + b) * t1 + c) * t1 + d;
        if k1 > 0.0 {
            t1 - (-k1 / (3.0 * t1 + b)).sqrt()
        } else {
            let t2 = (-b + v) / 3.0;
            let k2 = ((t2 + b) * t2 + c) * t2 + d;
            t2 + (-k2 / (3.0 * t2 + b)).sqrt()
        }
    } else {
        let mut seed = -b / 3.0;
        if ((3.0 * seed + 2.0 * b) * seed + c).abs() < 1e-4 {
            seed += 1.0;
        }
        seed
    };

    // A fixed burst of Newton steps, then iterate to the residual floor.
    for _ in 0..7 {
        let value = ((root + b) * root + c) * root + d;
        let derivative = (3.0 * root + 2.0 * b) * root + c;
        root -= value / derivative;
    }
    for _ in 0..43 {
        let value = ((root + b) * root + c) * root + d;
        if value.abs() <= 1e-13 {
            break;
        }
        let derivative = (3.0 * root + 2.0 * b) * root + c;
        root -= value / derivative;
    }
    root
}

/// Eigen decomposition of a singular symmetric 3x3 matrix (one eigenvalue is
/// exactly zero by construction).
///
/// Returns the eigenvector matrix [v1 v2 v3] and the eigenvalues (e1, e2, 0)
/// ordered by decreasing magnitude; v3 spans the null space.
fn eigen_decomposition_singular(m: &Matrix3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let mut null_vector = m.column(0).cross(&m.column(1));
    null_vector.normalize_mut();

    let m01_sq = m[(0, 1)] * m[(0, 1)];
    let b = -m[(0, 0)] - m[(1, 1)] - m[(2, 2)];
    let c = -m01_sq - m[(0, 2)] * m[(0, 2)] - m[(1, 2)] * m[(1, 2)]
        + m[(0, 0)] * (m[(1, 1)] + m[(2, 2)])
        + m[(1, 1)] * m[(2, 2)];
    let (_, mut e1, mut e2) = two_real_roots(b, c);
    if e1.abs() < e2.abs() {
        std::mem::swap(&mut e1, &mut e2);
    }

    let neg_m00_m11 = -m[(0, 0)] * m[(1, 1)];
    let prec_0 = m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)];
    let prec_1 = m[(0, 1)] * m[(0, 2)] - m[(0, 0)] * m[(1, 2)];

    let eigenvector = |e: f64| {
        let tmp = 1.0 / (e * (m[(0, 0)] + m[(1, 1)]) + neg_m00_m11 - e * e + m01_sq);
        let mut a1 = -(e * m[(0, 2)] + prec_0) * tmp;
        let mut a2 = -(e * m[(1, 2)] + prec_1) * tmp;
        let inv_norm = 1.0 / (a1 * a1 + a2 * a2 + 1.0).sqrt();
        a1 *= inv_norm;
        a2 *= inv_norm;
        Vector3::new(a1, a2, inv_norm)
    };
    let v1 = eigenvector(e1);
    let v2 = eigenvector(e2);

    (
        Matrix3::from_columns(&[v1, v2, null_vector]),
        Vector3::new(e1, e2, 0.0),
    )
}
