//! Five-point relative-pose minimal solver.
//!
//! Implements the Stewenius formulation of the five-point essential-matrix
//! problem: the four-dimensional nullspace of the epipolar constraints is
//! expanded through the cubic trace and determinant constraints into a 10x20
//! polynomial system over the Stewenius monomial basis, reduced by
//! Gauss-Jordan elimination, and solved through the eigenvalues of the 10x10
//! action matrix (up to ten real roots). Every real root yields an essential
//! matrix candidate, which is decomposed into four pose candidates; only
//! poses that triangulate all five sample pairs at positive depth survive.
//!
//! Scoring uses the Sampson distance of the reconstituted essential matrix.

use crate::manifold::so3::skew;
use crate::manifold::{LieGroup, SE3, SO3};
use crate::ransac::MinimalSolver;
use arrayvec::ArrayVec;
use nalgebra::{
    Matrix3, OMatrix, OVector, Unit, Vector2, Vector3, Vector4, U10, U20, U4, U5, U9,
};

const EIGEN_CONVERGENCE: f64 = 1e-12;
const EIGEN_ITERATIONS: usize = 1000;
/// Eigenvalues of the 9x9 Gram matrix below this threshold count as the
/// nullspace; five generic correspondences leave a nullity of exactly four.
const EIGEN_THRESHOLD: f64 = 1e-12;
const SVD_CONVERGENCE: f64 = 1e-12;
const SVD_ITERATIONS: usize = 1000;
/// The smallest singular value must drop below this for a vector to qualify
/// as the null direction of the shifted action matrix.
const SVD_NULL_THRESHOLD: f64 = 1e-10;

// Stewenius monomial basis over (x, y, z): degree three down to the constant.
const M_XXX: usize = 0;
const M_XXY: usize = 1;
const M_XYY: usize = 2;
const M_YYY: usize = 3;
const M_XXZ: usize = 4;
const M_XYZ: usize = 5;
const M_YYZ: usize = 6;
const M_XZZ: usize = 7;
const M_YZZ: usize = 8;
const M_ZZZ: usize = 9;
const M_XX: usize = 10;
const M_XY: usize = 11;
const M_YY: usize = 12;
const M_XZ: usize = 13;
const M_YZ: usize = 14;
const M_ZZ: usize = 15;
const M_X: usize = 16;
const M_Y: usize = 17;
const M_Z: usize = 18;
const M_ONE: usize = 19;

type MonomialVec = OVector<f64, U20>;
type NullspaceMat = OMatrix<f64, U9, U4>;
type ConstraintMat = OMatrix<f64, U10, U20>;
type ActionMat = OMatrix<f64, U10, U10>;

/// One bearing pair between two camera frames: the same scene point seen
/// from the first and the second camera.
#[derive(Debug, Clone)]
pub struct BearingMatch {
    /// Observation direction in the first camera
    pub first: Unit<Vector3<f64>>,
    /// Observation direction in the second camera
    pub second: Unit<Vector3<f64>>,
}

impl BearingMatch {
    /// Construct a pair.
    pub fn new(first: Unit<Vector3<f64>>, second: Unit<Vector3<f64>>) -> Self {
        BearingMatch { first, second }
    }
}

/// Five-point relative-pose solver.
///
/// The model is the pose of the first camera expressed in the second
/// (`p₂ = R p₁ + t`) with unit-norm translation — the scale of a two-view
/// reconstruction is unobservable.
#[derive(Debug, Clone, Default)]
pub struct FivePointSolver;

impl FivePointSolver {
    /// Construct the solver.
    pub fn new() -> Self {
        FivePointSolver
    }
}

/// Row-major epipolar constraint rows: `second_j · first_k` multiplies
/// `E[j][k]` at flat index `3j + k`.
fn epipolar_constraints(sample: &[&BearingMatch; 5]) -> OMatrix<f64, U5, U9> {
    let mut constraints = OMatrix::<f64, U5, U9>::zeros();
    for (row, pair) in sample.iter().enumerate() {
        let a = pair.first.into_inner();
        let b = pair.second.into_inner();
        for j in 0..3 {
            for k in 0..3 {
                constraints[(row, 3 * j + k)] = b[j] * a[k];
            }
        }
    }
    constraints
}

/// Nullspace basis of the epipolar constraints; `None` when the sample is
/// rank-deficient (nullity above four).
fn constraint_nullspace(constraints: &OMatrix<f64, U5, U9>) -> Option<NullspaceMat> {
    let gram = constraints.transpose() * constraints;
    let eigen = gram.try_symmetric_eigen(EIGEN_CONVERGENCE, EIGEN_ITERATIONS)?;

    let mut order = [0usize, 1, 2, 3, 4, 5, 6, 7, 8];
    order.sort_unstable_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let nullity = order
        .iter()
        .position(|&index| eigen.eigenvalues[index] > EIGEN_THRESHOLD)?;
    if nullity != 4 {
        return None;
    }

    let mut nullspace = NullspaceMat::zeros();
    for (column, &index) in order.iter().take(4).enumerate() {
        nullspace
            .column_mut(column)
            .copy_from(&eigen.eigenvectors.column(index));
    }
    Some(nullspace)
}

/// Product of two degree-one polynomials in (x, y, z) with coefficient
/// vectors over [x, y, z, 1].
fn poly_mul_deg1(a: Vector4<f64>, b: Vector4<f64>) -> MonomialVec {
    let mut product = MonomialVec::zeros();
    product[M_XX] = a.x * b.x;
    product[M_XY] = a.x * b.y + a.y * b.x;
    product[M_XZ] = a.x * b.z + a.z * b.x;
    product[M_YY] = a.y * b.y;
    product[M_YZ] = a.y * b.z + a.z * b.y;
    product[M_ZZ] = a.z * b.z;
    product[M_X] = a.x * b.w + a.w * b.x;
    product[M_Y] = a.y * b.w + a.w * b.y;
    product[M_Z] = a.z * b.w + a.w * b.z;
    product[M_ONE] = a.w * b.w;
    product
}

/// Product of a degree-two polynomial with a degree-one polynomial.
fn poly_mul_deg2(a: MonomialVec, b: Vector4<f64>) -> MonomialVec {
    let mut product = MonomialVec::zeros();
    product[M_XXX] = a[M_XX] * b.x;
    product[M_XXY] = a[M_XX] * b.y + a[M_XY] * b.x;
    product[M_XXZ] = a[M_XX] * b.z + a[M_XZ] * b.x;
    product[M_XYY] = a[M_XY] * b.y + a[M_YY] * b.x;
    product[M_XYZ] = a[M_XY] * b.z + a[M_YZ] * b.x + a[M_XZ] * b.y;
    product[M_XZZ] = a[M_XZ] * b.z + a[M_ZZ] * b.x;
    product[M_YYY] = a[M_YY] * b.y;
    product[M_YYZ] = a[M_YY] * b.z + a[M_YZ] * b.y;
    product[M_YZZ] = a[M_YZ] * b.z + a[M_ZZ] * b.y;
    product[M_ZZZ] = a[M_ZZ] * b.z;
    product[M_XX] = a[M_XX] * b.w + a[M_X] * b.x;
    product[M_XY] = a[M_XY] * b.w + a[M_X] * b.y + a[M_Y] * b.x;
    product[M_XZ] = a[M_XZ] * b.w + a[M_X] * b.z + a[M_Z] * b.x;
    product[M_YY] = a[M_YY] * b.w + a[M_Y] * b.y;
    product[M_YZ] = a[M_YZ] * b.w + a[M_Y] * b.z + a[M_Z] * b.y;
    product[M_ZZ] = a[M_ZZ] * b.w + a[M_Z] * b.z;
    product[M_X] = a[M_X] * b.w + a[M_ONE] * b.x;
    product[M_Y] = a[M_Y] * b.w + a[M_ONE] * b.y;
    product[M_Z] = a[M_Z] * b.w + a[M_ONE] * b.z;
    product[M_ONE] = a[M_ONE] * b.w;
    product
}

/// Expand the determinant and cubic-trace constraints of the essential
/// manifold over the nullspace parameterization E = x·E₁ + y·E₂ + z·E₃ + E₄.
fn polynomial_constraints(nullspace: &NullspaceMat) -> ConstraintMat {
    // Coefficient vector [x, y, z, 1] of each entry of E.
    let mut e_poly = [[Vector4::zeros(); 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            e_poly[i][j] = Vector4::new(
                nullspace[(3 * i + j, 0)],
                nullspace[(3 * i + j, 1)],
                nullspace[(3 * i + j, 2)],
                nullspace[(3 * i + j, 3)],
            );
        }
    }

    let mut constraints = ConstraintMat::zeros();

    // det(E) = 0.
    let det_poly = poly_mul_deg2(
        poly_mul_deg1(e_poly[0][1], e_poly[1][2]) - poly_mul_deg1(e_poly[0][2], e_poly[1][1]),
        e_poly[2][0],
    ) + poly_mul_deg2(
        poly_mul_deg1(e_poly[0][2], e_poly[1][0]) - poly_mul_deg1(e_poly[0][0], e_poly[1][2]),
        e_poly[2][1],
    ) + poly_mul_deg2(
        poly_mul_deg1(e_poly[0][0], e_poly[1][1]) - poly_mul_deg1(e_poly[0][1], e_poly[1][0]),
        e_poly[2][2],
    );
    constraints.row_mut(0).copy_from(&det_poly.transpose());

    // E·Eᵀ (symmetric, upper triangle computed once).
    let mut eet = [[MonomialVec::zeros(); 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            if i <= j {
                eet[i][j] = poly_mul_deg1(e_poly[i][0], e_poly[j][0])
                    + poly_mul_deg1(e_poly[i][1], e_poly[j][1])
                    + poly_mul_deg1(e_poly[i][2], e_poly[j][2]);
            } else {
                eet[i][j] = eet[j][i];
            }
        }
    }

    // L = E·Eᵀ − ½·tr(E·Eᵀ)·I.
    let mut l = eet;
    let half_trace = 0.5 * (eet[0][0] + eet[1][1] + eet[2][2]);
    for (i, row) in l.iter_mut().enumerate() {
        row[i] -= half_trace;
    }

    // L·E = 0, nine cubic rows.
    for i in 0..3 {
        for j in 0..3 {
            let row = poly_mul_deg2(l[i][0], e_poly[0][j])
                + poly_mul_deg2(l[i][1], e_poly[1][j])
                + poly_mul_deg2(l[i][2], e_poly[2][j]);
            constraints.row_mut(1 + i * 3 + j).copy_from(&row.transpose());
        }
    }

    constraints
}

/// Null direction of the shifted action matrix, when the shift is an actual
/// eigenvalue.
fn action_null_vector(action: &ActionMat, eigenvalue: f64) -> Option<OVector<f64, U10>> {
    let shifted = action - ActionMat::from_diagonal_element(eigenvalue);
    let svd = shifted.try_svd(false, true, SVD_CONVERGENCE, SVD_ITERATIONS)?;
    if svd.singular_values[9] < SVD_NULL_THRESHOLD {
        Some(svd.v_t?.row(9).transpose())
    } else {
        None
    }
}

/// All essential-matrix candidates of a five-pair sample.
fn essential_candidates(sample: &[&BearingMatch; 5]) -> ArrayVec<Matrix3<f64>, 10> {
    let mut candidates = ArrayVec::new();

    let constraints = epipolar_constraints(sample);
    let Some(nullspace) = constraint_nullspace(&constraints) else {
        return candidates;
    };

    let expanded = polynomial_constraints(&nullspace);

    // Gauss-Jordan elimination through an LU solve of the left 10x10 block.
    let left = expanded.fixed_view::<10, 10>(0, 0).into_owned();
    let right = expanded.fixed_view::<10, 10>(0, 10).into_owned();
    let Some(reduced) = left.full_piv_lu().solve(&right) else {
        return candidates;
    };

    // Action matrix of multiplication in the quotient ring.
    let mut action = ActionMat::zeros();
    action
        .fixed_view_mut::<3, 10>(0, 0)
        .copy_from(&reduced.fixed_view::<3, 10>(0, 0));
    action.row_mut(3).copy_from(&reduced.row(4));
    action.row_mut(4).copy_from(&reduced.row(5));
    action.row_mut(5).copy_from(&reduced.row(7));
    action[(6, 0)] = -1.0;
    action[(7, 1)] = -1.0;
    action[(8, 3)] = -1.0;
    action[(9, 6)] = -1.0;

    let eigenvalues = action.complex_eigenvalues();
    for index in 0..eigenvalues.len() {
        let eigenvalue = eigenvalues[index];
        if eigenvalue.im != 0.0 {
            continue;
        }
        let Some(null_vector) = action_null_vector(&action, eigenvalue.re) else {
            continue;
        };
        // Components 5..9 of the basis vector hold (x, y, z, 1) up to scale.
        let coefficients = null_vector.fixed_rows::<4>(5).into_owned();
        let e_flat = nullspace * coefficients;
        if candidates.is_full() {
            break;
        }
        candidates.push(Matrix3::from_row_slice(e_flat.as_slice()));
    }
    candidates
}

/// Depths of a bearing pair under a pose candidate: least-squares solution of
/// `d₁·(R a) − d₂·b + t ≈ 0`.
fn pair_depths(rotated_first: &Vector3<f64>, second: &Vector3<f64>, t: &Vector3<f64>) -> Option<(f64, f64)> {
    let c = rotated_first.dot(second);
    let det = 1.0 - c * c;
    if det < 1e-12 {
        return None;
    }
    let rhs_0 = -rotated_first.dot(t);
    let rhs_1 = second.dot(t);
    let d1 = (rhs_0 + c * rhs_1) / det;
    let d2 = (c * rhs_0 + rhs_1) / det;
    Some((d1, d2))
}

/// Decompose an essential matrix into pose candidates and keep those that
/// place all five sample points in front of both cameras.
fn poses_with_positive_depth(
    essential: &Matrix3<f64>,
    sample: &[&BearingMatch; 5],
) -> ArrayVec<SE3, 4> {
    let mut poses = ArrayVec::new();
    let Some(svd) = essential.try_svd(true, true, SVD_CONVERGENCE, SVD_ITERATIONS) else {
        return poses;
    };
    let (Some(mut u), Some(mut v_t)) = (svd.u, svd.v_t) else {
        return poses;
    };

    // The last column of U / row of Vᵀ is sign-ambiguous; pin the handedness.
    if u.determinant() < 0.0 {
        u.column_mut(2).neg_mut();
    }
    if v_t.determinant() < 0.0 {
        v_t.row_mut(2).neg_mut();
    }

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let rotation_a = u * w * v_t;
    let rotation_b = u * w.transpose() * v_t;
    let translation = u.column(2).into_owned();

    for rotation in [rotation_a, rotation_b] {
        for t in [translation, -translation] {
            let all_in_front = sample.iter().all(|pair| {
                let rotated = rotation * pair.first.into_inner();
                pair_depths(&rotated, &pair.second.into_inner(), &t)
                    .is_some_and(|(d1, d2)| d1 > 0.0 && d2 > 0.0)
            });
            if all_in_front && !poses.is_full() {
                poses.push(SE3::from_parts(t, SO3::from_matrix(&rotation)));
            }
        }
    }
    poses
}

impl MinimalSolver for FivePointSolver {
    type Datum = BearingMatch;
    type Model = SE3;

    fn sample_size(&self) -> usize {
        5
    }

    /// Repeated observations collapse the constraint rank.
    fn is_degenerate(&self, data: &[Self::Datum], sample: &[usize]) -> bool {
        for i in 0..sample.len() {
            for j in (i + 1)..sample.len() {
                let a = &data[sample[i]];
                let b = &data[sample[j]];
                if a.first.dot(&b.first).abs() > 1.0 - 1e-12
                    && a.second.dot(&b.second).abs() > 1.0 - 1e-12
                {
                    return true;
                }
            }
        }
        false
    }

    fn solve(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model> {
        let pairs = [
            &data[sample[0]],
            &data[sample[1]],
            &data[sample[2]],
            &data[sample[3]],
            &data[sample[4]],
        ];
        let mut poses: Vec<SE3> = Vec::new();
        for essential in essential_candidates(&pairs) {
            poses.extend(poses_with_positive_depth(&essential, &pairs));
        }
        poses
    }

    /// Sampson distance of the reconstituted essential matrix.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> Option<f64> {
        let essential = skew(&model.translation()) * model.rotation().rotation_matrix();
        let a = datum.first.into_inner();
        let b = datum.second.into_inner();

        let e_a = essential * a;
        let et_b = essential.transpose() * b;
        let numerator = b.dot(&e_a);
        let gradient = Vector2::new(e_a.x, e_a.y).norm_squared()
            + Vector2::new(et_b.x, et_b.y).norm_squared();
        if gradient < f64::EPSILON {
            return None;
        }
        Some(numerator.abs() / gradient.sqrt())
    }
}
