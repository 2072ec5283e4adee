//! Linear algebra helpers for 3×3 covariance matrices.
//!
//! Public API:
//!     pub fn symmetrize(m: &Matrix3<f64>) -> Matrix3<f64>
//!     pub fn matrix_square_root(matrix: &Matrix3<f64>) -> Matrix3<f64>
//!     pub fn robust_inverse(matrix: &Matrix3<f64>) -> Option<Matrix3<f64>>
//!     pub fn mahalanobis_distance(delta: &Vector3<f64>, cov: &Matrix3<f64>) -> Option<f64>
//!
//! Strategy for the square root:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ
//!
//! No jitter is added on the way to the square root: a rank-deficient
//! covariance keeps a rank-deficient factor, so samples stay on its support.
//!
//! The inverse only accepts (numerically) positive definite matrices: a
//! covariance that needs the EVD floor to become invertible describes a
//! degenerate distribution and the caller has to decide what that means.

use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{Matrix3, Vector3};

const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-6;
const MAX_TRIES: usize = 6;
const EIGEN_FLOOR: f64 = 0.0;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Removes the round-off asymmetry that creeps in through products such as
/// `R Σ Rᵀ`.
#[inline]
pub fn symmetrize(m: &Matrix3<f64>) -> Matrix3<f64> {
    0.5 * (m + m.transpose())
}

/// Compute a square root `S` such that `matrix ≈ S * Sᵀ`.
///
/// Positive definite input takes the Cholesky path and yields a lower
/// triangular factor. Semi-definite input (e.g. a point mass, or a planar
/// ensemble) goes to the eigen decomposition with negative eigenvalues
/// clamped to zero, yielding a symmetric factor of the same rank.
pub fn matrix_square_root(matrix: &Matrix3<f64>) -> Matrix3<f64> {
    let p = symmetrize(matrix);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Plain Cholesky square root, `None` if the matrix is not positive definite.
fn chol_sqrt(p: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    Cholesky::new(*p).map(|ch| ch.l())
}

/// Symmetric EVD square root with eigenvalue flooring:
/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &Matrix3<f64>, floor: f64) -> Matrix3<f64> {
    let se = SymmetricEigen::new(*p);
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    let u = se.eigenvectors;
    u * Matrix3::from_diagonal(&sqrt_vals) * u.transpose()
}

/// Inverse of a symmetric positive definite matrix via Cholesky, retrying with
/// a small diagonal jitter. `None` when the matrix is singular or indefinite.
pub fn robust_inverse(matrix: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let p = symmetrize(matrix);
    if let Some(ch) = Cholesky::new(p) {
        return Some(symmetrize(&ch.inverse()));
    }
    // Relative jitter: absolute values would swamp small-scale covariances.
    let scale = p.diagonal().amax();
    if !(scale > 0.0) || !scale.is_finite() {
        return None;
    }
    let mut jitter = INITIAL_JITTER * scale;
    for _ in 0..MAX_TRIES {
        if let Some(ch) = Cholesky::new(p + Matrix3::identity() * jitter) {
            return Some(symmetrize(&ch.inverse()));
        }
        jitter *= 10.0;
        if jitter > MAX_JITTER * scale {
            break;
        }
    }
    None
}

/// Mahalanobis distance `sqrt(δᵀ Σ⁻¹ δ)`, `None` if `cov` cannot be inverted.
pub fn mahalanobis_distance(delta: &Vector3<f64>, cov: &Matrix3<f64>) -> Option<f64> {
    let inv = robust_inverse(cov)?;
    Some(delta.dot(&(inv * delta)).max(0.0).sqrt())
}

/// True when every entry is finite and the matrix is positive definite.
pub fn is_positive_definite(matrix: &Matrix3<f64>) -> bool {
    matrix.iter().all(|v| v.is_finite()) && Cholesky::new(symmetrize(matrix)).is_some()
}

/* =============================== Tests ==================================== */
