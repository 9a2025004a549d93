//! Covariance propagation and symmetric positive (semi-)definite helpers.
//!
//! Public API:
//!     pub fn propagate_covariance(..) -> Matrix3<f64>
//!     pub fn pose_covariance_sqrt(&Matrix3<f64>) -> Matrix3<f64>
//!     pub fn sample_gaussian(..) -> Vector3<f64>
//!     pub fn robust_spd_solve(..) -> Result<DMatrix<f64>>
//!     pub fn mahalanobis_squared(..) -> Result<f64>
//!
//! Square root strategy for pose covariances:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp)
//! 4) Symmetric EVD with eigenvalue floor → S = U * sqrt(Λ⁺) * Uᵀ
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Matrix3x2, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{LocalizationError, Result};

/// First order propagation of a pose covariance through one motion step.
///
/// $$
/// C' = F_p C F_p^T + F_\delta C_\delta F_\delta^T
/// $$
///
/// The result is symmetrized; no diagonal regularization is added, so a step with $F_p = I$ and
/// $C_\delta = 0$ returns `c` unchanged.
pub fn propagate_covariance(
    c: &Matrix3<f64>,
    fp: &Matrix3<f64>,
    fd: &Matrix3x2<f64>,
    cd: &Matrix2<f64>,
) -> Matrix3<f64> {
    symmetrize3(&(fp * c * fp.transpose() + fd * cd * fd.transpose()))
}

/// P ← 0.5 (P + Pᵀ) for a pose covariance.
#[inline]
pub fn symmetrize3(m: &Matrix3<f64>) -> Matrix3<f64> {
    0.5 * (m + m.transpose())
}

/// P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

fn chol_sqrt(p: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    Cholesky::new(*p).map(|ch| ch.l())
}

/// Cholesky with diagonal jitter on a geometric ramp. Returns None if all tries fail.
fn chol_sqrt_with_jitter(
    p: &Matrix3<f64>,
    initial_jitter: f64,
    max_jitter: f64,
    max_tries: usize,
) -> Option<Matrix3<f64>> {
    let mut jitter = initial_jitter;
    for _ in 0..max_tries {
        let pj = p + Matrix3::identity() * jitter;
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l());
        }
        jitter *= 10.0;
        if jitter > max_jitter {
            break;
        }
    }
    None
}

/// S = U * sqrt(max(λ, floor)) * Uᵀ
fn evd_symmetric_sqrt_with_floor(p: &Matrix3<f64>, floor: f64) -> Matrix3<f64> {
    let se = SymmetricEigen::new(*p);
    let sqrt_vals = se.eigenvalues.map(|l| l.max(floor).sqrt());
    se.eigenvectors * Matrix3::from_diagonal(&sqrt_vals) * se.eigenvectors.transpose()
}

/// Robust square root `S` of a pose covariance such that `p ≈ S Sᵀ`.
///
/// Never fails: matrices that are only positive semi-definite (for example the zero covariance of
/// a perfectly known pose) fall through to the jittered or eigenvalue-floored factorizations.
pub fn pose_covariance_sqrt(p: &Matrix3<f64>) -> Matrix3<f64> {
    const INITIAL_JITTER: f64 = 1e-12;
    const MAX_JITTER: f64 = 1e-6;
    const MAX_TRIES: usize = 6;
    const EIGEN_FLOOR: f64 = 1e-12;
    let p = symmetrize3(p);
    if let Some(s) = chol_sqrt(&p) {
        return s;
    }
    if let Some(s) = chol_sqrt_with_jitter(&p, INITIAL_JITTER, MAX_JITTER, MAX_TRIES) {
        return s;
    }
    evd_symmetric_sqrt_with_floor(&p, EIGEN_FLOOR)
}

/// Draw one sample from $\mathcal{N}(\mu, P)$.
pub fn sample_gaussian<R: Rng + ?Sized>(
    mean: &Vector3<f64>,
    covariance: &Matrix3<f64>,
    rng: &mut R,
) -> Vector3<f64> {
    let s = pose_covariance_sqrt(covariance);
    let z = Vector3::from_fn(|_, _| rng.sample::<f64, _>(StandardNormal));
    mean + s * z
}

/// Whether every eigenvalue of the symmetric part of `m` is at least `-tol`.
pub fn is_positive_semidefinite(m: &Matrix3<f64>, tol: f64) -> bool {
    symmetrize3(m).symmetric_eigenvalues().iter().all(|l| *l >= -tol)
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    pub initial_jitter: f64,
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Solve A X = B for SPD-ish A via Cholesky, with jitter retries.
/// Returns None if all attempts fail or the shapes disagree.
pub fn chol_solve_spd(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() {
        return None;
    }
    let a_sym = symmetrize(a);
    if let Some(ch) = Cholesky::new(a_sym.clone()) {
        return Some(ch.solve(b));
    }
    let n = a_sym.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        let a_j = &a_sym + DMatrix::<f64>::identity(n, n) * jitter;
        if let Some(ch) = Cholesky::new(a_j) {
            return Some(ch.solve(b));
        }
        jitter *= 10.0;
        if jitter > opt.max_jitter {
            break;
        }
    }
    None
}

/// Robust SPD solve: Cholesky with jitter first, explicit inverse as a last resort.
pub fn robust_spd_solve(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    if let Some(x) = chol_solve_spd(a, b, SolveOptions::default()) {
        return Ok(x);
    }
    if a.is_square() && a.nrows() == b.nrows() {
        if let Some(inv) = symmetrize(a).try_inverse() {
            return Ok(inv * b);
        }
    }
    Err(LocalizationError::SingularInnovation)
}

/// Squared Mahalanobis distance $\nu^T S^{-1} \nu$.
pub fn mahalanobis_squared(nu: &DVector<f64>, s: &DMatrix<f64>) -> Result<f64> {
    let rhs = DMatrix::from_column_slice(nu.len(), 1, nu.as_slice());
    let x = robust_spd_solve(s, &rhs)?;
    Ok(nu.iter().zip(x.iter()).map(|(a, b)| a * b).sum())
}
