//! The core normal-equation solve shared by every solution flavor.
//!
//! `Ma = b` is attempted with full-pivot LU first; a numerically singular
//! system falls back to the Moore–Penrose pseudo-inverse built from the
//! self-adjoint eigendecomposition, inverting every eigenvalue above the
//! zero tolerance and leaving the rest at zero.

use crate::config::ConditionNumberType;
use crate::kernel::BasisError;
use crate::linalg::{FaerEigh, FaerLinalgError, FaerSvd, full_piv_solve};
use faer::Side;
use ndarray::{Array1, Array2};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SolutionError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("kernel not solved; cannot return {0}")]
    NotSolved(&'static str),
    #[error("numerical failure: {0}")]
    Numerical(String),
    #[error("{0} solution does not exist")]
    MissingSolution(&'static str),
    #[error("internal invariant violated: {0}")]
    Logic(String),
    #[error("basis construction failed: {0}")]
    Basis(#[from] BasisError),
    #[error("linear algebra backend failed: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Which path produced the coefficient vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolvedBy {
    None,
    Lu,
    Eigenvector,
}

static SOLUTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide monotonic solution id.
pub(crate) fn next_solution_id() -> u64 {
    SOLUTION_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Solve `Ma = b`. Eigenvalues with `|e| <= eigenvalue_zero_tolerance` are
/// treated as zero by the fallback pseudo-inverse.
pub fn solve_normal_equations(
    m: &Array2<f64>,
    b: &Array1<f64>,
    eigenvalue_zero_tolerance: f64,
) -> Result<(Array1<f64>, SolvedBy), SolutionError> {
    let n = m.nrows();
    if n == 0 || m.ncols() != n || b.len() != n {
        return Err(SolutionError::InvalidInput(format!(
            "normal equations shape mismatch: M is {}x{}, b is {}",
            m.nrows(),
            m.ncols(),
            b.len()
        )));
    }

    log::debug!("solving {n}x{n} kernel system");
    if let Some(a) = full_piv_solve(m, b) {
        return Ok((a, SolvedBy::Lu));
    }

    log::warn!("unable to determine kernel via LU; falling back to eigendecomposition");
    let (mut evals, evecs) = m
        .eigh(Side::Lower)
        .map_err(|e| SolutionError::Numerical(format!("unable to determine kernel via eigenvalues: {e}")))?;

    evals.mapv_inplace(|e| {
        if e.abs() <= eigenvalue_zero_tolerance {
            0.0
        } else {
            1.0 / e
        }
    });

    // a = R · diag(ẽ) · Rᵀ · b
    let rt_b = evecs.t().dot(b);
    let scaled = &rt_b * &evals;
    let a = evecs.dot(&scaled);
    Ok((a, SolvedBy::Eigenvector))
}

/// Condition number of `m` under the requested definition. Returns
/// `f64::INFINITY` for an effectively singular matrix.
pub fn condition_number(
    m: &Array2<f64>,
    condition_type: ConditionNumberType,
) -> Result<f64, SolutionError> {
    match condition_type {
        ConditionNumberType::Eigenvalue => {
            let (evals, _) = m.eigh(Side::Lower).map_err(SolutionError::from)?;
            let max = evals.iter().fold(0.0f64, |acc, &e| acc.max(e.abs()));
            let min = evals.iter().fold(f64::INFINITY, |acc, &e| acc.min(e.abs()));
            log::debug!("eigenvalue condition: {max:.3e} / {min:.3e}");
            if min == 0.0 {
                return Ok(f64::INFINITY);
            }
            Ok(max / min)
        }
        ConditionNumberType::Svd => {
            let (_, s, _) = m.svd(false, false).map_err(SolutionError::from)?;
            let max = s.iter().fold(0.0f64, |acc, &v| acc.max(v));
            let min = s.iter().fold(f64::INFINITY, |acc, &v| acc.min(v));
            log::debug!("svd condition: {max:.3e} / {min:.3e}");
            if min == 0.0 {
                return Ok(f64::INFINITY);
            }
            Ok(max / min)
        }
    }
}
