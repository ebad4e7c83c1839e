//! ndarray ⇄ faer interop and the small dense solves used by the kernel
//! solvers.
//!
//! User-facing matrices are `ndarray`; faer supplies the self-adjoint
//! eigendecomposition, SVD, and the GEMM/GEMV behind the normal equations,
//! reached through zero-copy raw-parts views. The full-pivot elimination and
//! Gauss–Jordan inverse are hand-rolled with explicit pivot thresholds so
//! singularity is detected, not silently propagated.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Mat, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("matrix factorization failed")]
    FactorizationFailed,
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("self-adjoint eigendecomposition failed: {0:?}")]
    SelfAdjointEigen(faer::linalg::solvers::EvdError),
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // Stay on ndarray for tiny products; switch to faer GEMM above that.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

/// Borrowed faer view of an ndarray matrix. Layouts with non-positive
/// strides are materialized into a compact owned copy first.
pub(crate) struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub(crate) fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer/shape/strides come from a live ndarray view with
        // positive strides, or from the owned compact copy held above.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

struct FaerColView<'a> {
    ptr: *const f64,
    len: usize,
    stride: isize,
    owned: Option<Array1<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerColView<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix1>) -> Self {
        let len = array.len();
        let stride = array.strides()[0];
        if stride <= 0 {
            let owned = array.to_owned();
            return Self {
                ptr: owned.as_ptr(),
                len,
                stride: 1,
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            len,
            stride,
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, len, stride) = if let Some(owned) = &self.owned {
            (owned.as_ptr(), owned.len(), 1)
        } else {
            (self.ptr, self.len, self.stride)
        };
        // SAFETY: analogous to FaerArrayView::as_ref.
        unsafe { MatRef::from_raw_parts(ptr, len, 1, stride, 0) }
    }
}

/// `AᵀB` through faer GEMM; small products stay on ndarray.
fn atb(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    let (n_b, q) = b.dim();
    debug_assert_eq!(n, n_b, "A and B must have the same number of rows");

    if !should_use_faer_matmul(p, q, n) {
        return a.t().dot(b);
    }

    let mut result = Mat::<f64>::zeros(p, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    let par = if n < 128 || p < 128 || q < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref().transpose(),
        b_view.as_ref(),
        1.0,
        par,
    );
    mat_to_array(result.as_ref())
}

/// `Aᵀv` through faer GEMV; small products stay on ndarray.
fn atv(a: &Array2<f64>, v: &Array1<f64>) -> Array1<f64> {
    use faer::Accum;
    use faer::linalg::matmul::matmul;

    let (n, p) = a.dim();
    debug_assert_eq!(n, v.len(), "A rows must match v length");

    if !should_use_faer_matmul(p, 1, n) {
        return a.t().dot(v);
    }

    let mut result = Mat::<f64>::zeros(p, 1);
    let a_view = FaerArrayView::new(a);
    let v_view = FaerColView::new(v);
    let par = if n < 128 || p < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref().transpose(),
        v_view.as_ref(),
        1.0,
        par,
    );

    let mut out = Array1::<f64>::zeros(p);
    for i in 0..p {
        out[i] = result[(i, 0)];
    }
    out
}

/// Inverse-variance weighted normal equations: `M = CᵀVC`, `b = CᵀVY`
/// with `V = diag(iv)`.
///
/// Rows of `C` are pixels, columns are fit parameters; `iv` must be the
/// already-validated strictly positive inverse variance.
pub fn weighted_normal_equations(
    c: &Array2<f64>,
    iv: &Array1<f64>,
    y: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    debug_assert_eq!(c.nrows(), iv.len());
    debug_assert_eq!(c.nrows(), y.len());

    let mut weighted = c.to_owned();
    for (mut row, &w) in weighted.rows_mut().into_iter().zip(iv.iter()) {
        row *= w;
    }
    let m = atb(c, &weighted);
    let b = atv(c, &(iv * y));
    (m, b)
}

/// Copy the upper triangle onto the lower one in place.
pub fn symmetrize_upper(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    debug_assert_eq!(n, matrix.ncols());
    for i in 0..n {
        for j in (i + 1)..n {
            matrix[[j, i]] = matrix[[i, j]];
        }
    }
}

/// Solve `Ax = b` by Gaussian elimination with full (row and column)
/// pivoting. Returns `None` when a pivot falls below the scaled threshold,
/// i.e. the matrix is numerically singular.
pub fn full_piv_solve(matrix: &Array2<f64>, rhs: &Array1<f64>) -> Option<Array1<f64>> {
    let n = matrix.nrows();
    if n == 0 || matrix.ncols() != n || rhs.len() != n {
        return None;
    }

    let mut a = matrix.to_owned();
    let mut b = rhs.to_owned();
    // Column swaps permute the unknowns: x[perm[j]] = y[j].
    let mut perm: Vec<usize> = (0..n).collect();

    let scale = a.iter().fold(0.0f64, |acc, &v| acc.max(v.abs()));
    if !scale.is_finite() {
        return None;
    }
    let tol = f64::EPSILON * n as f64 * scale.max(f64::MIN_POSITIVE);

    for k in 0..n {
        let mut pivot_row = k;
        let mut pivot_col = k;
        let mut pivot_abs = 0.0f64;
        for i in k..n {
            for j in k..n {
                let v = a[[i, j]].abs();
                if v > pivot_abs {
                    pivot_abs = v;
                    pivot_row = i;
                    pivot_col = j;
                }
            }
        }
        if pivot_abs <= tol || !pivot_abs.is_finite() {
            return None;
        }
        if pivot_row != k {
            for j in 0..n {
                a.swap([k, j], [pivot_row, j]);
            }
            b.swap(k, pivot_row);
        }
        if pivot_col != k {
            for i in 0..n {
                a.swap([i, k], [i, pivot_col]);
            }
            perm.swap(k, pivot_col);
        }

        let pivot = a[[k, k]];
        for i in (k + 1)..n {
            let factor = a[[i, k]] / pivot;
            if factor == 0.0 {
                continue;
            }
            a[[i, k]] = 0.0;
            for j in (k + 1)..n {
                a[[i, j]] -= factor * a[[k, j]];
            }
            b[i] -= factor * b[k];
        }
    }

    // Back substitution on the permuted system.
    let mut y = Array1::<f64>::zeros(n);
    for k in (0..n).rev() {
        let mut acc = b[k];
        for j in (k + 1)..n {
            acc -= a[[k, j]] * y[j];
        }
        y[k] = acc / a[[k, k]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for k in 0..n {
        x[perm[k]] = y[k];
    }
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

/// Dense inverse by Gauss–Jordan elimination with partial pivoting.
pub fn invert_square_matrix(matrix: &Array2<f64>) -> Result<Array2<f64>, FaerLinalgError> {
    let n = matrix.nrows();
    if n == 0 || matrix.ncols() != n {
        return Err(FaerLinalgError::FactorizationFailed);
    }

    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    for r in 0..n {
        for c in 0..n {
            aug[[r, c]] = matrix[[r, c]];
        }
        aug[[r, n + r]] = 1.0;
    }

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_abs = aug[[col, col]].abs();
        for r in (col + 1)..n {
            let v = aug[[r, col]].abs();
            if v > pivot_abs {
                pivot_abs = v;
                pivot_row = r;
            }
        }
        if pivot_abs <= 1e-14 || !pivot_abs.is_finite() {
            return Err(FaerLinalgError::FactorizationFailed);
        }
        if pivot_row != col {
            for c in 0..(2 * n) {
                aug.swap([col, c], [pivot_row, c]);
            }
        }

        let pivot = aug[[col, col]];
        for c in 0..(2 * n) {
            aug[[col, c]] /= pivot;
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = aug[[r, col]];
            if factor == 0.0 {
                continue;
            }
            for c in 0..(2 * n) {
                aug[[r, c]] -= factor * aug[[col, c]];
            }
        }
    }

    let mut inv = Array2::<f64>::zeros((n, n));
    for r in 0..n {
        for c in 0..n {
            inv[[r, c]] = aug[[r, n + c]];
        }
    }
    Ok(inv)
}

pub trait FaerEigh {
    /// Self-adjoint eigendecomposition: `(eigenvalues, eigenvectors)` with
    /// eigenvectors in columns.
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerEigh for ArrayBase<S, Ix2> {
    fn eigh(&self, side: Side) -> Result<(Array1<f64>, Array2<f64>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let eigen = faer_view
            .as_ref()
            .self_adjoint_eigen(side)
            .map_err(FaerLinalgError::SelfAdjointEigen)?;
        let values = diag_to_array(eigen.S());
        let vectors = mat_to_array(eigen.U());
        Ok((values, vectors))
    }
}

pub trait FaerSvd {
    fn svd(
        &self,
        compute_u: bool,
        compute_vt: bool,
    ) -> Result<(Option<Array2<f64>>, Array1<f64>, Option<Array2<f64>>), FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerSvd for ArrayBase<S, Ix2> {
    fn svd(
        &self,
        compute_u: bool,
        compute_vt: bool,
    ) -> Result<(Option<Array2<f64>>, Array1<f64>, Option<Array2<f64>>), FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let faer_mat = faer_view.as_ref();
        let (rows, cols) = faer_mat.shape();

        let compute_u_flag = if compute_u {
            ComputeSvdVectors::Full
        } else {
            ComputeSvdVectors::No
        };
        let compute_v_flag = if compute_vt {
            ComputeSvdVectors::Full
        } else {
            ComputeSvdVectors::No
        };

        let mut singular = Diag::<f64>::zeros(rows.min(cols));
        let mut u_storage = compute_u.then(|| Mat::<f64>::zeros(rows, rows));
        let mut v_storage = compute_vt.then(|| Mat::<f64>::zeros(cols, cols));

        let par = get_global_parallelism();
        let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
            rows,
            cols,
            compute_u_flag,
            compute_v_flag,
            par,
            Default::default(),
        ));
        let stack = MemStack::new(&mut mem);

        svd::svd(
            faer_mat,
            singular.as_mut(),
            u_storage.as_mut().map(|mat| mat.as_mut()),
            v_storage.as_mut().map(|mat| mat.as_mut()),
            par,
            stack,
            Default::default(),
        )
        .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

        let singular_values = diag_to_array(singular.as_ref());
        let u_opt = u_storage.map(|mat| mat_to_array(mat.as_ref()));
        let vt_opt = v_storage.map(|mat| {
            let mat_ref = mat.as_ref();
            let mut out = Array2::<f64>::zeros((mat_ref.ncols(), mat_ref.nrows()));
            for j in 0..mat_ref.nrows() {
                for i in 0..mat_ref.ncols() {
                    out[[i, j]] = mat_ref[(j, i)];
                }
            }
            out
        });

        Ok((u_opt, singular_values, vt_opt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn full_piv_solve_recovers_known_solution() {
        let a = array![[4.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 2.0]];
        let x_true = array![1.0, -2.0, 3.0];
        let b = a.dot(&x_true);
        let x = full_piv_solve(&a, &b).expect("well-conditioned system should solve");
        for i in 0..3 {
            assert!((x[i] - x_true[i]).abs() < 1e-12, "component {i} off: {}", x[i]);
        }
    }

    #[test]
    fn full_piv_solve_rejects_singular() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        let b = array![1.0, 2.0];
        assert!(full_piv_solve(&a, &b).is_none());
    }

    #[test]
    fn full_piv_solve_handles_zero_leading_pivot() {
        // Needs a pivot swap on the first step.
        let a = array![[0.0, 1.0], [1.0, 0.0]];
        let b = array![2.0, 5.0];
        let x = full_piv_solve(&a, &b).expect("permutation matrix is invertible");
        assert!((x[0] - 5.0).abs() < 1e-14);
        assert!((x[1] - 2.0).abs() < 1e-14);
    }

    #[test]
    fn invert_round_trips() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let inv = invert_square_matrix(&a).expect("invertible");
        let prod = a.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!((prod[[i, j]] - expect).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn weighted_normal_equations_match_dense_formula() {
        let c = array![[1.0, 0.5], [0.0, 2.0], [1.0, 1.0], [3.0, -1.0]];
        let iv = array![1.0, 0.5, 2.0, 0.25];
        let y = array![1.0, 2.0, 3.0, 4.0];

        let (m, b) = weighted_normal_equations(&c, &iv, &y);

        let v = Array2::from_diag(&iv);
        let m_ref = c.t().dot(&v).dot(&c);
        let b_ref = c.t().dot(&v).dot(&y);
        for i in 0..2 {
            assert!((b[i] - b_ref[i]).abs() < 1e-12);
            for j in 0..2 {
                assert!((m[[i, j]] - m_ref[[i, j]]).abs() < 1e-12);
            }
        }
        // M is symmetric by construction.
        assert!((m[[0, 1]] - m[[1, 0]]).abs() < 1e-12);
    }

    #[test]
    fn eigh_reconstructs_symmetric_input() {
        let a = array![[2.0, 1.0, 0.0], [1.0, 2.0, 1.0], [0.0, 1.0, 2.0]];
        let (vals, vecs) = a.eigh(Side::Lower).expect("eigh should succeed");
        let lam = Array2::from_diag(&vals);
        let rec = vecs.dot(&lam).dot(&vecs.t());
        for i in 0..3 {
            for j in 0..3 {
                assert!((rec[[i, j]] - a[[i, j]]).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn svd_singular_values_of_diagonal() {
        let a = array![[3.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
        let (_, s, vt) = a.svd(false, true).expect("svd should succeed");
        assert!((s[0] - 3.0).abs() < 1e-12);
        assert!((s[1] - 1.0).abs() < 1e-12);
        let vt = vt.expect("requested vt");
        assert_eq!(vt.dim(), (2, 2));
    }
}
