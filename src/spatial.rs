//! Spatially varying kernel fit.
//!
//! Per-stamp normal equations `(Q, w)` are accumulated into one
//! block-structured system over spatial × kernel indices. Each kernel basis
//! `m` owns a block of `nkt` spatial parameters (except a spatially constant
//! first term, which owns a single parameter) and the background owns `nbt`
//! parameters at the tail. Only the upper triangle is filled during
//! accumulation; `solve` symmetrizes before factorizing.
//!
//! Accumulation order is numerically significant at floating-point
//! precision: callers wanting bit-reproducibility must present constraints
//! in a stable order.

use crate::config::{ConditionNumberType, SolverConfig};
use crate::kernel::KernelBasis;
use crate::solution::{
    SolutionError, SolvedBy, condition_number, next_solution_id, solve_normal_equations,
};
use crate::spatial_fn::{PolynomialFunction2, SpatialFunction};
use ndarray::{Array1, Array2, s};
use std::sync::Arc;

/// A kernel whose basis coefficients vary over the image through a shared
/// spatial function.
#[derive(Debug, Clone)]
pub struct SpatialKernel<F: SpatialFunction = PolynomialFunction2> {
    basis: Arc<KernelBasis>,
    /// Row `i` holds basis `i`'s spatial coefficients: a single entry for a
    /// constant first term, `nkt` entries otherwise.
    coefficients: Vec<Vec<f64>>,
    kernel_fn: F,
    constant_first_term: bool,
}

impl<F: SpatialFunction> SpatialKernel<F> {
    /// Per-basis kernel coefficients at a position.
    pub fn coefficients_at(&self, x: f64, y: f64) -> Vec<f64> {
        self.coefficients
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if i == 0 && self.constant_first_term {
                    row[0]
                } else {
                    self.kernel_fn.evaluate(row, x, y)
                }
            })
            .collect()
    }

    /// Realized kernel image at a position.
    pub fn image_at(&self, x: f64, y: f64) -> Array2<f64> {
        let coeffs = self.coefficients_at(x, y);
        let mut out = Array2::<f64>::zeros((self.basis.height(), self.basis.width()));
        for (k, &a) in self.basis.kernels().iter().zip(coeffs.iter()) {
            out.scaled_add(a, k.data());
        }
        out
    }

    pub fn sum_at(&self, x: f64, y: f64) -> f64 {
        self.basis
            .kernels()
            .iter()
            .zip(self.coefficients_at(x, y))
            .map(|(k, a)| a * k.sum())
            .sum()
    }

    pub fn spatial_coefficients(&self) -> &[Vec<f64>] {
        &self.coefficients
    }

    pub fn basis(&self) -> &Arc<KernelBasis> {
        &self.basis
    }
}

/// The fitted differential-background surface.
#[derive(Debug, Clone)]
pub struct SpatialBackground<F: SpatialFunction = PolynomialFunction2> {
    background_fn: F,
    coefficients: Vec<f64>,
}

impl<F: SpatialFunction> SpatialBackground<F> {
    pub fn value_at(&self, x: f64, y: f64) -> f64 {
        if self.coefficients.len() != self.background_fn.n_parameters() {
            // Background was not fit; a single zero coefficient is stored.
            return 0.0;
        }
        self.background_fn.evaluate(&self.coefficients, x, y)
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

/// Accumulates per-stamp constraints and solves the global spatial system.
#[derive(Debug, Clone)]
pub struct SpatialKernelSolution<F: SpatialFunction + Clone = PolynomialFunction2> {
    id: u64,
    basis: Arc<KernelBasis>,
    kernel_fn: F,
    background_fn: F,
    fit_for_background: bool,
    constant_first_term: bool,
    eigenvalue_zero_tolerance: f64,
    n_bases: usize,
    nkt: usize,
    nbt: usize,
    nt: usize,
    m: Array2<f64>,
    b: Array1<f64>,
    a: Option<Array1<f64>>,
    solved_by: SolvedBy,
    kernel: Option<SpatialKernel<F>>,
    background: Option<SpatialBackground<F>>,
    ksum: f64,
}

impl<F: SpatialFunction + Clone> SpatialKernelSolution<F> {
    pub fn new(
        basis: Arc<KernelBasis>,
        kernel_fn: F,
        background_fn: F,
        config: &SolverConfig,
    ) -> Result<Self, SolutionError> {
        config.validate()?;
        let n_bases = basis.len();
        let nkt = kernel_fn.n_parameters();
        if nkt == 0 {
            return Err(SolutionError::InvalidInput(
                "spatial kernel function has no parameters".to_string(),
            ));
        }
        let fit_for_background = config.fit_for_background;
        let nbt = if fit_for_background {
            background_fn.n_parameters()
        } else {
            0
        };
        if fit_for_background && nbt == 0 {
            return Err(SolutionError::InvalidInput(
                "background function has no parameters".to_string(),
            ));
        }
        let constant_first_term = config.constant_first_term();
        let nt = if constant_first_term {
            (n_bases - 1) * nkt + 1 + nbt
        } else {
            n_bases * nkt + nbt
        };
        log::debug!(
            "spatial solution: nkt={nkt} nbt={nbt} nt={nt}, constant first term = {constant_first_term}"
        );
        Ok(Self {
            id: next_solution_id(),
            basis,
            kernel_fn,
            background_fn,
            fit_for_background,
            constant_first_term,
            eigenvalue_zero_tolerance: config.eigenvalue_zero_tolerance,
            n_bases,
            nkt,
            nbt,
            nt,
            m: Array2::zeros((nt, nt)),
            b: Array1::zeros(nt),
            a: None,
            solved_by: SolvedBy::None,
            kernel: None,
            background: None,
            ksum: 0.0,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn n_total_parameters(&self) -> usize {
        self.nt
    }

    /// Accumulate one stamp's `(Q, w)` evaluated at its center `(x, y)`.
    /// `Q` is `(nBases + hasBg)²`, `w` has `nBases + hasBg` entries.
    pub fn add_constraint(
        &mut self,
        x: f64,
        y: f64,
        q: &Array2<f64>,
        w: &Array1<f64>,
    ) -> Result<(), SolutionError> {
        let expected = self.n_bases + usize::from(self.fit_for_background);
        if q.nrows() != expected || q.ncols() != expected || w.len() != expected {
            return Err(SolutionError::InvalidInput(format!(
                "constraint shape mismatch: Q is {}x{}, w is {}, expected {expected}",
                q.nrows(),
                q.ncols(),
                w.len()
            )));
        }
        log::debug!("adding constraint at {x:.1}, {y:.1}");

        let nkt = self.nkt;
        let nbt = self.nbt;
        let n_bases = self.n_bases;

        let pk = Array1::from_shape_fn(nkt, |i| self.kernel_fn.unit_value(i, x, y));
        let pkpkt = outer(&pk, &pk);

        let (pb, pbpbt, pkpbt) = if self.fit_for_background {
            let pb = Array1::from_shape_fn(nbt, |i| self.background_fn.unit_value(i, x, y));
            let pbpbt = outer(&pb, &pb);
            let pkpbt = outer(&pk, &pb);
            (pb, pbpbt, pkpbt)
        } else {
            (Array1::zeros(0), Array2::zeros((0, 0)), Array2::zeros((0, 0)))
        };

        // First block index and row shift for the constant first term.
        let m0 = usize::from(self.constant_first_term);
        let dm = if self.constant_first_term { nkt - 1 } else { 0 };
        let mb = self.nt - nbt;
        let block = |m: usize| m * nkt - dm;

        if self.constant_first_term {
            self.m[[0, 0]] += q[[0, 0]];
            for m2 in 1..n_bases {
                let c0 = block(m2);
                let mut row = self.m.slice_mut(s![0..1, c0..c0 + nkt]);
                for (j, v) in row.iter_mut().enumerate() {
                    *v += q[[0, m2]] * pk[j];
                }
            }
            self.b[0] += w[0];

            if self.fit_for_background {
                let mut row = self.m.slice_mut(s![0..1, mb..mb + nbt]);
                for (j, v) in row.iter_mut().enumerate() {
                    *v += q[[0, n_bases]] * pb[j];
                }
            }
        }

        for m1 in m0..n_bases {
            let r0 = block(m1);

            // Diagonal kernel-kernel block: upper triangle only.
            for i in 0..nkt {
                for j in i..nkt {
                    self.m[[r0 + i, r0 + j]] += q[[m1, m1]] * pkpkt[[i, j]];
                }
            }

            for m2 in (m1 + 1)..n_bases {
                let c0 = block(m2);
                let mut blk = self.m.slice_mut(s![r0..r0 + nkt, c0..c0 + nkt]);
                blk.scaled_add(q[[m1, m2]], &pkpkt);
            }

            if self.fit_for_background {
                let mut blk = self.m.slice_mut(s![r0..r0 + nkt, mb..mb + nbt]);
                blk.scaled_add(q[[m1, n_bases]], &pkpbt);
            }

            let mut seg = self.b.slice_mut(s![r0..r0 + nkt]);
            seg.scaled_add(w[m1], &pk);
        }

        if self.fit_for_background {
            for i in 0..nbt {
                for j in i..nbt {
                    self.m[[mb + i, mb + j]] += q[[n_bases, n_bases]] * pbpbt[[i, j]];
                }
            }
            let mut seg = self.b.slice_mut(s![mb..mb + nbt]);
            seg.scaled_add(w[n_bases], &pb);
        }

        Ok(())
    }

    /// Symmetrize, solve, and unpack the spatial coefficients.
    pub fn solve(&mut self) -> Result<(), SolutionError> {
        crate::linalg::symmetrize_upper(&mut self.m);

        match solve_normal_equations(&self.m, &self.b, self.eigenvalue_zero_tolerance) {
            Ok((a, solved_by)) => {
                self.a = Some(a);
                self.solved_by = solved_by;
            }
            Err(err) => {
                self.solved_by = SolvedBy::None;
                return Err(err);
            }
        }
        self.set_kernel()
    }

    fn set_kernel(&mut self) -> Result<(), SolutionError> {
        let a = match &self.a {
            Some(a) => a,
            None => return Err(SolutionError::NotSolved("solution")),
        };
        let cond = condition_number(&self.m, ConditionNumberType::Eigenvalue)?;

        let mut coefficients: Vec<Vec<f64>> = Vec::with_capacity(self.n_bases);
        let mut idx = 0usize;
        for i in 0..self.n_bases {
            let take = if i == 0 && self.constant_first_term {
                1
            } else {
                self.nkt
            };
            let mut row = Vec::with_capacity(take);
            for _ in 0..take {
                if a[idx].is_nan() {
                    return Err(SolutionError::Numerical(format!(
                        "unable to determine spatial kernel solution {idx} (nan); condition number = {cond:.3e}"
                    )));
                }
                row.push(a[idx]);
                idx += 1;
            }
            coefficients.push(row);
        }

        let bg_coefficients = if self.fit_for_background {
            let mut coeffs = Vec::with_capacity(self.nbt);
            for i in 0..self.nbt {
                let idx = self.nt - self.nbt + i;
                if a[idx].is_nan() {
                    return Err(SolutionError::Numerical(format!(
                        "unable to determine spatial background solution {idx} (nan); condition number = {cond:.3e}"
                    )));
                }
                coeffs.push(a[idx]);
            }
            coeffs
        } else {
            vec![0.0]
        };

        let kernel = SpatialKernel {
            basis: self.basis.clone(),
            coefficients,
            kernel_fn: self.kernel_fn.clone(),
            constant_first_term: self.constant_first_term,
        };
        self.ksum = kernel.sum_at(0.0, 0.0);
        self.kernel = Some(kernel);
        self.background = Some(SpatialBackground {
            background_fn: self.background_fn.clone(),
            coefficients: bg_coefficients,
        });
        Ok(())
    }

    pub fn solved_by(&self) -> SolvedBy {
        self.solved_by
    }

    pub fn kernel(&self) -> Result<&SpatialKernel<F>, SolutionError> {
        self.kernel.as_ref().ok_or(SolutionError::NotSolved("solution"))
    }

    pub fn background(&self) -> Result<&SpatialBackground<F>, SolutionError> {
        self.background
            .as_ref()
            .ok_or(SolutionError::NotSolved("background"))
    }

    /// Owned (kernel, background) pair.
    pub fn solution_pair(
        &self,
    ) -> Result<(SpatialKernel<F>, SpatialBackground<F>), SolutionError> {
        Ok((self.kernel()?.clone(), self.background()?.clone()))
    }

    /// Kernel sum at the nominal position (0, 0).
    pub fn ksum(&self) -> Result<f64, SolutionError> {
        if self.kernel.is_none() {
            return Err(SolutionError::NotSolved("ksum"));
        }
        Ok(self.ksum)
    }

    pub fn make_kernel_image(&self, x: f64, y: f64) -> Result<Array2<f64>, SolutionError> {
        Ok(self.kernel()?.image_at(x, y))
    }

    pub fn condition_number(
        &self,
        condition_type: ConditionNumberType,
    ) -> Result<f64, SolutionError> {
        condition_number(&self.m, condition_type)
    }

    pub fn m_matrix(&self) -> &Array2<f64> {
        &self.m
    }

    pub fn b_vector(&self) -> &Array1<f64> {
        &self.b
    }

    pub fn coefficients(&self) -> Result<&Array1<f64>, SolutionError> {
        self.a.as_ref().ok_or(SolutionError::NotSolved("solution"))
    }
}

fn outer(u: &Array1<f64>, v: &Array1<f64>) -> Array2<f64> {
    Array2::from_shape_fn((u.len(), v.len()), |(i, j)| u[i] * v[j])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelBasisSet;
    use crate::kernel::delta_function_basis;

    fn test_config() -> SolverConfig {
        SolverConfig {
            kernel_basis_set: KernelBasisSet::DeltaFunction,
            fit_for_background: false,
            ..SolverConfig::default()
        }
    }

    #[test]
    fn parameter_counts_follow_constant_first_term() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let cfg = test_config();
        let sol = SpatialKernelSolution::new(
            basis.clone(),
            PolynomialFunction2::new(1),
            PolynomialFunction2::new(0),
            &cfg,
        )
        .expect("construct");
        assert_eq!(sol.n_total_parameters(), 9 * 3);

        let cfg_al = SolverConfig {
            kernel_basis_set: KernelBasisSet::AlardLupton,
            fit_for_background: true,
            ..SolverConfig::default()
        };
        let sol = SpatialKernelSolution::new(
            basis,
            PolynomialFunction2::new(1),
            PolynomialFunction2::new(1),
            &cfg_al,
        )
        .expect("construct");
        // (9-1)*3 + 1 + 3
        assert_eq!(sol.n_total_parameters(), 28);
    }

    #[test]
    fn constraint_shape_mismatch_rejected() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let mut sol = SpatialKernelSolution::new(
            basis,
            PolynomialFunction2::new(0),
            PolynomialFunction2::new(0),
            &test_config(),
        )
        .expect("construct");
        let q = Array2::<f64>::eye(4);
        let w = Array1::<f64>::zeros(4);
        assert!(sol.add_constraint(0.0, 0.0, &q, &w).is_err());
    }
}
