//! Tikhonov-regularized stamp solutions.
//!
//! Solves `(M + λH)a = b` for a caller-owned symmetric penalty `H`. λ comes
//! from the configuration: a fixed value, a value relative to the traces of
//! `M` and `H`, or the argmin of a risk estimator over a λ grid. The risk
//! surface is not convex in λ in general, so the grid argmin is used rather
//! than any descent scheme.

use crate::config::{ConditionNumberType, LambdaStepType, LambdaType, SolverConfig};
use crate::geom::BBox;
use crate::image::{Image, Mask};
use crate::kernel::{KernelBasis, LinearKernel};
use crate::linalg::{FaerEigh, FaerSvd, invert_square_matrix};
use crate::solution::{SolutionError, SolvedBy, solve_normal_equations};
use crate::stamp::StaticKernelSolution;
use faer::Side;
use ndarray::{Array1, Array2};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RegularizedKernelSolution {
    inner: StaticKernelSolution,
    h: Array2<f64>,
    lambda: f64,
    config: SolverConfig,
}

impl RegularizedKernelSolution {
    pub fn new(
        basis: Arc<KernelBasis>,
        fit_for_background: bool,
        h: Array2<f64>,
        config: SolverConfig,
    ) -> Result<Self, SolutionError> {
        config.validate()?;
        let inner = StaticKernelSolution::new(basis, fit_for_background);
        let nt = inner.n_parameters();
        if h.nrows() != nt || h.ncols() != nt {
            return Err(SolutionError::InvalidInput(format!(
                "regularization matrix is {}x{}, expected {nt}x{nt}",
                h.nrows(),
                h.ncols()
            )));
        }
        Ok(Self {
            inner,
            h,
            lambda: 0.0,
            config,
        })
    }

    pub fn build(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
    ) -> Result<(), SolutionError> {
        self.inner.build(template, science, variance)
    }

    pub fn build_with_mask(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
        mask: &Mask,
    ) -> Result<(), SolutionError> {
        self.inner.build_with_mask(template, science, variance, mask)
    }

    pub fn build_single(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
        mask_box: &BBox,
    ) -> Result<(), SolutionError> {
        self.inner.build_single(template, science, variance, mask_box)
    }

    /// Choose λ, then solve `(M + λH)a = b` through the standard pipeline.
    pub fn solve(&mut self) -> Result<(), SolutionError> {
        let lambda = match self.config.lambda_type {
            LambdaType::Absolute => self.config.lambda_value,
            LambdaType::Relative => {
                let tr_m = self.inner.m_matrix().diag().sum();
                let tr_h = self.h.diag().sum();
                if tr_h == 0.0 {
                    return Err(SolutionError::Numerical(
                        "regularization matrix has zero trace".to_string(),
                    ));
                }
                (tr_m / tr_h) * self.config.lambda_scaling
            }
            LambdaType::MinimizeBiasedRisk => {
                self.estimate_risk(self.config.max_condition_number)?
            }
            LambdaType::MinimizeUnbiasedRisk => self.estimate_risk(f64::INFINITY)?,
        };
        log::debug!("applying kernel regularization with lambda = {lambda:.2e}");
        self.lambda = lambda;

        let m_lambda = self.inner.m_matrix() + &(&self.h * lambda);
        match solve_normal_equations(
            &m_lambda,
            self.inner.b_vector(),
            self.config.eigenvalue_zero_tolerance,
        ) {
            Ok((a, solved_by)) => self.inner.apply_solution(a, solved_by),
            Err(err) => {
                self.inner.mark_unsolved();
                Err(err)
            }
        }
    }

    /// Biased-risk estimate over the configured λ grid:
    /// `risk(λ) = aᵀ(VVᵀ)a + 2·(tr(VVᵀ·(M+λH)⁻¹) − aᵀM⁺b)` with `V` the
    /// right singular vectors of `C` and `M⁺` the eigenvalue-truncated
    /// pseudo-inverse (ratios to the largest eigenvalue above `max_cond`
    /// zeroed).
    pub fn estimate_risk(&self, max_cond: f64) -> Result<f64, SolutionError> {
        let c = self.inner.design_matrix();
        if c.nrows() == 0 {
            return Err(SolutionError::InvalidInput(
                "risk estimate requires a built solution".to_string(),
            ));
        }
        let (_, _, vt) = c.svd(false, true)?;
        let vt = vt.ok_or_else(|| {
            SolutionError::Numerical("SVD did not return right singular vectors".to_string())
        })?;
        let vvt = vt.t().dot(&vt);

        // Truncated pseudo-inverse of M, which may be ill conditioned.
        let m = self.inner.m_matrix();
        let (evals, r) = m.eigh(Side::Lower)?;
        let e_max = evals.iter().fold(f64::NEG_INFINITY, |acc, &e| acc.max(e));
        let mut inv_evals = evals.clone();
        for (i, e) in inv_evals.iter_mut().enumerate() {
            if *e == 0.0 {
                continue;
            }
            if e_max / *e > max_cond {
                log::debug!(
                    "truncating eigenvalue {i}: {e_max:.5e} / {:.5e} vs {max_cond:.5e}",
                    *e
                );
                *e = 0.0;
            } else {
                *e = 1.0 / *e;
            }
        }
        let m_inv = r.dot(&Array2::from_diag(&inv_evals)).dot(&r.t());
        let m_inv_b: Array1<f64> = m_inv.dot(self.inner.b_vector());

        let lambdas = self.lambda_steps();
        let mut risks = Vec::with_capacity(lambdas.len());
        for &l in &lambdas {
            let m_lambda = m + &(&self.h * l);
            let (a, _) = solve_normal_equations(
                &m_lambda,
                self.inner.b_vector(),
                self.config.eigenvalue_zero_tolerance,
            )?;

            let term1 = a.dot(&vvt.dot(&a));
            let m_lambda_inv = invert_square_matrix(&m_lambda).map_err(|_| {
                SolutionError::Numerical(format!(
                    "unable to invert M + {l:.3e} H for the risk estimate"
                ))
            })?;
            let term2a = vvt.dot(&m_lambda_inv).diag().sum();
            let term2b = a.dot(&m_inv_b);
            let risk = term1 + 2.0 * (term2a - term2b);
            log::debug!("lambda = {l:.3}, risk = {risk:.5e}");
            risks.push(risk);
        }

        let mut best = 0usize;
        for (i, &r) in risks.iter().enumerate() {
            if r < risks[best] {
                best = i;
            }
        }
        if risks[best].is_nan() {
            return Err(SolutionError::Numerical(
                "risk estimate produced only NaN values".to_string(),
            ));
        }
        log::debug!(
            "minimum risk = {:.3e} at lambda = {:.3e}",
            risks[best],
            lambdas[best]
        );
        Ok(lambdas[best])
    }

    fn lambda_steps(&self) -> Vec<f64> {
        let mut lambdas = Vec::new();
        match self.config.lambda_step_type {
            LambdaStepType::Linear => {
                let mut l = self.config.lambda_lin_min;
                while l <= self.config.lambda_lin_max {
                    lambdas.push(l);
                    l += self.config.lambda_lin_step;
                }
            }
            LambdaStepType::Log => {
                let mut l = self.config.lambda_log_min;
                while l <= self.config.lambda_log_max {
                    lambdas.push(10f64.powf(l));
                    l += self.config.lambda_log_step;
                }
            }
        }
        lambdas
    }

    /// The normal-equation matrix, optionally with the chosen penalty
    /// folded in.
    pub fn m_matrix(&self, include_h: bool) -> Array2<f64> {
        if include_h {
            self.inner.m_matrix() + &(&self.h * self.lambda)
        } else {
            self.inner.m_matrix().clone()
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn regularization_matrix(&self) -> &Array2<f64> {
        &self.h
    }

    pub fn static_solution(&self) -> &StaticKernelSolution {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn solved_by(&self) -> SolvedBy {
        self.inner.solved_by()
    }

    pub fn kernel(&self) -> Result<LinearKernel, SolutionError> {
        self.inner.kernel()
    }

    pub fn make_kernel_image(&self) -> Result<Array2<f64>, SolutionError> {
        self.inner.make_kernel_image()
    }

    pub fn background(&self) -> Result<f64, SolutionError> {
        self.inner.background()
    }

    pub fn ksum(&self) -> Result<f64, SolutionError> {
        self.inner.ksum()
    }

    pub fn coefficients(&self) -> Result<&Array1<f64>, SolutionError> {
        self.inner.coefficients()
    }

    /// Condition number of the unpenalized `M`, the quantity the candidate
    /// gate inspects.
    pub fn condition_number(
        &self,
        condition_type: ConditionNumberType,
    ) -> Result<f64, SolutionError> {
        self.inner.condition_number(condition_type)
    }

    pub fn b_vector(&self) -> &Array1<f64> {
        self.inner.b_vector()
    }
}
