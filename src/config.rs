//! Solver configuration.
//!
//! Everything the original drove through a dynamic property bag is a typed
//! record here, deserialized with unknown keys rejected and numeric ranges
//! validated before a config reaches a solver.

use crate::solution::SolutionError;
use serde::{Deserialize, Serialize};

/// How the normal-equation condition number is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionNumberType {
    Eigenvalue,
    Svd,
}

/// How the regularization strength λ is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LambdaType {
    /// λ = `lambda_value`.
    Absolute,
    /// λ = (tr M / tr H) · `lambda_scaling`.
    Relative,
    /// Grid argmin of the biased-risk estimator, eigenvalues truncated at
    /// `max_condition_number`.
    MinimizeBiasedRisk,
    /// Same grid, no eigenvalue truncation.
    MinimizeUnbiasedRisk,
}

/// Shape of the λ grid scanned by the risk estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LambdaStepType {
    Linear,
    Log,
}

/// Stock kernel basis families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelBasisSet {
    AlardLupton,
    DeltaFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverConfig {
    /// Append an all-ones column to the design matrix and fit a
    /// differential background level.
    pub fit_for_background: bool,
    /// Replace the per-pixel variance with its median over the stamp.
    pub constant_variance_weighting: bool,
    /// After the first solve, rebuild once using the difference image's
    /// variance.
    pub iterate_single_kernel: bool,
    /// Reject stamps whose condition number exceeds
    /// `max_condition_number` (sets BAD, never raises).
    pub check_condition_number: bool,
    pub max_condition_number: f64,
    pub condition_number_type: ConditionNumberType,
    /// Core radius in pixels for candidate ranking and core statistics.
    pub candidate_core_radius: usize,
    pub lambda_type: LambdaType,
    pub lambda_value: f64,
    pub lambda_scaling: f64,
    pub lambda_step_type: LambdaStepType,
    pub lambda_lin_min: f64,
    pub lambda_lin_max: f64,
    pub lambda_lin_step: f64,
    pub lambda_log_min: f64,
    pub lambda_log_max: f64,
    pub lambda_log_step: f64,
    /// Clip candidates on difference-image residual statistics.
    pub single_kernel_clipping: bool,
    pub candidate_residual_mean_max: f64,
    pub candidate_residual_std_max: f64,
    /// Evaluate clipping statistics over the core only.
    pub use_core_stats: bool,
    pub use_regularization: bool,
    pub use_pca_for_spatial_kernel: bool,
    pub kernel_basis_set: KernelBasisSet,
    /// Eigenvalues with `|e| <= tol` are left at zero by the
    /// pseudo-inverse fallback. The default of zero reproduces an exact
    /// `e == 0` test.
    pub eigenvalue_zero_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            fit_for_background: true,
            constant_variance_weighting: true,
            iterate_single_kernel: false,
            check_condition_number: false,
            max_condition_number: 5.0e7,
            condition_number_type: ConditionNumberType::Eigenvalue,
            candidate_core_radius: 3,
            lambda_type: LambdaType::Absolute,
            lambda_value: 0.2,
            lambda_scaling: 1.0e-4,
            lambda_step_type: LambdaStepType::Log,
            lambda_lin_min: 0.0,
            lambda_lin_max: 1.0,
            lambda_lin_step: 0.1,
            lambda_log_min: -1.0,
            lambda_log_max: 2.0,
            lambda_log_step: 0.5,
            single_kernel_clipping: true,
            candidate_residual_mean_max: 0.25,
            candidate_residual_std_max: 1.50,
            use_core_stats: false,
            use_regularization: false,
            use_pca_for_spatial_kernel: false,
            kernel_basis_set: KernelBasisSet::AlardLupton,
            eigenvalue_zero_tolerance: 0.0,
        }
    }
}

impl SolverConfig {
    /// Validate numeric ranges. Run once when a config enters the solver
    /// layer; enum values are already closed by construction.
    pub fn validate(&self) -> Result<(), SolutionError> {
        if !self.max_condition_number.is_finite() || self.max_condition_number <= 0.0 {
            return Err(SolutionError::InvalidInput(format!(
                "max_condition_number must be positive and finite, got {}",
                self.max_condition_number
            )));
        }
        if self.lambda_lin_step <= 0.0 || self.lambda_log_step <= 0.0 {
            return Err(SolutionError::InvalidInput(
                "lambda grid steps must be positive".to_string(),
            ));
        }
        if self.lambda_lin_max < self.lambda_lin_min {
            return Err(SolutionError::InvalidInput(format!(
                "lambda_lin_max {} below lambda_lin_min {}",
                self.lambda_lin_max, self.lambda_lin_min
            )));
        }
        if self.lambda_log_max < self.lambda_log_min {
            return Err(SolutionError::InvalidInput(format!(
                "lambda_log_max {} below lambda_log_min {}",
                self.lambda_log_max, self.lambda_log_min
            )));
        }
        if !self.lambda_value.is_finite() || !self.lambda_scaling.is_finite() {
            return Err(SolutionError::InvalidInput(
                "lambda_value and lambda_scaling must be finite".to_string(),
            ));
        }
        if self.eigenvalue_zero_tolerance < 0.0 {
            return Err(SolutionError::InvalidInput(format!(
                "eigenvalue_zero_tolerance must be non-negative, got {}",
                self.eigenvalue_zero_tolerance
            )));
        }
        if self.candidate_residual_std_max <= 0.0 {
            return Err(SolutionError::InvalidInput(
                "candidate_residual_std_max must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the first basis term is held spatially constant: the
    /// Alard–Lupton convention, also adopted when refitting in a PCA basis.
    pub fn constant_first_term(&self) -> bool {
        self.kernel_basis_set == KernelBasisSet::AlardLupton || self.use_pca_for_spatial_kernel
    }
}
