//! # diffim
//!
//! Numerical core of an astronomical image-difference kernel solver.
//!
//! Given a co-registered template and science image with a per-pixel
//! variance map, the solvers here determine the convolution kernel that
//! best matches the template to the science image under inverse-variance
//! weighted least squares, optionally fitting a differential background,
//! penalizing kernel roughness, or interpolating per-stamp solutions across
//! an image with spatial polynomials.
//!
//! The layers, bottom up:
//!
//! - [`stamp::StaticKernelSolution`] builds `M = CᵀVC`, `b = CᵀVY` from
//!   basis-convolved template columns and solves for kernel coefficients,
//!   with masked and box-excluding build variants.
//! - [`regularize::RegularizedKernelSolution`] solves `(M + λH)a = b` with
//!   λ fixed, trace-relative, or chosen by a risk estimator over a grid.
//! - [`spatial::SpatialKernelSolution`] accumulates per-stamp `(Q, w)`
//!   constraints into one block system over spatial × kernel parameters.
//! - [`candidate::KernelCandidate`] runs one stamp's lifecycle and
//!   [`visitor::SingleKernelFitVisitor`] the build-and-clip loop.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod candidate;
pub mod config;
pub mod convolve;
pub mod geom;
pub mod image;
pub mod imstats;
pub mod kernel;
pub mod linalg;
pub mod regularize;
pub mod solution;
pub mod spatial;
pub mod spatial_fn;
pub mod stamp;
pub mod visitor;

pub use candidate::{
    CandidateSolution, CandidateStatus, CandidateSwitch, KernelCandidate, convolve_and_subtract,
};
pub use config::{
    ConditionNumberType, KernelBasisSet, LambdaStepType, LambdaType, SolverConfig,
};
pub use geom::{BBox, Point2};
pub use image::{Image, Mask, MaskedImage};
pub use imstats::ImageStatistics;
pub use kernel::{
    BasisError, BasisKernel, KernelBasis, LinearKernel, alard_lupton_basis,
    central_difference_regularization, delta_function_basis,
};
pub use regularize::RegularizedKernelSolution;
pub use solution::{SolutionError, SolvedBy, condition_number, solve_normal_equations};
pub use spatial::{SpatialBackground, SpatialKernel, SpatialKernelSolution};
pub use spatial_fn::{PolynomialFunction2, SpatialFunction};
pub use stamp::{StaticKernelSolution, build_stamp_solution};
pub use visitor::SingleKernelFitVisitor;
