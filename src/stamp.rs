//! Per-stamp kernel solution: design-matrix assembly and the weighted
//! least-squares normal equations.
//!
//! The design matrix `C` has one row per used pixel and one column per
//! basis kernel (the template convolved with that basis, restricted to the
//! good region), plus an all-ones column when a differential background is
//! fit. `M = CᵀVC` and `b = CᵀVY` are formed at build time so the condition
//! number can be inspected before committing to a solve.

use crate::config::{ConditionNumberType, SolverConfig};
use crate::convolve::convolve;
use crate::geom::{BBox, Point2};
use crate::image::{Image, Mask, grow_footprint};
use crate::kernel::{KernelBasis, LinearKernel};
use crate::linalg::weighted_normal_equations;
use crate::solution::{
    SolutionError, SolvedBy, condition_number, next_solution_id, solve_normal_equations,
};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use std::sync::Arc;

/// Flatten a matrix view column-major (x outer, y inner); the pixel order
/// shared by the target vector, the weights, and every design column.
fn flatten_matrix(m: &Array2<f64>) -> Vec<f64> {
    let (h, w) = m.dim();
    let mut out = Vec::with_capacity(h * w);
    for col in 0..w {
        for row in 0..h {
            out.push(m[[row, col]]);
        }
    }
    out
}

fn keep_filter(values: Vec<f64>, keep: Option<&[bool]>) -> Vec<f64> {
    match keep {
        None => values,
        Some(flags) => values
            .into_iter()
            .zip(flags.iter())
            .filter_map(|(v, &k)| k.then_some(v))
            .collect(),
    }
}

fn validate_stamp_shapes(
    template: &Image,
    science: &Image,
    variance: &Image,
) -> Result<(), SolutionError> {
    if template.bbox() != science.bbox() || template.bbox() != variance.bbox() {
        return Err(SolutionError::InvalidInput(format!(
            "stamp planes disagree: template {:?}, science {:?}, variance {:?}",
            template.bbox(),
            science.bbox(),
            variance.bbox()
        )));
    }
    Ok(())
}

fn validate_variance(variance: &Image) -> Result<(), SolutionError> {
    let min = variance.min();
    if min < 0.0 {
        return Err(SolutionError::InvalidInput(
            "variance less than 0.0".to_string(),
        ));
    }
    if min == 0.0 {
        return Err(SolutionError::InvalidInput(
            "variance equals 0.0, cannot inverse variance weight".to_string(),
        ));
    }
    Ok(())
}

/// Build and solve one stamp in a single call.
pub fn build_stamp_solution(
    template: &Image,
    science: &Image,
    variance: &Image,
    basis: &Arc<KernelBasis>,
    config: &SolverConfig,
) -> Result<StaticKernelSolution, SolutionError> {
    config.validate()?;
    let mut solution = StaticKernelSolution::new(basis.clone(), config.fit_for_background);
    solution.build(template, science, variance)?;
    solution.solve(config.eigenvalue_zero_tolerance)?;
    Ok(solution)
}

/// A stamp's weighted least-squares system and, after `solve`, its kernel.
#[derive(Debug, Clone)]
pub struct StaticKernelSolution {
    id: u64,
    basis: Arc<KernelBasis>,
    fit_for_background: bool,
    c: Array2<f64>,
    iv: Array1<f64>,
    y: Array1<f64>,
    m: Array2<f64>,
    b: Array1<f64>,
    a: Option<Array1<f64>>,
    solved_by: SolvedBy,
    kernel_coefficients: Vec<f64>,
    background: f64,
    ksum: f64,
}

impl StaticKernelSolution {
    pub fn new(basis: Arc<KernelBasis>, fit_for_background: bool) -> Self {
        Self {
            id: next_solution_id(),
            basis,
            fit_for_background,
            c: Array2::zeros((0, 0)),
            iv: Array1::zeros(0),
            y: Array1::zeros(0),
            m: Array2::zeros((0, 0)),
            b: Array1::zeros(0),
            a: None,
            solved_by: SolvedBy::None,
            kernel_coefficients: Vec::new(),
            background: 0.0,
            ksum: 0.0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn basis(&self) -> &Arc<KernelBasis> {
        &self.basis
    }

    pub fn fit_for_background(&self) -> bool {
        self.fit_for_background
    }

    pub fn n_parameters(&self) -> usize {
        self.basis.len() + usize::from(self.fit_for_background)
    }

    /// Standard build over the good region of the stamp.
    pub fn build(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
    ) -> Result<(), SolutionError> {
        validate_stamp_shapes(template, science, variance)?;
        validate_variance(variance)?;
        let good = self.basis.first().shrink_bbox(&template.bbox())?;
        self.build_from_regions(template, science, variance, &[good], None)
    }

    /// Build excluding every pixel covered by the grown bad-pixel footprint
    /// of `mask` (planes BAD, SAT, NO_DATA, EDGE; grown by the kernel
    /// half-width so convolution spill from masked pixels is excluded too).
    pub fn build_with_mask(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
        mask: &Mask,
    ) -> Result<(), SolutionError> {
        validate_stamp_shapes(template, science, variance)?;
        if mask.bbox() != template.bbox() {
            return Err(SolutionError::InvalidInput(format!(
                "mask bbox {:?} disagrees with stamp {:?}",
                mask.bbox(),
                template.bbox()
            )));
        }
        validate_variance(variance)?;

        let good = self.basis.first().shrink_bbox(&template.bbox())?;
        let footprint = mask.threshold_footprint(Mask::bad_pixel_bitmask());
        let grown = grow_footprint(&footprint, self.basis.first().ctr_x());

        // Selection flags in the same column-major order the flatten uses,
        // local to the good region.
        let bbox = template.bbox();
        let mut keep = Vec::with_capacity(good.area());
        for x in good.min_x()..=good.max_x() {
            for y in good.min_y()..=good.max_y() {
                let row = (y - bbox.min_y()) as usize;
                let col = (x - bbox.min_x()) as usize;
                keep.push(!grown[[row, col]]);
            }
        }
        let n_good = keep.iter().filter(|&&k| k).count();
        log::debug!(
            "masked build keeps {n_good} of {} good-region pixels",
            good.area()
        );
        if n_good == 0 {
            return Err(SolutionError::InvalidInput(
                "mask footprint covers the entire good region".to_string(),
            ));
        }

        self.build_from_regions(template, science, variance, &[good], Some(&keep))
    }

    /// Build excluding a single rectangle, keeping the four surrounding
    /// rectangles (top, bottom, left, right) clipped to the good region.
    pub fn build_single(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
        mask_box: &BBox,
    ) -> Result<(), SolutionError> {
        validate_stamp_shapes(template, science, variance)?;
        validate_variance(variance)?;

        let good = self.basis.first().shrink_bbox(&template.bbox())?;
        if !good.contains(mask_box) || mask_box.is_empty() {
            return Err(SolutionError::InvalidInput(format!(
                "mask box {:?} must be a non-empty subset of the good region {:?}",
                mask_box, good
            )));
        }

        let top = BBox::from_corners(
            Point2::new(good.min_x(), mask_box.max_y() + 1),
            Point2::new(good.max_x(), good.max_y()),
        );
        let bottom = BBox::from_corners(
            Point2::new(good.min_x(), good.min_y()),
            Point2::new(good.max_x(), mask_box.min_y() - 1),
        );
        let left = BBox::from_corners(
            Point2::new(good.min_x(), mask_box.min_y()),
            Point2::new(mask_box.min_x() - 1, mask_box.max_y()),
        );
        let right = BBox::from_corners(
            Point2::new(mask_box.max_x() + 1, mask_box.min_y()),
            Point2::new(good.max_x(), mask_box.max_y()),
        );

        let regions: Vec<BBox> = [top, bottom, left, right]
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect();
        if regions.is_empty() {
            return Err(SolutionError::InvalidInput(
                "mask box leaves no surrounding pixels".to_string(),
            ));
        }

        self.build_from_regions(template, science, variance, &regions, None)
    }

    fn build_from_regions(
        &mut self,
        template: &Image,
        science: &Image,
        variance: &Image,
        regions: &[BBox],
        keep: Option<&[bool]>,
    ) -> Result<(), SolutionError> {
        let n_kernel = self.basis.len();
        let n_parameters = self.n_parameters();

        let mut science_flat = Vec::new();
        let mut iv_flat = Vec::new();
        for region in regions {
            science_flat.extend(flatten_matrix(&science.matrix(region)?));
            iv_flat.extend(flatten_matrix(&variance.inverse_variance_matrix(region)?));
        }
        let science_flat = keep_filter(science_flat, keep);
        let iv_flat = keep_filter(iv_flat, keep);

        // One convolved column per basis kernel; fan out across the basis,
        // collected back in basis order.
        let columns: Vec<Vec<f64>> = self
            .basis
            .kernels()
            .par_iter()
            .map(|kernel| -> Result<Vec<f64>, SolutionError> {
                let convolved = convolve(template, kernel)?;
                let mut flat = Vec::new();
                for region in regions {
                    flat.extend(flatten_matrix(&convolved.matrix(region)?));
                }
                Ok(keep_filter(flat, keep))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let n_pixels = science_flat.len();
        let mut c = Array2::<f64>::zeros((n_pixels, n_parameters));
        for (j, column) in columns.iter().enumerate() {
            for (i, &v) in column.iter().enumerate() {
                c[[i, j]] = v;
            }
        }
        if self.fit_for_background {
            c.column_mut(n_kernel).fill(1.0);
        }

        let iv = Array1::from_vec(iv_flat);
        let y = Array1::from_vec(science_flat);
        let (m, b) = weighted_normal_equations(&c, &iv, &y);

        self.c = c;
        self.iv = iv;
        self.y = y;
        self.m = m;
        self.b = b;
        self.a = None;
        self.solved_by = SolvedBy::None;
        self.kernel_coefficients.clear();
        self.background = 0.0;
        self.ksum = 0.0;
        Ok(())
    }

    /// Solve the stored normal equations and realize the kernel.
    pub fn solve(&mut self, eigenvalue_zero_tolerance: f64) -> Result<(), SolutionError> {
        log::debug!(
            "solution {}: M is {}x{}, b is {}, C is {}x{}",
            self.id,
            self.m.nrows(),
            self.m.ncols(),
            self.b.len(),
            self.c.nrows(),
            self.c.ncols()
        );
        match solve_normal_equations(&self.m, &self.b, eigenvalue_zero_tolerance) {
            Ok((a, solved_by)) => {
                self.a = Some(a);
                self.solved_by = solved_by;
            }
            Err(err) => {
                self.solved_by = SolvedBy::None;
                return Err(err);
            }
        }
        self.finish_solve()
    }

    /// Apply an externally solved system (the regularized path solves a
    /// modified matrix but shares all bookkeeping).
    pub(crate) fn apply_solution(
        &mut self,
        a: Array1<f64>,
        solved_by: SolvedBy,
    ) -> Result<(), SolutionError> {
        self.a = Some(a);
        self.solved_by = solved_by;
        self.finish_solve()
    }

    /// NaN coefficients are fatal: the solution reverts to unsolved so no
    /// accessor can hand out a stale kernel.
    fn finish_solve(&mut self) -> Result<(), SolutionError> {
        if let Err(err) = self.set_kernel() {
            self.mark_unsolved();
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn mark_unsolved(&mut self) {
        self.a = None;
        self.solved_by = SolvedBy::None;
    }

    fn set_kernel(&mut self) -> Result<(), SolutionError> {
        let a = match self.a.clone() {
            Some(a) => a,
            None => return Err(SolutionError::NotSolved("solution")),
        };
        let n_kernel = self.basis.len();
        if a.len() != self.n_parameters() {
            return Err(SolutionError::Logic(format!(
                "mismatched sizes in kernel solution: {} coefficients for {} parameters",
                a.len(),
                self.n_parameters()
            )));
        }

        let mut coefficients = Vec::with_capacity(n_kernel);
        for idx in 0..n_kernel {
            if a[idx].is_nan() {
                return Err(SolutionError::Numerical(format!(
                    "unable to determine kernel solution {idx} (nan)"
                )));
            }
            coefficients.push(a[idx]);
        }
        self.kernel_coefficients = coefficients;
        self.ksum = self.kernel_snapshot().sum();

        if self.fit_for_background {
            let idx = a.len() - 1;
            if a[idx].is_nan() {
                return Err(SolutionError::Numerical(format!(
                    "unable to determine background solution {idx} (nan)"
                )));
            }
            self.background = a[idx];
        }
        Ok(())
    }

    fn kernel_snapshot(&self) -> LinearKernel {
        LinearKernel::new(self.basis.clone(), self.kernel_coefficients.clone())
    }

    pub fn solved_by(&self) -> SolvedBy {
        self.solved_by
    }

    fn require_solved(&self, what: &'static str) -> Result<(), SolutionError> {
        if self.solved_by == SolvedBy::None {
            return Err(SolutionError::NotSolved(what));
        }
        Ok(())
    }

    /// Owned snapshot of the fitted kernel.
    pub fn kernel(&self) -> Result<LinearKernel, SolutionError> {
        self.require_solved("solution")?;
        Ok(self.kernel_snapshot())
    }

    pub fn make_kernel_image(&self) -> Result<Array2<f64>, SolutionError> {
        self.require_solved("image")?;
        Ok(self.kernel_snapshot().image())
    }

    pub fn background(&self) -> Result<f64, SolutionError> {
        self.require_solved("background")?;
        Ok(self.background)
    }

    pub fn ksum(&self) -> Result<f64, SolutionError> {
        self.require_solved("ksum")?;
        Ok(self.ksum)
    }

    pub fn coefficients(&self) -> Result<&Array1<f64>, SolutionError> {
        self.require_solved("solution")?;
        self.a.as_ref().ok_or(SolutionError::NotSolved("solution"))
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

    pub fn design_matrix(&self) -> &Array2<f64> {
        &self.c
    }

    pub fn inverse_variance(&self) -> &Array1<f64> {
        &self.iv
    }

    pub fn target_vector(&self) -> &Array1<f64> {
        &self.y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::delta_function_basis;

    fn flat_stamp(value: f64, n: usize) -> (Image, Image, Image) {
        (
            Image::from_elem(n, n, value),
            Image::from_elem(n, n, value),
            Image::from_elem(n, n, 1.0),
        )
    }

    #[test]
    fn build_shapes_follow_good_region() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let (t, s, v) = flat_stamp(1.0, 8);
        let mut sol = StaticKernelSolution::new(basis, true);
        sol.build(&t, &s, &v).expect("build");
        // 8x8 shrunk by 1 on each side: 36 pixels; 9 kernels + background.
        assert_eq!(sol.design_matrix().dim(), (36, 10));
        assert_eq!(sol.m_matrix().dim(), (10, 10));
    }

    #[test]
    fn accessors_before_solve_fail() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let (t, s, v) = flat_stamp(1.0, 8);
        let mut sol = StaticKernelSolution::new(basis, false);
        sol.build(&t, &s, &v).expect("build");
        assert!(matches!(sol.kernel(), Err(SolutionError::NotSolved(_))));
        assert!(matches!(sol.ksum(), Err(SolutionError::NotSolved(_))));
    }

    #[test]
    fn zero_variance_rejected() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let (t, s, _) = flat_stamp(1.0, 8);
        let v = Image::from_elem(8, 8, 0.0);
        let mut sol = StaticKernelSolution::new(basis, false);
        let err = sol.build(&t, &s, &v).unwrap_err();
        assert!(err.to_string().contains("equals 0.0"));
    }

    #[test]
    fn build_single_drops_masked_box() {
        let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
        let (t, s, v) = flat_stamp(2.0, 10);
        let mut sol = StaticKernelSolution::new(basis.clone(), false);
        sol.build_single(&t, &s, &v, &BBox::new(4, 4, 2, 2))
            .expect("build_single");
        // Good region is 8x8 = 64 pixels, minus the 2x2 box.
        assert_eq!(sol.design_matrix().nrows(), 60);

        let mut outside = StaticKernelSolution::new(basis, false);
        assert!(
            outside
                .build_single(&t, &s, &v, &BBox::new(0, 0, 2, 2))
                .is_err(),
            "mask box outside the good region must be rejected"
        );
    }
}
