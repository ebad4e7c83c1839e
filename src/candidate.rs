//! One stamp's fitting lifecycle.
//!
//! A candidate owns its template and science planes, composes the variance
//! it will weight with, and carries up to two solutions: `original` (first
//! basis) and `pca` (any later refit). `Recent` always prefers the pca slot.

use crate::config::SolverConfig;
use crate::convolve::convolve_arrays;
use crate::image::{Image, Mask, MaskedImage};
use crate::imstats::ImageStatistics;
use crate::kernel::{KernelBasis, LinearKernel};
use crate::regularize::RegularizedKernelSolution;
use crate::solution::{SolutionError, SolvedBy};
use crate::stamp::StaticKernelSolution;
use ndarray::{Array1, Array2};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Unknown,
    Good,
    Bad,
}

/// Which solution slot an accessor refers to. `Recent` prefers the pca
/// refit over the original fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSwitch {
    Original,
    Pca,
    Recent,
}

/// A stamp solution in either flavor; the candidate stores whichever the
/// build produced.
#[derive(Debug, Clone)]
pub enum CandidateSolution {
    Static(StaticKernelSolution),
    Regularized(RegularizedKernelSolution),
}

impl CandidateSolution {
    pub fn kernel(&self) -> Result<LinearKernel, SolutionError> {
        match self {
            Self::Static(s) => s.kernel(),
            Self::Regularized(r) => r.kernel(),
        }
    }

    pub fn background(&self) -> Result<f64, SolutionError> {
        match self {
            Self::Static(s) => s.background(),
            Self::Regularized(r) => r.background(),
        }
    }

    pub fn ksum(&self) -> Result<f64, SolutionError> {
        match self {
            Self::Static(s) => s.ksum(),
            Self::Regularized(r) => r.ksum(),
        }
    }

    pub fn make_kernel_image(&self) -> Result<Array2<f64>, SolutionError> {
        match self {
            Self::Static(s) => s.make_kernel_image(),
            Self::Regularized(r) => r.make_kernel_image(),
        }
    }

    pub fn solved_by(&self) -> SolvedBy {
        match self {
            Self::Static(s) => s.solved_by(),
            Self::Regularized(r) => r.solved_by(),
        }
    }

    pub fn condition_number(
        &self,
        condition_type: crate::config::ConditionNumberType,
    ) -> Result<f64, SolutionError> {
        match self {
            Self::Static(s) => s.condition_number(condition_type),
            Self::Regularized(r) => r.condition_number(condition_type),
        }
    }

    /// The unpenalized normal-equation matrix, the `Q` handed to the
    /// spatial aggregator.
    pub fn m_matrix(&self) -> &Array2<f64> {
        match self {
            Self::Static(s) => s.m_matrix(),
            Self::Regularized(r) => r.static_solution().m_matrix(),
        }
    }

    /// The right-hand side, the spatial aggregator's `w`.
    pub fn b_vector(&self) -> &Array1<f64> {
        match self {
            Self::Static(s) => s.b_vector(),
            Self::Regularized(r) => r.b_vector(),
        }
    }
}

/// `science − (template ⊗ kernel) − background` with propagated variance
/// `var_science + var_template ⊗ kernel²`. Pixels outside the kernel's good
/// region are zeroed and flagged EDGE.
pub fn convolve_and_subtract(
    template: &MaskedImage,
    science: &MaskedImage,
    kernel: &LinearKernel,
    background: f64,
) -> Result<MaskedImage, SolutionError> {
    if template.bbox() != science.bbox() {
        return Err(SolutionError::InvalidInput(format!(
            "template bbox {:?} disagrees with science {:?}",
            template.bbox(),
            science.bbox()
        )));
    }
    let bbox = template.bbox();
    let first = kernel.basis().first();
    let good = first.shrink_bbox(&bbox)?;

    let k_img = kernel.image();
    let k_sq = k_img.mapv(|v| v * v);
    let conv = convolve_arrays(template.image.data(), &k_img, first.ctr_x(), first.ctr_y());
    let conv_var = convolve_arrays(
        template.variance.data(),
        &k_sq,
        first.ctr_x(),
        first.ctr_y(),
    );

    let (h, w) = (bbox.height(), bbox.width());
    let mut diff = Array2::<f64>::zeros((h, w));
    let mut var = Array2::<f64>::zeros((h, w));
    let mut mask = Array2::<u32>::zeros((h, w));
    for row in 0..h {
        let y = bbox.min_y() + row as i32;
        for col in 0..w {
            let x = bbox.min_x() + col as i32;
            if good.contains_point(x, y) {
                diff[[row, col]] = science.image.value(x, y) - conv[[row, col]] - background;
                var[[row, col]] = science.variance.value(x, y) + conv_var[[row, col]];
                mask[[row, col]] = science.mask.value(x, y) | template.mask.value(x, y);
            } else {
                // Edge pixels carry the unconvolved variance sum so a
                // rebuild weighting with this plane stays well defined.
                var[[row, col]] =
                    science.variance.value(x, y) + template.variance.value(x, y);
                mask[[row, col]] =
                    science.mask.value(x, y) | template.mask.value(x, y) | Mask::EDGE;
            }
        }
    }

    MaskedImage::with_mask(
        Image::with_origin(diff, bbox.min_x(), bbox.min_y()),
        Mask::with_origin(mask, bbox.min_x(), bbox.min_y()),
        Image::with_origin(var, bbox.min_x(), bbox.min_y()),
    )
}

static CANDIDATE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct KernelCandidate {
    id: u64,
    x_center: f64,
    y_center: f64,
    template: MaskedImage,
    science: MaskedImage,
    variance: Option<Image>,
    config: SolverConfig,
    core_flux: f64,
    is_initialized: bool,
    use_regularization: bool,
    original: Option<CandidateSolution>,
    pca: Option<CandidateSolution>,
    chi2: f64,
    status: CandidateStatus,
}

impl KernelCandidate {
    /// Construct and rank a candidate. A failed core-statistics pass marks
    /// the candidate BAD instead of failing construction.
    pub fn new(
        x_center: f64,
        y_center: f64,
        template: MaskedImage,
        science: MaskedImage,
        config: SolverConfig,
    ) -> Result<Self, SolutionError> {
        config.validate()?;
        if template.bbox() != science.bbox() {
            return Err(SolutionError::InvalidInput(format!(
                "template bbox {:?} disagrees with science {:?}",
                template.bbox(),
                science.bbox()
            )));
        }
        let id = CANDIDATE_ID.fetch_add(1, Ordering::Relaxed) + 1;

        // Rank by mean core S/N in the science image.
        let mut status = CandidateStatus::Unknown;
        let core_flux = match ImageStatistics::apply_core(&science, config.candidate_core_radius) {
            Ok(stats) => stats.mean(),
            Err(err) => {
                log::debug!("unable to calculate core stats for rating candidate {id}: {err}");
                status = CandidateStatus::Bad;
                f64::NAN
            }
        };
        log::debug!("candidate {id} at {x_center:.2} {y_center:.2} with rating {core_flux:.2}");

        Ok(Self {
            id,
            x_center,
            y_center,
            template,
            science,
            variance: None,
            config,
            core_flux,
            is_initialized: false,
            use_regularization: false,
            original: None,
            pca: None,
            chi2: 0.0,
            status,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn x_center(&self) -> f64 {
        self.x_center
    }

    pub fn y_center(&self) -> f64 {
        self.y_center
    }

    pub fn core_flux(&self) -> f64 {
        self.core_flux
    }

    pub fn status(&self) -> CandidateStatus {
        self.status
    }

    pub fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn set_chi2(&mut self, chi2: f64) {
        self.chi2 = chi2;
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    pub fn uses_regularization(&self) -> bool {
        self.use_regularization
    }

    pub fn template(&self) -> &MaskedImage {
        &self.template
    }

    pub fn science(&self) -> &MaskedImage {
        &self.science
    }

    /// Build a solution in the next open slot: the first build fills
    /// `original`, any later build fills `pca`.
    pub fn build(
        &mut self,
        basis: &Arc<KernelBasis>,
        h: Option<&Array2<f64>>,
    ) -> Result<(), SolutionError> {
        // Variance estimate comes from the sum of image variances.
        let mut var_data = self.science.variance.data() + self.template.variance.data();
        if self.config.constant_variance_weighting {
            let bbox = self.science.bbox();
            let median = Image::with_origin(var_data.clone(), bbox.min_x(), bbox.min_y()).median();
            let value = if median <= 0.0 { 1.0 } else { median };
            log::debug!("candidate {} using constant variance of {value:.2}", self.id);
            var_data.fill(value);
        }
        let bbox = self.science.bbox();
        self.variance = Some(Image::with_origin(var_data, bbox.min_x(), bbox.min_y()));

        self.build_kernel_solution(basis, h)?;

        if self.config.iterate_single_kernel && !self.config.constant_variance_weighting {
            let diffim = self.difference_image(CandidateSwitch::Recent)?;
            self.variance = Some(diffim.variance);
            self.build_kernel_solution(basis, h)?;
        }

        self.is_initialized = true;
        Ok(())
    }

    fn build_kernel_solution(
        &mut self,
        basis: &Arc<KernelBasis>,
        h: Option<&Array2<f64>>,
    ) -> Result<(), SolutionError> {
        let variance = self
            .variance
            .as_ref()
            .ok_or_else(|| SolutionError::Logic("variance missing during build".to_string()))?;

        let mut solution = match h {
            Some(h) => {
                self.use_regularization = true;
                log::debug!("candidate {}: using kernel regularization", self.id);
                let mut reg = RegularizedKernelSolution::new(
                    basis.clone(),
                    self.config.fit_for_background,
                    h.clone(),
                    self.config.clone(),
                )?;
                reg.build(&self.template.image, &self.science.image, variance)?;
                CandidateSolution::Regularized(reg)
            }
            None => {
                self.use_regularization = false;
                let mut stat =
                    StaticKernelSolution::new(basis.clone(), self.config.fit_for_background);
                stat.build(&self.template.image, &self.science.image, variance)?;
                CandidateSolution::Static(stat)
            }
        };

        let gate = if self.config.check_condition_number {
            let cond = solution.condition_number(self.config.condition_number_type)?;
            cond > self.config.max_condition_number
        } else {
            false
        };

        if gate {
            log::debug!("candidate {} solution has bad condition number", self.id);
            self.store_solution(solution);
            self.status = CandidateStatus::Bad;
            return Ok(());
        }

        match &mut solution {
            CandidateSolution::Static(s) => s.solve(self.config.eigenvalue_zero_tolerance)?,
            CandidateSolution::Regularized(r) => r.solve()?,
        }
        self.store_solution(solution);
        Ok(())
    }

    fn store_solution(&mut self, solution: CandidateSolution) {
        if self.is_initialized {
            self.pca = Some(solution);
        } else {
            self.original = Some(solution);
        }
    }

    pub fn solution(&self, switch: CandidateSwitch) -> Result<&CandidateSolution, SolutionError> {
        match switch {
            CandidateSwitch::Original => self
                .original
                .as_ref()
                .ok_or(SolutionError::MissingSolution("original")),
            CandidateSwitch::Pca => {
                self.pca.as_ref().ok_or(SolutionError::MissingSolution("pca"))
            }
            CandidateSwitch::Recent => self
                .pca
                .as_ref()
                .or(self.original.as_ref())
                .ok_or(SolutionError::MissingSolution("recent")),
        }
    }

    pub fn kernel(&self, switch: CandidateSwitch) -> Result<LinearKernel, SolutionError> {
        self.solution(switch)?.kernel()
    }

    pub fn background(&self, switch: CandidateSwitch) -> Result<f64, SolutionError> {
        self.solution(switch)?.background()
    }

    pub fn ksum(&self, switch: CandidateSwitch) -> Result<f64, SolutionError> {
        self.solution(switch)?.ksum()
    }

    pub fn kernel_image(&self, switch: CandidateSwitch) -> Result<Array2<f64>, SolutionError> {
        self.solution(switch)?.make_kernel_image()
    }

    /// Difference image under the requested slot's kernel and background.
    pub fn difference_image(
        &self,
        switch: CandidateSwitch,
    ) -> Result<MaskedImage, SolutionError> {
        let solution = self.solution(switch)?;
        convolve_and_subtract(
            &self.template,
            &self.science,
            &solution.kernel()?,
            solution.background()?,
        )
    }
}
