//! Candidate lifecycle and the single-kernel visitor, through to spatial
//! aggregation of candidate solutions.

use diffim::{
    CandidateStatus, CandidateSwitch, Image, KernelBasisSet, KernelCandidate, MaskedImage,
    PolynomialFunction2, SingleKernelFitVisitor, SolutionError, SolverConfig,
    SpatialKernelSolution, delta_function_basis,
};
use ndarray::Array2;
use std::sync::Arc;

fn smooth_image(n: usize, phase: f64) -> Image {
    let data = Array2::from_shape_fn((n, n), |(y, x)| {
        10.0 + 3.0 * (0.31 * x as f64 + phase).sin() * (0.17 * y as f64).cos() + 0.02 * x as f64
    });
    Image::new(data)
}

fn masked(image: Image, var: f64) -> MaskedImage {
    let n = image.width();
    MaskedImage::new(image, Image::from_elem(n, n, var)).expect("planes")
}

fn identity_config() -> SolverConfig {
    SolverConfig {
        kernel_basis_set: KernelBasisSet::DeltaFunction,
        fit_for_background: true,
        constant_variance_weighting: true,
        ..SolverConfig::default()
    }
}

#[test]
fn visitor_accepts_identical_stamp() {
    let n = 24;
    let template = masked(smooth_image(n, 0.0), 0.5);
    let science = masked(smooth_image(n, 0.0), 0.5);
    let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));

    let mut candidate =
        KernelCandidate::new(12.0, 12.0, template, science, identity_config()).expect("candidate");
    let mut visitor =
        SingleKernelFitVisitor::new(basis, identity_config()).expect("visitor");
    visitor.process_candidate(&mut candidate);

    assert_eq!(candidate.status(), CandidateStatus::Good);
    assert_eq!(visitor.n_processed(), 1);
    assert_eq!(visitor.n_rejected(), 0);

    // science == template: unit kernel sum, no background, zero residuals.
    let ksum = candidate.ksum(CandidateSwitch::Recent).expect("ksum");
    assert!((ksum - 1.0).abs() < 1e-6, "ksum {ksum}");
    let background = candidate
        .background(CandidateSwitch::Recent)
        .expect("background");
    assert!(background.abs() < 1e-6, "background {background}");
    assert!(candidate.chi2() < 1e-8, "chi2 {}", candidate.chi2());

    // Already initialized: the visitor skips it on a second pass.
    visitor.process_candidate(&mut candidate);
    assert_eq!(visitor.n_processed(), 1);
}

#[test]
fn visitor_rejects_unmatchable_artifacts() {
    // Isolated bright spikes in the science image are not representable by
    // small shifts of a smooth template; residual clipping must flag the
    // candidate.
    let n = 24;
    let template = masked(smooth_image(n, 0.0), 0.5);
    let mut science_img = smooth_image(n, 0.0);
    for &(x, y) in &[(5, 7), (11, 15), (17, 4), (8, 18), (20, 11)] {
        let v = science_img.value(x, y);
        science_img.set_value(x, y, v + 100.0);
    }
    let science = masked(science_img, 0.5);
    let config = SolverConfig {
        single_kernel_clipping: true,
        ..identity_config()
    };
    let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));

    let mut candidate =
        KernelCandidate::new(12.0, 12.0, template, science, config.clone()).expect("candidate");
    let mut visitor = SingleKernelFitVisitor::new(basis, config).expect("visitor");
    visitor.process_candidate(&mut candidate);

    assert_eq!(candidate.status(), CandidateStatus::Bad);
    assert_eq!(visitor.n_rejected(), 1);
}

#[test]
fn condition_gate_marks_bad_without_solving() {
    // A constant template makes every delta column identical: the condition
    // number is infinite and the gate must trip before any solve.
    let n = 24;
    let template = masked(Image::from_elem(n, n, 1.0), 0.5);
    let science = masked(Image::from_elem(n, n, 1.0), 0.5);
    let config = SolverConfig {
        check_condition_number: true,
        max_condition_number: 1.0e7,
        ..identity_config()
    };
    let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));

    let mut candidate =
        KernelCandidate::new(12.0, 12.0, template, science, config).expect("candidate");
    candidate.build(&basis, None).expect("gate does not raise");

    assert_eq!(candidate.status(), CandidateStatus::Bad);
    // The slot exists but was never solved.
    assert!(candidate.solution(CandidateSwitch::Original).is_ok());
    assert!(matches!(
        candidate.kernel(CandidateSwitch::Original),
        Err(SolutionError::NotSolved(_))
    ));
}

#[test]
fn iterated_build_refits_with_diffim_variance() {
    let n = 24;
    let template = masked(smooth_image(n, 0.0), 0.5);
    let science = masked(smooth_image(n, 0.0), 0.5);
    let config = SolverConfig {
        constant_variance_weighting: false,
        iterate_single_kernel: true,
        ..identity_config()
    };
    let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));

    let mut candidate =
        KernelCandidate::new(12.0, 12.0, template, science, config).expect("candidate");
    candidate.build(&basis, None).expect("build");

    // Both passes land in the original slot; pca stays empty until a
    // post-initialization build.
    assert!(candidate.is_initialized());
    assert!(candidate.solution(CandidateSwitch::Original).is_ok());
    assert!(candidate.solution(CandidateSwitch::Pca).is_err());
    let ksum = candidate.ksum(CandidateSwitch::Recent).expect("ksum");
    assert!((ksum - 1.0).abs() < 1e-6);
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let n = 16;
    let template = masked(smooth_image(n, 0.0), 0.5);
    let science = masked(smooth_image(n, 0.0), 0.5);
    let config = SolverConfig {
        lambda_lin_step: -1.0,
        ..identity_config()
    };
    assert!(matches!(
        KernelCandidate::new(8.0, 8.0, template, science, config),
        Err(SolutionError::InvalidInput(_))
    ));
}

#[test]
fn candidate_solutions_feed_the_spatial_fit() {
    // A grid of identical stamps aggregated spatially with a constant
    // spatial basis reproduces each stamp's own kernel.
    let n = 24;
    let config = identity_config();
    let basis = Arc::new(delta_function_basis(3, 3).expect("basis"));
    let mut visitor = SingleKernelFitVisitor::new(basis.clone(), config.clone()).expect("visitor");

    let mut candidates: Vec<KernelCandidate> = (0..9)
        .map(|i| {
            let x = 30.0 * (i % 3) as f64 + 12.0;
            let y = 30.0 * (i / 3) as f64 + 12.0;
            KernelCandidate::new(
                x,
                y,
                masked(smooth_image(n, 0.0), 0.5),
                masked(smooth_image(n, 0.0), 0.5),
                config.clone(),
            )
            .expect("candidate")
        })
        .collect();
    visitor.process_candidates(&mut candidates);
    assert_eq!(visitor.n_processed(), 9);

    let spatial_config = SolverConfig {
        kernel_basis_set: KernelBasisSet::DeltaFunction,
        fit_for_background: true,
        ..SolverConfig::default()
    };
    let mut spatial = SpatialKernelSolution::new(
        basis,
        PolynomialFunction2::new(0),
        PolynomialFunction2::new(0),
        &spatial_config,
    )
    .expect("spatial");

    for candidate in &candidates {
        assert_eq!(candidate.status(), CandidateStatus::Good);
        let solution = candidate.solution(CandidateSwitch::Recent).expect("recent");
        spatial
            .add_constraint(
                candidate.x_center(),
                candidate.y_center(),
                solution.m_matrix(),
                solution.b_vector(),
            )
            .expect("constraint");
    }
    spatial.solve().expect("spatial solve");

    let local = candidates[0]
        .kernel(CandidateSwitch::Recent)
        .expect("local kernel");
    let spatial_kernel = spatial.kernel().expect("spatial kernel");
    let coeffs = spatial_kernel.coefficients_at(50.0, 50.0);
    for (i, (&s, &l)) in coeffs
        .iter()
        .zip(local.coefficients().iter())
        .enumerate()
    {
        assert!((s - l).abs() < 1e-6, "coefficient {i}: spatial {s} vs local {l}");
    }
    assert!((spatial.ksum().expect("ksum") - 1.0).abs() < 1e-6);
}
