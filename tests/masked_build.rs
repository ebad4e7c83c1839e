//! Masked and box-excluding build paths.

use diffim::convolve::convolve_arrays;
use diffim::{BBox, BasisKernel, Image, KernelBasis, Mask, StaticKernelSolution};
use ndarray::Array2;
use std::sync::Arc;

fn smooth_template(n: usize) -> Image {
    let data = Array2::from_shape_fn((n, n), |(y, x)| {
        10.0 + 3.0 * (0.29 * x as f64).sin() * (0.23 * y as f64).cos() + 0.04 * y as f64
    });
    Image::new(data)
}

fn delta3() -> BasisKernel {
    let mut k = Array2::<f64>::zeros((3, 3));
    k[[1, 1]] = 1.0;
    BasisKernel::new(k).expect("odd dims")
}

fn gauss3() -> BasisKernel {
    let mut k = Array2::from_shape_fn((3, 3), |(y, x)| {
        let dx = x as f64 - 1.0;
        let dy = y as f64 - 1.0;
        (-(dx * dx + dy * dy) / 2.0).exp()
    });
    let sum = k.sum();
    k.mapv_inplace(|v| v / sum);
    BasisKernel::new(k).expect("odd dims")
}

fn blend_science(template: &Image) -> Image {
    let true_kernel = delta3().data() * 0.7 + gauss3().data() * 0.3;
    Image::new(convolve_arrays(template.data(), &true_kernel, 1, 1))
}

#[test]
fn masked_build_ignores_corrupted_block() {
    // Science is made from the clean template; the template handed to the
    // solver is then corrupted inside a masked 10x10 block. The footprint
    // grow must keep the corruption (and its convolution spill) out of the
    // fit entirely.
    let n = 64;
    let clean = smooth_template(n);
    let science = blend_science(&clean);
    let variance = Image::from_elem(n, n, 1.0);

    let mut corrupted = clean.clone();
    let mut mask = Mask::new(n, n);
    for y in 20..30 {
        for x in 20..30 {
            let v = corrupted.value(x, y);
            corrupted.set_value(x, y, v + 100.0);
            mask.or_value(x, y, Mask::BAD);
        }
    }

    let basis = Arc::new(KernelBasis::new(vec![delta3(), gauss3()]).expect("basis"));
    let mut masked = StaticKernelSolution::new(basis.clone(), false);
    masked
        .build_with_mask(&corrupted, &science, &variance, &mask)
        .expect("masked build");
    masked.solve(0.0).expect("solve");
    let a = masked.coefficients().expect("coefficients");
    assert!((a[0] - 0.7).abs() < 1e-8, "delta weight {}", a[0]);
    assert!((a[1] - 0.3).abs() < 1e-8, "gaussian weight {}", a[1]);

    // The unmasked build over the corrupted template is visibly biased.
    let mut unmasked = StaticKernelSolution::new(basis, false);
    unmasked
        .build(&corrupted, &science, &variance)
        .expect("build");
    unmasked.solve(0.0).expect("solve");
    let a_bad = unmasked.coefficients().expect("coefficients");
    assert!(
        (a_bad[0] - 0.7).abs() > 1e-4,
        "corruption unexpectedly invisible to the unmasked fit"
    );
}

#[test]
fn masked_build_matches_clean_solution() {
    // With clean inputs, masking a block changes the pixel set but not the
    // noise-free solution.
    let n = 64;
    let template = smooth_template(n);
    let science = blend_science(&template);
    let variance = Image::from_elem(n, n, 1.0);
    let mut mask = Mask::new(n, n);
    for y in 40..50 {
        for x in 12..22 {
            mask.or_value(x, y, Mask::SAT);
        }
    }

    let basis = Arc::new(KernelBasis::new(vec![delta3(), gauss3()]).expect("basis"));
    let mut with_mask = StaticKernelSolution::new(basis.clone(), false);
    with_mask
        .build_with_mask(&template, &science, &variance, &mask)
        .expect("masked build");
    with_mask.solve(0.0).expect("solve");

    let mut no_mask = StaticKernelSolution::new(basis, false);
    no_mask.build(&template, &science, &variance).expect("build");
    no_mask.solve(0.0).expect("solve");

    let a_masked = with_mask.coefficients().expect("coefficients");
    let a_clean = no_mask.coefficients().expect("coefficients");
    for i in 0..2 {
        assert!(
            (a_masked[i] - a_clean[i]).abs() < 1e-8,
            "coefficient {i}: {} vs {}",
            a_masked[i],
            a_clean[i]
        );
    }

    // The grown footprint removed more than the raw 10x10 block.
    let removed = no_mask.design_matrix().nrows() - with_mask.design_matrix().nrows();
    assert!(removed > 100, "grow removed only {removed} pixels");
}

#[test]
fn fully_masked_stamp_is_rejected() {
    let n = 16;
    let template = smooth_template(n);
    let science = template.clone();
    let variance = Image::from_elem(n, n, 1.0);
    let mut mask = Mask::new(n, n);
    for y in 0..n as i32 {
        for x in 0..n as i32 {
            mask.or_value(x, y, Mask::NO_DATA);
        }
    }
    let basis = Arc::new(KernelBasis::new(vec![delta3()]).expect("basis"));
    let mut sol = StaticKernelSolution::new(basis, false);
    assert!(
        sol.build_with_mask(&template, &science, &variance, &mask)
            .is_err()
    );
}

#[test]
fn build_single_excludes_central_box() {
    let n = 48;
    let template = smooth_template(n);
    let science = blend_science(&template);
    let variance = Image::from_elem(n, n, 1.0);
    let basis = Arc::new(KernelBasis::new(vec![delta3(), gauss3()]).expect("basis"));

    let mask_box = BBox::new(20, 22, 8, 6);
    let mut sol = StaticKernelSolution::new(basis, false);
    sol.build_single(&template, &science, &variance, &mask_box)
        .expect("build_single");
    sol.solve(0.0).expect("solve");

    // Good region is 46x46; the excluded box removes its area.
    assert_eq!(sol.design_matrix().nrows(), 46 * 46 - 8 * 6);
    let a = sol.coefficients().expect("coefficients");
    assert!((a[0] - 0.7).abs() < 1e-8);
    assert!((a[1] - 0.3).abs() < 1e-8);
}
