//! Basis kernels and their linear combinations.
//!
//! A matching kernel is fit as a linear combination of small fixed basis
//! images. The two stock families are the delta-function basis (one spike per
//! pixel, maximally flexible, usually regularized) and the Alard–Lupton basis
//! (Gaussians modulated by low-order polynomials, where only the first term
//! carries flux).

use crate::geom::BBox;
use ndarray::Array2;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BasisError {
    #[error("basis list is empty")]
    EmptyBasis,
    #[error("kernel dimensions must be odd, got {width}x{height}")]
    EvenDimensions { width: usize, height: usize },
    #[error("all basis kernels must share dimensions: {0}x{1} vs {2}x{3}")]
    MismatchedShapes(usize, usize, usize, usize),
    #[error("bounding box {0}x{1} too small to convolve with a {2}x{3} kernel")]
    BoxTooSmall(usize, usize, usize, usize),
    #[error("sigmas and degrees must have the same length: {0} vs {1}")]
    MismatchedLengths(usize, usize),
    #[error("gaussian width must be positive, got {0}")]
    NonPositiveSigma(f64),
}

/// A single 2-D basis image with odd dimensions and a defined center pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisKernel {
    data: Array2<f64>,
}

impl BasisKernel {
    /// Wrap a kernel image; both dimensions must be odd so the center pixel
    /// is unambiguous.
    pub fn new(data: Array2<f64>) -> Result<Self, BasisError> {
        let (height, width) = data.dim();
        if width == 0 || height == 0 || width % 2 == 0 || height % 2 == 0 {
            return Err(BasisError::EvenDimensions { width, height });
        }
        Ok(Self { data })
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Center column offset (the kernel half-width).
    pub fn ctr_x(&self) -> usize {
        self.width() / 2
    }

    /// Center row offset.
    pub fn ctr_y(&self) -> usize {
        self.height() / 2
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn sum(&self) -> f64 {
        self.data.sum()
    }

    /// The good region of `bbox` after convolution with this kernel: the
    /// box shrunk by the half-width on every side.
    pub fn shrink_bbox(&self, bbox: &BBox) -> Result<BBox, BasisError> {
        let good = bbox.shrunk_by(self.ctr_x(), self.ctr_y());
        if good.is_empty() {
            return Err(BasisError::BoxTooSmall(
                bbox.width(),
                bbox.height(),
                self.width(),
                self.height(),
            ));
        }
        Ok(good)
    }
}

/// Ordered list of basis kernels sharing one shape (and therefore one set of
/// center offsets). The order is meaningful: the first element is the one
/// that may be held spatially constant by the spatial fit.
#[derive(Debug, Clone)]
pub struct KernelBasis {
    kernels: Vec<BasisKernel>,
}

impl KernelBasis {
    pub fn new(kernels: Vec<BasisKernel>) -> Result<Self, BasisError> {
        let first = kernels.first().ok_or(BasisError::EmptyBasis)?;
        let (w, h) = (first.width(), first.height());
        for k in &kernels[1..] {
            if k.width() != w || k.height() != h {
                return Err(BasisError::MismatchedShapes(w, h, k.width(), k.height()));
            }
        }
        Ok(Self { kernels })
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernels(&self) -> &[BasisKernel] {
        &self.kernels
    }

    pub fn first(&self) -> &BasisKernel {
        &self.kernels[0]
    }

    pub fn width(&self) -> usize {
        self.first().width()
    }

    pub fn height(&self) -> usize {
        self.first().height()
    }
}

/// An owned snapshot of a solved kernel: basis plus one coefficient per
/// basis element.
#[derive(Debug, Clone)]
pub struct LinearKernel {
    basis: Arc<KernelBasis>,
    coefficients: Vec<f64>,
}

impl LinearKernel {
    pub fn new(basis: Arc<KernelBasis>, coefficients: Vec<f64>) -> Self {
        debug_assert_eq!(basis.len(), coefficients.len());
        Self {
            basis,
            coefficients,
        }
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn basis(&self) -> &Arc<KernelBasis> {
        &self.basis
    }

    /// Realize the kernel image `Σᵢ aᵢ·basisᵢ`.
    pub fn image(&self) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((self.basis.height(), self.basis.width()));
        for (k, &a) in self.basis.kernels().iter().zip(&self.coefficients) {
            out.scaled_add(a, k.data());
        }
        out
    }

    /// Kernel sum (the photometric scaling the kernel applies).
    pub fn sum(&self) -> f64 {
        self.basis
            .kernels()
            .iter()
            .zip(&self.coefficients)
            .map(|(k, &a)| a * k.sum())
            .sum()
    }
}

/// Delta-function basis: one kernel per pixel, each a unit spike. Ordered
/// column-major over (x, y) so coefficient k maps to pixel
/// `(k / height, k % height)`.
pub fn delta_function_basis(width: usize, height: usize) -> Result<KernelBasis, BasisError> {
    if width % 2 == 0 || height % 2 == 0 || width == 0 || height == 0 {
        return Err(BasisError::EvenDimensions { width, height });
    }
    let mut kernels = Vec::with_capacity(width * height);
    for x in 0..width {
        for y in 0..height {
            let mut data = Array2::<f64>::zeros((height, width));
            data[[y, x]] = 1.0;
            kernels.push(BasisKernel::new(data)?);
        }
    }
    KernelBasis::new(kernels)
}

/// Alard–Lupton basis: for each Gaussian width `sigmas[g]`, polynomial
/// modulations `x^i·y^j` with `i + j <= degrees[g]`.
///
/// The first kernel is normalized to unit sum; every subsequent kernel is
/// renormalized to zero sum against the first, so only the first term
/// carries flux and the kernel sum equals the first coefficient.
pub fn alard_lupton_basis(
    half_width: usize,
    sigmas: &[f64],
    degrees: &[usize],
) -> Result<KernelBasis, BasisError> {
    if sigmas.len() != degrees.len() {
        return Err(BasisError::MismatchedLengths(sigmas.len(), degrees.len()));
    }
    if sigmas.is_empty() {
        return Err(BasisError::EmptyBasis);
    }
    let size = 2 * half_width + 1;
    let hw = half_width as f64;

    let mut kernels: Vec<BasisKernel> = Vec::new();
    for (&sigma, &degree) in sigmas.iter().zip(degrees.iter()) {
        if sigma <= 0.0 {
            return Err(BasisError::NonPositiveSigma(sigma));
        }
        let inv_two_sig2 = 1.0 / (2.0 * sigma * sigma);
        for total in 0..=degree {
            for yexp in 0..=total {
                let xexp = total - yexp;
                let mut data = Array2::<f64>::zeros((size, size));
                for row in 0..size {
                    for col in 0..size {
                        let dx = col as f64 - hw;
                        let dy = row as f64 - hw;
                        let gauss = (-(dx * dx + dy * dy) * inv_two_sig2).exp();
                        data[[row, col]] = gauss * dx.powi(xexp as i32) * dy.powi(yexp as i32);
                    }
                }
                kernels.push(BasisKernel::new(data)?);
            }
        }
    }

    // First term: unit sum. Later terms: subtract their projection on the
    // first so they integrate to zero.
    let first_sum = kernels[0].sum();
    if first_sum != 0.0 {
        let normalized = kernels[0].data() / first_sum;
        kernels[0] = BasisKernel::new(normalized)?;
    }
    let first = kernels[0].data().clone();
    for k in kernels.iter_mut().skip(1) {
        let s = k.sum();
        if s != 0.0 {
            let adjusted = k.data() - &(&first * s);
            *k = BasisKernel::new(adjusted)?;
        }
    }

    KernelBasis::new(kernels)
}

/// Central-difference regularization matrix for a delta-function basis over
/// a `width x height` kernel grid: `H = BᵀB` where each row of `B` applies
/// the 5-point Laplacian stencil at one kernel pixel (neighbors outside the
/// grid dropped). When `fit_for_background`, a zero row and column are
/// appended so `H` matches the full parameter count.
pub fn central_difference_regularization(
    width: usize,
    height: usize,
    fit_for_background: bool,
) -> Array2<f64> {
    let np = width * height;
    // Pixel k is (x = k / height, y = k % height), matching the
    // delta-function basis ordering.
    let index = |x: usize, y: usize| x * height + y;

    let mut b = Array2::<f64>::zeros((np, np));
    for x in 0..width {
        for y in 0..height {
            let row = index(x, y);
            b[[row, row]] = -4.0;
            if x > 0 {
                b[[row, index(x - 1, y)]] = 1.0;
            }
            if x + 1 < width {
                b[[row, index(x + 1, y)]] = 1.0;
            }
            if y > 0 {
                b[[row, index(x, y - 1)]] = 1.0;
            }
            if y + 1 < height {
                b[[row, index(x, y + 1)]] = 1.0;
            }
        }
    }
    let h = b.t().dot(&b);

    if !fit_for_background {
        return h;
    }
    let nt = np + 1;
    let mut padded = Array2::<f64>::zeros((nt, nt));
    padded.slice_mut(ndarray::s![..np, ..np]).assign(&h);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_basis_covers_every_pixel_once() {
        let basis = delta_function_basis(3, 3).expect("odd dims");
        assert_eq!(basis.len(), 9);
        let total: Array2<f64> = basis
            .kernels()
            .iter()
            .fold(Array2::zeros((3, 3)), |acc, k| acc + k.data());
        assert!(total.iter().all(|&v| (v - 1.0).abs() < 1e-15));
    }

    #[test]
    fn even_kernel_rejected() {
        assert!(matches!(
            delta_function_basis(4, 3),
            Err(BasisError::EvenDimensions { .. })
        ));
    }

    #[test]
    fn alard_lupton_flux_lives_in_first_term() {
        let basis = alard_lupton_basis(4, &[1.0, 2.0], &[2, 1]).expect("valid basis");
        // nTerms = (2+1)(2+2)/2 + (1+1)(1+2)/2 = 6 + 3
        assert_eq!(basis.len(), 9);
        assert!((basis.first().sum() - 1.0).abs() < 1e-12);
        for k in &basis.kernels()[1..] {
            assert!(k.sum().abs() < 1e-10, "non-first term carries flux");
        }
    }

    #[test]
    fn regularization_matrix_is_symmetric_psd_diagonal() {
        let h = central_difference_regularization(3, 3, true);
        assert_eq!(h.dim(), (10, 10));
        for i in 0..10 {
            for j in 0..10 {
                assert!((h[[i, j]] - h[[j, i]]).abs() < 1e-12);
            }
        }
        // Background row/col stays zero.
        assert!(h.row(9).iter().all(|&v| v == 0.0));
        // x'Hx = |Bx|^2 >= 0 for a spot-check vector.
        let x = ndarray::Array1::linspace(-1.0, 1.0, 10);
        let q = x.dot(&h.dot(&x));
        assert!(q >= 0.0);
    }

    #[test]
    fn shrink_bbox_reports_too_small() {
        let k = BasisKernel::new(Array2::zeros((5, 5))).expect("odd");
        let tiny = BBox::new(0, 0, 4, 4);
        assert!(k.shrink_bbox(&tiny).is_err());
        let ok = k.shrink_bbox(&BBox::new(0, 0, 10, 10)).expect("fits");
        assert_eq!((ok.width(), ok.height()), (6, 6));
    }
}
