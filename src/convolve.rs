//! Kernel-centered convolution.
//!
//! Convention (matching the stamp builder's good-region arithmetic):
//! `out(x, y) = Σ_{i,j} k(i, j) · in(x + i − ctrX, y + j − ctrY)`.
//! Output pixels whose stencil would leave the input are left at zero; the
//! valid output is exactly the input box shrunk by the kernel half-width.

use crate::image::Image;
use crate::kernel::BasisKernel;
use crate::solution::SolutionError;
use ndarray::Array2;

/// Convolve a raw array with a kernel array centered at `(ctr_x, ctr_y)`.
/// The output has the input's shape with the edge border left at zero.
pub fn convolve_arrays(
    src: &Array2<f64>,
    kernel: &Array2<f64>,
    ctr_x: usize,
    ctr_y: usize,
) -> Array2<f64> {
    let (h, w) = src.dim();
    let (kh, kw) = kernel.dim();
    let mut out = Array2::<f64>::zeros((h, w));
    if w < kw || h < kh {
        return out;
    }

    let x_end = w - (kw - ctr_x - 1);
    let y_end = h - (kh - ctr_y - 1);
    for y in ctr_y..y_end {
        for x in ctr_x..x_end {
            let mut sum = 0.0;
            for j in 0..kh {
                let sy = y + j - ctr_y;
                for i in 0..kw {
                    let sx = x + i - ctr_x;
                    sum += kernel[[j, i]] * src[[sy, sx]];
                }
            }
            out[[y, x]] = sum;
        }
    }
    out
}

/// Convolve an image with a basis kernel, keeping the image's origin. Only
/// the good region of the result is meaningful.
pub fn convolve(image: &Image, kernel: &BasisKernel) -> Result<Image, SolutionError> {
    let bbox = image.bbox();
    if image.width() < kernel.width() || image.height() < kernel.height() {
        return Err(SolutionError::InvalidInput(format!(
            "image {}x{} smaller than kernel {}x{}",
            image.width(),
            image.height(),
            kernel.width(),
            kernel.height()
        )));
    }
    let data = convolve_arrays(image.data(), kernel.data(), kernel.ctr_x(), kernel.ctr_y());
    Ok(Image::with_origin(data, bbox.min_x(), bbox.min_y()))
}
