//! Residual statistics of difference images.
//!
//! Residuals are `image / √variance`, so for a well-matched kernel they are
//! unit-variance noise: the mean and rms feed candidate chi² and the
//! visitor's clipping gates.

use crate::geom::{BBox, Point2};
use crate::image::{Mask, MaskedImage};
use crate::solution::SolutionError;

#[derive(Debug, Clone, Copy)]
pub struct ImageStatistics {
    mean: f64,
    variance: f64,
    npix: usize,
}

impl ImageStatistics {
    /// Statistics over every usable pixel.
    pub fn apply(diffim: &MaskedImage) -> Result<Self, SolutionError> {
        Self::over_region(diffim, &diffim.bbox())
    }

    /// Statistics over the central core: a square of half-width `radius`
    /// around the stamp center, clipped to the image.
    pub fn apply_core(diffim: &MaskedImage, radius: usize) -> Result<Self, SolutionError> {
        let bbox = diffim.bbox();
        let cx = bbox.min_x() + (bbox.width() / 2) as i32;
        let cy = bbox.min_y() + (bbox.height() / 2) as i32;
        let r = radius as i32;
        let core = BBox::from_corners(Point2::new(cx - r, cy - r), Point2::new(cx + r, cy + r))
            .clipped_to(&bbox);
        Self::over_region(diffim, &core)
    }

    fn over_region(diffim: &MaskedImage, region: &BBox) -> Result<Self, SolutionError> {
        let bad = Mask::bad_pixel_bitmask();
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut npix = 0usize;

        for y in region.min_y()..=region.max_y() {
            for x in region.min_x()..=region.max_x() {
                if diffim.mask.value(x, y) & bad != 0 {
                    continue;
                }
                let var = diffim.variance.value(x, y);
                if !(var > 0.0) {
                    continue;
                }
                let r = diffim.image.value(x, y) / var.sqrt();
                if !r.is_finite() {
                    continue;
                }
                sum += r;
                sum_sq += r * r;
                npix += 1;
            }
        }

        if npix == 0 {
            return Err(SolutionError::InvalidInput(
                "no usable pixels for image statistics".to_string(),
            ));
        }
        let mean = sum / npix as f64;
        let variance = if npix > 1 {
            (sum_sq - npix as f64 * mean * mean) / (npix as f64 - 1.0)
        } else {
            0.0
        };
        Ok(Self {
            mean,
            variance: variance.max(0.0),
            npix,
        })
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn rms(&self) -> f64 {
        self.variance.sqrt()
    }

    pub fn npix(&self) -> usize {
        self.npix
    }
}
