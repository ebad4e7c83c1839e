//! Dense image, mask-plane, and footprint types consumed by the solvers.
//!
//! Pixel storage is `ndarray::Array2<f64>` with `(row, col) = (y, x)`;
//! every image carries an integer origin so sub-views keep their sky-frame
//! coordinates. The matrix views here are what the stamp builder consumes:
//! element `(row, col)` of a view corresponds to pixel `(x = col, y = row)`
//! of the selected rectangle.

use crate::geom::BBox;
use crate::solution::SolutionError;
use ndarray::{Array2, s};
use std::cmp::Ordering;

/// A single-plane f64 image with an integer origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Array2<f64>,
    x0: i32,
    y0: i32,
}

impl Image {
    pub fn new(data: Array2<f64>) -> Self {
        Self { data, x0: 0, y0: 0 }
    }

    pub fn with_origin(data: Array2<f64>, x0: i32, y0: i32) -> Self {
        Self { data, x0, y0 }
    }

    pub fn from_elem(width: usize, height: usize, value: f64) -> Self {
        Self::new(Array2::from_elem((height, width), value))
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.x0, self.y0, self.width(), self.height())
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    /// Pixel value at sky-frame coordinates. The caller guarantees
    /// containment; this is the hot accessor used inside validated loops.
    #[inline]
    pub fn value(&self, x: i32, y: i32) -> f64 {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]]
    }

    #[inline]
    pub fn set_value(&mut self, x: i32, y: i32, v: f64) {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]] = v;
    }

    fn local_slice(&self, bbox: &BBox) -> Result<ndarray::ArrayView2<'_, f64>, SolutionError> {
        if !self.bbox().contains(bbox) {
            return Err(SolutionError::InvalidInput(format!(
                "rectangle ({},{}) {}x{} not contained in image ({},{}) {}x{}",
                bbox.min_x(),
                bbox.min_y(),
                bbox.width(),
                bbox.height(),
                self.x0,
                self.y0,
                self.width(),
                self.height()
            )));
        }
        let ry = (bbox.min_y() - self.y0) as usize;
        let rx = (bbox.min_x() - self.x0) as usize;
        Ok(self
            .data
            .slice(s![ry..ry + bbox.height(), rx..rx + bbox.width()]))
    }

    /// Owned matrix view of a rectangle, `(row, col) = (y, x)` relative to
    /// the rectangle's corner.
    pub fn matrix(&self, bbox: &BBox) -> Result<Array2<f64>, SolutionError> {
        Ok(self.local_slice(bbox)?.to_owned())
    }

    /// Element-wise inverse of a variance rectangle. Fails if any selected
    /// pixel is negative (no meaning) or zero (cannot inverse-variance
    /// weight), with distinct messages for the two cases.
    pub fn inverse_variance_matrix(&self, bbox: &BBox) -> Result<Array2<f64>, SolutionError> {
        let view = self.local_slice(bbox)?;
        let min = view.iter().copied().fold(f64::INFINITY, f64::min);
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
        Ok(view.mapv(|v| 1.0 / v))
    }

    /// Owned rectangular sub-image keeping sky-frame coordinates.
    pub fn subimage(&self, bbox: &BBox) -> Result<Image, SolutionError> {
        Ok(Image::with_origin(
            self.local_slice(bbox)?.to_owned(),
            bbox.min_x(),
            bbox.min_y(),
        ))
    }

    pub fn min(&self) -> f64 {
        self.data.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Median pixel value (upper median for even counts).
    pub fn median(&self) -> f64 {
        let mut values: Vec<f64> = self.data.iter().copied().collect();
        if values.is_empty() {
            return f64::NAN;
        }
        let mid = values.len() / 2;
        let (_, m, _) = values.select_nth_unstable_by(mid, |a, b| {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        });
        *m
    }
}

/// Bit-plane mask sharing an image's shape and origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: Array2<u32>,
    x0: i32,
    y0: i32,
}

impl Mask {
    pub const BAD: u32 = 1 << 0;
    pub const SAT: u32 = 1 << 1;
    pub const NO_DATA: u32 = 1 << 2;
    pub const EDGE: u32 = 1 << 3;

    pub fn new(width: usize, height: usize) -> Self {
        Self {
            data: Array2::zeros((height, width)),
            x0: 0,
            y0: 0,
        }
    }

    pub fn with_origin(data: Array2<u32>, x0: i32, y0: i32) -> Self {
        Self { data, x0, y0 }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn bbox(&self) -> BBox {
        BBox::new(self.x0, self.y0, self.width(), self.height())
    }

    pub fn data(&self) -> &Array2<u32> {
        &self.data
    }

    /// Bit for a named plane; unknown names are a configuration error.
    pub fn plane_bitmask(name: &str) -> Result<u32, SolutionError> {
        match name {
            "BAD" => Ok(Self::BAD),
            "SAT" => Ok(Self::SAT),
            "NO_DATA" => Ok(Self::NO_DATA),
            "EDGE" => Ok(Self::EDGE),
            other => Err(SolutionError::InvalidInput(format!(
                "unknown mask plane '{other}'"
            ))),
        }
    }

    /// The planes excluded from kernel fits.
    pub fn bad_pixel_bitmask() -> u32 {
        Self::BAD | Self::SAT | Self::NO_DATA | Self::EDGE
    }

    #[inline]
    pub fn value(&self, x: i32, y: i32) -> u32 {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]]
    }

    #[inline]
    pub fn or_value(&mut self, x: i32, y: i32, bits: u32) {
        self.data[[(y - self.y0) as usize, (x - self.x0) as usize]] |= bits;
    }

    /// Boolean footprint of pixels with any of `bitmask` set, in local
    /// (row, col) layout.
    pub fn threshold_footprint(&self, bitmask: u32) -> Array2<bool> {
        self.data.mapv(|v| v & bitmask != 0)
    }
}

/// Binary dilation by a square structuring element of the given half-width,
/// the footprint grow applied before masked builds. A square of half-width
/// equal to the kernel half-width covers exactly the pixels whose
/// convolution stencil touches the footprint.
pub fn grow_footprint(footprint: &Array2<bool>, radius: usize) -> Array2<bool> {
    if radius == 0 {
        return footprint.clone();
    }
    let (h, w) = footprint.dim();
    let r = radius as i32;

    // Scatter from each set pixel; cheap for the sparse footprints seen in
    // practice.
    let mut grown = Array2::from_elem((h, w), false);
    for row in 0..h {
        for col in 0..w {
            if !footprint[[row, col]] {
                continue;
            }
            let r0 = (row as i32 - r).max(0) as usize;
            let r1 = ((row as i32 + r) as usize).min(h - 1);
            let c0 = (col as i32 - r).max(0) as usize;
            let c1 = ((col as i32 + r) as usize).min(w - 1);
            for gr in r0..=r1 {
                for gc in c0..=c1 {
                    grown[[gr, gc]] = true;
                }
            }
        }
    }
    grown
}

/// An image plane with its mask and per-pixel variance, all one shape.
#[derive(Debug, Clone)]
pub struct MaskedImage {
    pub image: Image,
    pub mask: Mask,
    pub variance: Image,
}

impl MaskedImage {
    pub fn new(image: Image, variance: Image) -> Result<Self, SolutionError> {
        let mask = Mask::with_origin(
            Array2::zeros((image.height(), image.width())),
            image.bbox().min_x(),
            image.bbox().min_y(),
        );
        Self::with_mask(image, mask, variance)
    }

    pub fn with_mask(image: Image, mask: Mask, variance: Image) -> Result<Self, SolutionError> {
        if image.bbox() != variance.bbox() || image.bbox() != mask.bbox() {
            return Err(SolutionError::InvalidInput(format!(
                "masked image planes disagree: image {:?}, mask {:?}, variance {:?}",
                image.bbox(),
                mask.bbox(),
                variance.bbox()
            )));
        }
        Ok(Self {
            image,
            mask,
            variance,
        })
    }

    pub fn bbox(&self) -> BBox {
        self.image.bbox()
    }
}
