//! Image / mask / variance pixel planes with a parent-frame origin.
//!
//! A `MaskedImage` is the unit the matcher convolves and subtracts: a pixel
//! array plus a bitmask plane and a per-pixel variance plane, all indexed
//! `[row, col]` = `[y, x]`, with an `xy0` origin offset locating the array in
//! a larger parent mosaic.

use ndarray::{s, Array2};
use thiserror::Error;

use crate::bbox::BBox;

/// Mask-plane bit assignments.
pub mod mask_planes {
    /// Pixel is defective or otherwise unusable.
    pub const BAD: u16 = 1 << 0;
    /// Pixel is saturated.
    pub const SAT: u16 = 1 << 1;
    /// Pixel lies in a convolution or resampling edge region.
    pub const EDGE: u16 = 1 << 2;
    /// Pixel has no valid data (e.g. outside the warped footprint).
    pub const NO_DATA: u16 = 1 << 3;
    /// Pixel is part of a detection footprint.
    pub const DETECTED: u16 = 1 << 4;
}

/// Errors from masked-image construction and region extraction.
#[derive(Error, Debug)]
pub enum ImageError {
    /// Plane shapes disagree.
    #[error("plane shapes differ: image {image:?}, mask {mask:?}, variance {variance:?}")]
    PlaneShapeMismatch {
        image: (usize, usize),
        mask: (usize, usize),
        variance: (usize, usize),
    },

    /// Requested region is not contained in the image.
    #[error("bbox ({0:?}) not contained in image bbox ({1:?})")]
    BBoxOutOfBounds(BBox, BBox),

    /// Operand dimensions disagree for element-wise arithmetic.
    #[error("operand dimensions differ: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(usize, usize, usize, usize),
}

/// Pixel, mask and variance planes sharing one geometry.
#[derive(Debug, Clone)]
pub struct MaskedImage {
    image: Array2<f64>,
    mask: Array2<u16>,
    variance: Array2<f64>,
    xy0: (i64, i64),
}

impl MaskedImage {
    /// All-zero image of the given dimensions at origin (0, 0).
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            image: Array2::zeros((height, width)),
            mask: Array2::zeros((height, width)),
            variance: Array2::zeros((height, width)),
            xy0: (0, 0),
        }
    }

    /// Assemble from existing planes; shapes must agree.
    pub fn from_planes(
        image: Array2<f64>,
        mask: Array2<u16>,
        variance: Array2<f64>,
        xy0: (i64, i64),
    ) -> Result<Self, ImageError> {
        if image.dim() != mask.dim() || image.dim() != variance.dim() {
            return Err(ImageError::PlaneShapeMismatch {
                image: image.dim(),
                mask: mask.dim(),
                variance: variance.dim(),
            });
        }
        Ok(Self {
            image,
            mask,
            variance,
            xy0,
        })
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut Array2<f64> {
        &mut self.image
    }

    pub fn mask(&self) -> &Array2<u16> {
        &self.mask
    }

    pub fn mask_mut(&mut self) -> &mut Array2<u16> {
        &mut self.mask
    }

    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }

    pub fn variance_mut(&mut self) -> &mut Array2<f64> {
        &mut self.variance
    }

    pub fn xy0(&self) -> (i64, i64) {
        self.xy0
    }

    pub fn set_xy0(&mut self, xy0: (i64, i64)) {
        self.xy0 = xy0;
    }

    /// (width, height) of the pixel planes.
    pub fn dimensions(&self) -> (usize, usize) {
        let (h, w) = self.image.dim();
        (w, h)
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    /// Bounding box in parent coordinates.
    pub fn bbox(&self) -> BBox {
        BBox::from_origin_and_dims(self.xy0.0, self.xy0.1, self.width(), self.height())
    }

    /// Deep-copied sub-image at `bbox` (parent coordinates). The result's
    /// `xy0` is the bbox corner, so parent coordinates remain meaningful.
    pub fn subimage(&self, bbox: &BBox) -> Result<MaskedImage, ImageError> {
        let own = self.bbox();
        if !bbox.is_valid() || !own.contains(bbox) {
            return Err(ImageError::BBoxOutOfBounds(*bbox, own));
        }
        let r0 = (bbox.min_y - self.xy0.1) as usize;
        let c0 = (bbox.min_x - self.xy0.0) as usize;
        let r1 = r0 + bbox.height();
        let c1 = c0 + bbox.width();
        Ok(MaskedImage {
            image: self.image.slice(s![r0..r1, c0..c1]).to_owned(),
            mask: self.mask.slice(s![r0..r1, c0..c1]).to_owned(),
            variance: self.variance.slice(s![r0..r1, c0..c1]).to_owned(),
            xy0: (bbox.min_x, bbox.min_y),
        })
    }

    fn check_same_dims(&self, other: &MaskedImage) -> Result<(), ImageError> {
        if self.image.dim() != other.image.dim() {
            let (w, h) = self.dimensions();
            let (ow, oh) = other.dimensions();
            return Err(ImageError::DimensionMismatch(w, h, ow, oh));
        }
        Ok(())
    }

    /// `self += other` per plane: pixels add, variances add, masks OR.
    pub fn add_assign(&mut self, other: &MaskedImage) -> Result<(), ImageError> {
        self.check_same_dims(other)?;
        self.image += &other.image;
        self.variance += &other.variance;
        self.mask.zip_mut_with(&other.mask, |m, o| *m |= o);
        Ok(())
    }

    /// `self -= other` per plane: pixels subtract, variances add, masks OR.
    pub fn sub_assign(&mut self, other: &MaskedImage) -> Result<(), ImageError> {
        self.check_same_dims(other)?;
        self.image -= &other.image;
        self.variance += &other.variance;
        self.mask.zip_mut_with(&other.mask, |m, o| *m |= o);
        Ok(())
    }

    /// Subtract a pixel plane (no mask or variance contribution), e.g. a
    /// background surface.
    pub fn sub_image_plane(&mut self, plane: &Array2<f64>) -> Result<(), ImageError> {
        if self.image.dim() != plane.dim() {
            let (w, h) = self.dimensions();
            return Err(ImageError::DimensionMismatch(w, h, plane.ncols(), plane.nrows()));
        }
        self.image -= plane;
        Ok(())
    }

    /// Add a pixel plane (no mask or variance contribution).
    pub fn add_image_plane(&mut self, plane: &Array2<f64>) -> Result<(), ImageError> {
        if self.image.dim() != plane.dim() {
            let (w, h) = self.dimensions();
            return Err(ImageError::DimensionMismatch(w, h, plane.ncols(), plane.nrows()));
        }
        self.image += plane;
        Ok(())
    }

    pub fn sub_scalar(&mut self, value: f64) {
        self.image -= value;
    }

    pub fn add_scalar(&mut self, value: f64) {
        self.image += value;
    }

    /// Scale pixels by `value`; variance scales by `value²`.
    pub fn mul_scalar(&mut self, value: f64) {
        self.image *= value;
        self.variance *= value * value;
    }

    /// Divide pixels by `value`; variance scales by `1/value²`.
    pub fn div_scalar(&mut self, value: f64) {
        self.mul_scalar(1.0 / value);
    }

    /// Overwrite all planes from `other`, keeping this image's `xy0`.
    pub fn assign(&mut self, other: &MaskedImage) -> Result<(), ImageError> {
        self.check_same_dims(other)?;
        self.image.assign(&other.image);
        self.mask.assign(&other.mask);
        self.variance.assign(&other.variance);
        Ok(())
    }

    /// OR mask bits into every pixel of the plane.
    pub fn or_mask(&mut self, bits: u16) {
        self.mask.mapv_inplace(|m| m | bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(width: usize, height: usize, xy0: (i64, i64)) -> MaskedImage {
        let image = Array2::from_shape_fn((height, width), |(r, c)| (r * width + c) as f64);
        let variance = Array2::from_elem((height, width), 1.0);
        let mask = Array2::zeros((height, width));
        MaskedImage::from_planes(image, mask, variance, xy0).unwrap()
    }

    #[test]
    fn bbox_respects_xy0() {
        let mi = ramp(8, 4, (10, 20));
        assert_eq!(mi.bbox(), BBox::from_corners(10, 20, 17, 23));
    }

    #[test]
    fn subimage_uses_parent_coordinates() {
        let mi = ramp(8, 4, (10, 20));
        let sub = mi.subimage(&BBox::from_corners(12, 21, 14, 22)).unwrap();
        assert_eq!(sub.dimensions(), (3, 2));
        assert_eq!(sub.xy0(), (12, 21));
        // Parent (12, 21) is local (col 2, row 1) in the source ramp.
        assert_relative_eq!(sub.image()[[0, 0]], (1 * 8 + 2) as f64);
    }

    #[test]
    fn subimage_out_of_bounds_errors() {
        let mi = ramp(8, 4, (0, 0));
        let err = mi.subimage(&BBox::from_corners(5, 1, 9, 2)).unwrap_err();
        assert!(matches!(err, ImageError::BBoxOutOfBounds(_, _)));
    }

    #[test]
    fn sub_assign_combines_masks_and_variance() {
        let mut a = ramp(4, 4, (0, 0));
        let mut b = ramp(4, 4, (0, 0));
        b.mask_mut()[[2, 2]] = mask_planes::SAT;
        a.sub_assign(&b).unwrap();
        assert_relative_eq!(a.image()[[3, 3]], 0.0);
        assert_relative_eq!(a.variance()[[0, 0]], 2.0);
        assert_eq!(a.mask()[[2, 2]], mask_planes::SAT);
    }

    #[test]
    fn scalar_round_trip_restores_pixels() {
        let mut mi = ramp(4, 4, (0, 0));
        let before = mi.image().clone();
        mi.sub_scalar(17.25);
        mi.add_scalar(17.25);
        for (a, b) in mi.image().iter().zip(before.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-12);
        }
    }

    #[test]
    fn mul_scalar_scales_variance_quadratically() {
        let mut mi = ramp(2, 2, (0, 0));
        mi.mul_scalar(-3.0);
        assert_relative_eq!(mi.variance()[[0, 0]], 9.0);
        assert_relative_eq!(mi.image()[[1, 1]], -9.0);
    }
}
