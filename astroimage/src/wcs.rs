//! Flat-sky linear world coordinate systems.
//!
//! The matcher only needs a pixel <-> sky mapping good enough to decide
//! registration and to drive resampling: `sky = crval + cd * (pixel - crpix)`
//! with sky coordinates in degrees on a locally flat tangent plane. The CD
//! matrix must be invertible so the mapping runs both ways.

use nalgebra::{Matrix2, Vector2};
use thiserror::Error;

/// Errors from WCS construction and composition.
#[derive(Error, Debug)]
pub enum WcsError {
    /// The CD matrix does not admit an inverse.
    #[error("CD matrix is singular (det = {0:.3e})")]
    SingularCd(f64),
}

/// Affine pixel-to-pixel transform `p' = linear * p + offset`.
#[derive(Debug, Clone, Copy)]
pub struct AffineTransform {
    pub linear: Matrix2<f64>,
    pub offset: Vector2<f64>,
}

impl AffineTransform {
    pub fn apply(&self, p: Vector2<f64>) -> Vector2<f64> {
        self.linear * p + self.offset
    }

    pub fn inverse(&self) -> Result<AffineTransform, WcsError> {
        let inv = self
            .linear
            .try_inverse()
            .ok_or_else(|| WcsError::SingularCd(self.linear.determinant()))?;
        Ok(AffineTransform {
            linear: inv,
            offset: -inv * self.offset,
        })
    }
}

/// Linear WCS: `sky = crval + cd * (pixel - crpix)`, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearWcs {
    crpix: Vector2<f64>,
    crval: Vector2<f64>,
    cd: Matrix2<f64>,
}

impl LinearWcs {
    /// Build a WCS; fails when `cd` is singular.
    pub fn new(
        crpix: (f64, f64),
        crval: (f64, f64),
        cd: Matrix2<f64>,
    ) -> Result<Self, WcsError> {
        if cd.try_inverse().is_none() {
            return Err(WcsError::SingularCd(cd.determinant()));
        }
        Ok(Self {
            crpix: Vector2::new(crpix.0, crpix.1),
            crval: Vector2::new(crval.0, crval.1),
            cd,
        })
    }

    /// North-up square-pixel WCS with the given plate scale in deg/px.
    pub fn simple(crpix: (f64, f64), crval: (f64, f64), scale_deg_per_px: f64) -> Result<Self, WcsError> {
        Self::new(
            crpix,
            crval,
            Matrix2::new(scale_deg_per_px, 0.0, 0.0, scale_deg_per_px),
        )
    }

    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let s = self.crval + self.cd * (Vector2::new(x, y) - self.crpix);
        (s.x, s.y)
    }

    pub fn sky_to_pixel(&self, lon: f64, lat: f64) -> (f64, f64) {
        // Invertibility is checked at construction.
        let inv = self.cd.try_inverse().unwrap_or_else(Matrix2::zeros);
        let p = self.crpix + inv * (Vector2::new(lon, lat) - self.crval);
        (p.x, p.y)
    }

    /// Affine transform taking pixels in this frame to pixels in `dest`.
    pub fn pixel_transform_to(&self, dest: &LinearWcs) -> Result<AffineTransform, WcsError> {
        let dest_inv = dest
            .cd
            .try_inverse()
            .ok_or_else(|| WcsError::SingularCd(dest.cd.determinant()))?;
        let linear = dest_inv * self.cd;
        let offset = dest.crpix + dest_inv * (self.crval - dest.crval) - linear * self.crpix;
        Ok(AffineTransform { linear, offset })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pixel_sky_round_trip() {
        let cd = Matrix2::new(2.8e-4, 1.0e-5, -1.0e-5, 2.8e-4);
        let wcs = LinearWcs::new((512.0, 512.0), (150.1, 2.2), cd).unwrap();
        let (lon, lat) = wcs.pixel_to_sky(100.0, 731.5);
        let (x, y) = wcs.sky_to_pixel(lon, lat);
        assert_relative_eq!(x, 100.0, epsilon = 1e-9);
        assert_relative_eq!(y, 731.5, epsilon = 1e-9);
    }

    #[test]
    fn singular_cd_rejected() {
        let cd = Matrix2::new(1.0, 2.0, 2.0, 4.0);
        assert!(matches!(
            LinearWcs::new((0.0, 0.0), (0.0, 0.0), cd),
            Err(WcsError::SingularCd(_))
        ));
    }

    #[test]
    fn pixel_transform_maps_shared_sky_position() {
        let a = LinearWcs::simple((0.0, 0.0), (10.0, -5.0), 1e-4).unwrap();
        let b = LinearWcs::simple((25.0, -8.0), (10.0, -5.0), 1e-4).unwrap();
        let t = a.pixel_transform_to(&b).unwrap();
        // Pixel (3, 4) in frame a and its image under t see the same sky.
        let p = t.apply(Vector2::new(3.0, 4.0));
        let (lon_a, lat_a) = a.pixel_to_sky(3.0, 4.0);
        let (lon_b, lat_b) = b.pixel_to_sky(p.x, p.y);
        assert_relative_eq!(lon_a, lon_b, epsilon = 1e-12);
        assert_relative_eq!(lat_a, lat_b, epsilon = 1e-12);
    }

    #[test]
    fn transform_inverse_round_trips() {
        let t = AffineTransform {
            linear: Matrix2::new(1.2, 0.1, -0.1, 0.9),
            offset: Vector2::new(4.0, -7.0),
        };
        let inv = t.inverse().unwrap();
        let p = Vector2::new(13.0, 5.5);
        let q = inv.apply(t.apply(p));
        assert_relative_eq!(q.x, p.x, epsilon = 1e-12);
        assert_relative_eq!(q.y, p.y, epsilon = 1e-12);
    }
}
