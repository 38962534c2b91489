//! Elliptical-Gaussian point-spread-function model.
//!
//! The model carries a 2x2 pixel-space covariance so it survives affine
//! resampling: warping an exposure re-projects the PSF by transforming the
//! covariance through the same pixel transform.

use nalgebra::Matrix2;
use ndarray::Array2;

/// FWHM = SIGMA_TO_FWHM * sigma for a Gaussian profile.
pub const SIGMA_TO_FWHM: f64 = 2.354_820_045_030_949;

/// Gaussian PSF parameterized by its pixel-space covariance matrix.
#[derive(Debug, Clone, Copy)]
pub struct GaussianPsf {
    covariance: Matrix2<f64>,
}

impl GaussianPsf {
    /// Circular PSF with the given sigma in pixels.
    pub fn from_sigma(sigma: f64) -> Self {
        Self {
            covariance: Matrix2::new(sigma * sigma, 0.0, 0.0, sigma * sigma),
        }
    }

    /// Circular PSF with the given FWHM in pixels.
    pub fn from_fwhm(fwhm: f64) -> Self {
        Self::from_sigma(fwhm / SIGMA_TO_FWHM)
    }

    /// Elliptical PSF from an explicit covariance matrix.
    pub fn from_covariance(covariance: Matrix2<f64>) -> Self {
        Self { covariance }
    }

    pub fn covariance(&self) -> Matrix2<f64> {
        self.covariance
    }

    /// Effective sigma: fourth root of the covariance determinant, the
    /// geometric mean of the principal widths.
    pub fn sigma(&self) -> f64 {
        self.covariance.determinant().abs().sqrt().sqrt()
    }

    /// Effective FWHM in pixels.
    pub fn fwhm(&self) -> f64 {
        SIGMA_TO_FWHM * self.sigma()
    }

    /// Unit-sum PSF image of odd side `size`, centered on the array center.
    pub fn kernel_image(&self, size: usize) -> Array2<f64> {
        let size = if size % 2 == 0 { size + 1 } else { size };
        let half = size as i64 / 2;
        let inv = self
            .covariance
            .try_inverse()
            .unwrap_or_else(|| Matrix2::identity());
        let mut img = Array2::zeros((size, size));
        let mut sum = 0.0;
        for r in 0..size {
            for c in 0..size {
                let dx = (c as i64 - half) as f64;
                let dy = (r as i64 - half) as f64;
                let q = inv[(0, 0)] * dx * dx
                    + (inv[(0, 1)] + inv[(1, 0)]) * dx * dy
                    + inv[(1, 1)] * dy * dy;
                let v = (-0.5 * q).exp();
                img[[r, c]] = v;
                sum += v;
            }
        }
        if sum > 0.0 {
            img.mapv_inplace(|v| v / sum);
        }
        img
    }

    /// Side length (odd) that contains the profile out to `n_sigma`.
    pub fn suggested_size(&self, n_sigma: f64) -> usize {
        let half = (n_sigma * self.sigma()).ceil().max(1.0) as usize;
        2 * half + 1
    }

    /// PSF as seen after resampling pixels through an affine transform with
    /// the given linear part: `C' = J C J^T`.
    pub fn transformed(&self, jacobian: &Matrix2<f64>) -> GaussianPsf {
        GaussianPsf {
            covariance: jacobian * self.covariance * jacobian.transpose(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fwhm_sigma_round_trip() {
        let psf = GaussianPsf::from_fwhm(4.7);
        assert_relative_eq!(psf.fwhm(), 4.7, epsilon = 1e-12);
        assert_relative_eq!(psf.sigma(), 4.7 / SIGMA_TO_FWHM, epsilon = 1e-12);
    }

    #[test]
    fn kernel_image_is_normalized_and_peaked() {
        let psf = GaussianPsf::from_sigma(1.5);
        let img = psf.kernel_image(11);
        let sum: f64 = img.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        // Central pixel dominates.
        let peak = img[[5, 5]];
        assert!(img.iter().all(|&v| v <= peak));
    }

    #[test]
    fn even_size_is_promoted_to_odd() {
        let psf = GaussianPsf::from_sigma(1.0);
        assert_eq!(psf.kernel_image(10).dim(), (11, 11));
    }

    #[test]
    fn transform_scales_covariance() {
        let psf = GaussianPsf::from_sigma(2.0);
        let j = Matrix2::new(0.5, 0.0, 0.0, 0.5);
        let t = psf.transformed(&j);
        assert_relative_eq!(t.sigma(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn anisotropic_transform_makes_elliptical_psf() {
        let psf = GaussianPsf::from_sigma(1.0);
        let j = Matrix2::new(2.0, 0.0, 0.0, 1.0);
        let t = psf.transformed(&j);
        let c = t.covariance();
        assert_relative_eq!(c[(0, 0)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(c[(1, 1)], 1.0, epsilon = 1e-12);
    }
}
