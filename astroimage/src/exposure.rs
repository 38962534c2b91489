//! Calibrated exposures: pixels plus the metadata matching needs.

use serde::{Deserialize, Serialize};

use crate::masked_image::MaskedImage;
use crate::psf::GaussianPsf;
use crate::wcs::LinearWcs;

/// Scalar photometric calibration carried through matching untouched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotoCalib {
    /// Mean instrumental-flux-to-nJy calibration factor.
    pub calibration_mean: f64,
}

impl Default for PhotoCalib {
    fn default() -> Self {
        Self {
            calibration_mean: 1.0,
        }
    }
}

/// A labeled image region: pixels, WCS, PSF model and photometric
/// calibration. The matcher reads exposures and, when warping, produces a
/// new one; callers retain ownership of their inputs.
#[derive(Debug, Clone)]
pub struct Exposure {
    masked_image: MaskedImage,
    wcs: LinearWcs,
    psf: Option<GaussianPsf>,
    photo_calib: PhotoCalib,
    filter: String,
}

impl Exposure {
    pub fn new(masked_image: MaskedImage, wcs: LinearWcs) -> Self {
        Self {
            masked_image,
            wcs,
            psf: None,
            photo_calib: PhotoCalib::default(),
            filter: String::new(),
        }
    }

    pub fn with_psf(mut self, psf: GaussianPsf) -> Self {
        self.psf = Some(psf);
        self
    }

    pub fn with_photo_calib(mut self, photo_calib: PhotoCalib) -> Self {
        self.photo_calib = photo_calib;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn masked_image(&self) -> &MaskedImage {
        &self.masked_image
    }

    pub fn masked_image_mut(&mut self) -> &mut MaskedImage {
        &mut self.masked_image
    }

    pub fn wcs(&self) -> &LinearWcs {
        &self.wcs
    }

    pub fn psf(&self) -> Option<&GaussianPsf> {
        self.psf.as_ref()
    }

    pub fn set_psf(&mut self, psf: Option<GaussianPsf>) {
        self.psf = psf;
    }

    pub fn photo_calib(&self) -> PhotoCalib {
        self.photo_calib
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn set_filter(&mut self, filter: impl Into<String>) {
        self.filter = filter.into();
    }

    /// (width, height) of the pixel planes.
    pub fn dimensions(&self) -> (usize, usize) {
        self.masked_image.dimensions()
    }

    pub fn bbox(&self) -> crate::bbox::BBox {
        self.masked_image.bbox()
    }
}
