//! Exposure data model and image-processing primitives for PSF matching.
//!
//! This crate provides the pixel-level types the matching layer operates on
//! (`MaskedImage`, `Exposure`, `BBox`, `LinearWcs`, `GaussianPsf`) together
//! with the numerical collaborators it consumes: convolution, thresholded
//! source detection and measurement, polynomial background surfaces, robust
//! statistics, and bilinear warping.

pub mod background;
pub mod bbox;
pub mod convolve;
pub mod detect;
pub mod exposure;
pub mod masked_image;
pub mod psf;
pub mod stats;
pub mod warp;
pub mod wcs;

pub use background::{fit_background, BackgroundError, BackgroundModel};
pub use bbox::BBox;
pub use convolve::{convolve_same, convolve_unnormalized, convolve_valid};
pub use detect::{detect_sources, measure_sources, Source};
pub use exposure::{Exposure, PhotoCalib};
pub use masked_image::{mask_planes, ImageError, MaskedImage};
pub use psf::{GaussianPsf, SIGMA_TO_FWHM};
pub use warp::{warp_exposure, warp_masked_image};
pub use wcs::{AffineTransform, LinearWcs, WcsError};
