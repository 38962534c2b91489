//! Matching configuration.
//!
//! One `KernelConfig` drives a whole matching call. A serialized JSON copy
//! travels with every kernel candidate so the solver can read fitting
//! parameters without a second configuration dependency.

use serde::{Deserialize, Serialize};

/// Which basis-kernel family the solver expands the matching kernel in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BasisFamily {
    /// Gaussians modulated by polynomials (compact, smooth kernels).
    #[default]
    AlardLupton,
    /// One delta function per kernel pixel (fully general, many unknowns).
    DeltaFunction,
}

/// Basis generation and sizing controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasisConfig {
    /// Basis family to expand the matching kernel in.
    pub family: BasisFamily,
    /// Base Gaussian widths (pixels) for the Alard-Lupton family.
    pub base_sigmas: Vec<f64>,
    /// Polynomial degree modulating each Gaussian; must pair with
    /// `base_sigmas`.
    pub deg_gauss: Vec<usize>,
    /// Scale kernel size and Gaussian widths from the PSF FWHMs when known.
    pub scale_by_fwhm: bool,
    /// Fixed kernel side (odd) used when `scale_by_fwhm` is off or no FWHM
    /// is available.
    pub kernel_size: usize,
    /// Kernel side as a multiple of the reference FWHM.
    pub kernel_size_fwhm_scaling: f64,
    /// Lower clamp on the derived kernel side.
    pub kernel_size_min: usize,
    /// Upper clamp on the derived kernel side.
    pub kernel_size_max: usize,
    /// Select the leading Gaussian degree with a BIC search before solving.
    pub use_bic_for_basis: bool,
    /// Candidate degrees for the BIC search.
    pub bic_first_degrees: Vec<usize>,
}

impl Default for BasisConfig {
    fn default() -> Self {
        Self {
            family: BasisFamily::AlardLupton,
            base_sigmas: vec![0.7, 1.5, 3.0],
            deg_gauss: vec![4, 2, 2],
            scale_by_fwhm: true,
            kernel_size: 21,
            kernel_size_fwhm_scaling: 6.0,
            kernel_size_min: 21,
            kernel_size_max: 35,
            use_bic_for_basis: false,
            bic_first_degrees: vec![2, 3, 4, 5, 6],
        }
    }
}

/// Candidate detection and vetting controls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateConfig {
    /// Detection significance threshold, in units of the clipped image noise.
    pub threshold_sigma: f64,
    /// Smooth with the exposure PSF before thresholding.
    pub smooth_before_detection: bool,
    /// Mask bits that veto a candidate when present in either patch.
    pub veto_mask: u16,
    /// Polynomial order of the pre-detection background fit.
    pub background_fit_order: usize,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            threshold_sigma: 10.0,
            smooth_before_detection: true,
            veto_mask: astroimage::mask_planes::BAD
                | astroimage::mask_planes::SAT
                | astroimage::mask_planes::NO_DATA,
            background_fit_order: 1,
        }
    }
}

/// Top-level kernel-matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Basis generation and sizing.
    pub basis: BasisConfig,
    /// Candidate detection and vetting.
    pub candidate: CandidateConfig,
    /// Spatial-cell width in pixels.
    pub size_cell_x: usize,
    /// Spatial-cell height in pixels.
    pub size_cell_y: usize,
    /// Polynomial order of the kernel's spatial variation.
    pub spatial_kernel_order: usize,
    /// Fit a differential background alongside the kernel.
    pub fit_for_background: bool,
    /// Polynomial order of the differential background.
    pub spatial_bg_order: usize,
    /// Minimum usable candidates required by the solver.
    pub min_usable_candidates: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            basis: BasisConfig::default(),
            candidate: CandidateConfig::default(),
            size_cell_x: 128,
            size_cell_y: 128,
            spatial_kernel_order: 1,
            fit_for_background: true,
            spatial_bg_order: 1,
            min_usable_candidates: 3,
        }
    }
}
