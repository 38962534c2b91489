//! PSF-matching kernel derivation and image subtraction.
//!
//! Given a template and a science exposure of the same sky region, this
//! crate derives a spatially varying convolution kernel and differential
//! background that carry the template's PSF onto the science image's, then
//! produces the difference image used for transient detection. The pipeline
//! per call:
//!
//! 1. **Geometry** — registration check; warp the template (and its PSF)
//!    onto the science grid when permitted.
//! 2. **Candidates** — high-significance detection on the science exposure
//!    (or a caller-supplied list), normalized and vetted to kernel-sized
//!    footprints.
//! 3. **Cells** — a spatial grid over the image, each cell owning its
//!    kernel-fitting candidates.
//! 4. **Basis** — Alard-Lupton or delta-function kernels, optionally sized
//!    by a BIC search over basis degrees.
//! 5. **Solve** — weighted least squares through the [`KernelSolver`] seam.
//! 6. **Convolve + recombine** — unnormalized convolution and the
//!    direction-specific subtraction arithmetic.
//!
//! Entry point is [`ImagePsfMatcher`]; the heavy numerics live behind the
//! solver/warper traits so they can be replaced or instrumented.

pub mod basis;
pub mod candidates;
pub mod cells;
pub mod config;
pub mod error;
pub mod geometry;
pub mod matcher;
pub mod observer;
pub mod solver;

pub use basis::{select_basis, BasisList};
pub use candidates::{select_candidates, vet_candidates, Candidate, VettedCandidate};
pub use cells::{CellSizer, FixedCellSizer, KernelCandidate, SpatialCell, SpatialCellSet};
pub use config::{BasisConfig, BasisFamily, CandidateConfig, KernelConfig};
pub use error::{CandidateError, ConfigError, GeometryError, MatchError, SolveError};
pub use geometry::{validate_and_register, BilinearWarper, Warper};
pub use matcher::{
    Direction, ImagePsfMatcher, MaskedMatchResult, MaskedSubtractResult, MatchParams,
    MatchResult, SubtractResult,
};
pub use observer::{MatchObserver, NullObserver};
pub use solver::{KernelSolution, KernelSolver, LeastSquaresKernelSolver, SpatialKernelModel};

/// Convert a Gaussian FWHM to its sigma.
pub fn psf_fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / astroimage::SIGMA_TO_FWHM
}
