//! Error taxonomy for the matching pipeline.
//!
//! All variants are fatal to the current call; nothing is retried internally.
//! The one sanctioned degradation — background-fit failure during candidate
//! selection — downgrades to a robust median estimate inside
//! `candidates::select_candidates` and never surfaces here.

use astroimage::bbox::BBox;
use thiserror::Error;

/// Geometry and registration failures.
#[derive(Error, Debug)]
pub enum GeometryError {
    /// The two exposures share no sky area at all.
    #[error("input images do not overlap on the sky")]
    NoOverlap,

    /// Exposures are not pixel-registered and warping was not allowed.
    #[error("input images not registered")]
    NotRegistered,

    /// Template/science pixel dimensions disagree.
    #[error("input images different size: {0}x{1} vs {2}x{3}")]
    DimensionMismatch(usize, usize, usize, usize),

    /// WCS composition failed (singular CD matrix).
    #[error("wcs error: {0}")]
    Wcs(#[from] astroimage::WcsError),
}

/// Candidate-list failures.
#[derive(Error, Debug)]
pub enum CandidateError {
    /// No candidates were supplied or detected.
    #[error("candidate list is empty")]
    EmptyInput,

    /// Every candidate was rejected during footprint vetting.
    #[error("no usable candidates after footprint vetting")]
    NoUsable,

    /// A footprint could not be extracted from one of the images.
    #[error("footprint {0:?} outside image bounds")]
    OutOfBounds(BBox),
}

/// Configuration failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Basis parameters are inconsistent (lengths, sizes, widths).
    #[error("kernel basis mis-specified: {0}")]
    Basis(String),

    /// The kernel configuration could not be serialized for candidates.
    #[error("failed to serialize kernel configuration: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Spatial-solve failures from the kernel solver.
#[derive(Error, Debug)]
pub enum SolveError {
    /// Fewer usable candidates than the configured floor.
    #[error("too few usable candidates for spatial fit: {have} < {need}")]
    TooFewCandidates { have: usize, need: usize },

    /// The normal equations could not be solved.
    #[error("kernel normal equations are singular")]
    Singular,

    /// The serialized configuration carried by a candidate is unreadable.
    #[error("candidate kernel configuration unreadable: {0}")]
    BadCandidateConfig(String),

    /// The fitted kernel has a (near-)zero pixel sum and cannot carry a
    /// photometric scale.
    #[error("fitted kernel pixel sum is degenerate ({0:.3e})")]
    DegenerateKernel(f64),
}

/// Top-level error for one matching or subtraction call.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Candidate(#[from] CandidateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error("image error: {0}")]
    Image(#[from] astroimage::ImageError),
}
