//! Observation hooks for matching checkpoints.
//!
//! Display and debugging tooling attaches here instead of through any
//! process-wide state: the orchestrator notifies the injected observer at
//! fixed checkpoints and otherwise never talks to it.

use astroimage::MaskedImage;

use crate::cells::SpatialCellSet;

/// Checkpoint notifications during one matching call.
///
/// All methods default to no-ops; implementors override the checkpoints they
/// care about. Implementations needing to record state use interior
/// mutability.
pub trait MatchObserver {
    /// The cell set is fully populated and about to be handed to the solver.
    fn pre_solve(&self, _cells: &SpatialCellSet) {}

    /// The matched (convolved) image has been produced.
    fn post_convolve(&self, _matched: &MaskedImage) {}

    /// The subtracted image has been produced.
    fn post_subtract(&self, _subtracted: &MaskedImage) {}
}

/// Observer that ignores every checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl MatchObserver for NullObserver {}
