//! Match orchestration: validate, select, build, solve, convolve, recombine.
//!
//! One `ImagePsfMatcher` call runs the full pipeline over a template/science
//! pair and returns a fresh result bundle; nothing persists across calls.
//! The two fitting directions are explicit strategies sharing this skeleton,
//! so the recombination arithmetic of each stays independently testable.

use astroimage::exposure::Exposure;
use astroimage::masked_image::MaskedImage;
use tracing::{error, info, warn};

use crate::basis;
use crate::candidates::{self, Candidate, VettedCandidate};
use crate::cells::{build_cell_set, CellSizer, FixedCellSizer, SpatialCellSet};
use crate::config::KernelConfig;
use crate::error::{CandidateError, GeometryError, MatchError, SolveError};
use crate::geometry::{self, BilinearWarper, Warper};
use crate::observer::{MatchObserver, NullObserver};
use crate::solver::{KernelSolution, KernelSolver, LeastSquaresKernelSolver};

/// Which image gets convolved by the matching kernel.
///
/// Convolving the template is the default and preferred path: the template
/// is usually the sharper image, and matching it to the science PSF avoids
/// deconvolution noise amplification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    ConvolveTemplate,
    ConvolveScience,
}

/// Per-call matching parameters.
#[derive(Debug, Clone, Default)]
pub struct MatchParams {
    /// Template PSF FWHM in pixels; read from the template PSF when absent.
    pub template_fwhm: Option<f64>,
    /// Science PSF FWHM in pixels; read from the science PSF when absent.
    pub science_fwhm: Option<f64>,
    /// Kernel candidates; detection runs on the science exposure when absent.
    pub candidates: Option<Vec<Candidate>>,
    /// Warp the template when the exposures are not registered.
    pub allow_warp: bool,
    /// Fitting direction.
    pub direction: Direction,
}

impl MatchParams {
    pub fn new() -> Self {
        Self {
            allow_warp: true,
            ..Default::default()
        }
    }
}

/// Result of matching at the masked-image level.
#[derive(Debug, Clone)]
pub struct MaskedMatchResult {
    /// The to-convolve image convolved with the matching kernel.
    pub matched_image: MaskedImage,
    /// Kernel and differential background models.
    pub solution: KernelSolution,
    /// Cell set the solver consumed.
    pub cells: SpatialCellSet,
}

/// Result of matching at the exposure level.
#[derive(Debug)]
pub struct MatchResult {
    /// PSF-matched exposure: science WCS and calibration, template filter,
    /// no PSF (matching does not produce one).
    pub matched: Exposure,
    /// Template after registration (warped when the grids differed).
    pub warped_template: Exposure,
    /// Kernel and differential background models.
    pub solution: KernelSolution,
    /// Cell set the solver consumed.
    pub cells: SpatialCellSet,
    /// Whether the inputs were already registered.
    pub registered: bool,
}

/// Result of subtraction at the exposure level.
#[derive(Debug)]
pub struct SubtractResult {
    /// Difference exposure in the science-minus-template sign convention.
    pub subtracted: Exposure,
    pub matched: Exposure,
    pub warped_template: Exposure,
    pub solution: KernelSolution,
    pub cells: SpatialCellSet,
}

/// Result of subtraction at the masked-image level.
#[derive(Debug, Clone)]
pub struct MaskedSubtractResult {
    pub subtracted: MaskedImage,
    pub matched_image: MaskedImage,
    pub solution: KernelSolution,
    pub cells: SpatialCellSet,
}

/// One fitting direction: image ordering, FWHM ordering, and the
/// recombination arithmetic.
trait DirectionStrategy {
    fn name(&self) -> &'static str;

    /// `(to_convolve, reference)` ordering of the masked images.
    fn order<'a>(
        &self,
        template: &'a MaskedImage,
        science: &'a MaskedImage,
    ) -> (&'a MaskedImage, &'a MaskedImage);

    /// `(target, reference)` ordering of the FWHMs for basis sizing.
    fn order_fwhm(
        &self,
        template_fwhm: Option<f64>,
        science_fwhm: Option<f64>,
    ) -> (Option<f64>, Option<f64>);

    /// Combine the matched image and background into the difference
    /// exposure.
    fn recombine(
        &self,
        science: &Exposure,
        warped_template: &Exposure,
        matched: &Exposure,
        solution: &KernelSolution,
    ) -> Result<Exposure, MatchError>;
}

/// `subtracted = science - (matched + background)`.
struct ConvolveTemplateStrategy;

impl DirectionStrategy for ConvolveTemplateStrategy {
    fn name(&self) -> &'static str {
        "convolve-template"
    }

    fn order<'a>(
        &self,
        template: &'a MaskedImage,
        science: &'a MaskedImage,
    ) -> (&'a MaskedImage, &'a MaskedImage) {
        (template, science)
    }

    fn order_fwhm(
        &self,
        template_fwhm: Option<f64>,
        science_fwhm: Option<f64>,
    ) -> (Option<f64>, Option<f64>) {
        (template_fwhm, science_fwhm)
    }

    fn recombine(
        &self,
        science: &Exposure,
        _warped_template: &Exposure,
        matched: &Exposure,
        solution: &KernelSolution,
    ) -> Result<Exposure, MatchError> {
        let mut subtracted = science.clone();
        let bg = solution.background.image(&subtracted.bbox());
        subtracted
            .masked_image_mut()
            .sub_assign(matched.masked_image())?;
        subtracted.masked_image_mut().sub_image_plane(&bg)?;
        Ok(subtracted)
    }
}

/// `subtracted = -(warped_template - matched - background) / kernel_sum`.
///
/// The science image was the one scaled by the kernel here, so the
/// difference is polarity-flipped back to science-minus-template and divided
/// by the kernel's (unnormalized) pixel sum to return to the native
/// photometric scale. The result adopts the warped template's PSF.
struct ConvolveScienceStrategy;

impl DirectionStrategy for ConvolveScienceStrategy {
    fn name(&self) -> &'static str {
        "convolve-science"
    }

    fn order<'a>(
        &self,
        template: &'a MaskedImage,
        science: &'a MaskedImage,
    ) -> (&'a MaskedImage, &'a MaskedImage) {
        (science, template)
    }

    fn order_fwhm(
        &self,
        template_fwhm: Option<f64>,
        science_fwhm: Option<f64>,
    ) -> (Option<f64>, Option<f64>) {
        (science_fwhm, template_fwhm)
    }

    fn recombine(
        &self,
        science: &Exposure,
        warped_template: &Exposure,
        matched: &Exposure,
        solution: &KernelSolution,
    ) -> Result<Exposure, MatchError> {
        let mut subtracted = science.clone();
        let bg = solution.background.image(&subtracted.bbox());
        subtracted
            .masked_image_mut()
            .assign(warped_template.masked_image())?;
        subtracted
            .masked_image_mut()
            .sub_assign(matched.masked_image())?;
        subtracted.masked_image_mut().sub_image_plane(&bg)?;

        // Preserve the science-minus-template polarity.
        subtracted.masked_image_mut().mul_scalar(-1.0);

        // Return to the native photometric scale.
        let (cx, cy) = subtracted.bbox().center();
        let kernel_sum = solution.kernel.kernel_sum_at(cx, cy);
        if kernel_sum.abs() < 1e-8 {
            return Err(SolveError::DegenerateKernel(kernel_sum).into());
        }
        subtracted.masked_image_mut().div_scalar(kernel_sum);

        // The difference was matched to the warped template's PSF.
        subtracted.set_psf(warped_template.psf().copied());
        Ok(subtracted)
    }
}

fn strategy_for(direction: Direction) -> &'static dyn DirectionStrategy {
    match direction {
        Direction::ConvolveTemplate => &ConvolveTemplateStrategy,
        Direction::ConvolveScience => &ConvolveScienceStrategy,
    }
}

/// PSF-matches exposure or masked-image pairs and subtracts them.
pub struct ImagePsfMatcher {
    config: KernelConfig,
    solver: Box<dyn KernelSolver>,
    warper: Box<dyn Warper>,
    cell_sizer: Box<dyn CellSizer>,
    observer: Box<dyn MatchObserver>,
}

impl ImagePsfMatcher {
    pub fn new(config: KernelConfig) -> Self {
        let cell_sizer = FixedCellSizer::from_config(&config);
        Self {
            config,
            solver: Box::new(LeastSquaresKernelSolver),
            warper: Box::new(BilinearWarper),
            cell_sizer: Box::new(cell_sizer),
            observer: Box::new(NullObserver),
        }
    }

    pub fn with_solver(mut self, solver: Box<dyn KernelSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_warper(mut self, warper: Box<dyn Warper>) -> Self {
        self.warper = warper;
        self
    }

    pub fn with_cell_sizer(mut self, cell_sizer: Box<dyn CellSizer>) -> Self {
        self.cell_sizer = cell_sizer;
        self
    }

    pub fn with_observer(mut self, observer: Box<dyn MatchObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    fn resolve_fwhm(supplied: Option<f64>, exposure: &Exposure, label: &str) -> Option<f64> {
        match supplied.or_else(|| exposure.psf().map(|p| p.fwhm())) {
            Some(fwhm) => {
                info!("{label} psf fwhm: {fwhm:.2} px");
                Some(fwhm)
            }
            None => {
                warn!("no estimate of psf fwhm for {label} image");
                None
            }
        }
    }

    /// Register and PSF-match `template` to `science`.
    ///
    /// Warps the template onto the science grid when permitted and needed,
    /// determines the matching kernel and differential background, and
    /// convolves per the requested direction. The matched exposure inherits
    /// the science WCS and photometric calibration and the template's filter
    /// label.
    pub fn match_exposures(
        &self,
        template: &Exposure,
        science: &Exposure,
        params: &MatchParams,
    ) -> Result<MatchResult, MatchError> {
        let (warped_template, registered) = geometry::validate_and_register(
            template,
            science,
            params.allow_warp,
            self.warper.as_ref(),
        )?;

        let template_fwhm = Self::resolve_fwhm(params.template_fwhm, &warped_template, "template");
        let science_fwhm = Self::resolve_fwhm(params.science_fwhm, science, "science");

        let strategy = strategy_for(params.direction);
        let (target_fwhm, reference_fwhm) = strategy.order_fwhm(template_fwhm, science_fwhm);
        let kernel_size = basis::kernel_size_for(&self.config.basis, reference_fwhm);

        let supplied: Vec<Candidate> = match &params.candidates {
            Some(list) => list.clone(),
            None => {
                let mut work = science.clone();
                let sources = candidates::select_candidates(
                    &mut work,
                    None,
                    self.config.candidate.smooth_before_detection,
                    &self.config.candidate,
                )?;
                sources.iter().map(Candidate::from).collect()
            }
        };
        if supplied.is_empty() {
            return Err(CandidateError::EmptyInput.into());
        }
        let vetted = candidates::vet_candidates(
            &supplied,
            warped_template.masked_image(),
            science.masked_image(),
            kernel_size,
            self.config.candidate.veto_mask,
        )?;

        let (to_convolve, reference) =
            strategy.order(warped_template.masked_image(), science.masked_image());
        let masked =
            self.match_masked_images(to_convolve, reference, &vetted, target_fwhm, reference_fwhm)?;

        let mut matched = Exposure::new(masked.matched_image, *science.wcs())
            .with_photo_calib(science.photo_calib())
            .with_filter(warped_template.filter());
        matched.set_psf(None);

        Ok(MatchResult {
            matched,
            warped_template,
            solution: masked.solution,
            cells: masked.cells,
            registered,
        })
    }

    /// PSF-match `to_convolve` to `reference` at the masked-image level.
    ///
    /// The images must already share a pixel grid; dimensions are validated
    /// before any solve is attempted.
    pub fn match_masked_images(
        &self,
        to_convolve: &MaskedImage,
        reference: &MaskedImage,
        candidates: &[VettedCandidate],
        target_fwhm: Option<f64>,
        reference_fwhm: Option<f64>,
    ) -> Result<MaskedMatchResult, MatchError> {
        if candidates.is_empty() {
            return Err(CandidateError::EmptyInput.into());
        }
        let (tw, th) = to_convolve.dimensions();
        let (rw, rh) = reference.dimensions();
        if (tw, th) != (rw, rh) {
            error!("input images different size: {tw}x{th} vs {rw}x{rh}");
            return Err(GeometryError::DimensionMismatch(tw, th, rw, rh).into());
        }

        if let (Some(t), Some(r)) = (target_fwhm, reference_fwhm) {
            info!("matching psf fwhm {t:.2} -> {r:.2} px");
        }

        let cells = build_cell_set(
            to_convolve,
            reference,
            candidates,
            &self.config,
            self.cell_sizer.as_ref(),
        )?;

        let basis_list = if self.config.basis.use_bic_for_basis {
            // Throwaway cell set for the information-criterion search; the
            // real one must reach the solver unconsumed.
            let probe = build_cell_set(
                to_convolve,
                reference,
                candidates,
                &self.config,
                self.cell_sizer.as_ref(),
            )?;
            let degree =
                basis::evaluate_bic(&probe, target_fwhm, reference_fwhm, &self.config.basis)?;
            basis::select_basis_with_first_degree(
                target_fwhm,
                reference_fwhm,
                &self.config.basis,
                degree,
            )?
        } else {
            basis::select_basis(target_fwhm, reference_fwhm, &self.config.basis)?
        };

        self.observer.pre_solve(&cells);
        let solution = self.solver.solve(&cells, &basis_list)?;
        let matched_image = solution
            .kernel
            .convolve(to_convolve, cells.cell_dimensions());
        self.observer.post_convolve(&matched_image);

        Ok(MaskedMatchResult {
            matched_image,
            solution,
            cells,
        })
    }

    /// Register, PSF-match and subtract two exposures.
    pub fn subtract_exposures(
        &self,
        template: &Exposure,
        science: &Exposure,
        params: &MatchParams,
    ) -> Result<SubtractResult, MatchError> {
        let results = self.match_exposures(template, science, params)?;
        let strategy = strategy_for(params.direction);
        let subtracted = strategy.recombine(
            science,
            &results.warped_template,
            &results.matched,
            &results.solution,
        )?;
        self.observer.post_subtract(subtracted.masked_image());
        info!("subtraction complete ({})", strategy.name());

        Ok(SubtractResult {
            subtracted,
            matched: results.matched,
            warped_template: results.warped_template,
            solution: results.solution,
            cells: results.cells,
        })
    }

    /// PSF-match and subtract at the masked-image level (template is
    /// convolved): `subtracted = science - (matched + background)`.
    pub fn subtract_masked_images(
        &self,
        template: &MaskedImage,
        science: &MaskedImage,
        candidates: &[VettedCandidate],
        template_fwhm: Option<f64>,
        science_fwhm: Option<f64>,
    ) -> Result<MaskedSubtractResult, MatchError> {
        let results =
            self.match_masked_images(template, science, candidates, template_fwhm, science_fwhm)?;

        let mut subtracted = science.clone();
        subtracted.sub_assign(&results.matched_image)?;
        let bg = results.solution.background.image(&science.bbox());
        subtracted.sub_image_plane(&bg)?;
        self.observer.post_subtract(&subtracted);

        Ok(MaskedSubtractResult {
            subtracted,
            matched_image: results.matched_image,
            solution: results.solution,
            cells: results.cells,
        })
    }
}
