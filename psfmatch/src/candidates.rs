//! Candidate-source selection and footprint vetting.
//!
//! Candidates seed the kernel fit. They arrive either from the caller (as
//! footprints or source references) or from an internal high-significance
//! detection pass over the science exposure. Either way they are normalized
//! to kernel-sized footprints and vetted against both images before the cell
//! builder sees them.

use astroimage::bbox::BBox;
use astroimage::convolve::convolve_same;
use astroimage::detect::{detect_sources, measure_sources, Source};
use astroimage::exposure::Exposure;
use astroimage::masked_image::MaskedImage;
use astroimage::{background, stats};
use tracing::{debug, info, warn};

use crate::config::CandidateConfig;
use crate::error::CandidateError;

/// A kernel-fitting candidate.
///
/// Raw detection footprints and source references normalize to the same
/// thing downstream: a footprint plus a centroid.
#[derive(Debug, Clone)]
pub enum Candidate {
    /// An explicit detection footprint.
    Footprint(BBox),
    /// A reference to a measured source by id and centroid.
    SourceRef {
        id: usize,
        /// Pixel centroid (x, y) in the shared parent frame.
        centroid: (f64, f64),
    },
}

impl From<&Source> for Candidate {
    fn from(src: &Source) -> Self {
        Candidate::SourceRef {
            id: src.id,
            centroid: (src.x, src.y),
        }
    }
}

/// A candidate that survived footprint vetting.
#[derive(Debug, Clone)]
pub struct VettedCandidate {
    /// Footprint grown to enclose the kernel extent, contained in both
    /// images.
    pub bbox: BBox,
    /// Pixel centroid (x, y).
    pub centroid: (f64, f64),
}

/// Detect and measure candidate sources on an exposure.
///
/// Fits and temporarily subtracts the background (falling back to the robust
/// median over unmasked pixels when the fit fails), detects above
/// `sigma` (default from config) times the clipped pixel noise, optionally
/// smoothing with the exposure's own PSF first, and runs the minimal
/// measurement pass. The background is restored on every exit path, so the
/// caller's pixel values are unchanged after this returns.
pub fn select_candidates(
    exposure: &mut Exposure,
    sigma: Option<f64>,
    do_smooth: bool,
    config: &CandidateConfig,
) -> Result<Vec<Source>, CandidateError> {
    let threshold_sigma = sigma.unwrap_or(config.threshold_sigma);
    let bbox = exposure.bbox();

    let bg_plane = match background::fit_background(
        exposure.masked_image(),
        config.background_fit_order,
    ) {
        Ok(model) => model.image(&bbox),
        Err(e) => {
            warn!("failed to fit background model ({e}); falling back to median estimate");
            let level = stats::masked_median(exposure.masked_image()).unwrap_or(0.0);
            background::BackgroundModel::constant(level, bbox).image(&bbox)
        }
    };

    // Scoped mutation: take the background off for detection, put it back
    // before returning on every Result path below.
    *exposure.masked_image_mut().image_mut() -= &bg_plane;

    let result = run_detection(exposure, threshold_sigma, do_smooth);

    *exposure.masked_image_mut().image_mut() += &bg_plane;

    let sources = result?;
    info!("selected {} candidate sources", sources.len());
    Ok(sources)
}

fn run_detection(
    exposure: &Exposure,
    threshold_sigma: f64,
    do_smooth: bool,
) -> Result<Vec<Source>, CandidateError> {
    let mi = exposure.masked_image();
    let (_, noise) = stats::clipped_mean_std(mi, 3.0, 5);

    let smoothed = if do_smooth {
        match exposure.psf() {
            Some(psf) => {
                let kernel = psf.kernel_image(psf.suggested_size(3.0));
                Some((
                    convolve_same(&mi.image().view(), &kernel.view()),
                    kernel.iter().map(|k| k * k).sum::<f64>().sqrt(),
                ))
            }
            None => {
                warn!("no psf available for pre-detection smoothing");
                None
            }
        }
    } else {
        None
    };

    // Smoothing suppresses per-pixel noise by the kernel's L2 norm; the
    // threshold tracks that so significance stays in input-noise units.
    let (smooth_plane, noise_scale) = match &smoothed {
        Some((plane, scale)) => (Some(plane.view()), *scale),
        None => (None, 1.0),
    };
    let threshold = threshold_sigma * noise * noise_scale;

    let mut sources = detect_sources(
        &mi.image().view(),
        smooth_plane.as_ref(),
        threshold,
        mi.xy0(),
    );
    measure_sources(&mut sources, exposure);
    debug!(
        "detection threshold {:.3} ({} sigma) yielded {} sources",
        threshold,
        threshold_sigma,
        sources.len()
    );
    Ok(sources)
}

/// Normalize and vet candidates into kernel-sized footprints.
///
/// Source references become square footprints of half-width `kernel_size`
/// around the centroid; explicit footprints are grown by half the kernel
/// size. A candidate survives when its footprint lies inside both images and
/// neither patch carries vetoed mask bits.
pub fn vet_candidates(
    candidates: &[Candidate],
    template: &MaskedImage,
    science: &MaskedImage,
    kernel_size: usize,
    veto_mask: u16,
) -> Result<Vec<VettedCandidate>, CandidateError> {
    if candidates.is_empty() {
        return Err(CandidateError::EmptyInput);
    }

    let template_bbox = template.bbox();
    let science_bbox = science.bbox();
    let mut vetted = Vec::with_capacity(candidates.len());

    for cand in candidates {
        let (bbox, centroid) = match cand {
            Candidate::SourceRef { centroid, .. } => (
                BBox::around(centroid.0, centroid.1, kernel_size as i64),
                *centroid,
            ),
            Candidate::Footprint(fp) => (fp.grown(kernel_size as i64 / 2), fp.center()),
        };

        if !template_bbox.contains(&bbox) || !science_bbox.contains(&bbox) {
            debug!(
                "candidate at ({:.1}, {:.1}) rejected: footprint leaves image bounds",
                centroid.0, centroid.1
            );
            continue;
        }

        if patch_has_vetoed_pixels(template, &bbox, veto_mask)
            || patch_has_vetoed_pixels(science, &bbox, veto_mask)
        {
            debug!(
                "candidate at ({:.1}, {:.1}) rejected: vetoed mask bits in patch",
                centroid.0, centroid.1
            );
            continue;
        }

        vetted.push(VettedCandidate { bbox, centroid });
    }

    if vetted.is_empty() {
        return Err(CandidateError::NoUsable);
    }
    info!(
        "{} of {} candidates usable for kernel fitting",
        vetted.len(),
        candidates.len()
    );
    Ok(vetted)
}

fn patch_has_vetoed_pixels(mi: &MaskedImage, bbox: &BBox, veto_mask: u16) -> bool {
    let (x0, y0) = mi.xy0();
    for r in bbox.min_y..=bbox.max_y {
        for c in bbox.min_x..=bbox.max_x {
            if mi.mask()[[(r - y0) as usize, (c - x0) as usize]] & veto_mask != 0 {
                return true;
            }
        }
    }
    false
}
