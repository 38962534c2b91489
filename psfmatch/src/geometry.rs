//! Registration policy: decide whether two exposures share a pixel grid and
//! warp the template onto the science frame when they do not.

use astroimage::bbox::BBox;
use astroimage::exposure::Exposure;
use astroimage::wcs::LinearWcs;
use tracing::info;

use crate::error::GeometryError;

/// Resampling seam. The default implementation is bilinear; tests substitute
/// counting or failing warpers.
pub trait Warper {
    /// Resample `src` onto `dest_wcs` over `dest_bbox`, PSF included.
    fn warp(
        &self,
        dest_wcs: &LinearWcs,
        dest_bbox: &BBox,
        src: &Exposure,
    ) -> Result<Exposure, GeometryError>;
}

/// Bilinear warper backed by `astroimage::warp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BilinearWarper;

impl Warper for BilinearWarper {
    fn warp(
        &self,
        dest_wcs: &LinearWcs,
        dest_bbox: &BBox,
        src: &Exposure,
    ) -> Result<Exposure, GeometryError> {
        Ok(astroimage::warp_exposure(dest_wcs, dest_bbox, src)?)
    }
}

/// Sky positions of an exposure's lower-left and upper-right pixel corners.
fn corner_sky(exposure: &Exposure) -> ((f64, f64), (f64, f64)) {
    let bbox = exposure.bbox();
    let origin = exposure
        .wcs()
        .pixel_to_sky(bbox.min_x as f64, bbox.min_y as f64);
    let limit = exposure
        .wcs()
        .pixel_to_sky(bbox.max_x as f64 + 1.0, bbox.max_y as f64 + 1.0);
    (origin, limit)
}

fn sky_box(origin: (f64, f64), limit: (f64, f64)) -> (f64, f64, f64, f64) {
    (
        origin.0.min(limit.0),
        origin.1.min(limit.1),
        origin.0.max(limit.0),
        origin.1.max(limit.1),
    )
}

fn sky_boxes_overlap(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
    a.0 <= b.2 && a.2 >= b.0 && a.1 <= b.3 && a.3 >= b.1
}

/// True when the two exposures already share corner sky positions and pixel
/// dimensions.
pub fn is_registered(template: &Exposure, science: &Exposure) -> bool {
    let (t_origin, t_limit) = corner_sky(template);
    let (s_origin, s_limit) = corner_sky(science);
    t_origin == s_origin && t_limit == s_limit && template.dimensions() == science.dimensions()
}

/// Validate relative geometry and, when permitted, register the template
/// onto the science grid.
///
/// Returns the (possibly warped) template and whether the inputs were
/// already registered. The science exposure is never mutated. Exposures with
/// no sky overlap fail regardless of `allow_warp`.
pub fn validate_and_register(
    template: &Exposure,
    science: &Exposure,
    allow_warp: bool,
    warper: &dyn Warper,
) -> Result<(Exposure, bool), GeometryError> {
    let (t_origin, t_limit) = corner_sky(template);
    let (s_origin, s_limit) = corner_sky(science);

    info!(
        "template wcs: {:.6},{:.6} -> {:.6},{:.6}",
        t_origin.0, t_origin.1, t_limit.0, t_limit.1
    );
    info!(
        "science wcs: {:.6},{:.6} -> {:.6},{:.6}",
        s_origin.0, s_origin.1, s_limit.0, s_limit.1
    );

    if !sky_boxes_overlap(sky_box(t_origin, t_limit), sky_box(s_origin, s_limit)) {
        return Err(GeometryError::NoOverlap);
    }

    if t_origin == s_origin && t_limit == s_limit && template.dimensions() == science.dimensions()
    {
        return Ok((template.clone(), true));
    }

    if !allow_warp {
        return Err(GeometryError::NotRegistered);
    }

    info!("astrometrically registering template to science image");
    let warped = warper.warp(science.wcs(), &science.bbox(), template)?;
    Ok((warped, false))
}
