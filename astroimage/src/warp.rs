//! Bilinear resampling of exposures onto a destination WCS and grid.

use ndarray::Array2;
use tracing::debug;

use crate::bbox::BBox;
use crate::exposure::Exposure;
use crate::masked_image::{mask_planes, MaskedImage};
use crate::wcs::{LinearWcs, WcsError};

/// Bilinear sample of `plane` at fractional local coordinates; `None` when
/// the 2x2 support leaves the array.
fn sample_bilinear(plane: &Array2<f64>, x: f64, y: f64) -> Option<f64> {
    let (h, w) = plane.dim();
    if x < 0.0 || y < 0.0 {
        return None;
    }
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    if x0 + 1 >= w || y0 + 1 >= h {
        return None;
    }
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    Some(
        plane[[y0, x0]] * (1.0 - fx) * (1.0 - fy)
            + plane[[y0, x0 + 1]] * fx * (1.0 - fy)
            + plane[[y0 + 1, x0]] * (1.0 - fx) * fy
            + plane[[y0 + 1, x0 + 1]] * fx * fy,
    )
}

/// Resample `src` onto `dest_wcs` over `dest_bbox`.
///
/// Image and variance planes are sampled bilinearly, the mask by nearest
/// neighbor. Destination pixels whose source position falls outside the
/// source footprint get zero data and the `NO_DATA | EDGE` bits.
pub fn warp_masked_image(
    dest_wcs: &LinearWcs,
    dest_bbox: &BBox,
    src: &MaskedImage,
    src_wcs: &LinearWcs,
) -> Result<MaskedImage, WcsError> {
    let dest_to_src = dest_wcs.pixel_transform_to(src_wcs)?;
    let (w, h) = (dest_bbox.width(), dest_bbox.height());
    let mut image = Array2::zeros((h, w));
    let mut variance = Array2::zeros((h, w));
    let mut mask = Array2::from_elem((h, w), mask_planes::NO_DATA | mask_planes::EDGE);

    let (sx0, sy0) = src.xy0();
    let mut n_outside = 0usize;
    for r in 0..h {
        for c in 0..w {
            let dest_x = dest_bbox.min_x as f64 + c as f64;
            let dest_y = dest_bbox.min_y as f64 + r as f64;
            let p = dest_to_src.apply(nalgebra::Vector2::new(dest_x, dest_y));
            let lx = p.x - sx0 as f64;
            let ly = p.y - sy0 as f64;
            match (
                sample_bilinear(src.image(), lx, ly),
                sample_bilinear(src.variance(), lx, ly),
            ) {
                (Some(v), Some(var)) => {
                    image[[r, c]] = v;
                    variance[[r, c]] = var;
                    let nr = ly.round().max(0.0) as usize;
                    let nc = lx.round().max(0.0) as usize;
                    mask[[r, c]] = src.mask()[[nr.min(src.height() - 1), nc.min(src.width() - 1)]];
                }
                _ => n_outside += 1,
            }
        }
    }
    if n_outside > 0 {
        debug!(
            "{} of {} warped pixels fall outside the source footprint",
            n_outside,
            w * h
        );
    }

    let mut out = MaskedImage::from_planes(image, mask, variance, (dest_bbox.min_x, dest_bbox.min_y))
        .expect("planes constructed with identical shapes");
    out.set_xy0((dest_bbox.min_x, dest_bbox.min_y));
    Ok(out)
}

/// Warp a whole exposure onto `dest_wcs` / `dest_bbox`, re-projecting its
/// PSF model through the same pixel transform so it stays valid.
pub fn warp_exposure(
    dest_wcs: &LinearWcs,
    dest_bbox: &BBox,
    src: &Exposure,
) -> Result<Exposure, WcsError> {
    let mi = warp_masked_image(dest_wcs, dest_bbox, src.masked_image(), src.wcs())?;
    let src_to_dest = src.wcs().pixel_transform_to(dest_wcs)?;
    let psf = src.psf().map(|p| p.transformed(&src_to_dest.linear));

    let mut out = Exposure::new(mi, *dest_wcs)
        .with_photo_calib(src.photo_calib())
        .with_filter(src.filter());
    out.set_psf(psf);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    use crate::psf::GaussianPsf;

    fn ramp_exposure(width: usize, height: usize, wcs: LinearWcs) -> Exposure {
        let image = Array2::from_shape_fn((height, width), |(r, c)| (r * width + c) as f64);
        let mi = MaskedImage::from_planes(
            image,
            Array2::zeros((height, width)),
            Array2::from_elem((height, width), 1.0),
            (0, 0),
        )
        .unwrap();
        Exposure::new(mi, wcs).with_psf(GaussianPsf::from_sigma(1.5))
    }

    #[test]
    fn identity_warp_reproduces_interior() {
        let wcs = LinearWcs::simple((0.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        let src = ramp_exposure(16, 16, wcs);
        let out = warp_exposure(&wcs, &BBox::from_origin_and_dims(0, 0, 16, 16), &src).unwrap();
        assert_relative_eq!(out.masked_image().image()[[5, 7]], (5 * 16 + 7) as f64);
        assert_eq!(out.masked_image().mask()[[5, 7]], 0);
    }

    #[test]
    fn shifted_frames_resample_with_offset() {
        let src_wcs = LinearWcs::simple((0.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        // Destination frame shifted 3 px in x relative to source.
        let dest_wcs = LinearWcs::simple((3.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        let src = ramp_exposure(16, 16, src_wcs);
        let out = warp_exposure(&dest_wcs, &BBox::from_origin_and_dims(0, 0, 16, 16), &src).unwrap();
        // Dest pixel (5, y) sees source pixel (2, y).
        assert_relative_eq!(out.masked_image().image()[[4, 5]], (4 * 16 + 2) as f64);
    }

    #[test]
    fn out_of_footprint_pixels_are_no_data() {
        let src_wcs = LinearWcs::simple((0.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        let dest_wcs = LinearWcs::simple((12.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        let src = ramp_exposure(16, 16, src_wcs);
        let out = warp_exposure(&dest_wcs, &BBox::from_origin_and_dims(0, 0, 16, 16), &src).unwrap();
        // Dest pixel (2, 2) maps to source x = -10, off-image.
        assert_eq!(
            out.masked_image().mask()[[2, 2]] & mask_planes::NO_DATA,
            mask_planes::NO_DATA
        );
        assert_relative_eq!(out.masked_image().image()[[2, 2]], 0.0);
    }

    #[test]
    fn psf_is_reprojected() {
        let src_wcs = LinearWcs::simple((0.0, 0.0), (30.0, 30.0), 1e-4).unwrap();
        // Destination plate scale is twice as coarse: PSF shrinks in pixels.
        let dest_wcs = LinearWcs::simple((0.0, 0.0), (30.0, 30.0), 2e-4).unwrap();
        let src = ramp_exposure(16, 16, src_wcs);
        let out = warp_exposure(&dest_wcs, &BBox::from_origin_and_dims(0, 0, 8, 8), &src).unwrap();
        assert_relative_eq!(out.psf().unwrap().sigma(), 0.75, epsilon = 1e-9);
    }
}
