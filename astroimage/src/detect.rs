//! Thresholded source detection and the minimal measurement pass.
//!
//! The detection pipeline is threshold segmentation, connected-component
//! labeling, then intensity-weighted moment centroiding, with an aspect-ratio
//! cut to reject cosmic rays and trails. Detection may run on a PSF-smoothed
//! copy of the pixels while moments are always measured on the originals.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bbox::BBox;
use crate::exposure::Exposure;
use crate::masked_image::mask_planes;

/// Aspect ratios above this are rejected as non-stellar.
const MAX_ASPECT_RATIO: f64 = 2.5;

/// A detected and (optionally) measured source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Sequential identifier within one detection run.
    pub id: usize,
    /// Centroid x (column) in parent-frame pixels, sub-pixel precision.
    pub x: f64,
    /// Centroid y (row) in parent-frame pixels, sub-pixel precision.
    pub y: f64,
    /// Total flux over the detection footprint.
    pub flux: f64,
    /// Second central moments of the footprint.
    pub m_xx: f64,
    pub m_yy: f64,
    pub m_xy: f64,
    /// Eigenvalue ratio of the moment matrix.
    pub aspect_ratio: f64,
    /// Effective diameter in pixels.
    pub diameter: f64,
    /// Detection footprint in parent coordinates.
    pub footprint: BBox,
    /// Sky position (degrees), set by the measurement pass.
    pub sky: Option<(f64, f64)>,
    /// Mask bits present anywhere in the footprint, set by measurement.
    pub quality_flags: u16,
}

impl Source {
    /// Shape cut used to reject elongated artifacts.
    pub fn is_stellar(&self) -> bool {
        self.aspect_ratio < MAX_ASPECT_RATIO
    }
}

/// Binary threshold map.
fn apply_threshold(image: &ArrayView2<f64>, threshold: f64) -> Array2<bool> {
    image.mapv(|v| v > threshold)
}

/// 4-connected component labeling by iterative flood fill.
///
/// Returns the label plane (0 = background, labels start at 1) and the label
/// count.
fn connected_components(binary: &ArrayView2<bool>) -> (Array2<usize>, usize) {
    let (h, w) = binary.dim();
    let mut labels = Array2::zeros((h, w));
    let mut next = 0usize;
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for r in 0..h {
        for c in 0..w {
            if !binary[[r, c]] || labels[[r, c]] != 0 {
                continue;
            }
            next += 1;
            stack.push((r, c));
            labels[[r, c]] = next;
            while let Some((pr, pc)) = stack.pop() {
                let mut visit = |nr: usize, nc: usize, stack: &mut Vec<(usize, usize)>| {
                    if binary[[nr, nc]] && labels[[nr, nc]] == 0 {
                        labels[[nr, nc]] = next;
                        stack.push((nr, nc));
                    }
                };
                if pr > 0 {
                    visit(pr - 1, pc, &mut stack);
                }
                if pr + 1 < h {
                    visit(pr + 1, pc, &mut stack);
                }
                if pc > 0 {
                    visit(pr, pc - 1, &mut stack);
                }
                if pc + 1 < w {
                    visit(pr, pc + 1, &mut stack);
                }
            }
        }
    }
    (labels, next)
}

/// Local-frame bounding boxes per label (index 0 holds label 1).
fn bounding_boxes(labels: &ArrayView2<usize>, n: usize) -> Vec<BBox> {
    let mut boxes = vec![
        BBox {
            min_x: i64::MAX,
            min_y: i64::MAX,
            max_x: i64::MIN,
            max_y: i64::MIN,
        };
        n
    ];
    for ((r, c), &label) in labels.indexed_iter() {
        if label == 0 {
            continue;
        }
        let b = &mut boxes[label - 1];
        b.min_x = b.min_x.min(c as i64);
        b.min_y = b.min_y.min(r as i64);
        b.max_x = b.max_x.max(c as i64);
        b.max_y = b.max_y.max(r as i64);
    }
    boxes
}

/// Intensity-weighted centroid and second moments for one labeled component.
fn measure_moments(
    image: &ArrayView2<f64>,
    labels: &ArrayView2<usize>,
    label: usize,
    bbox: &BBox,
    id: usize,
) -> Source {
    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    let mut m20 = 0.0;
    let mut m02 = 0.0;
    let mut m11 = 0.0;

    for r in bbox.min_y..=bbox.max_y {
        for c in bbox.min_x..=bbox.max_x {
            if labels[[r as usize, c as usize]] != label {
                continue;
            }
            let v = image[[r as usize, c as usize]].max(0.0);
            let x = c as f64;
            let y = r as f64;
            m00 += v;
            m10 += x * v;
            m01 += y * v;
            m20 += x * x * v;
            m02 += y * y * v;
            m11 += x * y * v;
        }
    }

    let (cx, cy) = if m00 > 0.0 {
        (m10 / m00, m01 / m00)
    } else {
        bbox.center()
    };

    let (mu_xx, mu_yy, mu_xy) = if m00 > 0.0 {
        (
            m20 / m00 - cx * cx,
            m02 / m00 - cy * cy,
            m11 / m00 - cx * cy,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    // Eigenvalues of the covariance matrix give principal widths.
    let tr = mu_xx + mu_yy;
    let det = mu_xx * mu_yy - mu_xy * mu_xy;
    let disc = (tr * tr / 4.0 - det).max(0.0).sqrt();
    let l1 = (tr / 2.0 + disc).max(1e-12);
    let l2 = (tr / 2.0 - disc).max(1e-12);
    let aspect_ratio = l1 / l2;
    let diameter = 2.0 * (l1 + l2).sqrt();

    Source {
        id,
        x: cx,
        y: cy,
        flux: m00,
        m_xx: mu_xx,
        m_yy: mu_yy,
        m_xy: mu_xy,
        aspect_ratio,
        diameter,
        footprint: *bbox,
        sky: None,
        quality_flags: 0,
    }
}

/// Detect sources above `threshold`.
///
/// When `smoothed` is given, segmentation runs on it while moments are
/// measured on `image`; both must share dimensions. Coordinates in the
/// returned sources are parent-frame (`xy0`-offset applied).
pub fn detect_sources<'a>(
    image: &ArrayView2<'a, f64>,
    smoothed: Option<&ArrayView2<'a, f64>>,
    threshold: f64,
    xy0: (i64, i64),
) -> Vec<Source> {
    let seg_plane = smoothed.unwrap_or(image);
    let binary = apply_threshold(seg_plane, threshold);
    let (labels, n) = connected_components(&binary.view());
    let boxes = bounding_boxes(&labels.view(), n);

    let mut sources = Vec::with_capacity(n);
    for (i, bbox) in boxes.iter().enumerate() {
        if !bbox.is_valid() {
            continue;
        }
        let mut src = measure_moments(image, &labels.view(), i + 1, bbox, sources.len());
        src.x += xy0.0 as f64;
        src.y += xy0.1 as f64;
        src.footprint = BBox::from_corners(
            bbox.min_x + xy0.0,
            bbox.min_y + xy0.1,
            bbox.max_x + xy0.0,
            bbox.max_y + xy0.1,
        );
        if src.is_stellar() {
            sources.push(src);
        }
    }
    debug!(
        "{} of {} components above threshold {:.3} pass the shape cut",
        sources.len(),
        n,
        threshold
    );
    sources
}

/// Minimal measurement pass: sky coordinates through the exposure WCS and
/// pixel-quality flags from the mask plane over each footprint. Mutates the
/// catalog in place.
pub fn measure_sources(sources: &mut [Source], exposure: &Exposure) {
    let mi = exposure.masked_image();
    let own = mi.bbox();
    for src in sources.iter_mut() {
        src.sky = Some(exposure.wcs().pixel_to_sky(src.x, src.y));
        let clipped = src.footprint.clipped_to(&own);
        if !clipped.is_valid() {
            src.quality_flags |= mask_planes::EDGE;
            continue;
        }
        let mut flags = 0u16;
        for r in clipped.min_y..=clipped.max_y {
            for c in clipped.min_x..=clipped.max_x {
                let lr = (r - mi.xy0().1) as usize;
                let lc = (c - mi.xy0().0) as usize;
                flags |= mi.mask()[[lr, lc]];
            }
        }
        src.quality_flags = flags;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    use crate::masked_image::MaskedImage;
    use crate::wcs::LinearWcs;

    fn gaussian_spot(image: &mut Array2<f64>, x: f64, y: f64, amp: f64, sigma: f64) {
        let (h, w) = image.dim();
        for r in 0..h {
            for c in 0..w {
                let dx = c as f64 - x;
                let dy = r as f64 - y;
                image[[r, c]] += amp * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    #[test]
    fn centroids_symmetric_cross() {
        let mut image = Array2::<f64>::zeros((5, 5));
        image[[2, 2]] = 1.0;
        image[[1, 2]] = 0.5;
        image[[2, 1]] = 0.5;
        image[[3, 2]] = 0.5;
        image[[2, 3]] = 0.5;
        let sources = detect_sources(&image.view(), None, 0.1, (0, 0));
        assert_eq!(sources.len(), 1);
        assert_relative_eq!(sources[0].x, 2.0, epsilon = 1e-10);
        assert_relative_eq!(sources[0].y, 2.0, epsilon = 1e-10);
        assert_relative_eq!(sources[0].flux, 3.0, epsilon = 1e-10);
    }

    #[test]
    fn subpixel_centroid_accuracy() {
        let mut image = Array2::<f64>::zeros((32, 32));
        gaussian_spot(&mut image, 16.4, 15.7, 100.0, 1.5);
        let sources = detect_sources(&image.view(), None, 1.0, (0, 0));
        assert_eq!(sources.len(), 1);
        assert!((sources[0].x - 16.4).abs() < 0.05);
        assert!((sources[0].y - 15.7).abs() < 0.05);
    }

    #[test]
    fn separate_spots_get_unique_labels() {
        let mut image = Array2::<f64>::zeros((40, 40));
        gaussian_spot(&mut image, 10.0, 10.0, 50.0, 1.2);
        gaussian_spot(&mut image, 30.0, 12.0, 40.0, 1.2);
        gaussian_spot(&mut image, 14.0, 30.0, 30.0, 1.2);
        let sources = detect_sources(&image.view(), None, 2.0, (0, 0));
        assert_eq!(sources.len(), 3);
        let mut ids: Vec<usize> = sources.iter().map(|s| s.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn elongated_streak_is_rejected() {
        let mut image = Array2::<f64>::zeros((20, 20));
        for c in 3..17 {
            image[[10, c]] = 10.0;
        }
        let sources = detect_sources(&image.view(), None, 1.0, (0, 0));
        assert!(sources.is_empty());
    }

    #[test]
    fn xy0_offsets_coordinates() {
        let mut image = Array2::<f64>::zeros((16, 16));
        gaussian_spot(&mut image, 8.0, 8.0, 50.0, 1.0);
        let sources = detect_sources(&image.view(), None, 1.0, (100, 200));
        assert_eq!(sources.len(), 1);
        assert!((sources[0].x - 108.0).abs() < 0.05);
        assert!((sources[0].y - 208.0).abs() < 0.05);
    }

    #[test]
    fn measurement_sets_sky_and_flags() {
        let mut image = Array2::<f64>::zeros((16, 16));
        gaussian_spot(&mut image, 8.0, 8.0, 50.0, 1.0);
        let mut mask = Array2::zeros((16, 16));
        mask[[8, 8]] = mask_planes::SAT;
        let mi = MaskedImage::from_planes(
            image.clone(),
            mask,
            Array2::from_elem((16, 16), 1.0),
            (0, 0),
        )
        .unwrap();
        let exposure = Exposure::new(
            mi,
            LinearWcs::simple((8.0, 8.0), (45.0, 10.0), 1e-4).unwrap(),
        );

        let mut sources = detect_sources(&image.view(), None, 1.0, (0, 0));
        measure_sources(&mut sources, &exposure);
        let (lon, lat) = sources[0].sky.unwrap();
        assert_relative_eq!(lon, 45.0, epsilon = 1e-5);
        assert_relative_eq!(lat, 10.0, epsilon = 1e-5);
        assert_eq!(sources[0].quality_flags & mask_planes::SAT, mask_planes::SAT);
    }
}
