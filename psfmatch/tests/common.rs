//! Shared fixtures for the matching integration tests.

#![allow(dead_code)]

use astroimage::masked_image::MaskedImage;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Largest |pixel| over the interior, skipping a border of `margin` pixels
/// and circles of `radius` around the `exclude` positions.
pub fn max_abs_excluding(
    mi: &MaskedImage,
    margin: usize,
    exclude: &[(f64, f64)],
    radius: f64,
) -> f64 {
    let mut max = 0.0f64;
    for (x, y, v) in interior_pixels(mi, margin) {
        if near_any(x, y, exclude, radius) {
            continue;
        }
        max = max.max(v.abs());
    }
    max
}

/// Root-mean-square pixel value over the same region as
/// [`max_abs_excluding`].
pub fn rms_excluding(mi: &MaskedImage, margin: usize, exclude: &[(f64, f64)], radius: f64) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (x, y, v) in interior_pixels(mi, margin) {
        if near_any(x, y, exclude, radius) {
            continue;
        }
        sum += v * v;
        n += 1;
    }
    (sum / n.max(1) as f64).sqrt()
}

/// Pixel sum over a square box of half-width `half` centered on `(cx, cy)`.
pub fn flux_in_box(mi: &MaskedImage, cx: usize, cy: usize, half: usize) -> f64 {
    let mut sum = 0.0;
    for r in cy - half..=cy + half {
        for c in cx - half..=cx + half {
            sum += mi.image()[[r, c]];
        }
    }
    sum
}

fn near_any(x: f64, y: f64, positions: &[(f64, f64)], radius: f64) -> bool {
    positions
        .iter()
        .any(|&(px, py)| (x - px).hypot(y - py) < radius)
}

fn interior_pixels(
    mi: &MaskedImage,
    margin: usize,
) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
    let (w, h) = mi.dimensions();
    (margin..h - margin).flat_map(move |r| {
        (margin..w - margin).map(move |c| (c as f64, r as f64, mi.image()[[r, c]]))
    })
}
