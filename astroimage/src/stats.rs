//! Robust pixel statistics over masked images.

use crate::masked_image::MaskedImage;

/// Median of a sample; `None` when empty or any value is non-finite.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some(0.5 * (sorted[n / 2 - 1] + sorted[n / 2]))
    }
}

/// Median over pixels with no mask bits set.
pub fn masked_median(mi: &MaskedImage) -> Option<f64> {
    let values: Vec<f64> = mi
        .image()
        .iter()
        .zip(mi.mask().iter())
        .filter(|(_, &m)| m == 0)
        .map(|(&v, _)| v)
        .collect();
    median(&values)
}

/// Sigma-clipped mean and standard deviation of the unmasked pixels.
///
/// Iterates mean/stddev with a +/- `n_sigma` rejection window until stable or
/// `max_iter` is reached. Returns `(mean, stddev)`; an empty sample gives
/// `(0.0, 0.0)`.
pub fn clipped_mean_std(mi: &MaskedImage, n_sigma: f64, max_iter: usize) -> (f64, f64) {
    let mut values: Vec<f64> = mi
        .image()
        .iter()
        .zip(mi.mask().iter())
        .filter(|(v, &m)| m == 0 && v.is_finite())
        .map(|(&v, _)| v)
        .collect();

    if values.is_empty() {
        return (0.0, 0.0);
    }

    let mut mean = 0.0;
    let mut std = 0.0;
    for _ in 0..max_iter.max(1) {
        let n = values.len() as f64;
        mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n.max(1.0);
        std = var.sqrt();
        if std == 0.0 {
            break;
        }
        let lo = mean - n_sigma * std;
        let hi = mean + n_sigma * std;
        let before = values.len();
        values.retain(|&v| v >= lo && v <= hi);
        if values.len() == before || values.is_empty() {
            break;
        }
    }
    (mean, std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    use crate::masked_image::mask_planes;

    #[test]
    fn median_odd_even() {
        assert_relative_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_relative_eq!(median(&[4.0, 1.0, 2.0, 3.0]).unwrap(), 2.5);
        assert!(median(&[]).is_none());
        assert!(median(&[1.0, f64::NAN]).is_none());
    }

    #[test]
    fn masked_median_skips_flagged_pixels() {
        let image = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f64);
        let mut mask = Array2::zeros((4, 4));
        // Flag the brightest half of the pixels.
        for r in 2..4 {
            for c in 0..4 {
                mask[[r, c]] = mask_planes::BAD;
            }
        }
        let mi = MaskedImage::from_planes(image, mask, Array2::from_elem((4, 4), 1.0), (0, 0))
            .unwrap();
        assert_relative_eq!(masked_median(&mi).unwrap(), 3.5);
    }

    #[test]
    fn clipping_rejects_outliers() {
        let mut image = Array2::from_elem((10, 10), 5.0);
        image[[0, 0]] = 1.0e6;
        let mi = MaskedImage::from_planes(
            image,
            Array2::zeros((10, 10)),
            Array2::from_elem((10, 10), 1.0),
            (0, 0),
        )
        .unwrap();
        let (mean, std) = clipped_mean_std(&mi, 3.0, 5);
        assert_relative_eq!(mean, 5.0, epsilon = 1e-9);
        assert_relative_eq!(std, 0.0, epsilon = 1e-9);
    }
}
