//! Kernel application to masked images.
//!
//! Convolution here is deliberately unnormalized: the matching kernel's
//! coefficients carry the photometric scale, so dividing by the kernel sum at
//! application time would undo the fit. Output pixels whose kernel support
//! leaves the input get the `EDGE | NO_DATA` mask bits and zero data.

use ndarray::{Array2, ArrayView2};

use crate::masked_image::{mask_planes, MaskedImage};

/// Convolve `src` with `kernel` (odd dimensions), same-size output.
///
/// Image pixels get `sum(I * k)`, variance gets `sum(V * k^2)`, and the mask
/// ORs every input mask bit under the kernel support. No normalization is
/// applied.
pub fn convolve_unnormalized(src: &MaskedImage, kernel: &ArrayView2<f64>) -> MaskedImage {
    let (kh, kw) = kernel.dim();
    debug_assert!(kh % 2 == 1 && kw % 2 == 1, "kernel dimensions must be odd");
    let (h, w) = (src.height(), src.width());
    let hy = kh / 2;
    let hx = kw / 2;

    let mut image = Array2::zeros((h, w));
    let mut variance = Array2::zeros((h, w));
    let mut mask = Array2::from_elem((h, w), mask_planes::EDGE | mask_planes::NO_DATA);

    let src_img = src.image();
    let src_var = src.variance();
    let src_mask = src.mask();

    if h >= kh && w >= kw {
        for r in hy..h - hy {
            for c in hx..w - hx {
                let mut acc = 0.0;
                let mut vacc = 0.0;
                let mut macc = 0u16;
                for kr in 0..kh {
                    for kc in 0..kw {
                        let ir = r + kr - hy;
                        let ic = c + kc - hx;
                        let k = kernel[[kr, kc]];
                        acc += src_img[[ir, ic]] * k;
                        vacc += src_var[[ir, ic]] * k * k;
                        macc |= src_mask[[ir, ic]];
                    }
                }
                image[[r, c]] = acc;
                variance[[r, c]] = vacc;
                mask[[r, c]] = macc;
            }
        }
    }

    let mut out = MaskedImage::from_planes(image, mask, variance, src.xy0())
        .expect("planes constructed with identical shapes");
    out.set_xy0(src.xy0());
    out
}

/// Same-size convolution of a plain pixel array with zero padding, e.g. for
/// PSF smoothing ahead of detection.
pub fn convolve_same(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (ih, iw) = image.dim();
    let (kh, kw) = kernel.dim();
    let hy = kh as isize / 2;
    let hx = kw as isize / 2;
    let mut out = Array2::zeros((ih, iw));
    for r in 0..ih {
        for c in 0..iw {
            let mut acc = 0.0;
            for kr in 0..kh {
                for kc in 0..kw {
                    let ir = r as isize + kr as isize - hy;
                    let ic = c as isize + kc as isize - hx;
                    if ir >= 0 && ir < ih as isize && ic >= 0 && ic < iw as isize {
                        acc += image[[ir as usize, ic as usize]] * kernel[[kr, kc]];
                    }
                }
            }
            out[[r, c]] = acc;
        }
    }
    out
}

/// Plain valid-mode convolution of a pixel array: output dimension is
/// `input - kernel + 1` per axis. Used to build solver design matrices.
pub fn convolve_valid(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (ih, iw) = image.dim();
    let (kh, kw) = kernel.dim();
    if ih < kh || iw < kw {
        return Array2::zeros((0, 0));
    }
    let oh = ih - kh + 1;
    let ow = iw - kw + 1;
    let mut out = Array2::zeros((oh, ow));
    for r in 0..oh {
        for c in 0..ow {
            let mut acc = 0.0;
            for kr in 0..kh {
                for kc in 0..kw {
                    acc += image[[r + kr, c + kc]] * kernel[[kr, kc]];
                }
            }
            out[[r, c]] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn flat(width: usize, height: usize, value: f64) -> MaskedImage {
        let image = Array2::from_elem((height, width), value);
        let variance = Array2::from_elem((height, width), 1.0);
        MaskedImage::from_planes(image, Array2::zeros((height, width)), variance, (0, 0)).unwrap()
    }

    #[test]
    fn identity_kernel_preserves_interior() {
        let mut src = flat(9, 9, 2.0);
        src.image_mut()[[4, 4]] = 10.0;
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let out = convolve_unnormalized(&src, &kernel.view());
        assert_relative_eq!(out.image()[[4, 4]], 10.0);
        assert_relative_eq!(out.image()[[1, 1]], 2.0);
        assert_eq!(out.mask()[[4, 4]], 0);
    }

    #[test]
    fn edge_pixels_are_flagged() {
        let src = flat(7, 7, 1.0);
        let kernel = Array2::from_elem((3, 3), 1.0 / 9.0);
        let out = convolve_unnormalized(&src, &kernel.view());
        assert_eq!(
            out.mask()[[0, 3]],
            mask_planes::EDGE | mask_planes::NO_DATA
        );
        assert_relative_eq!(out.image()[[0, 3]], 0.0);
        assert_eq!(out.mask()[[3, 3]], 0);
    }

    #[test]
    fn unnormalized_kernel_scales_flux() {
        let src = flat(9, 9, 3.0);
        let kernel = Array2::from_elem((3, 3), 0.5);
        let out = convolve_unnormalized(&src, &kernel.view());
        // Sum of kernel is 4.5, so a flat image of 3 becomes 13.5.
        assert_relative_eq!(out.image()[[4, 4]], 13.5);
    }

    #[test]
    fn variance_uses_squared_weights() {
        let src = flat(5, 5, 0.0);
        let kernel = array![[0.0, 0.5, 0.0], [0.5, 0.0, 0.5], [0.0, 0.5, 0.0]];
        let out = convolve_unnormalized(&src, &kernel.view());
        assert_relative_eq!(out.variance()[[2, 2]], 4.0 * 0.25);
    }

    #[test]
    fn mask_propagates_through_support() {
        let mut src = flat(9, 9, 1.0);
        src.mask_mut()[[4, 4]] = mask_planes::SAT;
        let kernel = Array2::from_elem((3, 3), 1.0 / 9.0);
        let out = convolve_unnormalized(&src, &kernel.view());
        assert_eq!(out.mask()[[3, 3]] & mask_planes::SAT, mask_planes::SAT);
        assert_eq!(out.mask()[[6, 6]] & mask_planes::SAT, 0);
    }

    #[test]
    fn valid_mode_dimensions() {
        let image = Array2::from_elem((10, 8), 1.0);
        let kernel = Array2::from_elem((3, 5), 1.0);
        let out = convolve_valid(&image.view(), &kernel.view());
        assert_eq!(out.dim(), (8, 4));
        assert_relative_eq!(out[[0, 0]], 15.0);
    }
}
