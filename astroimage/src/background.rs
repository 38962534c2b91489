//! Low-order polynomial background surfaces.
//!
//! `BackgroundModel` doubles as the sky-fit result used before candidate
//! detection and as the differential-background component of a kernel
//! solution: a 2-D polynomial in coordinates normalized to [-1, 1] over a
//! reference bounding box.

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, warn};

use crate::bbox::BBox;
use crate::masked_image::MaskedImage;

/// Errors from background-surface fitting.
#[derive(Error, Debug)]
pub enum BackgroundError {
    /// Not enough unmasked pixels to constrain the surface.
    #[error("too few unmasked pixels for background fit: {have} < {need}")]
    TooFewPixels { have: usize, need: usize },

    /// Normal equations could not be solved.
    #[error("background normal equations are singular")]
    Singular,
}

/// Number of monomials x^i y^j with i + j <= order.
pub fn n_poly_terms(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Evaluate the monomial basis (1, x, y, x^2, xy, y^2, ...) at `(x, y)`.
pub fn poly_terms(order: usize, x: f64, y: f64, out: &mut Vec<f64>) {
    out.clear();
    for total in 0..=order {
        for j in 0..=total {
            let i = total - j;
            out.push(x.powi(i as i32) * y.powi(j as i32));
        }
    }
}

/// Polynomial background surface over a reference bbox.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    coeffs: Vec<f64>,
    order: usize,
    domain: BBox,
}

impl BackgroundModel {
    /// Surface from fitted coefficients (monomial order as in `poly_terms`).
    pub fn new(coeffs: Vec<f64>, order: usize, domain: BBox) -> Self {
        debug_assert_eq!(coeffs.len(), n_poly_terms(order));
        Self {
            coeffs,
            order,
            domain,
        }
    }

    /// Identically-zero surface.
    pub fn zero(domain: BBox) -> Self {
        Self {
            coeffs: vec![0.0],
            order: 0,
            domain,
        }
    }

    /// Constant surface (e.g. the robust-median fallback level).
    pub fn constant(level: f64, domain: BBox) -> Self {
        Self {
            coeffs: vec![level],
            order: 0,
            domain,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn domain(&self) -> BBox {
        self.domain
    }

    fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        let w = (self.domain.width().max(2) - 1) as f64;
        let h = (self.domain.height().max(2) - 1) as f64;
        (
            2.0 * (x - self.domain.min_x as f64) / w - 1.0,
            2.0 * (y - self.domain.min_y as f64) / h - 1.0,
        )
    }

    /// Surface value at parent-frame pixel coordinates.
    pub fn eval(&self, x: f64, y: f64) -> f64 {
        let (nx, ny) = self.normalize(x, y);
        let mut terms = Vec::with_capacity(self.coeffs.len());
        poly_terms(self.order, nx, ny, &mut terms);
        terms
            .iter()
            .zip(self.coeffs.iter())
            .map(|(t, c)| t * c)
            .sum()
    }

    /// Surface rendered over `bbox` as a pixel plane.
    pub fn image(&self, bbox: &BBox) -> Array2<f64> {
        let (w, h) = (bbox.width(), bbox.height());
        Array2::from_shape_fn((h, w), |(r, c)| {
            self.eval(bbox.min_x as f64 + c as f64, bbox.min_y as f64 + r as f64)
        })
    }
}

/// Fit a polynomial background to the unmasked pixels of `mi`.
///
/// Pixels are subsampled on a stride chosen to keep roughly `max_samples`
/// contributing points. Fails when fewer unmasked samples than coefficients
/// remain.
pub fn fit_background(mi: &MaskedImage, order: usize) -> Result<BackgroundModel, BackgroundError> {
    const MAX_SAMPLES: usize = 4096;

    let domain = mi.bbox();
    let n_terms = n_poly_terms(order);
    let (h, w) = (mi.height(), mi.width());
    let total = h * w;
    let stride = ((total as f64 / MAX_SAMPLES as f64).sqrt().floor() as usize).max(1);

    let model_probe = BackgroundModel::zero(domain);
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut rhs: Vec<f64> = Vec::new();
    let mut terms = Vec::with_capacity(n_terms);
    for r in (0..h).step_by(stride) {
        for c in (0..w).step_by(stride) {
            if mi.mask()[[r, c]] != 0 || !mi.image()[[r, c]].is_finite() {
                continue;
            }
            let x = mi.xy0().0 as f64 + c as f64;
            let y = mi.xy0().1 as f64 + r as f64;
            let (nx, ny) = model_probe.normalize(x, y);
            poly_terms(order, nx, ny, &mut terms);
            rows.push(terms.clone());
            rhs.push(mi.image()[[r, c]]);
        }
    }

    if rows.len() < n_terms {
        warn!(
            "background fit has {} unmasked samples, needs {}",
            rows.len(),
            n_terms
        );
        return Err(BackgroundError::TooFewPixels {
            have: rows.len(),
            need: n_terms,
        });
    }
    debug!(
        "background fit order {}: {} samples at stride {}",
        order,
        rows.len(),
        stride
    );

    let a = DMatrix::from_fn(rows.len(), n_terms, |i, j| rows[i][j]);
    let b = DVector::from_vec(rhs);
    let ata = a.transpose() * &a;
    let atb = a.transpose() * b;
    let coeffs = ata
        .cholesky()
        .map(|ch| ch.solve(&atb))
        .ok_or(BackgroundError::Singular)?;

    Ok(BackgroundModel::new(
        coeffs.iter().copied().collect(),
        order,
        domain,
    ))
}
