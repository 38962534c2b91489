//! Kernel basis generation and the basis-complexity policy.
//!
//! The matching kernel is expanded in a fixed list of basis kernels: either
//! Alard-Lupton Gaussians modulated by polynomials, or a complete
//! delta-function grid. The first kernel carries unit sum and every later
//! kernel is renormalized to zero sum, so the leading coefficient alone sets
//! the photometric scale of the fit.

use ndarray::Array2;
use tracing::{debug, info};

use crate::config::{BasisConfig, BasisFamily};
use crate::error::{ConfigError, MatchError};
use crate::psf_fwhm_to_sigma;

/// Ordered, immutable list of pixelized basis kernels (all square, same
/// odd side).
#[derive(Debug, Clone)]
pub struct BasisList {
    kernels: Vec<Array2<f64>>,
}

impl BasisList {
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Kernel side length in pixels.
    pub fn width(&self) -> usize {
        self.kernels.first().map(|k| k.ncols()).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Array2<f64>> {
        self.kernels.iter()
    }

    pub fn get(&self, i: usize) -> &Array2<f64> {
        &self.kernels[i]
    }
}

/// Kernel side implied by the configuration and the reference FWHM: an odd
/// multiple of the FWHM clamped to the configured range, or the fixed size.
pub fn kernel_size_for(config: &BasisConfig, reference_fwhm: Option<f64>) -> usize {
    let size = match (config.scale_by_fwhm, reference_fwhm) {
        (true, Some(fwhm)) => {
            let scaled = (config.kernel_size_fwhm_scaling * fwhm).round() as usize;
            scaled.clamp(config.kernel_size_min, config.kernel_size_max)
        }
        _ => config.kernel_size,
    };
    if size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

fn validate(config: &BasisConfig) -> Result<(), ConfigError> {
    if config.base_sigmas.is_empty() {
        return Err(ConfigError::Basis("base_sigmas is empty".into()));
    }
    if config.base_sigmas.len() != config.deg_gauss.len() {
        return Err(ConfigError::Basis(format!(
            "base_sigmas ({}) and deg_gauss ({}) lengths differ",
            config.base_sigmas.len(),
            config.deg_gauss.len()
        )));
    }
    if config.base_sigmas.iter().any(|&s| !(s > 0.0)) {
        return Err(ConfigError::Basis("base_sigmas must be positive".into()));
    }
    if config.kernel_size < 3 {
        return Err(ConfigError::Basis(format!(
            "kernel_size {} too small",
            config.kernel_size
        )));
    }
    Ok(())
}

/// Gaussian widths for the run: base widths, rescaled onto the PSF-matching
/// width when FWHM information permits.
fn scaled_sigmas(
    config: &BasisConfig,
    target_fwhm: Option<f64>,
    reference_fwhm: Option<f64>,
) -> Vec<f64> {
    if !config.scale_by_fwhm {
        return config.base_sigmas.clone();
    }
    let (Some(target), Some(reference)) = (target_fwhm, reference_fwhm) else {
        return config.base_sigmas.clone();
    };
    if target == reference {
        return config.base_sigmas.clone();
    }
    let t_sig = psf_fwhm_to_sigma(target);
    let r_sig = psf_fwhm_to_sigma(reference);
    // Width of the Gaussian that carries one PSF into the other.
    let matching = (r_sig * r_sig - t_sig * t_sig).abs().sqrt().max(0.5);
    let anchor = config.base_sigmas[config.base_sigmas.len() / 2];
    let scale = matching / anchor;
    config.base_sigmas.iter().map(|s| s * scale).collect()
}

/// Alard-Lupton family: for each Gaussian width, the polynomial-modulated
/// kernels x^i y^j exp(-r^2 / 2 sigma^2) with i + j <= degree.
fn alard_lupton(size: usize, sigmas: &[f64], degrees: &[usize]) -> BasisList {
    let half = size as i64 / 2;
    let mut kernels = Vec::new();
    for (sigma, &degree) in sigmas.iter().zip(degrees.iter()) {
        let inv_2s2 = 1.0 / (2.0 * sigma * sigma);
        for total in 0..=degree {
            for j in 0..=total {
                let i = total - j;
                let mut k = Array2::zeros((size, size));
                for r in 0..size {
                    for c in 0..size {
                        let x = (c as i64 - half) as f64;
                        let y = (r as i64 - half) as f64;
                        k[[r, c]] = x.powi(i as i32)
                            * y.powi(j as i32)
                            * (-(x * x + y * y) * inv_2s2).exp();
                    }
                }
                kernels.push(k);
            }
        }
    }
    renormalize(&mut kernels);
    BasisList { kernels }
}

/// Complete delta-function grid: one unit impulse per kernel pixel.
fn delta_function(size: usize) -> BasisList {
    let mut kernels = Vec::with_capacity(size * size);
    for r in 0..size {
        for c in 0..size {
            let mut k = Array2::zeros((size, size));
            k[[r, c]] = 1.0;
            kernels.push(k);
        }
    }
    BasisList { kernels }
}

/// First kernel to unit sum; all later kernels to zero sum by subtracting
/// their projection onto the first.
fn renormalize(kernels: &mut [Array2<f64>]) {
    if kernels.is_empty() {
        return;
    }
    let sum0: f64 = kernels[0].iter().sum();
    if sum0.abs() > f64::EPSILON {
        kernels[0].mapv_inplace(|v| v / sum0);
    }
    let first = kernels[0].clone();
    for k in kernels.iter_mut().skip(1) {
        let s: f64 = k.iter().sum();
        if s.abs() > 1e-12 {
            k.zip_mut_with(&first, |v, f| *v -= s * f);
        }
    }
}

/// Log the FWHM relationship driving the basis choice. Diagnostic only; the
/// numerics change only through `scaled_sigmas`.
fn log_fwhm_mode(target_fwhm: Option<f64>, reference_fwhm: Option<f64>) {
    match (target_fwhm, reference_fwhm) {
        (Some(t), Some(r)) if t == r => {
            info!("target and reference psf fwhms are equal, falling back to config values")
        }
        (Some(t), Some(r)) if r > t => {
            info!("reference psf fwhm is the greater, normal convolution mode")
        }
        (Some(_), Some(_)) => info!("target psf fwhm is the greater, deconvolution mode"),
        _ => debug!("psf fwhm unavailable for one or both images"),
    }
}

/// Build the basis list for a matching run.
///
/// `target_fwhm` belongs to the image to be convolved, `reference_fwhm` to
/// the image matched against.
pub fn select_basis(
    target_fwhm: Option<f64>,
    reference_fwhm: Option<f64>,
    config: &BasisConfig,
) -> Result<BasisList, ConfigError> {
    validate(config)?;
    log_fwhm_mode(target_fwhm, reference_fwhm);
    let size = kernel_size_for(config, reference_fwhm);
    let list = match config.family {
        BasisFamily::AlardLupton => {
            let sigmas = scaled_sigmas(config, target_fwhm, reference_fwhm);
            alard_lupton(size, &sigmas, &config.deg_gauss)
        }
        BasisFamily::DeltaFunction => delta_function(size),
    };
    debug!(
        "basis list: {} kernels of side {} ({:?})",
        list.len(),
        list.width(),
        config.family
    );
    Ok(list)
}

/// As `select_basis` but with the leading Gaussian degree overridden, used
/// after the BIC search.
pub fn select_basis_with_first_degree(
    target_fwhm: Option<f64>,
    reference_fwhm: Option<f64>,
    config: &BasisConfig,
    first_degree: usize,
) -> Result<BasisList, ConfigError> {
    let mut adjusted = config.clone();
    if let Some(d) = adjusted.deg_gauss.first_mut() {
        *d = first_degree;
    }
    select_basis(target_fwhm, reference_fwhm, &adjusted)
}

/// Information-criterion search over leading Gaussian degrees.
///
/// Evaluates each candidate degree with a throwaway constant-kernel fit over
/// `cells` and returns the degree minimizing
/// `BIC = n ln(rss / n) + k ln(n)`.
pub fn evaluate_bic(
    cells: &crate::cells::SpatialCellSet,
    target_fwhm: Option<f64>,
    reference_fwhm: Option<f64>,
    config: &BasisConfig,
) -> Result<usize, MatchError> {
    validate(config)?;
    if config.bic_first_degrees.is_empty() {
        return Err(ConfigError::Basis("bic_first_degrees is empty".into()).into());
    }

    let mut best: Option<(usize, f64)> = None;
    for &degree in &config.bic_first_degrees {
        let basis =
            select_basis_with_first_degree(target_fwhm, reference_fwhm, config, degree)?;
        let (rss, n, k) = crate::solver::single_kernel_rss(cells, &basis)?;
        if n == 0 || rss <= 0.0 {
            continue;
        }
        let nf = n as f64;
        let bic = nf * (rss / nf).ln() + (k as f64) * nf.ln();
        debug!("bic search: degree {} -> bic {:.2}", degree, bic);
        match best {
            Some((_, b)) if b <= bic => {}
            _ => best = Some((degree, bic)),
        }
    }

    let (degree, bic) = best.ok_or(crate::error::SolveError::Singular)?;
    info!("bic search selected leading degree {} (bic {:.2})", degree, bic);
    Ok(degree)
}
