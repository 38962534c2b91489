//! Synthetic exposure builders shared by integration tests.
//!
//! These scenes are not meant to be realistic star fields; they exist so the
//! matching pipeline can be exercised end to end with known ground truth.

use astroimage::exposure::Exposure;
use astroimage::masked_image::MaskedImage;
use astroimage::psf::GaussianPsf;
use astroimage::wcs::LinearWcs;
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Parameters for one synthetic star.
#[derive(Debug, Clone, Copy)]
pub struct StarSpec {
    pub x: f64,
    pub y: f64,
    /// Total flux (the profile integrates to this).
    pub flux: f64,
    /// Gaussian sigma of the rendered profile in pixels. Zero renders a
    /// single-pixel impulse.
    pub sigma: f64,
}

impl StarSpec {
    pub fn new(x: f64, y: f64, flux: f64, sigma: f64) -> Self {
        Self { x, y, flux, sigma }
    }

    /// Single-pixel impulse carrying `flux`.
    pub fn impulse(x: f64, y: f64, flux: f64) -> Self {
        Self {
            x,
            y,
            flux,
            sigma: 0.0,
        }
    }
}

/// Scene geometry and noise controls.
#[derive(Debug, Clone)]
pub struct SceneConfig {
    pub width: usize,
    pub height: usize,
    /// Constant sky level added to every pixel.
    pub background: f64,
    /// Gaussian read-noise sigma; zero for noiseless scenes.
    pub read_noise_std: f64,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            background: 0.0,
            read_noise_std: 0.0,
            seed: 42,
        }
    }
}

/// Render star profiles plus background and seeded read noise.
pub fn render_scene(config: &SceneConfig, stars: &[StarSpec]) -> Array2<f64> {
    let mut image = Array2::from_elem((config.height, config.width), config.background);

    for star in stars {
        if star.sigma <= 0.0 {
            let c = star.x.round() as i64;
            let r = star.y.round() as i64;
            if r >= 0 && c >= 0 && (r as usize) < config.height && (c as usize) < config.width {
                image[[r as usize, c as usize]] += star.flux;
            }
            continue;
        }
        let norm = star.flux / (2.0 * std::f64::consts::PI * star.sigma * star.sigma);
        let radius = (5.0 * star.sigma).ceil() as i64;
        let r0 = (star.y as i64 - radius).max(0) as usize;
        let r1 = ((star.y as i64 + radius + 1).max(0) as usize).min(config.height);
        let c0 = (star.x as i64 - radius).max(0) as usize;
        let c1 = ((star.x as i64 + radius + 1).max(0) as usize).min(config.width);
        for r in r0..r1 {
            for c in c0..c1 {
                let dx = c as f64 - star.x;
                let dy = r as f64 - star.y;
                image[[r, c]] +=
                    norm * (-(dx * dx + dy * dy) / (2.0 * star.sigma * star.sigma)).exp();
            }
        }
    }

    if config.read_noise_std > 0.0 {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let noise =
            Normal::new(0.0, config.read_noise_std).expect("read noise sigma is positive");
        for pixel in image.iter_mut() {
            *pixel += noise.sample(&mut rng);
        }
    }

    image
}

/// Wrap a rendered scene into an exposure with a flat variance plane.
pub fn make_exposure(
    config: &SceneConfig,
    stars: &[StarSpec],
    psf_sigma: f64,
    wcs: LinearWcs,
) -> Exposure {
    let image = render_scene(config, stars);
    let variance = Array2::from_elem(
        (config.height, config.width),
        config.read_noise_std.max(1.0).powi(2),
    );
    let mask = Array2::zeros((config.height, config.width));
    let mi =
        MaskedImage::from_planes(image, mask, variance, (0, 0)).expect("planes share one shape");
    Exposure::new(mi, wcs)
        .with_psf(GaussianPsf::from_sigma(psf_sigma.max(0.1)))
        .with_filter("r")
}

/// North-up WCS centered on the image with a 0.2 arcsec/px plate scale.
pub fn default_wcs(width: usize, height: usize) -> LinearWcs {
    LinearWcs::simple(
        (width as f64 / 2.0, height as f64 / 2.0),
        (150.0, 2.5),
        0.2 / 3600.0,
    )
    .expect("diagonal CD matrix is invertible")
}

/// As `default_wcs` but with the reference pixel displaced, producing an
/// unregistered frame over the same sky.
pub fn offset_wcs(width: usize, height: usize, dx_px: f64, dy_px: f64) -> LinearWcs {
    LinearWcs::simple(
        (width as f64 / 2.0 + dx_px, height as f64 / 2.0 + dy_px),
        (150.0, 2.5),
        0.2 / 3600.0,
    )
    .expect("diagonal CD matrix is invertible")
}
