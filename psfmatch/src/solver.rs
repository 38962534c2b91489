//! Spatial kernel solving.
//!
//! The solver turns a populated cell set plus a basis list into a spatially
//! varying matching kernel and a differential background surface. The
//! default implementation is a single weighted linear least-squares fit:
//! basis-convolved candidate patches form the design matrix, science-patch
//! pixels the right-hand side, and inverse science variance the weights.

use astroimage::background::{n_poly_terms, poly_terms, BackgroundModel};
use astroimage::bbox::BBox;
use astroimage::convolve::{convolve_unnormalized, convolve_valid};
use astroimage::masked_image::MaskedImage;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

use crate::basis::BasisList;
use crate::cells::{KernelCandidate, SpatialCellSet};
use crate::config::KernelConfig;
use crate::error::SolveError;

const MIN_INTERIOR_PIXELS: usize = 9;
const VARIANCE_FLOOR: f64 = 1e-12;

/// A solved spatial kernel: per-basis coefficients varying polynomially over
/// the fit domain.
#[derive(Debug, Clone)]
pub struct SpatialKernelModel {
    basis: BasisList,
    /// `coeffs[j][k]`: coefficient of basis `j` on spatial term `k`.
    coeffs: Vec<Vec<f64>>,
    spatial_order: usize,
    domain: BBox,
}

impl SpatialKernelModel {
    pub fn width(&self) -> usize {
        self.basis.width()
    }

    pub fn spatial_order(&self) -> usize {
        self.spatial_order
    }

    pub fn domain(&self) -> BBox {
        self.domain
    }

    fn normalize(&self, x: f64, y: f64) -> (f64, f64) {
        normalize_over(&self.domain, x, y)
    }

    /// Kernel pixel image evaluated at parent-frame position `(x, y)`.
    pub fn kernel_image_at(&self, x: f64, y: f64) -> ndarray::Array2<f64> {
        let (nx, ny) = self.normalize(x, y);
        let mut terms = Vec::with_capacity(n_poly_terms(self.spatial_order));
        poly_terms(self.spatial_order, nx, ny, &mut terms);
        let size = self.width();
        let mut out = ndarray::Array2::zeros((size, size));
        for (j, kernel) in self.basis.iter().enumerate() {
            let c: f64 = self.coeffs[j]
                .iter()
                .zip(terms.iter())
                .map(|(a, t)| a * t)
                .sum();
            out.zip_mut_with(kernel, |o, k| *o += c * k);
        }
        out
    }

    /// Kernel pixel sum at `(x, y)` (the local photometric scale of the
    /// unnormalized fit).
    pub fn kernel_sum_at(&self, x: f64, y: f64) -> f64 {
        self.kernel_image_at(x, y).iter().sum()
    }

    /// Convolve a masked image with the spatial kernel (unnormalized).
    ///
    /// A spatially constant model convolves in one pass; otherwise the image
    /// is processed in tiles with the kernel frozen at each tile center.
    pub fn convolve(&self, src: &MaskedImage, tile: (usize, usize)) -> MaskedImage {
        let size = self.width();
        if self.spatial_order == 0 {
            let (cx, cy) = src.bbox().center();
            return convolve_unnormalized(src, &self.kernel_image_at(cx, cy).view());
        }

        let tile_w = tile.0.max(2 * size);
        let tile_h = tile.1.max(2 * size);
        let (h, w) = (src.height(), src.width());
        let half = size as i64 / 2;
        let (x0, y0) = src.xy0();

        let mut out = MaskedImage::zeros(w, h);
        out.set_xy0((x0, y0));
        out.or_mask(astroimage::mask_planes::EDGE | astroimage::mask_planes::NO_DATA);

        let mut ty = 0usize;
        while ty < h {
            let ty1 = (ty + tile_h).min(h);
            let mut tx = 0usize;
            while tx < w {
                let tx1 = (tx + tile_w).min(w);
                let region = BBox::from_corners(
                    x0 + tx as i64,
                    y0 + ty as i64,
                    x0 + tx1 as i64 - 1,
                    y0 + ty1 as i64 - 1,
                );
                let expanded = region.grown(half).clipped_to(&src.bbox());
                let sub = match src.subimage(&expanded) {
                    Ok(sub) => sub,
                    Err(_) => {
                        tx = tx1;
                        continue;
                    }
                };
                let (cx, cy) = region.center();
                let conv = convolve_unnormalized(&sub, &self.kernel_image_at(cx, cy).view());
                for r in region.min_y..=region.max_y {
                    for c in region.min_x..=region.max_x {
                        let or = (r - y0) as usize;
                        let oc = (c - x0) as usize;
                        let sr = (r - expanded.min_y) as usize;
                        let sc = (c - expanded.min_x) as usize;
                        out.image_mut()[[or, oc]] = conv.image()[[sr, sc]];
                        out.variance_mut()[[or, oc]] = conv.variance()[[sr, sc]];
                        out.mask_mut()[[or, oc]] = conv.mask()[[sr, sc]];
                    }
                }
                tx = tx1;
            }
            ty = ty1;
        }
        out
    }
}

/// One solved matching call: kernel, differential background and how many
/// candidates informed them.
#[derive(Debug, Clone)]
pub struct KernelSolution {
    pub kernel: SpatialKernelModel,
    pub background: BackgroundModel,
    pub n_candidates_used: usize,
}

/// The spatial solve seam.
pub trait KernelSolver {
    fn solve(
        &self,
        cells: &SpatialCellSet,
        basis: &BasisList,
    ) -> Result<KernelSolution, SolveError>;
}

/// Default weighted least-squares solver.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastSquaresKernelSolver;

fn normalize_over(domain: &BBox, x: f64, y: f64) -> (f64, f64) {
    let w = (domain.width().max(2) - 1) as f64;
    let h = (domain.height().max(2) - 1) as f64;
    (
        2.0 * (x - domain.min_x as f64) / w - 1.0,
        2.0 * (y - domain.min_y as f64) / h - 1.0,
    )
}

/// Per-pixel design rows for one candidate.
struct CandidateDesign {
    rows: Vec<Vec<f64>>,
    rhs: Vec<f64>,
    weights: Vec<f64>,
}

struct DesignSpec<'a> {
    basis: &'a BasisList,
    spatial_order: usize,
    n_bg: usize,
    bg_order: usize,
    domain: BBox,
    veto: u16,
}

/// Build design rows for one candidate, or `None` when the patch is too
/// small or fully vetoed.
fn candidate_design(cand: &KernelCandidate, spec: &DesignSpec<'_>) -> Option<CandidateDesign> {
    let size = spec.basis.width();
    let (ph, pw) = (cand.template.height(), cand.template.width());
    if ph < size + 2 || pw < size + 2 {
        return None;
    }
    let half = size / 2;
    let oh = ph - size + 1;
    let ow = pw - size + 1;

    let convolved: Vec<ndarray::Array2<f64>> = spec
        .basis
        .iter()
        .map(|k| convolve_valid(&cand.template.image().view(), &k.view()))
        .collect();

    let n_spatial = n_poly_terms(spec.spatial_order);
    let n_cols = spec.basis.len() * n_spatial + spec.n_bg;

    let (cnx, cny) = normalize_over(&spec.domain, cand.x, cand.y);
    let mut spatial_terms = Vec::with_capacity(n_spatial);
    poly_terms(spec.spatial_order, cnx, cny, &mut spatial_terms);

    let (px0, py0) = cand.science.xy0();
    let mut rows = Vec::new();
    let mut rhs = Vec::new();
    let mut weights = Vec::new();
    let mut bg_terms = Vec::with_capacity(spec.n_bg.max(1));

    for r in 0..oh {
        for c in 0..ow {
            let sr = r + half;
            let sc = c + half;
            let flags = cand.science.mask()[[sr, sc]] | cand.template.mask()[[sr, sc]];
            if flags & spec.veto != 0 {
                continue;
            }
            let var = cand.science.variance()[[sr, sc]].max(VARIANCE_FLOOR);

            let mut row = Vec::with_capacity(n_cols);
            for conv in &convolved {
                let v = conv[[r, c]];
                for t in &spatial_terms {
                    row.push(v * t);
                }
            }
            if spec.n_bg > 0 {
                let x = px0 as f64 + sc as f64;
                let y = py0 as f64 + sr as f64;
                let (nx, ny) = normalize_over(&spec.domain, x, y);
                poly_terms(spec.bg_order, nx, ny, &mut bg_terms);
                row.extend_from_slice(&bg_terms);
            }
            rows.push(row);
            rhs.push(cand.science.image()[[sr, sc]]);
            weights.push(1.0 / var);
        }
    }

    if rows.len() < MIN_INTERIOR_PIXELS {
        return None;
    }
    Some(CandidateDesign { rows, rhs, weights })
}

fn solve_normal(ata: DMatrix<f64>, atb: DVector<f64>) -> Result<DVector<f64>, SolveError> {
    if let Some(ch) = ata.clone().cholesky() {
        return Ok(ch.solve(&atb));
    }
    let svd = ata.svd(true, true);
    svd.solve(&atb, 1e-10).map_err(|_| SolveError::Singular)
}

fn accumulate(
    ata: &mut DMatrix<f64>,
    atb: &mut DVector<f64>,
    design: &CandidateDesign,
) {
    for ((row, &b), &w) in design
        .rows
        .iter()
        .zip(design.rhs.iter())
        .zip(design.weights.iter())
    {
        for i in 0..row.len() {
            let wi = w * row[i];
            atb[i] += wi * b;
            for j in i..row.len() {
                ata[(i, j)] += wi * row[j];
            }
        }
    }
}

fn mirror_upper(ata: &mut DMatrix<f64>) {
    let n = ata.nrows();
    for i in 0..n {
        for j in 0..i {
            ata[(i, j)] = ata[(j, i)];
        }
    }
}

fn residual_sum(design: &CandidateDesign, solution: &DVector<f64>) -> (f64, usize) {
    let mut rss = 0.0;
    for (row, &b) in design.rows.iter().zip(design.rhs.iter()) {
        let model: f64 = row.iter().zip(solution.iter()).map(|(r, s)| r * s).sum();
        let d = b - model;
        rss += d * d;
    }
    (rss, design.rows.len())
}

impl KernelSolver for LeastSquaresKernelSolver {
    fn solve(
        &self,
        cells: &SpatialCellSet,
        basis: &BasisList,
    ) -> Result<KernelSolution, SolveError> {
        let first = cells.candidates().next().ok_or(SolveError::TooFewCandidates {
            have: 0,
            need: 1,
        })?;
        let config: KernelConfig = serde_json::from_str(&first.kernel_config_json)
            .map_err(|e| SolveError::BadCandidateConfig(e.to_string()))?;

        let domain = cells.bbox();
        let mut spatial_order = config.spatial_kernel_order;
        let n_usable_estimate = cells.n_candidates();
        if n_usable_estimate < config.min_usable_candidates {
            return Err(SolveError::TooFewCandidates {
                have: n_usable_estimate,
                need: config.min_usable_candidates,
            });
        }
        while spatial_order > 0 && n_usable_estimate < n_poly_terms(spatial_order) {
            spatial_order -= 1;
        }
        if spatial_order != config.spatial_kernel_order {
            warn!(
                "reducing spatial kernel order {} -> {} for {} candidates",
                config.spatial_kernel_order, spatial_order, n_usable_estimate
            );
        }

        let n_bg = if config.fit_for_background {
            n_poly_terms(config.spatial_bg_order)
        } else {
            0
        };
        let spec = DesignSpec {
            basis,
            spatial_order,
            n_bg,
            bg_order: config.spatial_bg_order,
            domain,
            veto: config.candidate.veto_mask,
        };

        let designs: Vec<CandidateDesign> = cells
            .candidates()
            .filter_map(|cand| {
                let d = candidate_design(cand, &spec);
                if d.is_none() {
                    debug!("candidate {} unusable for the solve", cand.id);
                }
                d
            })
            .collect();

        if designs.len() < config.min_usable_candidates {
            return Err(SolveError::TooFewCandidates {
                have: designs.len(),
                need: config.min_usable_candidates,
            });
        }

        let n_spatial = n_poly_terms(spatial_order);
        let n_cols = basis.len() * n_spatial + n_bg;
        let mut ata = DMatrix::zeros(n_cols, n_cols);
        let mut atb = DVector::zeros(n_cols);
        for design in &designs {
            accumulate(&mut ata, &mut atb, design);
        }
        mirror_upper(&mut ata);
        let solution = solve_normal(ata, atb)?;

        let mut coeffs = Vec::with_capacity(basis.len());
        for j in 0..basis.len() {
            coeffs.push(
                (0..n_spatial)
                    .map(|k| solution[j * n_spatial + k])
                    .collect(),
            );
        }
        let kernel = SpatialKernelModel {
            basis: basis.clone(),
            coeffs,
            spatial_order,
            domain,
        };

        let background = if n_bg > 0 {
            let bg_coeffs: Vec<f64> = (0..n_bg)
                .map(|m| solution[basis.len() * n_spatial + m])
                .collect();
            BackgroundModel::new(bg_coeffs, config.spatial_bg_order, domain)
        } else {
            BackgroundModel::zero(domain)
        };

        let (rss, n_pix) = designs.iter().fold((0.0, 0usize), |(rss, n), d| {
            let (r, p) = residual_sum(d, &solution);
            (rss + r, n + p)
        });
        info!(
            "spatial solve: {} candidates, {} unknowns, rms residual {:.4}",
            designs.len(),
            n_cols,
            (rss / n_pix.max(1) as f64).sqrt()
        );

        Ok(KernelSolution {
            kernel,
            background,
            n_candidates_used: designs.len(),
        })
    }
}

/// Constant-kernel residual evaluation used by the BIC basis search.
///
/// Fits a single spatially constant kernel (no background) to every
/// candidate and returns `(rss, n_pixels, n_parameters)`.
pub(crate) fn single_kernel_rss(
    cells: &SpatialCellSet,
    basis: &BasisList,
) -> Result<(f64, usize, usize), SolveError> {
    let first = cells.candidates().next().ok_or(SolveError::TooFewCandidates {
        have: 0,
        need: 1,
    })?;
    let config: KernelConfig = serde_json::from_str(&first.kernel_config_json)
        .map_err(|e| SolveError::BadCandidateConfig(e.to_string()))?;

    let spec = DesignSpec {
        basis,
        spatial_order: 0,
        n_bg: 0,
        bg_order: 0,
        domain: cells.bbox(),
        veto: config.candidate.veto_mask,
    };
    let designs: Vec<CandidateDesign> = cells
        .candidates()
        .filter_map(|cand| candidate_design(cand, &spec))
        .collect();
    if designs.is_empty() {
        return Err(SolveError::TooFewCandidates { have: 0, need: 1 });
    }

    let n_cols = basis.len();
    let mut ata = DMatrix::zeros(n_cols, n_cols);
    let mut atb = DVector::zeros(n_cols);
    for design in &designs {
        accumulate(&mut ata, &mut atb, design);
    }
    mirror_upper(&mut ata);
    let solution = solve_normal(ata, atb)?;

    let (rss, n_pix) = designs.iter().fold((0.0, 0usize), |(rss, n), d| {
        let (r, p) = residual_sum(d, &solution);
        (rss + r, n + p)
    });
    Ok((rss, n_pix, n_cols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    use crate::basis::select_basis;
    use crate::candidates::VettedCandidate;
    use crate::cells::{build_cell_set, FixedCellSizer};
    use crate::config::{BasisConfig, BasisFamily};

    fn gaussian_image(
        width: usize,
        height: usize,
        x: f64,
        y: f64,
        flux: f64,
        sigma: f64,
    ) -> Array2<f64> {
        let norm = flux / (2.0 * std::f64::consts::PI * sigma * sigma);
        Array2::from_shape_fn((height, width), |(r, c)| {
            let dx = c as f64 - x;
            let dy = r as f64 - y;
            norm * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        })
    }

    fn masked(image: Array2<f64>) -> MaskedImage {
        let dim = image.dim();
        MaskedImage::from_planes(
            image,
            Array2::zeros(dim),
            Array2::from_elem(dim, 1.0),
            (0, 0),
        )
        .unwrap()
    }

    fn delta_to_gaussian_cells(config: &KernelConfig) -> (SpatialCellSet, BasisList) {
        // Template: unit impulses; science: the same impulses blurred by a
        // sigma = 2 Gaussian. The matching kernel is exactly that Gaussian.
        let (w, h) = (96usize, 96usize);
        let mut template = Array2::zeros((h, w));
        let mut science = Array2::zeros((h, w));
        let centers = [(30.0, 30.0), (66.0, 34.0), (48.0, 70.0)];
        for &(x, y) in &centers {
            template[[y as usize, x as usize]] = 1000.0;
            science += &gaussian_image(w, h, x, y, 1000.0, 2.0);
        }
        let template = masked(template);
        let science = masked(science);
        let cands: Vec<VettedCandidate> = centers
            .iter()
            .map(|&(x, y)| VettedCandidate {
                bbox: astroimage::BBox::around(x, y, 13),
                centroid: (x, y),
            })
            .collect();
        let cells = build_cell_set(
            &template,
            &science,
            &cands,
            config,
            &FixedCellSizer {
                size_x: 48,
                size_y: 48,
            },
        )
        .unwrap();
        let basis_cfg = BasisConfig {
            scale_by_fwhm: false,
            kernel_size: 13,
            base_sigmas: vec![2.0],
            deg_gauss: vec![2],
            ..BasisConfig::default()
        };
        let basis = select_basis(None, None, &basis_cfg).unwrap();
        (cells, basis)
    }

    #[test]
    fn recovers_known_gaussian_kernel() {
        let config = KernelConfig {
            spatial_kernel_order: 0,
            fit_for_background: true,
            spatial_bg_order: 0,
            ..KernelConfig::default()
        };
        let (cells, basis) = delta_to_gaussian_cells(&config);
        let solution = LeastSquaresKernelSolver.solve(&cells, &basis).unwrap();
        assert_eq!(solution.n_candidates_used, 3);
        // Photometric scale: blur conserves flux, so the kernel sum is 1 up
        // to the mass truncated outside the 13 px support.
        assert_relative_eq!(
            solution.kernel.kernel_sum_at(48.0, 48.0),
            1.0,
            epsilon = 5e-3
        );
        // Kernel shape matches the blur.
        let img = solution.kernel.kernel_image_at(48.0, 48.0);
        let truth = gaussian_image(13, 13, 6.0, 6.0, 1.0, 2.0);
        for (a, b) in img.iter().zip(truth.iter()) {
            assert!((a - b).abs() < 2e-3, "kernel pixel off: {a} vs {b}");
        }
        // No differential background was injected.
        assert!(solution.background.eval(48.0, 48.0).abs() < 1e-3);
    }

    #[test]
    fn too_few_candidates_is_rejected() {
        let config = KernelConfig {
            min_usable_candidates: 5,
            ..KernelConfig::default()
        };
        let (cells, basis) = delta_to_gaussian_cells(&config);
        let err = LeastSquaresKernelSolver.solve(&cells, &basis).unwrap_err();
        assert!(matches!(err, SolveError::TooFewCandidates { have: 3, need: 5 }));
    }

    #[test]
    fn spatial_order_is_clamped_for_sparse_candidates() {
        let config = KernelConfig {
            spatial_kernel_order: 2,
            fit_for_background: false,
            min_usable_candidates: 3,
            ..KernelConfig::default()
        };
        let (cells, basis) = delta_to_gaussian_cells(&config);
        // Three candidates cannot support the 6 second-order terms.
        let solution = LeastSquaresKernelSolver.solve(&cells, &basis).unwrap();
        assert!(solution.kernel.spatial_order() <= 1);
    }

    #[test]
    fn differential_background_is_recovered() {
        let config = KernelConfig {
            spatial_kernel_order: 0,
            fit_for_background: true,
            spatial_bg_order: 0,
            ..KernelConfig::default()
        };
        let (mut cells, basis) = delta_to_gaussian_cells(&config);
        // Add a constant offset to every science patch.
        let offset = 25.0;
        let mut shifted = Vec::new();
        for cand in cells.candidates() {
            let mut c = cand.clone();
            c.science.add_scalar(offset);
            shifted.push(c);
        }
        let mut rebuilt = SpatialCellSet::new(cells.bbox(), 48, 48);
        for c in shifted {
            rebuilt.insert(c).unwrap();
        }
        cells = rebuilt;
        let solution = LeastSquaresKernelSolver.solve(&cells, &basis).unwrap();
        assert_relative_eq!(
            solution.background.eval(48.0, 48.0),
            offset,
            epsilon = 1e-2
        );
        assert_relative_eq!(
            solution.kernel.kernel_sum_at(48.0, 48.0),
            1.0,
            epsilon = 1e-2
        );
    }

    #[test]
    fn delta_basis_matches_arbitrary_shift() {
        // Science is the template shifted by one pixel; the delta basis can
        // represent that exactly.
        let (w, h) = (64usize, 64usize);
        let mut template = Array2::zeros((h, w));
        let mut science = Array2::zeros((h, w));
        for &(x, y) in &[(20usize, 20usize), (44, 24), (32, 46)] {
            template[[y, x]] = 500.0;
            science[[y, x + 1]] = 500.0;
        }
        let template = masked(template);
        let science = masked(science);
        let config = KernelConfig {
            spatial_kernel_order: 0,
            fit_for_background: false,
            ..KernelConfig::default()
        };
        let cands: Vec<VettedCandidate> = [(20.0, 20.0), (44.0, 24.0), (32.0, 46.0)]
            .iter()
            .map(|&(x, y)| VettedCandidate {
                bbox: astroimage::BBox::around(x, y, 7),
                centroid: (x, y),
            })
            .collect();
        let cells = build_cell_set(
            &template,
            &science,
            &cands,
            &config,
            &FixedCellSizer {
                size_x: 32,
                size_y: 32,
            },
        )
        .unwrap();
        let basis = select_basis(
            None,
            None,
            &BasisConfig {
                family: BasisFamily::DeltaFunction,
                scale_by_fwhm: false,
                kernel_size: 5,
                ..BasisConfig::default()
            },
        )
        .unwrap();
        let solution = LeastSquaresKernelSolver.solve(&cells, &basis).unwrap();
        let kernel = solution.kernel.kernel_image_at(32.0, 32.0);
        // Correlation convention: S[y, x] = T[y, x - 1] puts the unit weight
        // one pixel left of center.
        assert_relative_eq!(kernel[[2, 1]], 1.0, epsilon = 1e-6);
        assert!(kernel[[2, 2]].abs() < 1e-6);
    }
}
