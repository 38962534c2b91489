//! Spatial cells: localized containers of kernel-fitting candidates.
//!
//! The cell grid partitions the template bbox so the spatial solve can draw
//! candidates evenly across the field. Cell membership is decided purely by
//! the candidate's footprint center.

use astroimage::bbox::BBox;
use astroimage::masked_image::MaskedImage;
use tracing::{debug, info};

use crate::candidates::VettedCandidate;
use crate::config::KernelConfig;
use crate::error::{CandidateError, ConfigError, MatchError};

/// A paired template/science patch ready for kernel fitting.
#[derive(Debug, Clone)]
pub struct KernelCandidate {
    /// Sequential candidate id within the cell set.
    pub id: usize,
    /// Centroid x in parent pixels.
    pub x: f64,
    /// Centroid y in parent pixels.
    pub y: f64,
    /// Patch extracted from the image that will be convolved.
    pub template: MaskedImage,
    /// Patch extracted from the reference image.
    pub science: MaskedImage,
    /// Serialized copy of the active kernel configuration, so the solver can
    /// read fitting parameters without a second config dependency.
    pub kernel_config_json: String,
}

/// One grid cell owning zero or more candidates.
#[derive(Debug, Clone)]
pub struct SpatialCell {
    pub bbox: BBox,
    candidates: Vec<KernelCandidate>,
}

impl SpatialCell {
    pub fn candidates(&self) -> &[KernelCandidate] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Grid partition of an image bbox, each cell owning its candidates.
#[derive(Debug, Clone)]
pub struct SpatialCellSet {
    bbox: BBox,
    nx: usize,
    ny: usize,
    cell_width: usize,
    cell_height: usize,
    cells: Vec<SpatialCell>,
}

impl SpatialCellSet {
    /// Grid covering exactly `bbox` with cells of the given size; boundary
    /// cells are truncated to the bbox.
    pub fn new(bbox: BBox, cell_width: usize, cell_height: usize) -> Self {
        let cell_width = cell_width.max(1);
        let cell_height = cell_height.max(1);
        let nx = bbox.width().div_ceil(cell_width).max(1);
        let ny = bbox.height().div_ceil(cell_height).max(1);
        let mut cells = Vec::with_capacity(nx * ny);
        for iy in 0..ny {
            for ix in 0..nx {
                let min_x = bbox.min_x + (ix * cell_width) as i64;
                let min_y = bbox.min_y + (iy * cell_height) as i64;
                let max_x = (min_x + cell_width as i64 - 1).min(bbox.max_x);
                let max_y = (min_y + cell_height as i64 - 1).min(bbox.max_y);
                cells.push(SpatialCell {
                    bbox: BBox::from_corners(min_x, min_y, max_x, max_y),
                    candidates: Vec::new(),
                });
            }
        }
        Self {
            bbox,
            nx,
            ny,
            cell_width,
            cell_height,
            cells,
        }
    }

    pub fn bbox(&self) -> BBox {
        self.bbox
    }

    pub fn cell_dimensions(&self) -> (usize, usize) {
        (self.cell_width, self.cell_height)
    }

    pub fn cells(&self) -> &[SpatialCell] {
        &self.cells
    }

    /// Insert a candidate into the cell containing its centroid.
    pub fn insert(&mut self, candidate: KernelCandidate) -> Result<(), CandidateError> {
        let cx = candidate.x.round() as i64;
        let cy = candidate.y.round() as i64;
        if !self.bbox.contains_point(cx, cy) {
            return Err(CandidateError::OutOfBounds(BBox::from_corners(
                cx, cy, cx, cy,
            )));
        }
        let ix = ((cx - self.bbox.min_x) as usize / self.cell_width).min(self.nx - 1);
        let iy = ((cy - self.bbox.min_y) as usize / self.cell_height).min(self.ny - 1);
        self.cells[iy * self.nx + ix].candidates.push(candidate);
        Ok(())
    }

    /// All candidates across all cells, in insertion order per cell.
    pub fn candidates(&self) -> impl Iterator<Item = &KernelCandidate> {
        self.cells.iter().flat_map(|c| c.candidates.iter())
    }

    pub fn n_candidates(&self) -> usize {
        self.cells.iter().map(|c| c.candidates.len()).sum()
    }
}

/// Cell-sizing policy.
///
/// The fixed implementation is the only one in production use; adaptive
/// sizing from candidate density is the intended extension point.
pub trait CellSizer {
    fn cell_size(&self, candidates: &[VettedCandidate], image_bbox: &BBox) -> (usize, usize);
}

/// Fixed cell size read from configuration.
#[derive(Debug, Clone, Copy)]
pub struct FixedCellSizer {
    pub size_x: usize,
    pub size_y: usize,
}

impl FixedCellSizer {
    pub fn from_config(config: &KernelConfig) -> Self {
        Self {
            size_x: config.size_cell_x,
            size_y: config.size_cell_y,
        }
    }
}

impl CellSizer for FixedCellSizer {
    fn cell_size(&self, _candidates: &[VettedCandidate], _image_bbox: &BBox) -> (usize, usize) {
        (self.size_x, self.size_y)
    }
}

/// Build the cell set the solver consumes.
///
/// Extracts co-located patches from both images at each vetted footprint and
/// files the resulting `KernelCandidate` into the grid cell containing its
/// centroid. The grid covers exactly the to-convolve image's bbox.
pub fn build_cell_set(
    to_convolve: &MaskedImage,
    reference: &MaskedImage,
    candidates: &[VettedCandidate],
    config: &KernelConfig,
    sizer: &dyn CellSizer,
) -> Result<SpatialCellSet, MatchError> {
    if candidates.is_empty() {
        return Err(CandidateError::EmptyInput.into());
    }

    let bbox = to_convolve.bbox();
    let (cell_w, cell_h) = sizer.cell_size(candidates, &bbox);
    let mut cell_set = SpatialCellSet::new(bbox, cell_w, cell_h);

    let config_json = serde_json::to_string(config).map_err(ConfigError::Serialize)?;

    for (id, cand) in candidates.iter().enumerate() {
        let template = to_convolve
            .subimage(&cand.bbox)
            .map_err(|_| CandidateError::OutOfBounds(cand.bbox))?;
        let science = reference
            .subimage(&cand.bbox)
            .map_err(|_| CandidateError::OutOfBounds(cand.bbox))?;
        debug!(
            "candidate {} at {:.2}, {:.2}",
            id, cand.centroid.0, cand.centroid.1
        );
        cell_set.insert(KernelCandidate {
            id,
            x: cand.centroid.0,
            y: cand.centroid.1,
            template,
            science,
            kernel_config_json: config_json.clone(),
        })?;
    }

    info!(
        "cell set: {} candidates in {}x{} cells over {:?}",
        cell_set.n_candidates(),
        cell_set.nx,
        cell_set.ny,
        bbox
    );
    Ok(cell_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vetted(x: f64, y: f64, half: i64) -> VettedCandidate {
        VettedCandidate {
            bbox: BBox::around(x, y, half),
            centroid: (x, y),
        }
    }

    #[test]
    fn grid_covers_bbox_exactly() {
        let set = SpatialCellSet::new(BBox::from_corners(0, 0, 99, 79), 32, 32);
        assert_eq!(set.nx, 4);
        assert_eq!(set.ny, 3);
        let last = set.cells().last().unwrap();
        assert_eq!(last.bbox.max_x, 99);
        assert_eq!(last.bbox.max_y, 79);
    }

    #[test]
    fn empty_candidates_fail() {
        let mi = MaskedImage::zeros(64, 64);
        let err = build_cell_set(
            &mi,
            &mi,
            &[],
            &KernelConfig::default(),
            &FixedCellSizer {
                size_x: 32,
                size_y: 32,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Candidate(CandidateError::EmptyInput)
        ));
    }

    #[test]
    fn candidate_count_matches_input() {
        let mi = MaskedImage::zeros(128, 128);
        let cands = vec![
            vetted(20.0, 20.0, 8),
            vetted(100.0, 30.0, 8),
            vetted(60.0, 110.0, 8),
        ];
        let set = build_cell_set(
            &mi,
            &mi,
            &cands,
            &KernelConfig::default(),
            &FixedCellSizer {
                size_x: 64,
                size_y: 64,
            },
        )
        .unwrap();
        assert_eq!(set.n_candidates(), 3);
        // Patches carry parent coordinates.
        let first = set.candidates().find(|c| c.id == 0).unwrap();
        assert_eq!(first.template.xy0(), (12, 12));
        assert_eq!(first.template.dimensions(), (17, 17));
    }

    #[test]
    fn candidates_land_in_their_cells() {
        let mi = MaskedImage::zeros(128, 128);
        let cands = vec![vetted(20.0, 20.0, 8), vetted(100.0, 100.0, 8)];
        let set = build_cell_set(
            &mi,
            &mi,
            &cands,
            &KernelConfig::default(),
            &FixedCellSizer {
                size_x: 64,
                size_y: 64,
            },
        )
        .unwrap();
        for cell in set.cells() {
            for cand in cell.candidates() {
                assert!(cell
                    .bbox
                    .contains_point(cand.x.round() as i64, cand.y.round() as i64));
            }
        }
    }

    #[test]
    fn candidates_carry_serialized_config() {
        let mi = MaskedImage::zeros(64, 64);
        let set = build_cell_set(
            &mi,
            &mi,
            &[vetted(32.0, 32.0, 8)],
            &KernelConfig::default(),
            &FixedCellSizer {
                size_x: 32,
                size_y: 32,
            },
        )
        .unwrap();
        let cand = set.candidates().next().unwrap();
        let parsed: KernelConfig = serde_json::from_str(&cand.kernel_config_json).unwrap();
        assert_eq!(parsed.size_cell_x, KernelConfig::default().size_cell_x);
    }
}
