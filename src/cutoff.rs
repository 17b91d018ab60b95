//! Cutoff profiles.
//!
//! For every internal block boundary a profile is searched inside a small tile around the nominal
//! boundary line. Each element picks the position with the highest contrast across the cut, so
//! neighbouring blocks meet along image edges instead of slicing homogeneous regions in half.
//!
//! Profile values are absolute raster coordinates of the first pixel on the far side of the cut:
//! the first row of the lower block for [`ProfileAxis::Horizontal`], the first column of the right
//! block for [`ProfileAxis::Vertical`].

use crate::error::RasterError;
use crate::planner::BlockPlan;
use crate::raster::{BandProperty, BandType, MemRaster, PixelSource, Raster};
use log::{debug, warn};
use multiversion::multiversion;
use std::sync::Arc;

/// Pixels compared on each side of a candidate cut position.
pub const PIXEL_WINDOW: usize = 5;
/// Maximum move of the cut between two neighbouring elements.
pub const SMOOTHING: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileAxis {
    /// Cut between vertically stacked blocks. Indexed by column, values are rows.
    Horizontal,
    /// Cut between side by side blocks. Indexed by row, values are columns.
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoffProfile {
    pub axis: ProfileAxis,
    /// Nominal boundary line.
    pub center: usize,
    values: Vec<usize>,
    straight: bool,
}

impl CutoffProfile {
    /// Profile following the nominal boundary.
    pub fn straight(axis: ProfileAxis, center: usize, len: usize) -> Self {
        Self {
            axis,
            center,
            values: vec![center; len],
            straight: true,
        }
    }

    #[inline(always)]
    pub fn at(&self, pos: usize) -> usize {
        self.values.get(pos).copied().unwrap_or(self.center)
    }

    pub fn values(&self) -> &[usize] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_straight(&self) -> bool {
        self.straight
    }
}

/// Contrast across position `pos` of `strip`: mean absolute difference of mirrored pixel pairs.
#[multiversion(targets = "simd")]
fn strip_contrast(strip: &[f64], pos: usize, window: usize) -> f64 {
    let mut sum = 0f64;
    for k in 0..window {
        sum += (strip[pos - 1 - k] - strip[pos + k]).abs();
    }
    sum / (2 * window + 1) as f64
}

/// Search a cutoff profile around `center_line`.
///
/// `raster_dims` is `(rows, cols)` of `source`. Returns `Ok(None)` when the tile neighbourhood is
/// too small to hold a pixel window on both sides of the cut.
#[allow(clippy::too_many_arguments)]
pub fn generate<S: PixelSource + ?Sized>(
    source: &S,
    raster_dims: (usize, usize),
    bands: &[usize],
    center_line: usize,
    axis: ProfileAxis,
    pixel_window: usize,
    tile_window: usize,
    smoothing: usize,
) -> Result<Option<CutoffProfile>, RasterError> {
    let (rows, cols) = raster_dims;
    let (length, extent) = match axis {
        ProfileAxis::Horizontal => (cols, rows),
        ProfileAxis::Vertical => (rows, cols),
    };
    if tile_window < pixel_window || extent == 0 || bands.is_empty() {
        return Ok(None);
    }

    let start = center_line.saturating_sub(tile_window).min(extent - 1);
    let bound = (center_line + 1 + tile_window).min(extent);
    if bound <= start || bound - start < 1 + 2 * pixel_window {
        return Ok(None);
    }
    let min_pos = start + pixel_window;
    let max_pos = bound - pixel_window;
    let strip_len = bound - start;

    let mut strips = vec![0f64; bands.len() * strip_len];
    let mut values: Vec<usize> = Vec::with_capacity(length);
    for element in 0..length {
        for (strip, band) in strips.chunks_exact_mut(strip_len).zip(bands) {
            for (offset, v) in strip.iter_mut().enumerate() {
                let across = start + offset;
                *v = match axis {
                    ProfileAxis::Horizontal => source.value(element, across, *band)?,
                    ProfileAxis::Vertical => source.value(across, element, *band)?,
                };
            }
        }

        let (lo, hi) = match values.last() {
            Some(&prev) => (
                prev.saturating_sub(smoothing).max(min_pos),
                (prev + smoothing).min(max_pos),
            ),
            None => (min_pos, max_pos),
        };
        let mut best = lo;
        let mut best_score = 0f64;
        for pos in lo..=hi {
            let score: f64 = strips
                .chunks_exact(strip_len)
                .map(|strip| strip_contrast(strip, pos - start, pixel_window))
                .sum();
            if score > best_score {
                best_score = score;
                best = pos;
            }
        }
        values.push(best);
    }

    Ok(Some(CutoffProfile {
        axis,
        center: center_line,
        values,
        straight: false,
    }))
}

/// Keeps neighbouring profiles from crossing each other.
fn tile_window(overlap: usize, block_edge: usize) -> usize {
    (overlap / 2).min(block_edge / 2 + PIXEL_WINDOW - 1)
}

/// All profiles of one block grid.
///
/// `horizontal[k]` separates block rows `k` and `k + 1`, `vertical[k]` block columns `k` and
/// `k + 1`. Profiles span the whole raster and are shared by every block along the line.
#[derive(Debug, Clone, Default)]
pub struct CutoffSet {
    pub horizontal: Vec<Arc<CutoffProfile>>,
    pub vertical: Vec<Arc<CutoffProfile>>,
    /// Profiles which could not be searched and follow the nominal line.
    pub fallbacks: usize,
}

impl CutoffSet {
    /// No profiles, blocks end at their window edge.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn build<S: PixelSource + ?Sized>(
        source: &S,
        bands: &[usize],
        plan: &BlockPlan,
    ) -> Result<Self, RasterError> {
        let (v_blocks, h_blocks) = plan.grid_dims();
        let dims = (plan.raster_rows, plan.raster_cols);
        let mut set = Self::default();

        let h_tile = tile_window(plan.overlap_h, plan.block_height);
        for k in 1..v_blocks {
            let center = k * plan.block_height;
            let profile = match generate(
                source,
                dims,
                bands,
                center,
                ProfileAxis::Horizontal,
                PIXEL_WINDOW,
                h_tile,
                SMOOTHING,
            )? {
                Some(profile) => profile,
                None => {
                    warn!("horizontal cutoff at row {center} falls back to a straight line (tile {h_tile})");
                    set.fallbacks += 1;
                    CutoffProfile::straight(ProfileAxis::Horizontal, center, plan.raster_cols)
                }
            };
            set.horizontal.push(Arc::new(profile));
        }

        let v_tile = tile_window(plan.overlap_w, plan.block_width);
        for k in 1..h_blocks {
            let center = k * plan.block_width;
            let profile = match generate(
                source,
                dims,
                bands,
                center,
                ProfileAxis::Vertical,
                PIXEL_WINDOW,
                v_tile,
                SMOOTHING,
            )? {
                Some(profile) => profile,
                None => {
                    warn!("vertical cutoff at column {center} falls back to a straight line (tile {v_tile})");
                    set.fallbacks += 1;
                    CutoffProfile::straight(ProfileAxis::Vertical, center, plan.raster_rows)
                }
            };
            set.vertical.push(Arc::new(profile));
        }

        debug!(
            "generated {} horizontal and {} vertical cutoff profiles, {} straight",
            set.horizontal.len(),
            set.vertical.len(),
            set.fallbacks
        );
        Ok(set)
    }

    pub fn top(&self, matrix_row: usize) -> Option<Arc<CutoffProfile>> {
        matrix_row
            .checked_sub(1)
            .and_then(|k| self.horizontal.get(k))
            .cloned()
    }

    pub fn bottom(&self, matrix_row: usize) -> Option<Arc<CutoffProfile>> {
        self.horizontal.get(matrix_row).cloned()
    }

    pub fn left(&self, matrix_col: usize) -> Option<Arc<CutoffProfile>> {
        matrix_col
            .checked_sub(1)
            .and_then(|k| self.vertical.get(k))
            .cloned()
    }

    pub fn right(&self, matrix_col: usize) -> Option<Arc<CutoffProfile>> {
        self.vertical.get(matrix_col).cloned()
    }
}

/// Debug raster with nominal block lines and cutoff profiles drawn as 255 on a zero background.
pub fn render_cutoff_lines(set: &CutoffSet, rows: usize, cols: usize) -> MemRaster {
    let mut out = MemRaster::new(rows, cols, &[BandProperty::new(BandType::U8, None)]);
    let mut draw = |col: usize, row: usize| {
        if col < cols && row < rows {
            // in bounds, cannot fail
            let _ = out.set(col, row, 0, 255.0);
        }
    };
    for profile in &set.horizontal {
        for col in 0..cols {
            draw(col, profile.center);
            draw(col, profile.at(col));
        }
    }
    for profile in &set.vertical {
        for row in 0..rows {
            draw(profile.center, row);
            draw(profile.at(row), row);
        }
    }
    out
}
