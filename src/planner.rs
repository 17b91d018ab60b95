//! Block grid planning.
//!
//! Splits the raster into a grid of equally sized nominal blocks so that one expanded block
//! (nominal block plus overlap on every side) fits the per-worker pixel budget.

use crate::error::SegmenterError;
use log::debug;
use serde::Serialize;

/// Rectangle in raster pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockBounds {
    pub start_row: usize,
    pub start_col: usize,
    pub height: usize,
    pub width: usize,
}

impl BlockBounds {
    #[inline(always)]
    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.start_row
            && row < self.start_row + self.height
            && col >= self.start_col
            && col < self.start_col + self.width
    }

    pub fn end_row(&self) -> usize {
        self.start_row + self.height
    }

    pub fn end_col(&self) -> usize {
        self.start_col + self.width
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }
}

/// Result of [`plan`].
///
/// `overlap_h` is the margin added above and below a block (rows), `overlap_w` the margin added
/// left and right of it (columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockPlan {
    pub raster_rows: usize,
    pub raster_cols: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub overlap_h: usize,
    pub overlap_w: usize,
}

impl BlockPlan {
    /// One block covering the whole raster.
    pub fn whole(raster_rows: usize, raster_cols: usize) -> Self {
        Self {
            raster_rows,
            raster_cols,
            block_width: raster_cols,
            block_height: raster_rows,
            overlap_h: 0,
            overlap_w: 0,
        }
    }

    /// `(block rows, block columns)` of the logical grid.
    pub fn grid_dims(&self) -> (usize, usize) {
        (
            self.raster_rows.div_ceil(self.block_height),
            self.raster_cols.div_ceil(self.block_width),
        )
    }

    pub fn block_count(&self) -> usize {
        let (v, h) = self.grid_dims();
        v * h
    }

    pub fn nominal_bounds(&self, matrix_row: usize, matrix_col: usize) -> BlockBounds {
        let start_row = matrix_row * self.block_height;
        let start_col = matrix_col * self.block_width;
        BlockBounds {
            start_row,
            start_col,
            height: self.block_height.min(self.raster_rows - start_row),
            width: self.block_width.min(self.raster_cols - start_col),
        }
    }

    /// Nominal bounds grown by the overlap margin, clamped to the raster.
    pub fn expanded_bounds(&self, matrix_row: usize, matrix_col: usize) -> BlockBounds {
        let nominal = self.nominal_bounds(matrix_row, matrix_col);
        let start_row = nominal.start_row.saturating_sub(self.overlap_h);
        let start_col = nominal.start_col.saturating_sub(self.overlap_w);
        let end_row = nominal
            .end_row()
            .saturating_add(self.overlap_h)
            .min(self.raster_rows);
        let end_col = nominal
            .end_col()
            .saturating_add(self.overlap_w)
            .min(self.raster_cols);
        BlockBounds {
            start_row,
            start_col,
            height: end_row - start_row,
            width: end_col - start_col,
        }
    }
}

/// Compute the block grid.
///
/// `memory_budget_pixels` is the number of pixels the strategy may hold in memory at once across
/// all workers, `max_block_size` an optional (0 = none) cap on the nominal block edge.
/// The smallest scale factor whose expanded block fits the cap wins, so blocks are as large as
/// possible.
pub fn plan(
    raster_rows: usize,
    raster_cols: usize,
    overlap: usize,
    memory_budget_pixels: usize,
    max_block_size: usize,
    thread_count: usize,
) -> Result<BlockPlan, SegmenterError> {
    if raster_rows == 0 || raster_cols == 0 {
        return Err(SegmenterError::EmptyRaster);
    }
    let threads = thread_count.max(1);
    let total_pixels = raster_rows.saturating_mul(raster_cols);
    let user_cap_splits = max_block_size > 0
        && max_block_size
            .checked_mul(max_block_size)
            .is_some_and(|cap| cap < total_pixels);
    if threads == 1 && memory_budget_pixels >= total_pixels && !user_cap_splits {
        return Ok(BlockPlan::whole(raster_rows, raster_cols));
    }

    // a cap too large to represent limits nothing
    let max_block_pixels = if max_block_size > 0 {
        expanded_pixels(max_block_size, max_block_size, overlap).unwrap_or(usize::MAX)
    } else {
        memory_budget_pixels / threads
    };
    let unworkable = SegmenterError::UnworkableBudget {
        rows: raster_rows,
        cols: raster_cols,
        overlap,
        max_block_pixels,
    };
    let min_block_pixels = match overlap.checked_mul(overlap) {
        Some(pixels) if overlap.checked_mul(2).is_some() => pixels.max(1),
        _ => return Err(unworkable),
    };
    if min_block_pixels > max_block_pixels {
        return Err(unworkable);
    }

    for scale in 1..=raster_rows.max(raster_cols) {
        let block_height = raster_rows.div_ceil(scale);
        let block_width = raster_cols.div_ceil(scale);
        if block_height.saturating_mul(block_width) < min_block_pixels {
            break;
        }
        let fits = expanded_pixels(block_height, block_width, overlap)
            .is_some_and(|expanded| expanded <= max_block_pixels);
        if fits {
            debug!(
                "planned {block_width}x{block_height} blocks (scale {scale}, overlap {overlap}, cap {max_block_pixels} px)"
            );
            return Ok(BlockPlan {
                raster_rows,
                raster_cols,
                block_width,
                block_height,
                overlap_h: overlap,
                overlap_w: overlap,
            });
        }
    }
    Err(unworkable)
}

/// Pixels of a `height` x `width` block grown by `overlap` on every side, `None` on overflow.
fn expanded_pixels(height: usize, width: usize, overlap: usize) -> Option<usize> {
    let margin = overlap.checked_mul(2)?;
    height
        .checked_add(margin)?
        .checked_mul(width.checked_add(margin)?)
}
