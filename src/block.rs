//! Block descriptors and the shared block table.

use crate::cutoff::{CutoffProfile, CutoffSet};
use crate::planner::{BlockBounds, BlockPlan};
use log::trace;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockStatus {
    #[default]
    NotProcessed,
    UnderSegmentation,
    Segmented,
}

/// One unit of segmentation work.
///
/// `bounds` is the expanded window handed to the strategy, `nominal` the non-overlapping grid
/// cell. The four profiles cut the authoritative region out of the window; a missing profile
/// leaves that side at the window edge.
#[derive(Debug, Clone, Default)]
pub struct SegmentsBlock {
    pub matrix_row: usize,
    pub matrix_col: usize,
    pub bounds: BlockBounds,
    pub nominal: BlockBounds,
    pub status: BlockStatus,
    pub top: Option<Arc<CutoffProfile>>,
    pub bottom: Option<Arc<CutoffProfile>>,
    pub left: Option<Arc<CutoffProfile>>,
    pub right: Option<Arc<CutoffProfile>>,
}

impl SegmentsBlock {
    pub fn new(plan: &BlockPlan, cutoffs: &CutoffSet, matrix_row: usize, matrix_col: usize) -> Self {
        Self {
            matrix_row,
            matrix_col,
            bounds: plan.expanded_bounds(matrix_row, matrix_col),
            nominal: plan.nominal_bounds(matrix_row, matrix_col),
            status: BlockStatus::NotProcessed,
            top: cutoffs.top(matrix_row),
            bottom: cutoffs.bottom(matrix_row),
            left: cutoffs.left(matrix_col),
            right: cutoffs.right(matrix_col),
        }
    }

    /// Whether raster pixel `(row, col)` belongs to this block's output.
    #[inline]
    pub fn is_authoritative(&self, row: usize, col: usize) -> bool {
        self.bounds.contains(row, col)
            && self.top.as_ref().map_or(true, |p| row >= p.at(col))
            && self.bottom.as_ref().map_or(true, |p| row < p.at(col))
            && self.left.as_ref().map_or(true, |p| col >= p.at(row))
            && self.right.as_ref().map_or(true, |p| col < p.at(row))
    }
}

#[derive(Debug, Default)]
struct MatrixState {
    rows: usize,
    cols: usize,
    blocks: Vec<SegmentsBlock>,
}

/// Block table shared by all workers. Every access goes through one mutex.
#[derive(Debug, Default)]
pub struct SegmentsBlockMatrix {
    state: Mutex<MatrixState>,
}

impl SegmentsBlockMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table filled from a plan and its cutoff profiles.
    pub fn from_plan(plan: &BlockPlan, cutoffs: &CutoffSet) -> Self {
        let (rows, cols) = plan.grid_dims();
        let blocks = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(r, c)| SegmentsBlock::new(plan, cutoffs, r, c))
            .collect();
        Self {
            state: Mutex::new(MatrixState { rows, cols, blocks }),
        }
    }

    /// Replace the table with `rows x cols` default blocks.
    pub fn reset(&self, rows: usize, cols: usize) {
        let mut state = self.state.lock();
        state.rows = rows;
        state.cols = cols;
        state.blocks = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|(matrix_row, matrix_col)| SegmentsBlock {
                matrix_row,
                matrix_col,
                ..Default::default()
            })
            .collect();
    }

    pub fn dims(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.rows, state.cols)
    }

    pub fn len(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locked access to one block. The table stays locked while the guard lives.
    pub fn at(&self, row: usize, col: usize) -> Option<MappedMutexGuard<'_, SegmentsBlock>> {
        let guard = self.state.lock();
        if row >= guard.rows || col >= guard.cols {
            return None;
        }
        let idx = row * guard.cols + col;
        MutexGuard::try_map(guard, |state| state.blocks.get_mut(idx)).ok()
    }

    /// Copy of one block, for use outside the lock.
    pub fn snapshot(&self, row: usize, col: usize) -> Option<SegmentsBlock> {
        self.at(row, col).map(|block| block.clone())
    }

    pub fn blocks(&self) -> Vec<SegmentsBlock> {
        self.state.lock().blocks.clone()
    }

    /// Claim the first `NotProcessed` block in row-major order.
    pub fn try_claim_next(&self) -> Option<(usize, usize)> {
        let mut state = self.state.lock();
        let block = state
            .blocks
            .iter_mut()
            .find(|b| b.status == BlockStatus::NotProcessed)?;
        block.status = BlockStatus::UnderSegmentation;
        trace!("claimed block ({}, {})", block.matrix_row, block.matrix_col);
        Some((block.matrix_row, block.matrix_col))
    }

    /// Flip a claimed block to `Segmented`. Returns `false` if the block was not claimed.
    pub fn mark_done(&self, row: usize, col: usize) -> bool {
        match self.at(row, col) {
            Some(mut block) if block.status == BlockStatus::UnderSegmentation => {
                block.status = BlockStatus::Segmented;
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, row: usize, col: usize) -> Option<BlockStatus> {
        self.at(row, col).map(|block| block.status)
    }

    pub fn count(&self, status: BlockStatus) -> usize {
        self.state
            .lock()
            .blocks
            .iter()
            .filter(|b| b.status == status)
            .count()
    }

    pub fn segmented_count(&self) -> usize {
        self.count(BlockStatus::Segmented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan;
    use std::collections::HashSet;

    #[test]
    fn claims_are_exclusive_across_threads() {
        let p = plan(90, 90, 0, usize::MAX, 10, 1).unwrap();
        let matrix = SegmentsBlockMatrix::from_plan(&p, &CutoffSet::none());
        assert_eq!(matrix.dims(), (9, 9));

        let claimed = Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    while let Some((r, c)) = matrix.try_claim_next() {
                        claimed.lock().push((r, c));
                        assert!(matrix.mark_done(r, c));
                    }
                });
            }
        });
        let claimed = claimed.into_inner();
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(claimed.len(), 81);
        assert_eq!(unique.len(), 81);
        assert_eq!(matrix.segmented_count(), 81);
        assert_eq!(matrix.try_claim_next(), None);
    }

    #[test]
    fn status_only_moves_forward() {
        let matrix = SegmentsBlockMatrix::new();
        matrix.reset(1, 2);
        assert!(!matrix.mark_done(0, 0));
        assert_eq!(matrix.try_claim_next(), Some((0, 0)));
        assert_eq!(matrix.status(0, 0), Some(BlockStatus::UnderSegmentation));
        assert!(matrix.mark_done(0, 0));
        assert!(!matrix.mark_done(0, 0));
        assert_eq!(matrix.status(0, 0), Some(BlockStatus::Segmented));
        assert_eq!(matrix.try_claim_next(), Some((0, 1)));
        assert_eq!(matrix.try_claim_next(), None);
        assert_eq!(matrix.count(BlockStatus::UnderSegmentation), 1);
        assert!(matrix.at(1, 0).is_none());
    }

    #[test]
    fn authoritative_regions_tile_the_raster() {
        let raster = crate::raster::MemRaster::from_fn(
            120,
            130,
            &[crate::raster::BandProperty::new(crate::raster::BandType::F64, None)],
            |c, r, _| ((c * 7 + r * 13) % 23) as f64,
        );
        let p = plan(120, 130, 24, usize::MAX, 40, 2).unwrap();
        let cutoffs = CutoffSet::build(&raster, &[0], &p).unwrap();
        assert_eq!(cutoffs.fallbacks, 0);
        let blocks = SegmentsBlockMatrix::from_plan(&p, &cutoffs).blocks();
        for row in 0..120 {
            for col in 0..130 {
                let owners = blocks
                    .iter()
                    .filter(|b| b.is_authoritative(row, col))
                    .count();
                assert_eq!(owners, 1, "pixel ({row}, {col})");
            }
        }
    }
}
