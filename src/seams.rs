//! Post-run reconciliation of labels along block seams.
//!
//! Blocks are segmented independently, so a region crossing a cutoff line ends up with one label
//! per block. Neighbouring pixels owned by different blocks are compared with the strategy's seam
//! rule and matching labels are joined, each group keeping its smallest label.

use crate::arrays::Array2D;
use crate::block::SegmentsBlock;
use crate::connectivity::DisjointSet;
use crate::error::SegmenterError;
use crate::segmenter::BandStatistics;
use crate::strategy::SegmentationStrategy;
use crate::sync::RasterSynchronizer;
use log::debug;

const NO_OWNER: u32 = u32::MAX;

/// Block owning every pixel.
fn owner_map(blocks: &[SegmentsBlock], rows: usize, cols: usize) -> Array2D<u32> {
    let mut owners = Array2D::from_fill(NO_OWNER, cols, rows);
    for (idx, block) in blocks.iter().enumerate() {
        let b = &block.bounds;
        for row in b.start_row..b.end_row() {
            let owner_row = owners.get_row_mut(row);
            for (col, owner) in owner_row
                .iter_mut()
                .enumerate()
                .take(b.end_col())
                .skip(b.start_col)
            {
                if block.is_authoritative(row, col) {
                    *owner = idx as u32;
                }
            }
        }
    }
    owners
}

/// Join labels across block seams. Returns the number of label merges.
pub fn reconcile(
    sync: &RasterSynchronizer<'_>,
    blocks: &[SegmentsBlock],
    bands: &[usize],
    stats: &BandStatistics,
    strategy: &dyn SegmentationStrategy,
    max_label: u32,
) -> Result<usize, SegmenterError> {
    let input = sync.input();
    let (rows, cols) = (input.rows(), input.cols());
    let owners = owner_map(blocks, rows, cols);

    let mut labels = Array2D::from_fill(0u32, cols, rows);
    sync.with_output(|output| -> Result<(), SegmenterError> {
        for row in 0..rows {
            for (col, label) in labels.get_row_mut(row).iter_mut().enumerate() {
                *label = output.get(col, row, 0)? as u32;
            }
        }
        Ok(())
    })?;

    if max_label >= u32::MAX - 1 {
        return Err(SegmenterError::LabelsExhausted);
    }
    let mut set = DisjointSet::new(max_label + 1);
    let mut merges = 0;
    let mut features_a = vec![0f64; bands.len()];
    let mut features_b = vec![0f64; bands.len()];
    let features = |col: usize, row: usize, out: &mut [f64]| -> Result<(), SegmenterError> {
        for (i, (v, band)) in out.iter_mut().zip(bands).enumerate() {
            *v = stats.normalize(i, sync.read(col, row, *band)?);
        }
        Ok(())
    };

    for row in 0..rows {
        for col in 0..cols {
            let index = labels.get_index(col, row);
            let label = labels.data[index];
            if label == 0 {
                continue;
            }
            let owner = owners.data[index];
            let right = (col + 1 < cols).then(|| index + 1);
            let below = (row + 1 < rows).then(|| index + cols);
            for other in [right, below].into_iter().flatten() {
                let other_label = labels.data[other];
                if other_label == 0 || owners.data[other] == owner {
                    continue;
                }
                if set.find(label) == set.find(other_label) {
                    continue;
                }
                let (other_col, other_row) = (other % cols, other / cols);
                features(col, row, &mut features_a)?;
                features(other_col, other_row, &mut features_b)?;
                if strategy.seam_merge_allowed(&features_a, &features_b) {
                    set.merge(label, other_label);
                    merges += 1;
                }
            }
        }
    }

    if merges > 0 {
        sync.with_output(|output| -> Result<(), SegmenterError> {
            for row in 0..rows {
                for (col, &label) in labels.get_row(row).iter().enumerate() {
                    let root = set.find(label);
                    if root != label {
                        output.set(col, row, 0, root as f64)?;
                    }
                }
            }
            Ok(())
        })?;
    }
    debug!("seam reconciliation merged {merges} label pairs");
    Ok(merges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::SegmentsBlockMatrix;
    use crate::cutoff::CutoffSet;
    use crate::planner::BlockPlan;
    use crate::raster::{BandProperty, BandType, MemRaster, Raster};
    use crate::threshold::TrivialThresholdStrategy;

    #[test]
    fn labels_of_one_region_are_joined_across_blocks() {
        // two flat halves split by a vertical block seam at column 10
        let input = MemRaster::from_fn(4, 20, &[BandProperty::new(BandType::U8, None)], |_, r, _| {
            if r < 2 {
                10.0
            } else {
                200.0
            }
        });
        let p = BlockPlan {
            raster_rows: 4,
            raster_cols: 20,
            block_width: 10,
            block_height: 4,
            overlap_h: 0,
            overlap_w: 0,
        };
        assert_eq!(p.grid_dims(), (1, 2));
        let blocks = SegmentsBlockMatrix::from_plan(&p, &CutoffSet::none()).blocks();

        let mut output = MemRaster::new(4, 20, &[BandProperty::labels()]);
        for row in 0..4 {
            for col in 0..20 {
                let label = match (row < 2, col < 10) {
                    (true, true) => 1,
                    (false, true) => 2,
                    (true, false) => 3,
                    (false, false) => 4,
                };
                output.set(col, row, 0, label as f64).unwrap();
            }
        }
        let sync = RasterSynchronizer::new(&input, Box::new(output), None);
        let stats = BandStatistics {
            min: vec![10.0],
            max: vec![200.0],
        };
        let strategy = TrivialThresholdStrategy::default();
        let merges = reconcile(&sync, &blocks, &[0], &stats, &strategy, 4).unwrap();
        assert_eq!(merges, 2);

        let out = sync.into_output();
        assert_eq!(out.get(15, 0, 0).unwrap(), 1.0);
        assert_eq!(out.get(15, 3, 0).unwrap(), 2.0);
        assert_eq!(out.get(0, 3, 0).unwrap(), 2.0);
    }
}
