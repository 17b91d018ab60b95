//! Shared access to the input and output rasters.

use crate::arrays::Array2D;
use crate::block::SegmentsBlock;
use crate::cache::{CacheStats, TileCache};
use crate::error::RasterError;
use crate::planner::BlockBounds;
use crate::raster::{PixelSource, Raster};
use log::trace;
use parking_lot::Mutex;

/// Input reads go through an optional LRU tile cache, output writes through one lock.
///
/// Segmentation runs on private buffers; the output lock is only held while a finished block is
/// copied into the output raster.
pub struct RasterSynchronizer<'a> {
    input: &'a dyn Raster,
    cache: Option<TileCache>,
    output: Mutex<Box<dyn Raster>>,
}

impl<'a> RasterSynchronizer<'a> {
    /// `cache_tiles` of `None` reads the input directly.
    pub fn new(input: &'a dyn Raster, output: Box<dyn Raster>, cache_tiles: Option<usize>) -> Self {
        Self {
            input,
            cache: cache_tiles.map(TileCache::new),
            output: Mutex::new(output),
        }
    }

    pub fn input(&self) -> &'a dyn Raster {
        self.input
    }

    pub fn read(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError> {
        match &self.cache {
            Some(cache) => cache.get(self.input, col, row, band),
            None => self.input.get(col, row, band),
        }
    }

    /// Copy `bands` of the window `bounds` into private buffers.
    pub fn read_window(
        &self,
        bounds: &BlockBounds,
        bands: &[usize],
    ) -> Result<Vec<Array2D<f64>>, RasterError> {
        bands
            .iter()
            .map(|&band| {
                let mut buf = Array2D::from_fill(0f64, bounds.width, bounds.height);
                for y in 0..bounds.height {
                    let row = buf.get_row_mut(y);
                    match &self.cache {
                        Some(cache) => cache.read_row_part(
                            self.input,
                            bounds.start_col,
                            bounds.start_row + y,
                            band,
                            row,
                        )?,
                        None => self.input.read_row_part(
                            bounds.start_col,
                            bounds.start_row + y,
                            band,
                            row,
                        )?,
                    }
                }
                Ok(buf)
            })
            .collect()
    }

    pub fn write(&self, col: usize, row: usize, band: usize, value: f64) -> Result<(), RasterError> {
        self.output.lock().set(col, row, band, value)
    }

    /// Write the non-zero labels of the block's authoritative region. `labels` covers the block's
    /// expanded bounds. Returns the number of written pixels.
    pub fn commit(&self, block: &SegmentsBlock, labels: &Array2D<u32>) -> Result<usize, RasterError> {
        let bounds = &block.bounds;
        if labels.width != bounds.width || labels.height != bounds.height {
            return Err(RasterError::DimensionMismatch);
        }
        let mut output = self.output.lock();
        let mut written = 0;
        for y in 0..bounds.height {
            let row = bounds.start_row + y;
            for (x, &label) in labels.get_row(y).iter().enumerate() {
                let col = bounds.start_col + x;
                if label != 0 && block.is_authoritative(row, col) {
                    output.set(col, row, 0, label as f64)?;
                    written += 1;
                }
            }
        }
        trace!(
            "committed {written} pixels of block ({}, {})",
            block.matrix_row,
            block.matrix_col
        );
        Ok(written)
    }

    /// Run `f` with exclusive access to the output raster.
    pub fn with_output<R>(&self, f: impl FnOnce(&mut dyn Raster) -> R) -> R {
        let mut output = self.output.lock();
        f(output.as_mut())
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(TileCache::stats)
    }

    /// Drop the cache and hand the output raster back.
    pub fn into_output(self) -> Box<dyn Raster> {
        self.output.into_inner()
    }
}

impl PixelSource for RasterSynchronizer<'_> {
    #[inline]
    fn value(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError> {
        self.read(col, row, band)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cutoff::CutoffSet;
    use crate::planner::plan;
    use crate::raster::{BandProperty, BandType, MemRaster};

    fn input() -> MemRaster {
        let props = [BandProperty::new(BandType::F64, None); 3];
        MemRaster::from_fn(100, 90, &props, |c, r, b| (c * 3 + r * 5 + b * 1000) as f64)
    }

    #[test]
    fn cached_and_direct_windows_agree() {
        let input = input();
        let out = || Box::new(MemRaster::new(100, 90, &[BandProperty::labels()])) as Box<dyn Raster>;
        let direct = RasterSynchronizer::new(&input, out(), None);
        let cached = RasterSynchronizer::new(&input, out(), Some(2));
        let bounds = BlockBounds {
            start_row: 30,
            start_col: 50,
            height: 60,
            width: 40,
        };
        let a = direct.read_window(&bounds, &[2, 0]).unwrap();
        let b = cached.read_window(&bounds, &[2, 0]).unwrap();
        assert_eq!(a.len(), 2);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.data.as_slice(), y.data.as_slice());
        }
        assert_eq!(a[0][(0, 0)], input.get(50, 30, 2).unwrap());
        assert_eq!(a[1][(39, 59)], input.get(89, 89, 0).unwrap());
        assert!(cached.cache_stats().unwrap().cached_tiles <= 2);
        assert!(direct.cache_stats().is_none());
        assert_eq!(cached.value(7, 8, 1).unwrap(), input.get(7, 8, 1).unwrap());
    }

    #[test]
    fn commit_writes_only_authoritative_labels() {
        let input = input();
        let p = plan(100, 90, 4, usize::MAX, 50, 2).unwrap();
        assert_eq!(p.grid_dims(), (2, 2));
        let cutoffs = CutoffSet::build(&input, &[0], &p).unwrap();
        let block = SegmentsBlock::new(&p, &cutoffs, 0, 0);
        let sync = RasterSynchronizer::new(
            &input,
            Box::new(MemRaster::new(100, 90, &[BandProperty::labels()])),
            None,
        );
        let mut labels = Array2D::from_fill(7u32, block.bounds.width, block.bounds.height);
        labels[(0, 0)] = 0;
        let written = sync.commit(&block, &labels).unwrap();
        assert_eq!(written, 50 * 45 - 1);

        let wrong = Array2D::from_fill(1u32, 3, 3);
        assert_eq!(sync.commit(&block, &wrong), Err(RasterError::DimensionMismatch));

        let out = sync.into_output();
        assert_eq!(out.get(0, 0, 0).unwrap(), 0.0);
        assert_eq!(out.get(44, 49, 0).unwrap(), 7.0);
        // inside the overlap margin, owned by the neighbours
        assert_eq!(out.get(46, 10, 0).unwrap(), 0.0);
        assert_eq!(out.get(10, 51, 0).unwrap(), 0.0);
    }
}
