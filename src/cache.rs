//! Bounded LRU cache of input raster tiles.
//!
//! Recency is a stamp per tile. Eviction pops the oldest entry of a min-heap and re-queues entries
//! whose tile was touched since they were queued, so a hit costs one map lookup.

use crate::error::RasterError;
use crate::raster::Raster;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

/// Edge of a cached tile in pixels.
pub const TILE_EDGE: usize = 64;

type TileKey = (usize, usize, usize);

#[derive(Debug)]
struct Tile {
    start_col: usize,
    start_row: usize,
    width: usize,
    data: Vec<f64>,
}

impl Tile {
    fn load(raster: &dyn Raster, key: TileKey) -> Result<Self, RasterError> {
        let (tile_row, tile_col, band) = key;
        let start_row = tile_row * TILE_EDGE;
        let start_col = tile_col * TILE_EDGE;
        let height = TILE_EDGE.min(raster.rows() - start_row);
        let width = TILE_EDGE.min(raster.cols() - start_col);
        let mut data = vec![0f64; width * height];
        for (y, row) in data.chunks_exact_mut(width).enumerate() {
            raster.read_row_part(start_col, start_row + y, band, row)?;
        }
        Ok(Self {
            start_col,
            start_row,
            width,
            data,
        })
    }

    #[inline(always)]
    fn value(&self, col: usize, row: usize) -> f64 {
        self.data[(row - self.start_row) * self.width + (col - self.start_col)]
    }

    /// Values of `row` from `start_col` up to the tile's right edge, at most `len` of them.
    #[inline]
    fn row_span(&self, row: usize, start_col: usize, len: usize) -> &[f64] {
        let offset = (row - self.start_row) * self.width + (start_col - self.start_col);
        let len = len.min(self.start_col + self.width - start_col);
        &self.data[offset..offset + len]
    }
}

#[derive(Debug)]
struct Slot {
    tile: Arc<Tile>,
    stamp: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    tiles: HashMap<TileKey, Slot>,
    /// One entry per cached tile, possibly older than the tile's current stamp.
    queue: BinaryHeap<Reverse<(u64, TileKey)>>,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn hit(&mut self, key: &TileKey) -> Option<Arc<Tile>> {
        self.clock += 1;
        let slot = self.tiles.get_mut(key)?;
        slot.stamp = self.clock;
        self.hits += 1;
        Some(slot.tile.clone())
    }

    fn insert(&mut self, key: TileKey, tile: Arc<Tile>) -> Arc<Tile> {
        self.clock += 1;
        self.misses += 1;
        let stamp = self.clock;
        if let Some(slot) = self.tiles.get_mut(&key) {
            // loaded twice by racing workers
            slot.stamp = stamp;
            return slot.tile.clone();
        }
        self.tiles.insert(
            key,
            Slot {
                tile: tile.clone(),
                stamp,
            },
        );
        self.queue.push(Reverse((stamp, key)));
        tile
    }

    /// Drop the least recently used tile.
    fn evict(&mut self) {
        while let Some(Reverse((stamp, key))) = self.queue.pop() {
            match self.tiles.get(&key) {
                Some(slot) if slot.stamp == stamp => {
                    self.tiles.remove(&key);
                    return;
                }
                Some(slot) => self.queue.push(Reverse((slot.stamp, key))),
                None => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_tiles: usize,
}

/// Thread-safe tile cache holding at most `capacity` single-band tiles.
///
/// Tiles are loaded outside the lock; two workers missing the same tile at once both read it and
/// the second insert is dropped. Hits and misses count tile lookups, not pixels.
#[derive(Debug)]
pub struct TileCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl TileCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Capacity in tiles for a byte budget, never below one tile per worker.
    pub fn capacity_for(budget_bytes: u64, workers: usize) -> usize {
        let tile_bytes = (TILE_EDGE * TILE_EDGE * std::mem::size_of::<f64>()) as u64;
        ((budget_bytes / tile_bytes) as usize).max(workers).max(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check(
        raster: &dyn Raster,
        col: usize,
        row: usize,
        band: usize,
    ) -> Result<(), RasterError> {
        if col >= raster.cols() || row >= raster.rows() {
            return Err(RasterError::OutOfBounds { col, row });
        }
        if band >= raster.band_count() {
            return Err(RasterError::InvalidBand {
                band,
                bands: raster.band_count(),
            });
        }
        Ok(())
    }

    /// Tile holding `(col, row)`, loaded on a miss.
    fn tile(
        &self,
        raster: &dyn Raster,
        col: usize,
        row: usize,
        band: usize,
    ) -> Result<Arc<Tile>, RasterError> {
        let key = (row / TILE_EDGE, col / TILE_EDGE, band);
        if let Some(tile) = self.state.lock().hit(&key) {
            return Ok(tile);
        }

        let loaded = Arc::new(Tile::load(raster, key)?);
        let mut state = self.state.lock();
        let tile = state.insert(key, loaded);
        while state.tiles.len() > self.capacity {
            state.evict();
        }
        Ok(tile)
    }

    pub fn get(
        &self,
        raster: &dyn Raster,
        col: usize,
        row: usize,
        band: usize,
    ) -> Result<f64, RasterError> {
        Self::check(raster, col, row, band)?;
        Ok(self.tile(raster, col, row, band)?.value(col, row))
    }

    /// Fill `out` with `band` values of `row` starting at `col`, one cache lookup per tile.
    pub fn read_row_part(
        &self,
        raster: &dyn Raster,
        col: usize,
        row: usize,
        band: usize,
        out: &mut [f64],
    ) -> Result<(), RasterError> {
        if out.is_empty() {
            return Ok(());
        }
        Self::check(raster, col + out.len() - 1, row, band)?;
        let mut done = 0;
        while done < out.len() {
            let start = col + done;
            let tile = self.tile(raster, start, row, band)?;
            let span = tile.row_span(row, start, out.len() - done);
            out[done..done + span.len()].copy_from_slice(span);
            done += span.len();
        }
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.tiles.clear();
        state.queue.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            cached_tiles: state.tiles.len(),
        }
    }
}
