//! Orchestrator of a block-parallel segmentation run.
//!
//! [`Segmenter::initialize`] validates the configuration against the input raster and builds the
//! strategy, so configuration errors surface before any thread exists. [`Segmenter::execute`]
//! then runs the whole pipeline:
//!
//! 1. one sequential pass computing the global range of every selected band,
//! 2. block planning within the memory budget,
//! 3. cutoff profile generation between overlapping blocks,
//! 4. a dedicated worker pool claiming blocks from the shared block matrix,
//! 5. seam reconciliation joining labels of regions split by block boundaries.
//!
//! The orchestrating thread sleeps on a condition variable with a timeout while workers run and
//! uses every wake-up to report progress and poll for cancellation.

use crate::block::SegmentsBlockMatrix;
use crate::cache::{CacheStats, TileCache, TILE_EDGE};
use crate::common::SegmenterConfig;
use crate::cutoff::CutoffSet;
use crate::error::{RasterError, SegmenterError};
use crate::ids::SegmentIdAllocator;
use crate::planner::{self, BlockPlan};
use crate::progress::ProgressReporter;
use crate::raster::{BandProperty, MemRasterFactory, Raster, RasterFactory};
use crate::seams;
use crate::strategy::StrategyRegistry;
use crate::sync::RasterSynchronizer;
use crate::worker::{run_worker, RunContext, StrategyJob};
use log::{debug, info};
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::time::Duration;
use sysinfo::System;

/// Share of the free memory the blocks of all workers may occupy.
const BLOCK_MEMORY_FRACTION: f64 = 0.7;
/// Share of the free memory the input tile cache may occupy, minus the worker blocks.
const CACHE_MEMORY_FRACTION: f64 = 0.3;

/// Global value range of the selected bands, no-data pixels excluded.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BandStatistics {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl BandStatistics {
    /// Scan `bands` of the whole raster. A band holding only no-data gets the range `0..=0`.
    pub fn compute(
        input: &dyn Raster,
        bands: &[usize],
        no_data: &[Option<f64>],
    ) -> Result<Self, RasterError> {
        let mut row_buf = vec![0f64; input.cols()];
        let mut stats = Self {
            min: Vec::with_capacity(bands.len()),
            max: Vec::with_capacity(bands.len()),
        };
        for (&band, no_data) in bands.iter().zip(no_data) {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for row in 0..input.rows() {
                input.read_row_part(0, row, band, &mut row_buf)?;
                for &v in row_buf.iter().filter(|v| no_data.map_or(true, |nd| **v != nd)) {
                    min = min.min(v);
                    max = max.max(v);
                }
            }
            if min > max {
                min = 0.0;
                max = 0.0;
            }
            stats.min.push(min);
            stats.max.push(max);
        }
        Ok(stats)
    }

    /// `value` of the `band`-th selected band scaled to `0..=1`.
    #[inline]
    pub fn normalize(&self, band: usize, value: f64) -> f64 {
        let range = self.max[band] - self.min[band];
        if range > 0.0 {
            (value - self.min[band]) / range
        } else {
            0.0
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub plan: BlockPlan,
    pub workers: usize,
    pub blocks: usize,
    pub labels_issued: u32,
    /// Cutoff profiles which fell back to the nominal block boundary.
    pub straight_cutoffs: usize,
    pub seam_merges: usize,
    pub cache: Option<CacheStats>,
}

/// Label raster (one `U32` band, 0 for no-data) and the summary of the run.
pub struct SegmentationOutput {
    pub raster: Box<dyn Raster>,
    pub summary: RunSummary,
}

/// Validated run inputs.
struct Prepared<'a> {
    config: SegmenterConfig,
    input: &'a dyn Raster,
    no_data: Vec<Option<f64>>,
}

pub struct Segmenter<'a> {
    registry: StrategyRegistry,
    output_factory: Box<dyn RasterFactory>,
    ids: SegmentIdAllocator,
    prepared: Option<Prepared<'a>>,
}

impl Default for Segmenter<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Segmenter<'a> {
    /// Segmenter with the built-in strategies writing to an in-memory raster.
    pub fn new() -> Self {
        Self::with_registry(StrategyRegistry::global().clone())
    }

    pub fn with_registry(registry: StrategyRegistry) -> Self {
        Self {
            registry,
            output_factory: Box::new(MemRasterFactory),
            ids: SegmentIdAllocator::new(),
            prepared: None,
        }
    }

    pub fn with_output_factory(mut self, factory: impl RasterFactory + 'static) -> Self {
        self.output_factory = Box::new(factory);
        self
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn is_initialized(&self) -> bool {
        self.prepared.is_some()
    }

    /// Validate `config` against `input` and check that the strategy accepts its parameters.
    /// A failed call leaves the segmenter uninitialized.
    pub fn initialize(
        &mut self,
        config: SegmenterConfig,
        input: &'a dyn Raster,
    ) -> Result<(), SegmenterError> {
        self.reset();
        if input.rows() == 0 || input.cols() == 0 || input.band_count() == 0 {
            return Err(SegmenterError::EmptyRaster);
        }
        config.validate(input.band_count())?;
        let mut strategy = self.registry.create(&config.strategy_name)?;
        strategy.initialize(&config.strategy)?;

        let no_data = if config.no_data_values.is_empty() {
            config
                .input_bands
                .iter()
                .map(|&band| input.no_data_value(band))
                .collect()
        } else {
            config.no_data_values.iter().copied().map(Some).collect()
        };
        debug!(
            "initialized \"{}\" on bands {:?} of a {}x{} raster",
            config.strategy_name,
            config.input_bands,
            input.cols(),
            input.rows()
        );
        self.prepared = Some(Prepared {
            config,
            input,
            no_data,
        });
        Ok(())
    }

    pub fn reset(&mut self) {
        self.prepared = None;
        self.ids.reset();
    }

    /// Run the segmentation.
    ///
    /// `progress` is ignored unless `enable_progress` is set. Cancellation through it, or any
    /// worker failure, fails the whole run; the partially written output is dropped.
    pub fn execute(
        &mut self,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<SegmentationOutput, SegmenterError> {
        self.ids.reset();
        let prepared = self.prepared.as_ref().ok_or(SegmenterError::NotInitialized)?;
        let config = &prepared.config;
        let input = prepared.input;
        let (rows, cols) = (input.rows(), input.cols());
        let bands = config.input_bands.as_slice();
        let progress = progress.filter(|_| config.enable_progress);

        let stats = BandStatistics::compute(input, bands, &prepared.no_data)?;
        debug!("band ranges: min {:?}, max {:?}", stats.min, stats.max);

        let mut strategy = self.registry.create(&config.strategy_name)?;
        strategy.initialize(&config.strategy)?;

        let overlap = if config.enable_block_processing && config.enable_block_merging {
            config
                .block_overlap
                .unwrap_or_else(|| strategy.optimal_blocks_overlap())
        } else {
            0
        };
        let threads = thread_count(config);
        let pixel_bytes = strategy.mem_usage_estimation(bands.len(), 1).max(1.0);
        let free_bytes = if config.memory_budget_bytes > 0 {
            Some(config.memory_budget_bytes)
        } else {
            free_memory()
        };
        let total_pixels = rows * cols;
        let budget_pixels = free_bytes.map_or(total_pixels, |free| {
            ((free as f64 * BLOCK_MEMORY_FRACTION / pixel_bytes) as usize).min(total_pixels)
        });

        let plan = if config.enable_block_processing {
            planner::plan(rows, cols, overlap, budget_pixels, config.max_block_size, threads)?
        } else {
            BlockPlan::whole(rows, cols)
        };
        let blocks = plan.block_count();
        let workers = if blocks <= 1 { 1 } else { threads.min(blocks) };
        info!(
            "segmenting {cols}x{rows} raster in {blocks} blocks of {}x{} (overlap {}) on {workers} workers",
            plan.block_width, plan.block_height, plan.overlap_h
        );

        let output = self
            .output_factory
            .create(rows, cols, &[BandProperty::labels()])?;
        let cache_tiles = config
            .enable_raster_cache
            .then(|| cache_capacity(free_bytes, &plan, workers, pixel_bytes, bands.len()));
        let sync = RasterSynchronizer::new(input, output, cache_tiles);

        let cutoffs = if blocks > 1 && (plan.overlap_h > 0 || plan.overlap_w > 0) {
            CutoffSet::build(&sync, bands, &plan)?
        } else {
            CutoffSet::none()
        };

        let job = StrategyJob {
            registry: &self.registry,
            strategy_name: &config.strategy_name,
            params: &config.strategy,
            bands,
            no_data: &prepared.no_data,
            stats: &stats,
        };
        let ctx = RunContext::new(
            SegmentsBlockMatrix::from_plan(&plan, &cutoffs),
            sync,
            &self.ids,
            job,
        );
        let poll = Duration::from_millis(config.progress_poll_interval_ms.max(1));
        if run_workers(&ctx, workers, progress, poll)? {
            return Err(SegmenterError::Cancelled);
        }
        if let Some(err) = ctx.take_error() {
            return Err(err);
        }

        let seam_merges = if config.enable_block_merging && blocks > 1 {
            seams::reconcile(
                &ctx.sync,
                &ctx.matrix.blocks(),
                bands,
                &stats,
                strategy.as_ref(),
                self.ids.issued(),
            )?
        } else {
            0
        };

        let summary = RunSummary {
            plan,
            workers,
            blocks,
            labels_issued: self.ids.issued(),
            straight_cutoffs: cutoffs.fallbacks,
            seam_merges,
            cache: ctx.sync.cache_stats(),
        };
        info!(
            "segmentation finished: {} labels, {seam_merges} seam merges",
            summary.labels_issued
        );
        Ok(SegmentationOutput {
            raster: ctx.sync.into_output(),
            summary,
        })
    }
}

/// Run `workers` workers on a dedicated pool until all of them exit. Returns whether the run was
/// cancelled through `progress`.
fn run_workers(
    ctx: &RunContext<'_>,
    workers: usize,
    progress: Option<&dyn ProgressReporter>,
    poll: Duration,
) -> Result<bool, SegmenterError> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("segmenter-worker-{i}"))
        .build()
        .map_err(|err| SegmenterError::ThreadPool(err.to_string()))?;

    let blocks = ctx.matrix.len();
    // a single block reports through its strategy
    let strategy_progress = if blocks == 1 { progress } else { None };
    if blocks > 1 {
        if let Some(progress) = progress {
            progress.set_total_steps(blocks);
        }
    }

    ctx.start_workers(workers);
    let cancelled = pool.in_place_scope(|scope| {
        for worker in 0..workers {
            scope.spawn(move |_| run_worker(ctx, worker, strategy_progress));
        }
        let mut reported = 0;
        let mut cancelled = false;
        loop {
            ctx.wait(poll);
            if let Some(progress) = progress {
                if blocks > 1 {
                    let done = ctx.matrix.segmented_count();
                    while reported < done {
                        progress.pulse();
                        reported += 1;
                    }
                }
                if !cancelled && !progress.is_active() {
                    info!("cancellation requested, waiting for workers to stop");
                    cancelled = true;
                    ctx.abort();
                }
            }
            if ctx.running_workers() == 0 {
                break;
            }
        }
        cancelled
    });
    Ok(cancelled)
}

fn thread_count(config: &SegmenterConfig) -> usize {
    if !config.enable_threaded_processing || !config.enable_block_processing {
        1
    } else if config.max_threads > 0 {
        config.max_threads
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

/// Available memory in bytes, falling back to the total when the platform does not report it.
fn free_memory() -> Option<u64> {
    let mut system = System::new();
    system.refresh_memory();
    match (system.available_memory(), system.total_memory()) {
        (0, 0) => None,
        (0, total) => Some(total),
        (available, _) => Some(available),
    }
}

fn cache_capacity(
    free_bytes: Option<u64>,
    plan: &BlockPlan,
    workers: usize,
    pixel_bytes: f64,
    band_count: usize,
) -> usize {
    match free_bytes {
        Some(free) => {
            let block_pixels = (plan.block_height + 2 * plan.overlap_h)
                * (plan.block_width + 2 * plan.overlap_w);
            let block_bytes = (workers * block_pixels) as f64 * pixel_bytes;
            let budget = (free as f64 * CACHE_MEMORY_FRACTION - block_bytes).max(0.0);
            TileCache::capacity_for(budget as u64, workers)
        }
        None => {
            plan.raster_rows.div_ceil(TILE_EDGE) * plan.raster_cols.div_ceil(TILE_EDGE) * band_count
        }
    }
}
