//! Shared run state and the worker loop.

use crate::arrays::Array2D;
use crate::block::{SegmentsBlock, SegmentsBlockMatrix};
use crate::error::SegmenterError;
use crate::ids::SegmentIdAllocator;
use crate::progress::ProgressReporter;
use crate::segmenter::BandStatistics;
use crate::strategy::{BlockWindow, SegmentationStrategy, StrategyParameters, StrategyRegistry};
use crate::sync::RasterSynchronizer;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Read-only inputs every worker needs to build and feed its strategy.
#[derive(Clone, Copy)]
pub struct StrategyJob<'a> {
    pub registry: &'a StrategyRegistry,
    pub strategy_name: &'a str,
    pub params: &'a StrategyParameters,
    pub bands: &'a [usize],
    pub no_data: &'a [Option<f64>],
    pub stats: &'a BandStatistics,
}

/// State shared by the orchestrator and the workers of one run.
pub struct RunContext<'a> {
    pub matrix: SegmentsBlockMatrix,
    pub sync: RasterSynchronizer<'a>,
    pub ids: &'a SegmentIdAllocator,
    pub job: StrategyJob<'a>,
    abort: AtomicBool,
    running: AtomicUsize,
    signal: Mutex<()>,
    block_processed: Condvar,
    first_error: Mutex<Option<SegmenterError>>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        matrix: SegmentsBlockMatrix,
        sync: RasterSynchronizer<'a>,
        ids: &'a SegmentIdAllocator,
        job: StrategyJob<'a>,
    ) -> Self {
        Self {
            matrix,
            sync,
            ids,
            job,
            abort: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            signal: Mutex::new(()),
            block_processed: Condvar::new(),
            first_error: Mutex::new(None),
        }
    }

    /// Register `workers` workers before they are spawned.
    pub fn start_workers(&self, workers: usize) {
        self.running.store(workers, Ordering::Release);
    }

    pub fn running_workers(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::Release);
        self.notify();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Keep the first error and stop every worker.
    pub fn fail(&self, err: SegmenterError) {
        {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        self.abort();
    }

    pub fn take_error(&self) -> Option<SegmenterError> {
        self.first_error.lock().take()
    }

    pub fn notify(&self) {
        let _signal = self.signal.lock();
        self.block_processed.notify_all();
    }

    /// Sleep until a block finishes, a worker exits or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        let mut signal = self.signal.lock();
        if self.running_workers() == 0 {
            return;
        }
        self.block_processed.wait_for(&mut signal, timeout);
    }

    fn worker_exited(&self) {
        let _signal = self.signal.lock();
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.block_processed.notify_all();
    }
}

/// Marks the worker as exited however the loop ends.
struct RunningGuard<'c, 'a>(&'c RunContext<'a>);

impl Drop for RunningGuard<'_, '_> {
    fn drop(&mut self) {
        self.0.worker_exited();
    }
}

/// Worker entry point: claim blocks until none is left or the run is aborted.
///
/// `progress` is only passed when the run has a single block.
pub fn run_worker(ctx: &RunContext<'_>, worker: usize, progress: Option<&dyn ProgressReporter>) {
    let _guard = RunningGuard(ctx);
    match worker_loop(ctx, worker, progress) {
        Ok(blocks) => debug!("worker {worker} finished after {blocks} blocks"),
        Err(err) => {
            if err.is_cancellation() {
                debug!("worker {worker} cancelled");
            } else {
                warn!("worker {worker} failed: {err}");
            }
            ctx.fail(err);
        }
    }
}

fn worker_loop(
    ctx: &RunContext<'_>,
    worker: usize,
    progress: Option<&dyn ProgressReporter>,
) -> Result<usize, SegmenterError> {
    let job = &ctx.job;
    let mut strategy = job.registry.create(job.strategy_name)?;
    strategy.initialize(job.params)?;

    let mut blocks = 0;
    while !ctx.is_aborted() {
        let Some((row, col)) = ctx.matrix.try_claim_next() else {
            break;
        };
        let Some(block) = ctx.matrix.snapshot(row, col) else {
            break;
        };
        trace!("worker {worker} segmenting block ({row}, {col})");
        process_block(ctx, strategy.as_mut(), &block, progress)?;
        ctx.matrix.mark_done(row, col);
        ctx.notify();
        blocks += 1;
    }
    Ok(blocks)
}

/// Read, segment and commit one block. On error the block stays `UnderSegmentation`.
fn process_block(
    ctx: &RunContext<'_>,
    strategy: &mut dyn SegmentationStrategy,
    block: &SegmentsBlock,
    progress: Option<&dyn ProgressReporter>,
) -> Result<(), SegmenterError> {
    let job = &ctx.job;
    let window = BlockWindow {
        bounds: block.bounds,
        bands: ctx.sync.read_window(&block.bounds, job.bands)?,
        no_data: job.no_data.to_vec(),
        band_min: job.stats.min.clone(),
        band_max: job.stats.max.clone(),
    };
    let mut labels = Array2D::from_fill(0u32, block.bounds.width, block.bounds.height);
    strategy
        .execute(ctx.ids, block, &window, &mut labels, progress)
        .map_err(|err| match err {
            SegmenterError::Cancelled
            | SegmenterError::LabelsExhausted
            | SegmenterError::Raster(_)
            | SegmenterError::Strategy { .. } => err,
            other => SegmenterError::Strategy {
                row: block.matrix_row,
                col: block.matrix_col,
                message: other.to_string(),
            },
        })?;
    ctx.sync.commit(block, &labels)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStatus;
    use crate::cutoff::CutoffSet;
    use crate::planner::plan;
    use crate::raster::{BandProperty, BandType, MemRaster, Raster};
    use crate::strategy::LabelWindow;

    struct FailingStrategy;

    impl SegmentationStrategy for FailingStrategy {
        fn initialize(&mut self, _: &StrategyParameters) -> Result<(), SegmenterError> {
            Ok(())
        }

        fn execute(
            &mut self,
            _: &SegmentIdAllocator,
            block: &SegmentsBlock,
            _: &BlockWindow,
            _: &mut LabelWindow,
            _: Option<&dyn ProgressReporter>,
        ) -> Result<(), SegmenterError> {
            if (block.matrix_row, block.matrix_col) == (1, 1) {
                Err(SegmenterError::StrategyInit("broken block".to_string()))
            } else {
                Ok(())
            }
        }

        fn mem_usage_estimation(&self, _: usize, _: usize) -> f64 {
            1.0
        }

        fn optimal_blocks_overlap(&self) -> usize {
            0
        }

        fn seam_merge_allowed(&self, _: &[f64], _: &[f64]) -> bool {
            false
        }
    }

    #[test_log::test]
    fn failing_block_stops_the_run() {
        let input = MemRaster::new(40, 40, &[BandProperty::new(BandType::U8, None)]);
        let p = plan(40, 40, 0, usize::MAX, 20, 1).unwrap();
        let mut registry = StrategyRegistry::new();
        registry.register("failing", || Box::new(FailingStrategy));
        let stats = BandStatistics {
            min: vec![0.0],
            max: vec![0.0],
        };
        let ids = SegmentIdAllocator::new();
        let params = StrategyParameters::default();
        let ctx = RunContext::new(
            SegmentsBlockMatrix::from_plan(&p, &CutoffSet::none()),
            RasterSynchronizer::new(
                &input,
                Box::new(MemRaster::new(40, 40, &[BandProperty::labels()])),
                None,
            ),
            &ids,
            StrategyJob {
                registry: &registry,
                strategy_name: "failing",
                params: &params,
                bands: &[0],
                no_data: &[None],
                stats: &stats,
            },
        );
        ctx.start_workers(1);
        run_worker(&ctx, 0, None);

        assert_eq!(ctx.running_workers(), 0);
        assert!(ctx.is_aborted());
        assert!(matches!(
            ctx.take_error(),
            Some(SegmenterError::Strategy { row: 1, col: 1, .. })
        ));
        assert_eq!(ctx.matrix.status(1, 1), Some(BlockStatus::UnderSegmentation));
        assert_eq!(ctx.matrix.segmented_count(), 3);
        assert_eq!(ctx.sync.into_output().get(0, 0, 0).unwrap(), 0.0);
    }
}
