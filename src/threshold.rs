use crate::block::SegmentsBlock;
use crate::connectivity::assign_disjoint_set;
use crate::error::SegmenterError;
use crate::ids::SegmentIdAllocator;
use crate::progress::ProgressReporter;
use crate::strategy::{BlockWindow, LabelWindow, SegmentationStrategy, StrategyParameters};

/// One segment per 4-connected run of pixels whose normalized values differ by at most
/// `threshold` in every band.
#[derive(Debug, Default)]
pub struct TrivialThresholdStrategy {
    threshold: f64,
}

impl TrivialThresholdStrategy {
    pub const NAME: &'static str = "trivial-threshold";

    #[inline]
    fn similar(&self, a: &[f64], b: &[f64]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() <= self.threshold)
    }
}

impl SegmentationStrategy for TrivialThresholdStrategy {
    fn initialize(&mut self, params: &StrategyParameters) -> Result<(), SegmenterError> {
        if params.threshold.is_nan() || params.threshold < 0.0 {
            return Err(SegmenterError::StrategyInit(format!(
                "threshold must be a non-negative number, got {}",
                params.threshold
            )));
        }
        self.threshold = params.threshold;
        Ok(())
    }

    fn execute(
        &mut self,
        ids: &SegmentIdAllocator,
        _block: &SegmentsBlock,
        input: &BlockWindow,
        output: &mut LabelWindow,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<(), SegmenterError> {
        if let Some(progress) = progress {
            progress.set_total_steps(2);
        }
        let bands = input.band_count();
        let pixels = input.width() * input.height();
        let mut features = vec![0f64; pixels * bands];
        for (index, f) in features.chunks_exact_mut(bands.max(1)).enumerate() {
            input.features(index, f);
        }
        let mask = input.valid_mask();
        let set = assign_disjoint_set(&mask, |a, b| {
            self.similar(
                &features[a * bands..(a + 1) * bands],
                &features[b * bands..(b + 1) * bands],
            )
        });
        let components = set.flatten();

        if let Some(progress) = progress {
            progress.pulse();
            if !progress.is_active() {
                return Err(SegmenterError::Cancelled);
            }
        }

        // masked pixels stay singletons, so a component is labeled iff its leader is active
        let active: Vec<usize> = components
            .component_leaders
            .iter()
            .enumerate()
            .filter(|(_, leader)| mask.data[**leader as usize])
            .map(|(component, _)| component)
            .collect();
        let mut labels = vec![0u32; components.num_components as usize];
        if !active.is_empty() {
            let first = ids.next_ids(active.len() as u32)?;
            for (label, component) in (first..).zip(active) {
                labels[component] = label;
            }
        }
        for (index, out) in output.data.iter_mut().enumerate() {
            if mask.data[index] {
                *out = labels[components.component_assignment[index] as usize];
            }
        }

        if let Some(progress) = progress {
            progress.pulse();
        }
        Ok(())
    }

    fn mem_usage_estimation(&self, band_count: usize, pixels: usize) -> f64 {
        // window + features, union-find parents and assignment, label and mask
        let per_pixel = 2 * band_count * std::mem::size_of::<f64>() + 3 * 4 + 1;
        (per_pixel * pixels) as f64
    }

    fn optimal_blocks_overlap(&self) -> usize {
        0
    }

    fn seam_merge_allowed(&self, a: &[f64], b: &[f64]) -> bool {
        self.similar(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrays::Array2D;
    use crate::cutoff::CutoffSet;
    use crate::planner::{plan, BlockBounds};
    use crate::progress::TaskProgress;

    fn window(values: &[f64], width: usize, height: usize, no_data: Option<f64>) -> BlockWindow {
        BlockWindow {
            bounds: BlockBounds {
                start_row: 0,
                start_col: 0,
                height,
                width,
            },
            bands: vec![Array2D::from_slice(values, width, height).unwrap()],
            no_data: vec![no_data],
            band_min: vec![0.0],
            band_max: vec![100.0],
        }
    }

    fn run(
        strategy: &mut TrivialThresholdStrategy,
        input: &BlockWindow,
        ids: &SegmentIdAllocator,
    ) -> LabelWindow {
        let p = plan(input.height(), input.width(), 0, usize::MAX, 0, 1).unwrap();
        let block = SegmentsBlock::new(&p, &CutoffSet::none(), 0, 0);
        let mut out = Array2D::from_fill(0u32, input.width(), input.height());
        strategy.execute(ids, &block, input, &mut out, None).unwrap();
        out
    }

    #[test]
    fn equal_runs_become_segments() {
        #[rustfmt::skip]
        let values = [
            10.0, 10.0, 20.0,
            10.0, 99.0, 20.0,
            30.0, 30.0, 20.0,
        ];
        let input = window(&values, 3, 3, Some(99.0));
        let ids = SegmentIdAllocator::new();
        ids.next_ids(5).unwrap();
        let mut strategy = TrivialThresholdStrategy::default();
        strategy.initialize(&StrategyParameters::default()).unwrap();
        let out = run(&mut strategy, &input, &ids);
        assert_eq!(ids.issued(), 8);
        assert_eq!(out[(1, 1)], 0);
        assert_eq!(out[(0, 0)], out[(0, 1)]);
        assert_eq!(out[(2, 0)], out[(2, 2)]);
        assert_eq!(out[(0, 2)], out[(1, 2)]);
        assert_ne!(out[(0, 0)], out[(2, 0)]);
        assert_ne!(out[(2, 2)], out[(1, 2)]);
        assert!(out.data.iter().filter(|l| **l != 0).all(|l| (6..=8).contains(l)));
    }

    #[test]
    fn threshold_joins_close_values() {
        let values = [10.0, 11.0, 12.0, 40.0];
        let input = window(&values, 4, 1, None);
        let ids = SegmentIdAllocator::new();
        let mut strategy = TrivialThresholdStrategy::default();
        let params = StrategyParameters {
            threshold: 0.015,
            ..Default::default()
        };
        strategy.initialize(&params).unwrap();
        let out = run(&mut strategy, &input, &ids);
        assert_eq!(out.data.as_slice(), &[1, 1, 1, 2]);
        assert!(strategy.seam_merge_allowed(&[0.1], &[0.11]));
        assert!(!strategy.seam_merge_allowed(&[0.1], &[0.2]));

        let bad = StrategyParameters {
            threshold: f64::NAN,
            ..Default::default()
        };
        assert!(strategy.initialize(&bad).is_err());
    }

    #[test]
    fn cancelled_progress_aborts() {
        let input = window(&[1.0; 4], 2, 2, None);
        let ids = SegmentIdAllocator::new();
        let p = plan(2, 2, 0, usize::MAX, 0, 1).unwrap();
        let block = SegmentsBlock::new(&p, &CutoffSet::none(), 0, 0);
        let mut out = Array2D::from_fill(0u32, 2, 2);
        let progress = TaskProgress::new();
        progress.cancel();
        let mut strategy = TrivialThresholdStrategy::default();
        assert_eq!(
            strategy.execute(&ids, &block, &input, &mut out, Some(&progress)),
            Err(SegmenterError::Cancelled)
        );
        assert_eq!(ids.issued(), 0);
    }
}
