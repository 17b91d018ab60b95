//! Region growing by Baatz heterogeneity.
//!
//! Segments carry their perimeter, compactness, smoothness and per-band sums, square sums and
//! standard deviations. The cost of merging two segments is the growth in heterogeneity:
//! a weighted sum of the colour term (standard deviations, weighted per band) and the shape term
//! (compactness and smoothness). Features are rescaled to the range of the live segments before
//! every merge iteration.

use crate::block::SegmentsBlock;
use crate::error::SegmenterError;
use crate::ids::SegmentIdAllocator;
use crate::progress::ProgressReporter;
use crate::region_growing::{grow, PassRules, SegmentGraph, SegmentMerger};
use crate::strategy::{BlockWindow, LabelWindow, SegmentationStrategy, StrategyParameters};

const PERIMETER: usize = 0;
const COMPACTNESS: usize = 1;
const SMOOTHNESS: usize = 2;
const BAND_FEATURES: usize = 3;

/// Linear rescaling of one feature to the range found over the live segments.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rescale {
    offset: f64,
    gain: f64,
}

impl Default for Rescale {
    fn default() -> Self {
        Self {
            offset: 0.0,
            gain: 1.0,
        }
    }
}

impl Rescale {
    fn from_range(min: f64, max: f64) -> Self {
        if min > max {
            Self::default()
        } else if min == max {
            Self {
                offset: 0.0,
                gain: if max == 0.0 { 1.0 } else { 1.0 / max },
            }
        } else {
            Self {
                offset: -min,
                gain: 1.0 / (max - min),
            }
        }
    }

    #[inline]
    fn apply(&self, value: f64) -> f64 {
        (value + self.offset) * self.gain
    }
}

#[derive(Debug, Clone, Copy)]
struct FeatureRange {
    min: f64,
    max: f64,
}

impl FeatureRange {
    fn new() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn add(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn rescale(&self) -> Rescale {
        Rescale::from_range(self.min, self.max)
    }
}

/// Feature layout: perimeter, compactness, smoothness, then sums, square sums and standard
/// deviations of every band.
struct BaatzMerger {
    bands: usize,
    color_weight: f64,
    compactness_weight: f64,
    band_weights: Vec<f64>,
    compactness: Rescale,
    smoothness: Rescale,
    std_dev: Rescale,
}

impl BaatzMerger {
    fn new(params: &StrategyParameters, band_weights: Vec<f64>) -> Self {
        Self {
            bands: band_weights.len(),
            color_weight: params.color_weight,
            compactness_weight: params.compactness_weight,
            band_weights,
            compactness: Rescale::default(),
            smoothness: Rescale::default(),
            std_dev: Rescale::default(),
        }
    }

    fn sum_at(&self, band: usize) -> usize {
        BAND_FEATURES + band
    }

    fn square_sum_at(&self, band: usize) -> usize {
        BAND_FEATURES + self.bands + band
    }

    fn std_dev_at(&self, band: usize) -> usize {
        BAND_FEATURES + 2 * self.bands + band
    }
}

impl SegmentMerger for BaatzMerger {
    fn features_len(&self, bands: usize) -> usize {
        BAND_FEATURES + 3 * bands
    }

    fn init_features(&self, pixel: &[f64], out: &mut [f64]) {
        out[PERIMETER] = 4.0;
        out[COMPACTNESS] = 4.0;
        out[SMOOTHNESS] = 1.0;
        for (band, &v) in pixel.iter().enumerate() {
            out[self.sum_at(band)] = v;
            out[self.square_sum_at(band)] = v * v;
            out[self.std_dev_at(band)] = 0.0;
        }
    }

    fn update(&mut self, graph: &SegmentGraph) {
        let mut compactness = FeatureRange::new();
        let mut smoothness = FeatureRange::new();
        let mut std_dev = FeatureRange::new();
        for seg in graph.live() {
            let f = graph.features(seg);
            compactness.add(f[COMPACTNESS]);
            smoothness.add(f[SMOOTHNESS]);
            for band in 0..self.bands {
                std_dev.add(f[self.std_dev_at(band)]);
            }
        }
        self.compactness = compactness.rescale();
        self.smoothness = smoothness.rescale();
        self.std_dev = std_dev.rescale();
    }

    fn dissimilarity(
        &self,
        graph: &SegmentGraph,
        a: u32,
        b: u32,
        border: u32,
        merged: &mut [f64],
    ) -> f64 {
        let (fa, fb) = (graph.features(a), graph.features(b));
        let (size_a, size_b) = (graph.size(a) as f64, graph.size(b) as f64);
        let size = size_a + size_b;
        let bbox = graph.bounding_box(a).union(&graph.bounding_box(b));

        let perimeter = fa[PERIMETER] + fb[PERIMETER] - 2.0 * border as f64;
        merged[PERIMETER] = perimeter;
        merged[COMPACTNESS] = perimeter / size.sqrt();
        merged[SMOOTHNESS] = perimeter / (2 * (bbox.width() + bbox.height())) as f64;
        let growth = |rescale: &Rescale, feature: usize, merged: f64| {
            rescale.apply(merged)
                - (rescale.apply(fa[feature]) * size_a + rescale.apply(fb[feature]) * size_b) / size
        };
        let h_compact = growth(&self.compactness, COMPACTNESS, merged[COMPACTNESS]);
        let h_smooth = growth(&self.smoothness, SMOOTHNESS, merged[SMOOTHNESS]);
        let h_shape =
            self.compactness_weight * h_compact + (1.0 - self.compactness_weight) * h_smooth;

        let mut h_color = 0.0;
        for (band, weight) in self.band_weights.iter().enumerate() {
            let (sum, square_sum, std_dev) =
                (self.sum_at(band), self.square_sum_at(band), self.std_dev_at(band));
            merged[sum] = fa[sum] + fb[sum];
            merged[square_sum] = fa[square_sum] + fb[square_sum];
            let mean = merged[sum] / size;
            merged[std_dev] = (merged[square_sum] / size - mean * mean).max(0.0).sqrt();
            h_color += weight * growth(&self.std_dev, std_dev, merged[std_dev]);
        }

        (self.color_weight * h_color + (1.0 - self.color_weight) * h_shape).max(0.0)
    }
}

#[derive(Debug, Default)]
pub struct RegionGrowingBaatzStrategy {
    params: StrategyParameters,
    /// Normalized `band_weights`, empty for equal weights.
    band_weights: Vec<f64>,
}

impl RegionGrowingBaatzStrategy {
    pub const NAME: &'static str = "region-growing-baatz";

    fn weights_for(&self, bands: usize) -> Result<Vec<f64>, SegmenterError> {
        if self.band_weights.is_empty() {
            return Ok(vec![1.0 / bands.max(1) as f64; bands]);
        }
        if self.band_weights.len() != bands {
            return Err(SegmenterError::StrategyInit(format!(
                "{} band weights for {bands} bands",
                self.band_weights.len()
            )));
        }
        Ok(self.band_weights.clone())
    }
}

fn unit_weight(name: &str, value: f64) -> Result<(), SegmenterError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(SegmenterError::StrategyInit(format!(
            "{name} must be within 0..=1, got {value}"
        )))
    }
}

impl SegmentationStrategy for RegionGrowingBaatzStrategy {
    fn initialize(&mut self, params: &StrategyParameters) -> Result<(), SegmenterError> {
        if params.min_segment_size == 0 {
            return Err(SegmenterError::StrategyInit(
                "min_segment_size must be positive".to_string(),
            ));
        }
        if params.similarity_threshold.is_nan() || params.similarity_threshold < 0.0 {
            return Err(SegmenterError::StrategyInit(format!(
                "similarity_threshold must be a non-negative number, got {}",
                params.similarity_threshold
            )));
        }
        unit_weight("color_weight", params.color_weight)?;
        unit_weight("compactness_weight", params.compactness_weight)?;
        if params
            .band_weights
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(SegmenterError::StrategyInit(format!(
                "band weights must be non-negative, got {:?}",
                params.band_weights
            )));
        }
        let total: f64 = params.band_weights.iter().sum();
        if !params.band_weights.is_empty() && total == 0.0 {
            return Err(SegmenterError::StrategyInit(
                "band weights sum to zero".to_string(),
            ));
        }
        self.band_weights = params.band_weights.iter().map(|w| w / total).collect();
        self.params = params.clone();
        Ok(())
    }

    fn execute(
        &mut self,
        ids: &SegmentIdAllocator,
        block: &SegmentsBlock,
        input: &BlockWindow,
        output: &mut LabelWindow,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<(), SegmenterError> {
        let mut merger = BaatzMerger::new(&self.params, self.weights_for(input.band_count())?);
        let exact = PassRules {
            mutual_best: false,
            same_iteration: true,
        };
        let stepped = PassRules {
            mutual_best: self.params.enable_local_mutual_best_fitting,
            same_iteration: self.params.enable_same_iteration_merges,
        };
        grow(
            &mut merger,
            &self.params,
            exact,
            stepped,
            ids,
            block,
            input,
            output,
            progress,
        )
    }

    fn mem_usage_estimation(&self, band_count: usize, pixels: usize) -> f64 {
        let f64_size = std::mem::size_of::<f64>();
        // window, shape and band features, segment record, six neighbour edges, pixel to segment
        // map and label
        let features = (BAND_FEATURES + 3 * band_count) * f64_size;
        let per_pixel = band_count * f64_size + features + 4 + 16 + 4 + 1 + 4 + 6 * 8 + 4 + 4;
        (per_pixel * pixels) as f64
    }

    fn optimal_blocks_overlap(&self) -> usize {
        (self.params.min_segment_size as f64).sqrt() as usize
    }

    /// Colour heterogeneity of a two pixel segment against the similarity threshold.
    fn seam_merge_allowed(&self, a: &[f64], b: &[f64]) -> bool {
        let Ok(weights) = self.weights_for(a.len()) else {
            return false;
        };
        let h_color: f64 = a
            .iter()
            .zip(b)
            .zip(&weights)
            .map(|((x, y), w)| w * (x - y).abs() / 2.0)
            .sum();
        h_color <= self.params.similarity_threshold
    }
}
