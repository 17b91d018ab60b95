//! Pluggable segmentation strategies.
//!
//! A strategy turns one block window into labels. It is created per worker from a
//! [`StrategyRegistry`], so implementations need no internal locking. New segments must take
//! their labels from the shared [`SegmentIdAllocator`] to stay unique across blocks.

use crate::arrays::Array2D;
use crate::baatz::RegionGrowingBaatzStrategy;
use crate::block::SegmentsBlock;
use crate::error::SegmenterError;
use crate::ids::SegmentIdAllocator;
use crate::planner::BlockBounds;
use crate::progress::ProgressReporter;
use crate::region_growing::RegionGrowingMeanStrategy;
use crate::threshold::TrivialThresholdStrategy;
use serde::{Deserialize, Serialize};
use static_init::dynamic;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Labels of one block window, 0 for unlabeled pixels.
pub type LabelWindow = Array2D<u32>;

/// Tuning shared by the built-in strategies. Each strategy reads the fields it knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyParameters {
    /// Segments smaller than this are merged into their most similar neighbour.
    pub min_segment_size: usize,
    /// Maximum normalized mean distance for merging two segments.
    pub similarity_threshold: f64,
    /// Number of steps the merge threshold is raised over, up to `similarity_threshold`.
    pub similarity_increase_steps: usize,
    /// Maximum normalized difference between pixels of one threshold segment.
    pub threshold: f64,
    /// Baatz: share of the colour heterogeneity in the merge cost, the rest is shape.
    pub color_weight: f64,
    /// Baatz: share of compactness in the shape heterogeneity, the rest is smoothness.
    pub compactness_weight: f64,
    /// Baatz: weight of every selected band in the colour heterogeneity. Empty weighs all bands
    /// equally, otherwise one non-negative weight per band.
    pub band_weights: Vec<f64>,
    /// Baatz: only merge two segments when each is the other's cheapest neighbour.
    pub enable_local_mutual_best_fitting: bool,
    /// Baatz: let a segment merged in one iteration merge again within the same iteration.
    pub enable_same_iteration_merges: bool,
}

impl Default for StrategyParameters {
    fn default() -> Self {
        Self {
            min_segment_size: 100,
            similarity_threshold: 0.03,
            similarity_increase_steps: 2,
            threshold: 0.0,
            color_weight: 0.9,
            compactness_weight: 0.5,
            band_weights: vec![],
            enable_local_mutual_best_fitting: false,
            enable_same_iteration_merges: false,
        }
    }
}

/// Pixels of one expanded block, copied out of the input raster.
#[derive(Debug, Clone)]
pub struct BlockWindow {
    pub bounds: BlockBounds,
    /// Raw values of the selected bands, in selection order.
    pub bands: Vec<Array2D<f64>>,
    pub no_data: Vec<Option<f64>>,
    pub band_min: Vec<f64>,
    pub band_max: Vec<f64>,
}

impl BlockWindow {
    pub fn width(&self) -> usize {
        self.bounds.width
    }

    pub fn height(&self) -> usize {
        self.bounds.height
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// A pixel is invalid when any band holds its no-data value.
    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        self.bands
            .iter()
            .zip(&self.no_data)
            .all(|(band, no_data)| no_data.map_or(true, |nd| band.data[index] != nd))
    }

    /// Band value scaled to `0..=1` by the global band statistics.
    #[inline]
    pub fn normalized(&self, band: usize, index: usize) -> f64 {
        let min = self.band_min[band];
        let range = self.band_max[band] - min;
        if range > 0.0 {
            (self.bands[band].data[index] - min) / range
        } else {
            0.0
        }
    }

    pub fn features(&self, index: usize, out: &mut [f64]) {
        for (band, v) in out.iter_mut().enumerate() {
            *v = self.normalized(band, index);
        }
    }

    /// Pixels a strategy should label: every valid pixel of the window, overlap margin included.
    /// Labels outside the block's authoritative region are dropped when the block is committed.
    pub fn valid_mask(&self) -> Array2D<bool> {
        let mut mask = Array2D::from_fill(false, self.width(), self.height());
        for (index, m) in mask.data.iter_mut().enumerate() {
            *m = self.is_valid(index);
        }
        mask
    }
}

pub trait SegmentationStrategy: Send {
    fn initialize(&mut self, params: &StrategyParameters) -> Result<(), SegmenterError>;

    /// Label the block. `output` covers the expanded bounds and starts zeroed; only labels inside
    /// the authoritative region reach the output raster.
    fn execute(
        &mut self,
        ids: &SegmentIdAllocator,
        block: &SegmentsBlock,
        input: &BlockWindow,
        output: &mut LabelWindow,
        progress: Option<&dyn ProgressReporter>,
    ) -> Result<(), SegmenterError>;

    /// Bytes needed to segment `pixels` pixels of `band_count` bands.
    fn mem_usage_estimation(&self, band_count: usize, pixels: usize) -> f64;

    /// Overlap margin giving the strategy enough context at block edges.
    fn optimal_blocks_overlap(&self) -> usize;

    /// Whether two pixels on opposite sides of a block seam belong to one segment. Both slices
    /// hold normalized band values.
    fn seam_merge_allowed(&self, a: &[f64], b: &[f64]) -> bool;
}

pub type StrategyConstructor = Arc<dyn Fn() -> Box<dyn SegmentationStrategy> + Send + Sync>;

/// Name to constructor table. The process-wide default holds the built-in strategies.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    constructors: BTreeMap<String, StrategyConstructor>,
}

#[dynamic(lazy)]
static DEFAULT_REGISTRY: StrategyRegistry = StrategyRegistry::with_builtin();

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(TrivialThresholdStrategy::NAME, || {
            Box::<TrivialThresholdStrategy>::default()
        });
        registry.register(RegionGrowingMeanStrategy::NAME, || {
            Box::<RegionGrowingMeanStrategy>::default()
        });
        registry.register(RegionGrowingBaatzStrategy::NAME, || {
            Box::<RegionGrowingBaatzStrategy>::default()
        });
        registry
    }

    pub fn global() -> &'static StrategyRegistry {
        &DEFAULT_REGISTRY
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn() -> Box<dyn SegmentationStrategy> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Fresh, uninitialized strategy instance.
    pub fn create(&self, name: &str) -> Result<Box<dyn SegmentationStrategy>, SegmenterError> {
        self.constructors
            .get(name)
            .map(|constructor| constructor())
            .ok_or_else(|| SegmenterError::UnknownStrategy(name.to_string()))
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_builtin_strategies() {
        let registry = StrategyRegistry::global();
        assert!(registry.contains("trivial-threshold"));
        assert!(registry.contains("region-growing-mean"));
        assert!(registry.contains("region-growing-baatz"));
        assert_eq!(registry.names().count(), 3);
        assert!(registry.create("region-growing-mean").is_ok());
        assert!(matches!(
            registry.create("watershed"),
            Err(SegmenterError::UnknownStrategy(name)) if name == "watershed"
        ));
    }

    #[test]
    fn parameters_fill_missing_fields_with_defaults() {
        let params: StrategyParameters =
            serde_json::from_str(r#"{ "min_segment_size": 9 }"#).unwrap();
        assert_eq!(params.min_segment_size, 9);
        assert_eq!(params.similarity_increase_steps, 2);
        assert_eq!(params.color_weight, 0.9);
        assert!(params.band_weights.is_empty());
        assert!(!params.enable_local_mutual_best_fitting);
    }

    #[test]
    fn window_validity_and_normalization() {
        let bounds = BlockBounds {
            start_row: 0,
            start_col: 0,
            height: 1,
            width: 3,
        };
        let window = BlockWindow {
            bounds,
            bands: vec![
                Array2D::from_slice(&[0.0, 5.0, 10.0], 3, 1).unwrap(),
                Array2D::from_slice(&[7.0, -1.0, 7.0], 3, 1).unwrap(),
            ],
            no_data: vec![None, Some(-1.0)],
            band_min: vec![0.0, 7.0],
            band_max: vec![10.0, 7.0],
        };
        assert!(window.is_valid(0));
        assert!(!window.is_valid(1));
        assert_eq!(window.normalized(0, 1), 0.5);
        assert_eq!(window.normalized(1, 2), 0.0);
        let mut features = [0.0; 2];
        window.features(2, &mut features);
        assert_eq!(features, [1.0, 0.0]);

        let mask = window.valid_mask();
        assert_eq!(mask.data.as_slice(), &[true, false, true]);
    }
}
