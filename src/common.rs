use crate::error::SegmenterError;
use crate::strategy::StrategyParameters;
use serde::{Deserialize, Serialize};

/// Options of one segmentation run.
///
/// Every field has a default, so a configuration can be deserialized from a partial document.
/// The defaults process the whole raster in blocks on all available cores with block merging and
/// the input cache enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Name of a strategy in the registry.
    pub strategy_name: String,
    /// Input bands fed to the strategy, in order.
    pub input_bands: Vec<usize>,
    /// Allow more than one worker thread.
    pub enable_threaded_processing: bool,
    /// Upper bound of worker threads, 0 uses the available parallelism.
    pub max_threads: usize,
    /// Allow splitting the raster into blocks. When disabled the raster is one block.
    pub enable_block_processing: bool,
    /// Overlap blocks and join them along cutoff profiles. When disabled blocks meet at their
    /// nominal edges and segments are cut there.
    pub enable_block_merging: bool,
    /// Maximum edge of a nominal block in pixels, 0 for no limit.
    pub max_block_size: usize,
    /// Read the input through an LRU tile cache.
    pub enable_raster_cache: bool,
    /// Report progress to and accept cancellation from the reporter passed to `execute`.
    pub enable_progress: bool,
    /// No-data value of every input band. Empty uses the values of the input raster.
    pub no_data_values: Vec<f64>,
    /// Overlap margin in pixels, `None` asks the strategy.
    pub block_overlap: Option<usize>,
    /// Memory the run may use in bytes, 0 detects the available memory.
    pub memory_budget_bytes: u64,
    /// How often the orchestrator wakes up to check progress and cancellation.
    pub progress_poll_interval_ms: u64,
    pub strategy: StrategyParameters,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            strategy_name: "region-growing-mean".to_string(),
            input_bands: vec![],
            enable_threaded_processing: true,
            max_threads: 0,
            enable_block_processing: true,
            enable_block_merging: true,
            max_block_size: 0,
            enable_raster_cache: true,
            enable_progress: false,
            no_data_values: vec![],
            block_overlap: None,
            memory_budget_bytes: 0,
            progress_poll_interval_ms: 1000,
            strategy: StrategyParameters::default(),
        }
    }
}

impl SegmenterConfig {
    /// Check band selection and no-data values against a raster with `band_count` bands.
    pub fn validate(&self, band_count: usize) -> Result<(), SegmenterError> {
        if self.input_bands.is_empty() {
            return Err(SegmenterError::NoBands);
        }
        if let Some(&band) = self.input_bands.iter().find(|b| **b >= band_count) {
            return Err(SegmenterError::InvalidBand {
                band,
                bands: band_count,
            });
        }
        if !self.no_data_values.is_empty() && self.no_data_values.len() != self.input_bands.len() {
            return Err(SegmenterError::NoDataCountMismatch {
                expected: self.input_bands.len(),
                got: self.no_data_values.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors() {
        let mut config = SegmenterConfig::default();
        assert_eq!(config.validate(3), Err(SegmenterError::NoBands));
        config.input_bands = vec![0, 3];
        assert_eq!(
            config.validate(3),
            Err(SegmenterError::InvalidBand { band: 3, bands: 3 })
        );
        config.input_bands = vec![0, 2];
        config.no_data_values = vec![0.0];
        assert_eq!(
            config.validate(3),
            Err(SegmenterError::NoDataCountMismatch {
                expected: 2,
                got: 1
            })
        );
        config.no_data_values = vec![0.0, 255.0];
        assert_eq!(config.validate(3), Ok(()));
    }

    #[test]
    fn partial_config_deserializes_with_defaults() {
        let config: SegmenterConfig = serde_json::from_str(
            r#"{
                "strategy_name": "trivial-threshold",
                "input_bands": [1],
                "max_threads": 2,
                "strategy": { "threshold": 0.1 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.strategy_name, "trivial-threshold");
        assert!(config.enable_block_merging);
        assert_eq!(config.progress_poll_interval_ms, 1000);
        assert_eq!(config.strategy.threshold, 0.1);
        assert_eq!(config.strategy.min_segment_size, 100);
    }
}
