//! Block-parallel raster segmentation in Rust.
//!
//! This crate splits a large multi-band raster into possibly overlapping blocks, segments every
//! block with a pluggable strategy on a pool of worker threads and writes one globally consistent
//! label raster. Block sizes follow the memory budget and the number of workers. Neighbouring
//! blocks meet along cutoff profiles which follow the strongest local edges instead of a straight
//! line, and regions split by a block boundary are joined again after the run.
//!
//! Three strategies are built in: `"trivial-threshold"` (4-connected runs of similar pixels),
//! `"region-growing-mean"` (mutual best neighbour merging of segment means) and
//! `"region-growing-baatz"` (merging by Baatz colour and shape heterogeneity). Others can be added
//! through a [`strategy::StrategyRegistry`].
//!
//! The following example segments an in-memory raster with two flat regions:
//!
//! ```rust
//! use raster_segmenter::common::SegmenterConfig;
//! use raster_segmenter::raster::{BandProperty, BandType, MemRaster, Raster};
//! use raster_segmenter::segmenter::Segmenter;
//!
//! fn main() {
//!     // 256x256 single band raster, 10 above row 128 and 200 below
//!     let input = MemRaster::from_fn(
//!         256,
//!         256,
//!         &[BandProperty::new(BandType::U8, None)],
//!         |_col, row, _band| if row < 128 { 10.0 } else { 200.0 },
//!     );
//!     // config with defaults, blocks of at most 128x128 pixels
//!     let config = SegmenterConfig {
//!         strategy_name: "trivial-threshold".to_string(),
//!         input_bands: vec![0],
//!         max_block_size: 128,
//!         ..Default::default()
//!     };
//!     let mut segmenter = Segmenter::new();
//!     segmenter.initialize(config, &input).unwrap();
//!     // pass a `ProgressReporter` to report progress and allow cancellation
//!     let output = segmenter.execute(None).unwrap();
//!     let top = output.raster.get(0, 0, 0).unwrap();
//!     let bottom = output.raster.get(0, 255, 0).unwrap();
//!     assert_ne!(top, bottom);
//!     assert_eq!(output.raster.get(255, 0, 0).unwrap(), top);
//! }
//! ```
//!
//! Rasters are accessed through the [`raster::Raster`] trait, so disk backed rasters can be
//! plugged in by implementing it together with a [`raster::RasterFactory`] for the output.
//!
//! Cancellation is cooperative. Workers only look at the abort flag between blocks, so a
//! cancelled run returns after the blocks in flight are finished.
//!
//! The crate logs through the `log` facade and does not install a logger.
//!

pub mod arrays;
pub mod baatz;
pub mod block;
pub mod cache;
pub mod common;
pub mod connectivity;
pub mod cutoff;
pub mod error;
pub mod ids;
pub mod planner;
pub mod progress;
pub mod raster;
pub mod region_growing;
pub mod seams;
pub mod segmenter;
pub mod strategy;
pub mod sync;
pub mod threshold;
pub mod worker;
