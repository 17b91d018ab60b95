use thiserror::Error;

/// Failures reported by raster storage.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RasterError {
    #[error("pixel ({col}, {row}) out of bounds")]
    OutOfBounds { col: usize, row: usize },
    #[error("band {band} out of range, raster has {bands} bands")]
    InvalidBand { band: usize, bands: usize },
    #[error("dimension mismatch")]
    DimensionMismatch,
    #[error("raster i/o error: {0}")]
    Io(String),
}

/// Everything that can make a segmentation run fail.
///
/// Configuration errors are returned from `Segmenter::initialize` before any thread is spawned,
/// everything else from `Segmenter::execute`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SegmenterError {
    #[error("segmenter not initialized")]
    NotInitialized,
    #[error("no input bands selected")]
    NoBands,
    #[error("input band {band} out of range, raster has {bands} bands")]
    InvalidBand { band: usize, bands: usize },
    #[error("expected {expected} no-data values, got {got}")]
    NoDataCountMismatch { expected: usize, got: usize },
    #[error("input raster has no pixels or no bands")]
    EmptyRaster,
    #[error("unknown segmentation strategy \"{0}\"")]
    UnknownStrategy(String),
    #[error("strategy initialization failed: {0}")]
    StrategyInit(String),
    #[error(
        "unworkable block budget: {max_block_pixels} pixels per block cannot hold a {rows}x{cols} raster with overlap {overlap}"
    )]
    UnworkableBudget {
        rows: usize,
        cols: usize,
        overlap: usize,
        max_block_pixels: usize,
    },
    #[error("strategy failed on block ({row}, {col}): {message}")]
    Strategy {
        row: usize,
        col: usize,
        message: String,
    },
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error("segment labels exhausted")]
    LabelsExhausted,
    #[error("segmentation cancelled")]
    Cancelled,
    #[error("cannot start worker threads: {0}")]
    ThreadPool(String),
}

impl SegmenterError {
    /// Cancellation is the caller's own request, every other variant is a real failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SegmenterError::Cancelled)
    }
}
