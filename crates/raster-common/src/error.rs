//! Error types for raster metadata and tile buffers.

use thiserror::Error;

use crate::rect::Rect;

/// Result type alias using RasterError.
pub type RasterResult<T> = Result<T, RasterError>;

/// Errors raised while building descriptors or manipulating tiles.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RasterError {
    #[error("Invalid raster dimensions {width}x{height} for product '{product}'")]
    InvalidDimensions {
        product: String,
        width: usize,
        height: usize,
    },

    #[error("Duplicate band '{band}' in product '{product}'")]
    DuplicateBand { product: String, band: String },

    #[error("Band '{band}' not found in product '{product}'")]
    BandNotFound { product: String, band: String },

    #[error("Rectangle {0} has zero area")]
    EmptyRect(Rect),

    #[error("Buffer length mismatch: expected {expected} samples, got {actual}")]
    BufferLength { expected: usize, actual: usize },

    #[error("Rectangle {requested} is not contained in {bounds}")]
    OutOfBounds { requested: Rect, bounds: Rect },

    #[error("Tiles do not cover {0} completely")]
    IncompleteMosaic(Rect),
}

impl RasterError {
    /// Create an OutOfBounds error.
    pub fn out_of_bounds(requested: Rect, bounds: Rect) -> Self {
        Self::OutOfBounds { requested, bounds }
    }

    /// Create a BandNotFound error.
    pub fn band_not_found(product: impl Into<String>, band: impl Into<String>) -> Self {
        Self::BandNotFound {
            product: product.into(),
            band: band.into(),
        }
    }
}
