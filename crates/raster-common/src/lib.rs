//! Raster model shared across the tile-graph workspace.
//!
//! - [`RasterDescriptor`] / [`BandDescriptor`]: immutable product metadata
//! - [`Rect`] / [`Margin`]: pixel rectangles and neighbourhood margins
//! - [`Tile`]: a decoded sample buffer for one band over one rectangle
//! - [`TileIndex`]: (x, y) to buffer offset arithmetic used by kernels

pub mod descriptor;
pub mod error;
pub mod rect;
pub mod tile;
pub mod tile_index;

pub use descriptor::{BandDescriptor, BandId, DataType, RasterDescriptor, RasterDescriptorBuilder, Unit};
pub use error::{RasterError, RasterResult};
pub use rect::{Margin, Rect};
pub use tile::{Sample, Tile, TileData};
pub use tile_index::TileIndex;
