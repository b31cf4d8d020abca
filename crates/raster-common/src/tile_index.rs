//! Absolute-coordinate to buffer-offset mapping for a tile rectangle.

use crate::rect::Rect;

/// Maps absolute raster coordinates inside a tile rectangle to linear buffer
/// offsets.
///
/// The row form avoids recomputing the row offset inside inner loops:
///
/// ```
/// use raster_common::{Rect, TileIndex};
///
/// let mut index = TileIndex::new(Rect::new(10, 20, 4, 3));
/// index.calculate_stride(21);
/// assert_eq!(index.index(12), 6);
/// assert_eq!(index.offset(12, 21), 6);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TileIndex {
    rect: Rect,
    row_offset: usize,
}

impl TileIndex {
    pub fn new(rect: Rect) -> Self {
        Self {
            rect,
            row_offset: 0,
        }
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Select the row at absolute `y` for subsequent [`index`](Self::index) calls.
    pub fn calculate_stride(&mut self, y: usize) {
        debug_assert!(y >= self.rect.y && y < self.rect.y_max());
        self.row_offset = (y - self.rect.y) * self.rect.width;
    }

    /// Offset of absolute `x` in the row selected by `calculate_stride`.
    pub fn index(&self, x: usize) -> usize {
        debug_assert!(x >= self.rect.x && x < self.rect.x_max());
        self.row_offset + (x - self.rect.x)
    }

    /// Offset of absolute `(x, y)`.
    pub fn offset(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.rect.contains(x, y));
        (y - self.rect.y) * self.rect.width + (x - self.rect.x)
    }
}
