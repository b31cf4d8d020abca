//! Pixel rectangles and neighbourhood margins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An axis-aligned pixel rectangle. `x`/`y` is the top-left corner; the
/// right and bottom edges (`x_max`, `y_max`) are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// Extra pixels a neighbourhood operator needs on each side of a target rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Margin {
    pub x: usize,
    pub y: usize,
}

impl Margin {
    /// Margin of a pointwise operator.
    pub const ZERO: Margin = Margin { x: 0, y: 0 };

    pub fn new(x: usize, y: usize) -> Self {
        Self { x, y }
    }

    /// Same margin on both axes.
    pub fn uniform(pixels: usize) -> Self {
        Self {
            x: pixels,
            y: pixels,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

impl Rect {
    /// Create a new rectangle.
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Rectangle covering a whole raster of the given size.
    pub fn of_size(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Exclusive right edge.
    pub fn x_max(&self) -> usize {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn y_max(&self) -> usize {
        self.y + self.height
    }

    /// Number of pixels covered.
    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Check if a pixel lies inside this rectangle.
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.x && x < self.x_max() && y >= self.y && y < self.y_max()
    }

    /// Check if `other` lies completely inside this rectangle.
    pub fn contains_rect(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x_max() <= self.x_max()
            && other.y_max() <= self.y_max()
    }

    /// Compute the intersection of two rectangles.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let x_max = self.x_max().min(other.x_max());
        let y_max = self.y_max().min(other.y_max());

        if x >= x_max || y >= y_max {
            return None;
        }

        Some(Rect::new(x, y, x_max - x, y_max - y))
    }

    /// Clip to a raster of the given size.
    pub fn clip_to(&self, width: usize, height: usize) -> Option<Rect> {
        self.intersection(&Rect::of_size(width, height))
    }

    /// Grow by `margin` on every side, clipped to `[0, width) x [0, height)`.
    ///
    /// Pixels beyond the raster edge are treated as absent: nothing is
    /// wrapped or mirrored.
    pub fn expand_clipped(&self, margin: Margin, width: usize, height: usize) -> Rect {
        let x = self.x.saturating_sub(margin.x);
        let y = self.y.saturating_sub(margin.y);
        let x_max = (self.x_max() + margin.x).min(width).max(x);
        let y_max = (self.y_max() + margin.y).min(height).max(y);
        Rect::new(x, y, x_max - x, y_max - y)
    }

    /// Split a `width x height` raster into a row-major grid of tiles of at
    /// most `tile_width x tile_height`. Edge tiles are smaller.
    pub fn tile_grid(width: usize, height: usize, tile_width: usize, tile_height: usize) -> Vec<Rect> {
        let tile_width = tile_width.max(1);
        let tile_height = tile_height.max(1);
        let mut tiles = Vec::with_capacity(width.div_ceil(tile_width) * height.div_ceil(tile_height));

        let mut y = 0;
        while y < height {
            let h = tile_height.min(height - y);
            let mut x = 0;
            while x < width {
                let w = tile_width.min(width - x);
                tiles.push(Rect::new(x, y, w, h));
                x += w;
            }
            y += h;
        }
        tiles
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{} {}x{}]", self.x, self.y, self.width, self.height)
    }
}
