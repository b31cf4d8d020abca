//! Test data generators for synthetic SAR-like rasters.
//!
//! These generators create predictable, verifiable sample patterns in
//! row-major order that can be used across the test suite.

/// Creates a test grid with predictable values.
///
/// Each cell value is calculated as: `col * 1000 + row`
///
/// This makes it easy to verify that data is being read correctly
/// by checking that grid[row][col] == col * 1000 + row.
///
/// # Example
///
/// ```
/// use test_utils::create_test_grid;
///
/// let grid = create_test_grid(10, 5);
/// assert_eq!(grid.len(), 50);
/// assert_eq!(grid[0], 0.0);    // col=0, row=0
/// assert_eq!(grid[1], 1000.0); // col=1, row=0
/// assert_eq!(grid[10], 1.0);   // col=0, row=1
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f64> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push((col * 1000 + row) as f64);
        }
    }
    data
}

/// Creates a grid numbered `0..width*height` in row-major order.
pub fn create_ramp_grid(width: usize, height: usize) -> Vec<f64> {
    (0..width * height).map(|i| i as f64).collect()
}

/// Creates a grid filled with a constant value.
pub fn create_constant_grid(width: usize, height: usize, value: f64) -> Vec<f64> {
    vec![value; width * height]
}

/// Creates an amplitude grid with multiplicative speckle.
///
/// A smooth backscatter gradient (100 to 300) is multiplied by a
/// deterministic noise factor in [0.5, 1.5).
pub fn create_speckle_grid(width: usize, height: usize, seed: u32) -> Vec<f64> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let x_factor = col as f64 / width.max(1) as f64;
            let y_factor = row as f64 / height.max(1) as f64;
            let backscatter = 100.0 + 100.0 * x_factor + 100.0 * y_factor;

            let hash = simple_hash(col as u32, row as u32, seed);
            let noise = 0.5 + (hash % 1000) as f64 / 1000.0;
            data.push((backscatter * noise).round());
        }
    }
    data
}

/// Creates the real and imaginary components of a complex grid whose
/// intensity (i² + q²) at each pixel is `col * 1000 + row` squared.
///
/// The phase rotates with the pixel position so neither component is trivial.
pub fn create_complex_grid(width: usize, height: usize) -> (Vec<f64>, Vec<f64>) {
    let mut i = Vec::with_capacity(width * height);
    let mut q = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let amplitude = (col * 1000 + row) as f64;
            let phase = (col + row) as f64 * 0.25;
            i.push(amplitude * phase.cos());
            q.push(amplitude * phase.sin());
        }
    }
    (i, q)
}

/// Replace the samples at the given (col, row) positions with `no_data`.
pub fn punch_no_data(
    mut data: Vec<f64>,
    width: usize,
    positions: &[(usize, usize)],
    no_data: f64,
) -> Vec<f64> {
    for &(col, row) in positions {
        let offset = row * width + col;
        if col < width && offset < data.len() {
            data[offset] = no_data;
        }
    }
    data
}

/// Simple deterministic hash for reproducible test data.
fn simple_hash(x: u32, y: u32, seed: u32) -> u32 {
    let mut h = seed;
    h = h.wrapping_mul(31).wrapping_add(x);
    h = h.wrapping_mul(31).wrapping_add(y);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}
