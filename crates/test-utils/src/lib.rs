//! Shared test utilities for the tile graph workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Synthetic raster generators
//! - In-memory external sources
//! - Instrumented test operators and graphs
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your integration tests:
//!
//! ```ignore
//! use test_utils::{test_ops_graph, test_registry};
//! ```

pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Macro for approximate equality of two sample slices.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_samples_approx_eq;
///
/// assert_samples_approx_eq!(tile.to_f64_vec(), vec![1.0, 2.0], 1e-6);
/// ```
#[macro_export]
macro_rules! assert_samples_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: Vec<f64> = $left.iter().map(|v| *v as f64).collect();
        let right: Vec<f64> = $right.iter().map(|v| *v as f64).collect();
        assert_eq!(left.len(), right.len(), "sample counts differ");
        for (l, r) in left.iter().zip(right.iter()) {
            $crate::assert_approx_eq!(*l, *r, $epsilon);
        }
    }};
}
