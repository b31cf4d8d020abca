//! SAR raster operators for the tile graph engine.
//!
//! - [`median`]: windowed median speckle filter (`median`)
//! - [`polarimetric`]: dual-polarisation band arithmetic (`dual-pol`)
//!
//! Operators are made available to graphs through [`register_all`].

pub mod median;
pub mod polarimetric;

pub use median::{filter, FilterSources, MedianFilterOp};
pub use polarimetric::{DualPolOp, PolOperation};

use tile_engine::{OperatorRegistry, ResolutionResult};

/// Register every operator of this crate.
pub fn register_all(registry: &mut OperatorRegistry) -> ResolutionResult<()> {
    registry.register(median::descriptor())?;
    registry.register(polarimetric::descriptor())?;
    Ok(())
}

/// A registry holding only the operators of this crate.
pub fn registry() -> ResolutionResult<OperatorRegistry> {
    let mut registry = OperatorRegistry::new();
    register_all(&mut registry)?;
    Ok(registry)
}
