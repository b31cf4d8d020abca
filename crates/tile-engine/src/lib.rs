//! Tile-based operator graph engine.
//!
//! A declarative [`GraphSpec`] is resolved against an [`OperatorRegistry`]
//! and a set of [`ExternalSources`] into a [`ResolvedGraph`]. A
//! [`TileScheduler`] then serves `(band, rect)` requests lazily: tiles are
//! computed on demand, cached, and concurrent requests for the same tile
//! share one computation.
//!
//! # Example
//!
//! ```ignore
//! use tile_engine::{resolve, EngineConfig, GraphSpec, TileScheduler};
//!
//! let graph = GraphSpec::from_yaml(&std::fs::read_to_string("graph.yaml")?)?;
//! let resolved = resolve(&graph, "speckle", &registry, &externals)?;
//! let scheduler = TileScheduler::new(resolved, EngineConfig::from_env());
//!
//! let band = scheduler.graph().target_bands()[0].clone();
//! let tile = scheduler.get_tile(&band, Rect::new(0, 0, 256, 256)).await?;
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod operator;
pub mod params;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod source;

pub use cache::{CacheStats, TileCache, TileKey};
pub use config::EngineConfig;
pub use error::{
    OperatorError, OperatorResult, ResolutionError, ResolutionResult, TileError, TileResult,
};
pub use graph::{GraphSpec, NodeSpec, SourceBinding, SourceRef};
pub use operator::{
    CallLog, ComputeContext, InitContext, InvocationRecorder, Operator, OutputBand,
    OutputDescriptor, SourceTileProvider, SourceTiles,
};
pub use params::{ParamDescriptor, ParamKind, ParamValue, ParameterSchema, Parameters};
pub use registry::{OperatorDescriptor, OperatorFactory, OperatorRegistry, SourceSlot};
pub use resolver::{resolve, Producer, ResolvedGraph, ResolvedNode};
pub use scheduler::{SchedulerBuilder, SchedulerStats, TileScheduler};
pub use source::{ExternalSource, ExternalSources, MemorySource, SourceError};

// Re-export the raster model for operator implementations.
pub use raster_common;
