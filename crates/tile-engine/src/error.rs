//! Error types for graph resolution, operator kernels and tile requests.

use raster_common::{BandId, RasterError, Rect};
use thiserror::Error;

/// Errors detected while resolving a graph. All of them are fatal before any
/// pixel is computed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("cyclic graph: {}", .cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<String> },

    #[error("node '{node}' ({operator}): source slot '{slot}' is not bound to a known product")]
    MissingSource {
        node: String,
        operator: String,
        slot: String,
    },

    #[error("node '{node}' ({operator}) has no source slot named '{slot}'")]
    UnknownSourceSlot {
        node: String,
        operator: String,
        slot: String,
    },

    #[error("invalid parameter '{parameter}' for operator '{operator}': {reason}")]
    InvalidParameter {
        operator: String,
        parameter: String,
        reason: String,
    },

    #[error("node '{node}' uses unknown operator '{operator}'")]
    UnknownOperator { node: String, operator: String },

    #[error("target node '{0}' is not defined in the graph")]
    UnknownTarget(String),

    #[error("node id '{0}' is defined more than once")]
    DuplicateNode(String),

    #[error("operator '{0}' is already registered")]
    DuplicateOperator(String),

    #[error("product name '{0}' is used by both a node and an external source")]
    DuplicateProduct(String),

    #[error("node '{node}' ({operator}) failed to initialize: {message}")]
    Initialization {
        node: String,
        operator: String,
        message: String,
    },

    #[error("failed to parse graph: {0}")]
    Parse(String),
}

impl ResolutionError {
    /// Create an InvalidParameter error.
    pub fn invalid_parameter(
        operator: impl Into<String>,
        parameter: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            operator: operator.into(),
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Create a MissingSource error.
    pub fn missing_source(
        node: impl Into<String>,
        operator: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self::MissingSource {
            node: node.into(),
            operator: operator.into(),
            slot: slot.into(),
        }
    }
}

impl From<serde_yaml::Error> for ResolutionError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for ResolutionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Errors returned by operator implementations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OperatorError {
    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("invalid parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("computation failed: {0}")]
    Computation(String),

    #[error("source tile {band} {rect} was not gathered for this computation")]
    SourceNotGathered { band: BandId, rect: Rect },

    #[error("source band {band} was not gathered for this computation")]
    BandNotGathered { band: BandId },

    #[error("computation cancelled")]
    Cancelled,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Raster(#[from] RasterError),
}

impl OperatorError {
    /// Create an InvalidParameter error.
    pub fn invalid_parameter(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidSource error.
    pub fn invalid_source(msg: impl Into<String>) -> Self {
        Self::InvalidSource(msg.into())
    }

    /// Create a Computation error.
    pub fn computation(msg: impl Into<String>) -> Self {
        Self::Computation(msg.into())
    }
}

/// Errors returned by tile requests.
///
/// Cloneable so that every coalesced waiter receives the same error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TileError {
    #[error("invalid request for {band} {rect}: {reason}")]
    InvalidRequest {
        band: BandId,
        rect: Rect,
        reason: String,
    },

    #[error("operator '{operator}' failed computing {band} {rect}: {message}")]
    Computation {
        operator: String,
        band: BandId,
        rect: Rect,
        message: String,
    },

    #[error("computation of {band} {rect} was cancelled")]
    Cancelled { band: BandId, rect: Rect },

    #[error("external source '{external}' failed reading {band} {rect}: {message}")]
    Source {
        external: String,
        band: BandId,
        rect: Rect,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TileError {
    /// Create an InvalidRequest error.
    pub fn invalid_request(band: &BandId, rect: Rect, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            band: band.clone(),
            rect,
            reason: reason.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Result type for graph resolution.
pub type ResolutionResult<T> = std::result::Result<T, ResolutionError>;

/// Result type for operator implementations.
pub type OperatorResult<T> = std::result::Result<T, OperatorError>;

/// Result type for tile requests.
pub type TileResult<T> = std::result::Result<T, TileError>;
