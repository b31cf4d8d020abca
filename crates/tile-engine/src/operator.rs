//! The contract between the engine and a configured operator instance.

use raster_common::{BandDescriptor, BandId, Margin, RasterDescriptor, Rect, Tile};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{OperatorError, OperatorResult};
use crate::params::Parameters;

/// A processing operator bound to one graph node.
///
/// `initialize` runs once during resolution and declares the output product.
/// The compute methods are synchronous and run on the blocking pool; they
/// receive every declared source tile already gathered.
pub trait Operator: Send + Sync {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor>;

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile>;

    /// Compute every output band of a stack operator in one invocation.
    /// Tiles are returned in the order of `targets`.
    fn compute_tile_stack(
        &self,
        targets: &[BandDescriptor],
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Vec<Tile>> {
        targets
            .iter()
            .map(|target| self.compute_tile(target, rect, sources, ctx))
            .collect()
    }
}

/// One declared output band and the source bands it is computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBand {
    pub descriptor: BandDescriptor,
    pub sources: Vec<BandId>,
}

/// What `initialize` declares about a node's output product.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputDescriptor {
    pub product_type: String,
    pub width: usize,
    pub height: usize,
    pub bands: Vec<OutputBand>,
    pub margin: Margin,
    pub stack: bool,
}

impl OutputDescriptor {
    pub fn new(product_type: impl Into<String>, width: usize, height: usize) -> Self {
        Self {
            product_type: product_type.into(),
            width,
            height,
            bands: Vec::new(),
            margin: Margin::ZERO,
            stack: false,
        }
    }

    /// Output with the same dimensions as `source`.
    pub fn like(source: &RasterDescriptor, product_type: impl Into<String>) -> Self {
        Self::new(product_type, source.width(), source.height())
    }

    pub fn band(mut self, descriptor: BandDescriptor, sources: Vec<BandId>) -> Self {
        self.bands.push(OutputBand {
            descriptor,
            sources,
        });
        self
    }

    pub fn with_margin(mut self, margin: Margin) -> Self {
        self.margin = margin;
        self
    }

    /// Mark the operator as computing all bands in one invocation.
    pub fn stacked(mut self) -> Self {
        self.stack = true;
        self
    }
}

/// What an operator sees during `initialize`.
pub struct InitContext<'a> {
    node_id: &'a str,
    sources: &'a HashMap<String, Arc<RasterDescriptor>>,
    parameters: &'a Parameters,
}

impl<'a> InitContext<'a> {
    pub fn new(
        node_id: &'a str,
        sources: &'a HashMap<String, Arc<RasterDescriptor>>,
        parameters: &'a Parameters,
    ) -> Self {
        Self {
            node_id,
            sources,
            parameters,
        }
    }

    pub fn node_id(&self) -> &str {
        self.node_id
    }

    pub fn parameters(&self) -> &Parameters {
        self.parameters
    }

    /// Descriptor bound to a source slot, if the slot is bound.
    pub fn source(&self, slot: &str) -> Option<&Arc<RasterDescriptor>> {
        self.sources.get(slot)
    }

    pub fn require_source(&self, slot: &str) -> OperatorResult<&Arc<RasterDescriptor>> {
        self.source(slot)
            .ok_or_else(|| OperatorError::invalid_source(format!("slot '{slot}' is not bound")))
    }
}

/// Access to the source tiles gathered for one computation.
pub trait SourceTileProvider: Send + Sync {
    /// The whole gathered tile for `band`: the margin-expanded target
    /// rectangle clipped to the source raster.
    fn gathered(&self, band: &BandId) -> OperatorResult<&Tile>;

    /// `rect` of `band`, cropped from the gathered tile.
    fn source_tile(&self, band: &BandId, rect: Rect) -> OperatorResult<Tile> {
        let tile = self.gathered(band)?;
        if !tile.rect().contains_rect(&rect) {
            return Err(OperatorError::SourceNotGathered {
                band: band.clone(),
                rect,
            });
        }
        Ok(tile.crop(rect)?)
    }
}

/// Source tiles gathered by the scheduler, keyed by band.
#[derive(Debug, Default)]
pub struct SourceTiles {
    tiles: HashMap<BandId, Tile>,
}

impl SourceTiles {
    pub fn new(tiles: impl IntoIterator<Item = Tile>) -> Self {
        Self {
            tiles: tiles
                .into_iter()
                .map(|tile| (tile.band().clone(), tile))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

impl SourceTileProvider for SourceTiles {
    fn gathered(&self, band: &BandId) -> OperatorResult<&Tile> {
        self.tiles
            .get(band)
            .ok_or_else(|| OperatorError::BandNotGathered { band: band.clone() })
    }
}

/// Receives a label for every kernel call an operator chooses to report.
pub trait InvocationRecorder: Send + Sync {
    fn record(&self, call: &str);
}

/// An [`InvocationRecorder`] that keeps calls in order.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of recorded calls with the given label.
    pub fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl InvocationRecorder for CallLog {
    fn record(&self, call: &str) {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call.to_string());
    }
}

/// Per-invocation context handed to kernels.
#[derive(Clone)]
pub struct ComputeContext {
    node: String,
    cancel: CancellationToken,
    recorder: Option<Arc<dyn InvocationRecorder>>,
}

impl ComputeContext {
    pub fn new(node: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            node: node.into(),
            cancel,
            recorder: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Option<Arc<dyn InvocationRecorder>>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Id of the node being computed.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` once the session has been cancelled.
    pub fn check_cancelled(&self) -> OperatorResult<()> {
        if self.cancel.is_cancelled() {
            Err(OperatorError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Report a call to the injected recorder, if any.
    pub fn record(&self, call: &str) {
        if let Some(recorder) = &self.recorder {
            recorder.record(call);
        }
    }
}
