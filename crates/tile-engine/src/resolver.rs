//! Graph resolution: binds sources, validates parameters, initializes
//! operators and orders nodes so that producers precede consumers.
//!
//! No pixel data is touched here.

use raster_common::{BandDescriptor, BandId, Margin, RasterDescriptor};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OperatorError, ResolutionError, ResolutionResult};
use crate::graph::{GraphSpec, NodeSpec, SourceRef};
use crate::operator::{InitContext, Operator, OutputBand};
use crate::params::Parameters;
use crate::registry::OperatorRegistry;
use crate::source::{ExternalSource, ExternalSources};

/// An initialized graph node.
pub struct ResolvedNode {
    pub id: String,
    pub operator_type: String,
    pub operator: Arc<dyn Operator>,
    pub parameters: Parameters,
    /// Slot bindings in declaration order.
    pub bindings: Vec<(String, SourceRef)>,
    /// Output product, named after the node id.
    pub descriptor: Arc<RasterDescriptor>,
    /// Output bands with their source bands, in product order.
    pub bands: Vec<OutputBand>,
    pub margin: Margin,
    pub stack: bool,
}

impl ResolvedNode {
    pub fn band(&self, name: &str) -> Option<&OutputBand> {
        self.bands.iter().find(|b| b.descriptor.name() == name)
    }

    pub fn band_ids(&self) -> Vec<BandId> {
        self.bands.iter().map(|b| b.descriptor.id()).collect()
    }
}

impl fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("id", &self.id)
            .field("operator_type", &self.operator_type)
            .field("bands", &self.band_ids())
            .field("margin", &self.margin)
            .field("stack", &self.stack)
            .finish_non_exhaustive()
    }
}

/// Who produces a band.
#[derive(Clone)]
pub enum Producer {
    /// Band `band` (index into the node's bands) of node `node`.
    Node { node: Arc<ResolvedNode>, band: usize },
    /// A band read from an external source.
    External {
        source: Arc<dyn ExternalSource>,
        descriptor: BandDescriptor,
    },
}

impl Producer {
    pub fn band_descriptor(&self) -> &BandDescriptor {
        match self {
            Self::Node { node, band } => &node.bands[*band].descriptor,
            Self::External { descriptor, .. } => descriptor,
        }
    }

    /// Raster of the product the band belongs to.
    pub fn raster(&self) -> Arc<RasterDescriptor> {
        match self {
            Self::Node { node, .. } => Arc::clone(&node.descriptor),
            Self::External { source, .. } => source.descriptor(),
        }
    }
}

impl fmt::Debug for Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { node, band } => f
                .debug_struct("Node")
                .field("node", &node.id)
                .field("band", &node.bands[*band].descriptor.name())
                .finish(),
            Self::External { descriptor, .. } => f
                .debug_struct("External")
                .field("band", &descriptor.id())
                .finish(),
        }
    }
}

/// The output of resolution: an immutable, session-scoped graph.
pub struct ResolvedGraph {
    nodes: Vec<Arc<ResolvedNode>>,
    producers: HashMap<BandId, Producer>,
    externals: ExternalSources,
    target: String,
}

impl ResolvedGraph {
    /// Nodes in topological order.
    pub fn nodes(&self) -> &[Arc<ResolvedNode>] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Arc<ResolvedNode>> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Node ids in topological order.
    pub fn order(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_node(&self) -> Option<&Arc<ResolvedNode>> {
        self.node(&self.target)
    }

    /// Bands of the target node, in product order.
    pub fn target_bands(&self) -> Vec<BandId> {
        self.target_node().map(|n| n.band_ids()).unwrap_or_default()
    }

    /// Which node (or external source) produces `band`.
    pub fn producer(&self, band: &BandId) -> Option<&Producer> {
        self.producers.get(band)
    }

    /// External sources bound by the resolved nodes.
    pub fn externals(&self) -> &ExternalSources {
        &self.externals
    }
}

impl fmt::Debug for ResolvedGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedGraph")
            .field("target", &self.target)
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

struct Resolver<'a> {
    specs: HashMap<&'a str, &'a NodeSpec>,
    registry: &'a OperatorRegistry,
    externals: &'a ExternalSources,
    state: HashMap<&'a str, Visit>,
    path: Vec<&'a str>,
    resolved: HashMap<&'a str, Arc<ResolvedNode>>,
    order: Vec<Arc<ResolvedNode>>,
    producers: HashMap<BandId, Producer>,
    bound_externals: ExternalSources,
}

/// Resolve `target` and everything it depends on.
pub fn resolve(
    graph: &GraphSpec,
    target: &str,
    registry: &OperatorRegistry,
    externals: &ExternalSources,
) -> ResolutionResult<ResolvedGraph> {
    graph.check_unique_ids()?;

    let specs: HashMap<&str, &NodeSpec> = graph.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    if let Some(node) = graph.nodes.iter().find(|n| externals.contains(&n.id)) {
        return Err(ResolutionError::DuplicateProduct(node.id.clone()));
    }
    if !specs.contains_key(target) {
        return Err(ResolutionError::UnknownTarget(target.to_string()));
    }

    let mut resolver = Resolver {
        specs,
        registry,
        externals,
        state: HashMap::new(),
        path: Vec::new(),
        resolved: HashMap::new(),
        order: Vec::new(),
        producers: HashMap::new(),
        bound_externals: ExternalSources::new(),
    };
    resolver.visit(target)?;

    let resolved = ResolvedGraph {
        nodes: resolver.order,
        producers: resolver.producers,
        externals: resolver.bound_externals,
        target: target.to_string(),
    };

    info!(
        target_node = %resolved.target,
        nodes = resolved.nodes.len(),
        bands = resolved.producers.len(),
        externals = resolved.externals.len(),
        order = ?resolved.order(),
        "Resolved operator graph"
    );

    Ok(resolved)
}

impl<'a> Resolver<'a> {
    fn visit(&mut self, id: &'a str) -> ResolutionResult<Arc<RasterDescriptor>> {
        match self.state.get(id) {
            Some(Visit::Done) => {
                if let Some(node) = self.resolved.get(id) {
                    return Ok(Arc::clone(&node.descriptor));
                }
            }
            Some(Visit::InProgress) => {
                let start = self.path.iter().position(|n| *n == id).unwrap_or(0);
                let mut cycle: Vec<String> = self.path[start..].iter().map(|n| n.to_string()).collect();
                cycle.push(id.to_string());
                return Err(ResolutionError::CyclicGraph { cycle });
            }
            None => {}
        }

        let spec = *self
            .specs
            .get(id)
            .ok_or_else(|| ResolutionError::UnknownTarget(id.to_string()))?;

        self.state.insert(id, Visit::InProgress);
        self.path.push(id);

        let node = self.resolve_node(spec)?;
        let descriptor = Arc::clone(&node.descriptor);

        self.path.pop();
        self.state.insert(id, Visit::Done);
        self.resolved.insert(id, Arc::clone(&node));
        self.order.push(node);

        Ok(descriptor)
    }

    fn resolve_node(&mut self, spec: &'a NodeSpec) -> ResolutionResult<Arc<ResolvedNode>> {
        let registry = self.registry;
        let externals = self.externals;
        let op = registry
            .get(&spec.operator)
            .ok_or_else(|| ResolutionError::UnknownOperator {
                node: spec.id.clone(),
                operator: spec.operator.clone(),
            })?;

        let parameters = op.parameters.validate(&op.name, &spec.parameters)?;

        if let Some(binding) = spec.sources.iter().find(|b| op.slot(&b.slot).is_none()) {
            return Err(ResolutionError::UnknownSourceSlot {
                node: spec.id.clone(),
                operator: op.name.clone(),
                slot: binding.slot.clone(),
            });
        }

        let mut sources = HashMap::new();
        let mut bindings = Vec::new();
        for slot in &op.sources {
            let Some(binding) = spec.binding(&slot.name) else {
                if slot.mandatory {
                    return Err(ResolutionError::missing_source(&spec.id, &op.name, &slot.name));
                }
                continue;
            };

            let descriptor = match &binding.source {
                SourceRef::Node(node_id) => {
                    if !self.specs.contains_key(node_id.as_str()) {
                        return Err(ResolutionError::missing_source(&spec.id, &op.name, &slot.name));
                    }
                    self.visit(node_id.as_str())?
                }
                SourceRef::External(product) => {
                    let source = externals
                        .get(product)
                        .ok_or_else(|| ResolutionError::missing_source(&spec.id, &op.name, &slot.name))?;
                    self.bind_external(source)
                }
            };

            sources.insert(slot.name.clone(), descriptor);
            bindings.push((slot.name.clone(), binding.source.clone()));
        }

        let map_init_error = |err: OperatorError| match err {
            OperatorError::InvalidParameter { parameter, reason } => {
                ResolutionError::invalid_parameter(&op.name, parameter, reason)
            }
            other => ResolutionError::Initialization {
                node: spec.id.clone(),
                operator: op.name.clone(),
                message: other.to_string(),
            },
        };

        let mut operator = op.create(&parameters).map_err(map_init_error)?;
        let output = operator
            .initialize(&InitContext::new(&spec.id, &sources, &parameters))
            .map_err(map_init_error)?;

        let initialization = |message: String| ResolutionError::Initialization {
            node: spec.id.clone(),
            operator: op.name.clone(),
            message,
        };

        for band in &output.bands {
            if let Some(missing) = band.sources.iter().find(|b| !self.producers.contains_key(b)) {
                return Err(initialization(format!(
                    "output band '{}' reads unknown source band {missing}",
                    band.descriptor.name()
                )));
            }
        }

        let descriptor = RasterDescriptor::builder(
            spec.id.clone(),
            output.product_type.clone(),
            output.width,
            output.height,
        )
        .bands(output.bands.iter().map(|b| b.descriptor.clone()))
        .build()
        .map_err(|err| initialization(err.to_string()))?;

        // Band descriptors now carry the owning product.
        let bands: Vec<OutputBand> = output
            .bands
            .into_iter()
            .zip(descriptor.bands())
            .map(|(band, descriptor)| OutputBand {
                descriptor: descriptor.clone(),
                sources: band.sources,
            })
            .collect();

        let node = Arc::new(ResolvedNode {
            id: spec.id.clone(),
            operator_type: op.name.clone(),
            operator: Arc::from(operator),
            parameters,
            bindings,
            descriptor: Arc::new(descriptor),
            bands,
            margin: output.margin,
            stack: output.stack,
        });

        for (index, band) in node.bands.iter().enumerate() {
            self.producers.insert(
                band.descriptor.id(),
                Producer::Node {
                    node: Arc::clone(&node),
                    band: index,
                },
            );
        }

        debug!(
            node = %node.id,
            operator = %node.operator_type,
            bands = node.bands.len(),
            margin_x = node.margin.x,
            margin_y = node.margin.y,
            stack = node.stack,
            "Initialized node"
        );

        Ok(node)
    }

    fn bind_external(&mut self, source: &Arc<dyn ExternalSource>) -> Arc<RasterDescriptor> {
        let descriptor = source.descriptor();
        if !self.bound_externals.contains(descriptor.name()) {
            for band in descriptor.bands() {
                self.producers.insert(
                    band.id(),
                    Producer::External {
                        source: Arc::clone(source),
                        descriptor: band.clone(),
                    },
                );
            }
            self.bound_externals.insert(Arc::clone(source));
        }
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{ComputeContext, OutputDescriptor, SourceTileProvider};
    use crate::params::{ParamDescriptor, ParamKind};
    use crate::registry::OperatorDescriptor;
    use crate::source::MemorySource;
    use crate::OperatorResult;
    use raster_common::{DataType, Rect, Tile};

    /// Copies every band of its source.
    struct Passthrough;

    impl Operator for Passthrough {
        fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
            let source = ctx.require_source("source")?;
            let mut output = OutputDescriptor::like(source, "copy");
            for band in source.bands() {
                output = output.band(
                    BandDescriptor::new(band.name(), band.data_type()),
                    vec![band.id()],
                );
            }
            Ok(output)
        }

        fn compute_tile(
            &self,
            target: &BandDescriptor,
            rect: Rect,
            _sources: &dyn SourceTileProvider,
            _ctx: &ComputeContext,
        ) -> OperatorResult<Tile> {
            Ok(Tile::filled(target.id(), rect, target.data_type(), 0.0, 0.0)?)
        }
    }

    /// Rejects even sizes during initialize.
    struct SizeChecked(i64);

    impl Operator for SizeChecked {
        fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
            if self.0 % 2 == 0 {
                return Err(OperatorError::invalid_parameter("size", "must be odd"));
            }
            Passthrough.initialize(ctx)
        }

        fn compute_tile(
            &self,
            target: &BandDescriptor,
            rect: Rect,
            sources: &dyn SourceTileProvider,
            ctx: &ComputeContext,
        ) -> OperatorResult<Tile> {
            Passthrough.compute_tile(target, rect, sources, ctx)
        }
    }

    fn registry() -> OperatorRegistry {
        let mut registry = OperatorRegistry::new();
        registry
            .register(
                OperatorDescriptor::new("copy", |_: &Parameters| Ok(Box::new(Passthrough) as Box<dyn Operator>))
                    .with_source("source"),
            )
            .unwrap();
        registry
            .register(
                OperatorDescriptor::new("sized", |p: &Parameters| {
                    Ok(Box::new(SizeChecked(p.get_int("size").unwrap_or(1))) as Box<dyn Operator>)
                })
                .with_parameter(ParamDescriptor::optional("size", ParamKind::Int, Some(1.into())))
                .with_source("source"),
            )
            .unwrap();
        registry
    }

    fn externals() -> ExternalSources {
        let descriptor = RasterDescriptor::builder("input", "GRD", 4, 4)
            .band(BandDescriptor::new("B1", DataType::UInt8))
            .build()
            .unwrap();
        ExternalSources::new().with(Arc::new(MemorySource::new(descriptor)))
    }

    fn chain() -> GraphSpec {
        GraphSpec::new()
            .node(NodeSpec::new("c", "copy").with_node_source("source", "b"))
            .node(NodeSpec::new("a", "copy").with_external_source("source", "input"))
            .node(NodeSpec::new("b", "copy").with_node_source("source", "a"))
    }

    #[test]
    fn test_chain_is_topologically_ordered() {
        let resolved = resolve(&chain(), "c", &registry(), &externals()).unwrap();
        assert_eq!(resolved.order(), vec!["a", "b", "c"]);
        assert_eq!(resolved.target_bands(), vec![BandId::new("c", "B1")]);

        let node = resolved.node("b").unwrap();
        assert_eq!(node.descriptor.name(), "b");
        assert_eq!(node.bands[0].sources, vec![BandId::new("a", "B1")]);
        assert!(matches!(
            resolved.producer(&BandId::new("input", "B1")),
            Some(Producer::External { .. })
        ));
    }

    #[test]
    fn test_unreachable_nodes_are_skipped() {
        let resolved = resolve(&chain(), "a", &registry(), &externals()).unwrap();
        assert_eq!(resolved.order(), vec!["a"]);
    }

    #[test]
    fn test_self_cycle() {
        let graph = GraphSpec::new().node(NodeSpec::new("a", "copy").with_node_source("source", "a"));
        let err = resolve(&graph, "a", &registry(), &externals()).unwrap_err();
        assert_eq!(
            err,
            ResolutionError::CyclicGraph {
                cycle: vec!["a".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_missing_mandatory_slot() {
        let graph = GraphSpec::new().node(NodeSpec::new("a", "copy"));
        assert_eq!(
            resolve(&graph, "a", &registry(), &externals()).unwrap_err(),
            ResolutionError::missing_source("a", "copy", "source")
        );
    }

    #[test]
    fn test_binding_to_unknown_products() {
        let graph = GraphSpec::new().node(NodeSpec::new("a", "copy").with_node_source("source", "ghost"));
        assert!(matches!(
            resolve(&graph, "a", &registry(), &externals()),
            Err(ResolutionError::MissingSource { .. })
        ));

        let graph = GraphSpec::new().node(NodeSpec::new("a", "copy").with_external_source("source", "ghost"));
        assert!(matches!(
            resolve(&graph, "a", &registry(), &externals()),
            Err(ResolutionError::MissingSource { .. })
        ));
    }

    #[test]
    fn test_undeclared_slot() {
        let graph = GraphSpec::new().node(
            NodeSpec::new("a", "copy")
                .with_external_source("source", "input")
                .with_external_source("mask", "input"),
        );
        assert!(matches!(
            resolve(&graph, "a", &registry(), &externals()),
            Err(ResolutionError::UnknownSourceSlot { ref slot, .. }) if slot == "mask"
        ));
    }

    #[test]
    fn test_unknown_operator_and_target() {
        let graph = GraphSpec::new().node(NodeSpec::new("a", "nope"));
        assert!(matches!(
            resolve(&graph, "a", &registry(), &externals()),
            Err(ResolutionError::UnknownOperator { .. })
        ));
        assert_eq!(
            resolve(&graph, "z", &registry(), &externals()).unwrap_err(),
            ResolutionError::UnknownTarget("z".into())
        );
    }

    #[test]
    fn test_node_named_like_external() {
        let graph = GraphSpec::new().node(NodeSpec::new("input", "copy").with_external_source("source", "input"));
        assert_eq!(
            resolve(&graph, "input", &registry(), &externals()).unwrap_err(),
            ResolutionError::DuplicateProduct("input".into())
        );
    }

    #[test]
    fn test_initialize_rejection_is_invalid_parameter() {
        let graph = GraphSpec::new().node(
            NodeSpec::new("a", "sized")
                .with_param("size", 4)
                .with_external_source("source", "input"),
        );
        assert_eq!(
            resolve(&graph, "a", &registry(), &externals()).unwrap_err(),
            ResolutionError::invalid_parameter("sized", "size", "must be odd")
        );
    }
}
