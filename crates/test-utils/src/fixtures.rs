//! Common test fixtures: in-memory sources, test operators and graphs.
//!
//! The `Op1` → `Op2` → `Op3` chain mirrors a small processing graph on a
//! 3x2 raster. Every test operator reports its kernel calls through the
//! recorder injected in the [`ComputeContext`], so call order can be asserted
//! without global state.

use raster_common::{BandDescriptor, BandId, DataType, Margin, RasterDescriptor, Rect, Tile, Unit};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tile_engine::{
    ComputeContext, GraphSpec, InitContext, MemorySource, NodeSpec, Operator, OperatorDescriptor,
    OperatorError, OperatorRegistry, OperatorResult, OutputDescriptor, ParamDescriptor, ParamKind,
    Parameters, SourceTileProvider,
};

use crate::generators::{create_complex_grid, create_speckle_grid};

/// Width of the rasters produced by the `Op*` test operators.
pub const RASTER_WIDTH: usize = 3;
/// Height of the rasters produced by the `Op*` test operators.
pub const RASTER_HEIGHT: usize = 2;

// ============================================================================
// Sources
// ============================================================================

/// In-memory source with one band per `(descriptor, samples)` pair.
pub fn memory_source(
    product: &str,
    width: usize,
    height: usize,
    bands: Vec<(BandDescriptor, Vec<f64>)>,
) -> Arc<MemorySource> {
    let descriptor = RasterDescriptor::builder(product, "TEST", width, height)
        .bands(bands.iter().map(|(band, _)| band.clone()))
        .build()
        .expect("valid test descriptor");

    let mut source = MemorySource::new(descriptor);
    for (band, samples) in &bands {
        source = source
            .with_band(band.name(), samples)
            .expect("samples match raster size");
    }
    Arc::new(source)
}

/// Single Float32 band named `Amplitude_VV` with multiplicative speckle.
pub fn grd_source(product: &str, width: usize, height: usize) -> Arc<MemorySource> {
    memory_source(
        product,
        width,
        height,
        vec![(
            BandDescriptor::new("Amplitude_VV", DataType::Float32).with_unit(Unit::Amplitude),
            create_speckle_grid(width, height, 1),
        )],
    )
}

/// Complex SLC product: `i_VV` (real) followed by `q_VV` (imaginary).
pub fn sar_slc_source(product: &str, width: usize, height: usize) -> Arc<MemorySource> {
    let (i, q) = create_complex_grid(width, height);
    memory_source(
        product,
        width,
        height,
        vec![
            (
                BandDescriptor::new("i_VV", DataType::Float32).with_unit(Unit::Real),
                i,
            ),
            (
                BandDescriptor::new("q_VV", DataType::Float32).with_unit(Unit::Imaginary),
                q,
            ),
        ],
    )
}

/// Dual-polarisation product with `Intensity_VV` and `Intensity_VH` bands.
pub fn dual_pol_source(product: &str, width: usize, height: usize) -> Arc<MemorySource> {
    memory_source(
        product,
        width,
        height,
        vec![
            (
                BandDescriptor::new("Intensity_VV", DataType::Float32).with_unit(Unit::Intensity),
                create_speckle_grid(width, height, 11),
            ),
            (
                BandDescriptor::new("Intensity_VH", DataType::Float32).with_unit(Unit::Intensity),
                create_speckle_grid(width, height, 12)
                    .into_iter()
                    .map(|v| v / 4.0)
                    .collect(),
            ),
        ],
    )
}

// ============================================================================
// Operator helpers
// ============================================================================

/// Output that copies every band of `source` (same type and no-data value).
fn copy_of(source: &RasterDescriptor, product_type: &str) -> OutputDescriptor {
    let mut output = OutputDescriptor::like(source, product_type);
    for band in source.bands() {
        let mut copy = BandDescriptor::new(band.name(), band.data_type()).with_no_data(band.no_data_value());
        if let Some(unit) = band.unit() {
            copy = copy.with_unit(unit);
        }
        output = output.band(copy, vec![band.id()]);
    }
    output
}

/// Copy `rect` of the same-named band of `source_product` into `target`.
fn copy_tile(
    source_product: &str,
    target: &BandDescriptor,
    rect: Rect,
    sources: &dyn SourceTileProvider,
) -> OperatorResult<Tile> {
    let source = sources.source_tile(&BandId::new(source_product, target.name()), rect)?;
    Ok(Tile::new(target.id(), rect, target.no_data_value(), source.data().clone())?)
}

/// Evaluate `f(x, y)` over `rect` into a tile of `target`.
fn tile_from_fn(target: &BandDescriptor, rect: Rect, f: impl Fn(usize, usize) -> f64) -> OperatorResult<Tile> {
    let mut samples = Vec::with_capacity(rect.area());
    for y in rect.y..rect.y_max() {
        for x in rect.x..rect.x_max() {
            samples.push(f(x, y));
        }
    }
    Ok(Tile::from_f64(
        target.id(),
        rect,
        target.data_type(),
        target.no_data_value(),
        &samples,
    )?)
}

fn first_of(tiles: Vec<Tile>) -> OperatorResult<Tile> {
    tiles
        .into_iter()
        .next()
        .ok_or_else(|| OperatorError::computation("stack produced no tiles"))
}

// ============================================================================
// Op1 / Op2 / Op3
// ============================================================================

/// Source-less operator producing band `Op1A` with values `x + 10 * y`.
pub struct Op1;

impl Operator for Op1 {
    fn initialize(&mut self, _ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        Ok(OutputDescriptor::new("Op1Type", RASTER_WIDTH, RASTER_HEIGHT)
            .band(BandDescriptor::new("Op1A", DataType::Int8), vec![]))
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        _sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        ctx.record("Op1;");
        tile_from_fn(target, rect, |x, y| (x + 10 * y) as f64)
    }
}

/// Stack operator reading `Op1A` and producing `Op2A = Op1A + 1` and
/// `Op2B = Op1A > threshold`.
pub struct Op2 {
    threshold: f64,
    op1a: Option<BandId>,
}

impl Op2 {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, op1a: None }
    }
}

impl Operator for Op2 {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let input = ctx.require_source("input")?;
        let op1a = input
            .band("Op1A")
            .ok_or_else(|| OperatorError::invalid_source("input has no band Op1A"))?
            .id();
        self.op1a = Some(op1a.clone());

        Ok(OutputDescriptor::like(input, "Op2Type")
            .band(BandDescriptor::new("Op2A", DataType::Int8), vec![op1a.clone()])
            .band(BandDescriptor::new("Op2B", DataType::Int8), vec![op1a])
            .stacked())
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        first_of(self.compute_tile_stack(slice::from_ref(target), rect, sources, ctx)?)
    }

    fn compute_tile_stack(
        &self,
        targets: &[BandDescriptor],
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Vec<Tile>> {
        let op1a = self
            .op1a
            .as_ref()
            .ok_or_else(|| OperatorError::computation("not initialized"))?;
        let input = sources.source_tile(op1a, rect)?;
        ctx.record("Op2;");

        targets
            .iter()
            .map(|target| {
                let value = |x, y| input.get(x, y).unwrap_or(0.0);
                match target.name() {
                    "Op2A" => tile_from_fn(target, rect, |x, y| value(x, y) + 1.0),
                    _ => tile_from_fn(target, rect, |x, y| {
                        if value(x, y) > self.threshold {
                            1.0
                        } else {
                            0.0
                        }
                    }),
                }
            })
            .collect()
    }
}

/// Stack operator with two source slots producing four bands.
pub struct Op3 {
    factor: f64,
    ignore_sign: bool,
    inputs: Vec<BandId>,
}

impl Op3 {
    pub fn new(factor: f64, ignore_sign: bool) -> Self {
        Self {
            factor,
            ignore_sign,
            inputs: Vec::new(),
        }
    }
}

impl Operator for Op3 {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let input1 = ctx.require_source("input1")?;
        let input2 = ctx.require_source("input2")?;
        let op1a = input1
            .band("Op1A")
            .ok_or_else(|| OperatorError::invalid_source("input1 has no band Op1A"))?
            .id();
        let op2a = input2
            .band("Op2A")
            .ok_or_else(|| OperatorError::invalid_source("input2 has no band Op2A"))?
            .id();
        let op2b = input2
            .band("Op2B")
            .ok_or_else(|| OperatorError::invalid_source("input2 has no band Op2B"))?
            .id();
        self.inputs = vec![op1a, op2a, op2b];

        let mut output = OutputDescriptor::like(input1, "Op3Type").stacked();
        for name in ["Op3A", "Op3B", "Op3C", "Op3D"] {
            output = output.band(BandDescriptor::new(name, DataType::Int8), self.inputs.clone());
        }
        Ok(output)
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        first_of(self.compute_tile_stack(slice::from_ref(target), rect, sources, ctx)?)
    }

    fn compute_tile_stack(
        &self,
        targets: &[BandDescriptor],
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Vec<Tile>> {
        let inputs = self
            .inputs
            .iter()
            .map(|band| sources.source_tile(band, rect))
            .collect::<OperatorResult<Vec<Tile>>>()?;
        ctx.record("Op3;");

        let value = |i: usize, x, y| inputs[i].get(x, y).unwrap_or(0.0);
        targets
            .iter()
            .map(|target| match target.name() {
                "Op3A" => tile_from_fn(target, rect, |x, y| value(0, x, y) + value(1, x, y)),
                "Op3B" => tile_from_fn(target, rect, |x, y| value(1, x, y) - value(2, x, y) * self.factor),
                "Op3C" => tile_from_fn(target, rect, |x, y| {
                    let v = value(2, x, y) - value(0, x, y);
                    if self.ignore_sign {
                        v.abs()
                    } else {
                        v
                    }
                }),
                _ => tile_from_fn(target, rect, |x, y| value(0, x, y) * self.factor),
            })
            .collect()
    }
}

// ============================================================================
// Instrumented operators
// ============================================================================

/// Copies its source after sleeping `delay`, checking cancellation while it
/// waits.
pub struct SlowCopy {
    delay: Duration,
    source: String,
}

impl Operator for SlowCopy {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let source = ctx.require_source("source")?;
        self.source = source.name().to_string();
        Ok(copy_of(source, "SlowCopy"))
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        ctx.record("SlowCopy;");
        let started = Instant::now();
        while started.elapsed() < self.delay {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.check_cancelled()?;
        copy_tile(&self.source, target, rect, sources)
    }
}

/// Source rectangles seen by [`Probe`] kernels.
#[derive(Debug, Default)]
pub struct RectProbe {
    rects: Mutex<Vec<(BandId, Rect)>>,
}

impl RectProbe {
    pub fn rects(&self) -> Vec<(BandId, Rect)> {
        self.rects.lock().expect("probe lock").clone()
    }
}

/// Neighbourhood operator that records the rectangle of every gathered
/// source tile.
pub struct Probe {
    margin: Margin,
    source: String,
    probe: Arc<RectProbe>,
}

impl Operator for Probe {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let source = ctx.require_source("source")?;
        self.source = source.name().to_string();
        Ok(copy_of(source, "Probe").with_margin(self.margin))
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        ctx.record("Probe;");
        let band = BandId::new(self.source.clone(), target.name());
        let gathered = sources.gathered(&band)?;
        self.probe
            .rects
            .lock()
            .expect("probe lock")
            .push((band, gathered.rect()));
        copy_tile(&self.source, target, rect, sources)
    }
}

/// Copies its source, failing while the shared failure budget is positive.
pub struct Flaky {
    failures: Arc<AtomicUsize>,
    source: String,
}

impl Operator for Flaky {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let source = ctx.require_source("source")?;
        self.source = source.name().to_string();
        Ok(copy_of(source, "Flaky"))
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        ctx.record("Flaky;");
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(OperatorError::computation("injected failure"));
        }
        copy_tile(&self.source, target, rect, sources)
    }
}

// ============================================================================
// Registry and graphs
// ============================================================================

/// Registry with `Op1`, `Op2`, `Op3` and `SlowCopy`.
pub fn test_registry() -> OperatorRegistry {
    let mut registry = OperatorRegistry::new();

    registry
        .register(OperatorDescriptor::new("Op1", |_: &Parameters| {
            Ok(Box::new(Op1) as Box<dyn Operator>)
        }))
        .expect("register Op1");

    registry
        .register(
            OperatorDescriptor::new("Op2", |params: &Parameters| {
                let threshold = params.get_float("threshold").unwrap_or_default();
                Ok(Box::new(Op2::new(threshold)) as Box<dyn Operator>)
            })
            .with_parameter(ParamDescriptor::mandatory("threshold", ParamKind::Float))
            .with_source("input"),
        )
        .expect("register Op2");

    registry
        .register(
            OperatorDescriptor::new("Op3", |params: &Parameters| {
                let factor = params.get_float("factor").unwrap_or(1.0);
                let ignore_sign = params.get_bool("ignoreSign").unwrap_or(false);
                Ok(Box::new(Op3::new(factor, ignore_sign)) as Box<dyn Operator>)
            })
            .with_parameter(ParamDescriptor::optional("ignoreSign", ParamKind::Bool, Some(false.into())))
            .with_parameter(ParamDescriptor::optional("expression", ParamKind::Text, Some("".into())))
            .with_parameter(ParamDescriptor::optional("factor", ParamKind::Float, Some(1.0.into())))
            .with_source("input1")
            .with_source("input2"),
        )
        .expect("register Op3");

    registry
        .register(
            OperatorDescriptor::new("SlowCopy", |params: &Parameters| {
                let delay = params.get_int("delayMs").unwrap_or(0).max(0) as u64;
                Ok(Box::new(SlowCopy {
                    delay: Duration::from_millis(delay),
                    source: String::new(),
                }) as Box<dyn Operator>)
            })
            .with_parameter(ParamDescriptor::optional("delayMs", ParamKind::Int, Some(50.into())))
            .with_source("source"),
        )
        .expect("register SlowCopy");

    registry
}

/// Descriptor for the `Probe` operator recording into `probe`.
pub fn probe_descriptor(probe: Arc<RectProbe>) -> OperatorDescriptor {
    OperatorDescriptor::new("Probe", move |params: &Parameters| {
        let margin = Margin::new(
            params.get_int("marginX").unwrap_or(1).max(0) as usize,
            params.get_int("marginY").unwrap_or(1).max(0) as usize,
        );
        Ok(Box::new(Probe {
            margin,
            source: String::new(),
            probe: Arc::clone(&probe),
        }) as Box<dyn Operator>)
    })
    .with_parameter(ParamDescriptor::optional("marginX", ParamKind::Int, Some(1.into())))
    .with_parameter(ParamDescriptor::optional("marginY", ParamKind::Int, Some(1.into())))
    .with_source("source")
}

/// Descriptor for the `Flaky` operator failing `failures` times in total.
pub fn flaky_descriptor(failures: Arc<AtomicUsize>) -> OperatorDescriptor {
    OperatorDescriptor::new("Flaky", move |_: &Parameters| {
        Ok(Box::new(Flaky {
            failures: Arc::clone(&failures),
            source: String::new(),
        }) as Box<dyn Operator>)
    })
    .with_source("source")
}

/// `n1: Op1` → `n2: Op2` → `n3: Op3` (which also reads `n1`).
pub fn test_ops_graph() -> GraphSpec {
    GraphSpec::new()
        .node(NodeSpec::new("n3", "Op3")
            .with_param("factor", 2.0)
            .with_node_source("input1", "n1")
            .with_node_source("input2", "n2"))
        .node(NodeSpec::new("n2", "Op2")
            .with_param("threshold", 2)
            .with_node_source("input", "n1"))
        .node(NodeSpec::new("n1", "Op1"))
}
