//! Dual-polarisation band arithmetic.
//!
//! Combines a co-polarised and a cross-polarised band of one product into any
//! of sum, difference, ratio, normalised difference and log ratio. All
//! outputs are computed in one stack invocation, since they read the same
//! two source tiles.

use raster_common::{BandDescriptor, BandId, DataType, Rect, Tile};
use std::fmt;
use tile_engine::{
    ComputeContext, InitContext, Operator, OperatorDescriptor, OperatorError, OperatorResult,
    OutputDescriptor, ParamDescriptor, ParamKind, ParamValue, Parameters, SourceTileProvider,
};
use tracing::debug;

pub const OPERATOR_NAME: &str = "dual-pol";

/// Denominators at or below this magnitude yield 0.
const ZERO_THRESHOLD: f64 = 1e-10;

/// Registry entry for the dual-polarisation operator.
pub fn descriptor() -> OperatorDescriptor {
    let all: Vec<&str> = PolOperation::ALL.iter().map(|op| op.as_str()).collect();

    OperatorDescriptor::new(OPERATOR_NAME, |params: &Parameters| {
        Ok(Box::new(DualPolOp::from_parameters(params)?) as Box<dyn Operator>)
    })
    .with_description("Sum, difference, ratio and log ratio of co- and cross-polarised bands")
    .with_parameter(ParamDescriptor::mandatory("copol", ParamKind::Text))
    .with_parameter(ParamDescriptor::mandatory("crosspol", ParamKind::Text))
    .with_parameter(
        ParamDescriptor::optional("operations", ParamKind::List, Some(ParamValue::from(all)))
            .with_description("Subset of sum, diff, ratio, ndiff, log_ratio"),
    )
    .with_source("source")
}

/// A per-pixel combination of the co-pol (`a`) and cross-pol (`b`) samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolOperation {
    Sum,
    Diff,
    Ratio,
    NDiff,
    LogRatio,
}

impl PolOperation {
    pub const ALL: [PolOperation; 5] = [
        PolOperation::Sum,
        PolOperation::Diff,
        PolOperation::Ratio,
        PolOperation::NDiff,
        PolOperation::LogRatio,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sum" => Some(PolOperation::Sum),
            "diff" => Some(PolOperation::Diff),
            "ratio" => Some(PolOperation::Ratio),
            "ndiff" => Some(PolOperation::NDiff),
            "log_ratio" | "logratio" => Some(PolOperation::LogRatio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolOperation::Sum => "sum",
            PolOperation::Diff => "diff",
            PolOperation::Ratio => "ratio",
            PolOperation::NDiff => "ndiff",
            PolOperation::LogRatio => "log_ratio",
        }
    }

    /// Name of the output band.
    pub fn band_name(&self) -> &'static str {
        match self {
            PolOperation::Sum => "Sum",
            PolOperation::Diff => "Diff",
            PolOperation::Ratio => "Ratio",
            PolOperation::NDiff => "NDiff",
            PolOperation::LogRatio => "LogRatio",
        }
    }

    pub fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            PolOperation::Sum => a + b,
            PolOperation::Diff => a - b,
            PolOperation::Ratio => {
                if b.abs() > ZERO_THRESHOLD {
                    a / b
                } else {
                    0.0
                }
            }
            PolOperation::NDiff => {
                let sum = a + b;
                if sum.abs() > ZERO_THRESHOLD {
                    (a - b) / sum
                } else {
                    0.0
                }
            }
            PolOperation::LogRatio => {
                // A zero numerator would give -inf dB.
                if b.abs() > ZERO_THRESHOLD && a.abs() > ZERO_THRESHOLD {
                    10.0 * (a / b).abs().log10()
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for PolOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `dual-pol` stack operator.
#[derive(Debug)]
pub struct DualPolOp {
    copol: String,
    crosspol: String,
    operations: Vec<PolOperation>,
    inputs: Option<(BandId, BandId)>,
}

impl DualPolOp {
    pub fn from_parameters(params: &Parameters) -> OperatorResult<Self> {
        let copol = params
            .get_text("copol")
            .ok_or_else(|| OperatorError::invalid_parameter("copol", "missing"))?;
        let crosspol = params
            .get_text("crosspol")
            .ok_or_else(|| OperatorError::invalid_parameter("crosspol", "missing"))?;

        let operations = match params.get_list("operations") {
            Some(names) => parse_operations(names)?,
            None => PolOperation::ALL.to_vec(),
        };

        Ok(Self {
            copol: copol.to_string(),
            crosspol: crosspol.to_string(),
            operations,
            inputs: None,
        })
    }

    pub fn operations(&self) -> &[PolOperation] {
        &self.operations
    }
}

fn parse_operations(names: &[String]) -> OperatorResult<Vec<PolOperation>> {
    if names.is_empty() {
        return Err(OperatorError::invalid_parameter("operations", "no operations selected"));
    }
    let mut operations = Vec::with_capacity(names.len());
    for name in names {
        let op = PolOperation::parse(name)
            .ok_or_else(|| OperatorError::invalid_parameter("operations", format!("unknown operation '{name}'")))?;
        if operations.contains(&op) {
            return Err(OperatorError::invalid_parameter(
                "operations",
                format!("operation '{op}' listed twice"),
            ));
        }
        operations.push(op);
    }
    Ok(operations)
}

impl Operator for DualPolOp {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let source = ctx.require_source("source")?;
        let band = |parameter: &str, name: &str| {
            source.band(name).ok_or_else(|| {
                OperatorError::invalid_parameter(
                    parameter,
                    format!("source '{}' has no band '{name}'", source.name()),
                )
            })
        };
        let copol = band("copol", &self.copol)?;
        let crosspol = band("crosspol", &self.crosspol)?;
        let inputs = vec![copol.id(), crosspol.id()];

        let mut output = OutputDescriptor::like(source, "dual-pol").stacked();
        for op in &self.operations {
            output = output.band(
                BandDescriptor::new(op.band_name(), DataType::Float32).with_no_data(copol.no_data_value()),
                inputs.clone(),
            );
        }

        debug!(
            node = ctx.node_id(),
            copol = %copol.id(),
            crosspol = %crosspol.id(),
            operations = ?self.operations,
            "Initialized dual-pol operator"
        );

        self.inputs = Some((copol.id(), crosspol.id()));
        Ok(output)
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        self.compute_tile_stack(std::slice::from_ref(target), rect, sources, ctx)?
            .pop()
            .ok_or_else(|| OperatorError::computation("no tile produced"))
    }

    fn compute_tile_stack(
        &self,
        targets: &[BandDescriptor],
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Vec<Tile>> {
        let (copol, crosspol) = self
            .inputs
            .as_ref()
            .ok_or_else(|| OperatorError::computation("operator used before initialization"))?;
        let a = sources.source_tile(copol, rect)?;
        let b = sources.source_tile(crosspol, rect)?;
        ctx.check_cancelled()?;

        targets
            .iter()
            .map(|target| {
                let op = self
                    .operations
                    .iter()
                    .find(|op| op.band_name() == target.name())
                    .ok_or_else(|| OperatorError::computation(format!("unexpected band '{}'", target.name())))?;

                let no_data = target.no_data_value();
                let samples: Vec<f64> = (0..rect.area())
                    .map(|offset| {
                        let (av, bv) = (a.sample_at(offset), b.sample_at(offset));
                        if a.is_no_data(av) || b.is_no_data(bv) {
                            no_data
                        } else {
                            op.apply(av, bv)
                        }
                    })
                    .collect();

                Ok(Tile::from_f64(target.id(), rect, target.data_type(), no_data, &samples)?)
            })
            .collect()
    }
}
