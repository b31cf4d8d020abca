//! Windowed median speckle filter.
//!
//! Each output pixel is the median of the valid source samples in a window
//! centred on it. Windows are clipped to the raster bounds near the edges, so
//! boundary pixels use fewer samples rather than padded ones. A complex pair
//! (a `real` band followed by an `imaginary` band) is filtered as a single
//! intensity band.

use rayon::prelude::*;
use raster_common::{BandDescriptor, BandId, DataType, Margin, RasterDescriptor, Rect, Tile, Unit};
use std::collections::HashMap;
use tile_engine::{
    ComputeContext, InitContext, Operator, OperatorDescriptor, OperatorError, OperatorResult,
    OutputDescriptor, ParamDescriptor, ParamKind, Parameters, SourceTileProvider,
};
use tracing::debug;

pub const OPERATOR_NAME: &str = "median";

const DEFAULT_FILTER_SIZE: i64 = 3;

/// Registry entry for the median filter.
pub fn descriptor() -> OperatorDescriptor {
    OperatorDescriptor::new(OPERATOR_NAME, |params: &Parameters| {
        Ok(Box::new(MedianFilterOp::from_parameters(params)?) as Box<dyn Operator>)
    })
    .with_description("Median speckle filter over a rectangular window")
    .with_parameter(
        ParamDescriptor::optional("sourceBands", ParamKind::List, None)
            .with_description("Bands to filter; all bands when omitted"),
    )
    .with_parameter(
        ParamDescriptor::optional("filterSizeX", ParamKind::Int, Some(DEFAULT_FILTER_SIZE.into()))
            .with_description("Window width in pixels (odd)"),
    )
    .with_parameter(
        ParamDescriptor::optional("filterSizeY", ParamKind::Int, Some(DEFAULT_FILTER_SIZE.into()))
            .with_description("Window height in pixels (odd)"),
    )
    .with_parameter(
        ParamDescriptor::optional("combineComplex", ParamKind::Bool, Some(true.into()))
            .with_description("Filter real/imaginary pairs as one intensity band"),
    )
    .with_source("source")
}

/// Source samples for one output band.
#[derive(Debug, Clone, Copy)]
pub enum FilterSources<'a> {
    Single(&'a Tile),
    /// In-phase and quadrature components, combined to `i² + q²`.
    Complex { i: &'a Tile, q: &'a Tile },
}

impl FilterSources<'_> {
    fn rect(&self) -> Rect {
        match self {
            FilterSources::Single(tile) => tile.rect(),
            FilterSources::Complex { i, .. } => i.rect(),
        }
    }

    /// Valid samples of the covered rectangle; no-data samples are `None`.
    fn plane(&self) -> OperatorResult<Vec<Option<f64>>> {
        let valid = |tile: &Tile, offset: usize| {
            let value = tile.sample_at(offset);
            (!tile.is_no_data(value)).then_some(value)
        };

        match self {
            FilterSources::Single(tile) => Ok((0..tile.len()).map(|o| valid(tile, o)).collect()),
            FilterSources::Complex { i, q } => {
                if i.rect() != q.rect() {
                    return Err(OperatorError::invalid_source(format!(
                        "complex components cover {} and {}",
                        i.rect(),
                        q.rect()
                    )));
                }
                Ok((0..i.len())
                    .map(|o| match (valid(i, o), valid(q, o)) {
                        (Some(i), Some(q)) => Some(i * i + q * q),
                        _ => None,
                    })
                    .collect())
            }
        }
    }
}

/// Median of the samples in a `window_width` x `window_height` window around
/// every pixel of `target`.
///
/// The window is clipped to the rectangle covered by `sources`, which the
/// scheduler gathers as the target expanded by the filter margin and clipped
/// to the raster. Returns samples in row-major order over `target`.
pub fn filter(
    sources: FilterSources<'_>,
    target: Rect,
    window_width: usize,
    window_height: usize,
    no_data: f64,
    ctx: &ComputeContext,
) -> OperatorResult<Vec<f64>> {
    if target.is_empty() {
        return Ok(Vec::new());
    }
    let coverage = sources.rect();
    if !coverage.contains_rect(&target) {
        return Err(OperatorError::invalid_source(format!(
            "source tile {coverage} does not cover {target}"
        )));
    }

    let plane = sources.plane()?;
    let half_x = window_width / 2;
    let half_y = window_height / 2;

    let mut output = vec![no_data; target.area()];
    output
        .par_chunks_mut(target.width)
        .enumerate()
        .try_for_each(|(row, out)| -> OperatorResult<()> {
            ctx.check_cancelled()?;

            let y = target.y + row;
            let y0 = y.saturating_sub(half_y).max(coverage.y);
            let y1 = (y + half_y + 1).min(coverage.y_max());
            let mut window: Vec<f64> = Vec::with_capacity(window_width * window_height);

            for (col, sample) in out.iter_mut().enumerate() {
                let x = target.x + col;
                let x0 = x.saturating_sub(half_x).max(coverage.x);
                let x1 = (x + half_x + 1).min(coverage.x_max());

                window.clear();
                for wy in y0..y1 {
                    let row_start = (wy - coverage.y) * coverage.width;
                    window.extend(
                        plane[row_start + (x0 - coverage.x)..row_start + (x1 - coverage.x)]
                            .iter()
                            .flatten(),
                    );
                }

                if !window.is_empty() {
                    let mid = window.len() / 2;
                    let (_, median, _) = window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
                    *sample = *median;
                }
            }
            Ok(())
        })?;

    Ok(output)
}

#[derive(Debug, Clone)]
enum BandPlan {
    Single(BandId),
    Complex { i: BandId, q: BandId },
}

impl BandPlan {
    fn sources(&self) -> Vec<BandId> {
        match self {
            BandPlan::Single(band) => vec![band.clone()],
            BandPlan::Complex { i, q } => vec![i.clone(), q.clone()],
        }
    }
}

/// The `median` operator.
#[derive(Debug)]
pub struct MedianFilterOp {
    source_bands: Option<Vec<String>>,
    filter_size_x: usize,
    filter_size_y: usize,
    combine_complex: bool,
    plans: HashMap<String, BandPlan>,
}

impl MedianFilterOp {
    pub fn from_parameters(params: &Parameters) -> OperatorResult<Self> {
        Ok(Self {
            source_bands: params.get_list("sourceBands").map(|bands| bands.to_vec()),
            filter_size_x: filter_size(params, "filterSizeX")?,
            filter_size_y: filter_size(params, "filterSizeY")?,
            combine_complex: params.get_bool("combineComplex").unwrap_or(true),
            plans: HashMap::new(),
        })
    }

    pub fn margin(&self) -> Margin {
        Margin::new(self.filter_size_x / 2, self.filter_size_y / 2)
    }

    fn selected_bands<'a>(&self, source: &'a RasterDescriptor) -> OperatorResult<Vec<&'a BandDescriptor>> {
        let Some(names) = &self.source_bands else {
            return Ok(source.bands().iter().collect());
        };
        if names.is_empty() {
            return Err(OperatorError::invalid_parameter("sourceBands", "no bands selected"));
        }
        names
            .iter()
            .map(|name| {
                source.band(name).ok_or_else(|| {
                    OperatorError::invalid_parameter(
                        "sourceBands",
                        format!("source '{}' has no band '{name}'", source.name()),
                    )
                })
            })
            .collect()
    }
}

fn filter_size(params: &Parameters, name: &str) -> OperatorResult<usize> {
    let size = params.get_int(name).unwrap_or(DEFAULT_FILTER_SIZE);
    if size < 1 || size % 2 == 0 {
        return Err(OperatorError::invalid_parameter(
            name,
            format!("filter size must be an odd number >= 1, got {size}"),
        ));
    }
    Ok(size as usize)
}

fn intensity_name(real_band: &str) -> String {
    format!("Intensity_{}", real_band.strip_prefix("i_").unwrap_or(real_band))
}

impl Operator for MedianFilterOp {
    fn initialize(&mut self, ctx: &InitContext<'_>) -> OperatorResult<OutputDescriptor> {
        let source = ctx.require_source("source")?;
        let bands = self.selected_bands(source)?;

        let mut output = OutputDescriptor::like(source, source.product_type()).with_margin(self.margin());
        let mut plans = HashMap::new();

        let mut index = 0;
        while index < bands.len() {
            let band = bands[index];
            let partner = bands.get(index + 1).copied();

            let (descriptor, plan) = match partner {
                Some(q)
                    if self.combine_complex
                        && band.unit() == Some(Unit::Real)
                        && q.unit() == Some(Unit::Imaginary) =>
                {
                    index += 2;
                    let descriptor = BandDescriptor::new(intensity_name(band.name()), DataType::Float32)
                        .with_no_data(band.no_data_value())
                        .with_unit(Unit::Intensity);
                    (descriptor, BandPlan::Complex { i: band.id(), q: q.id() })
                }
                _ => {
                    index += 1;
                    let mut descriptor =
                        BandDescriptor::new(band.name(), band.data_type()).with_no_data(band.no_data_value());
                    if let Some(unit) = band.unit() {
                        descriptor = descriptor.with_unit(unit);
                    }
                    (descriptor, BandPlan::Single(band.id()))
                }
            };

            output = output.band(descriptor.clone(), plan.sources());
            plans.insert(descriptor.name().to_string(), plan);
        }

        debug!(
            node = ctx.node_id(),
            source = source.name(),
            filter_size_x = self.filter_size_x,
            filter_size_y = self.filter_size_y,
            bands = plans.len(),
            "Initialized median filter"
        );

        self.plans = plans;
        Ok(output)
    }

    fn compute_tile(
        &self,
        target: &BandDescriptor,
        rect: Rect,
        sources: &dyn SourceTileProvider,
        ctx: &ComputeContext,
    ) -> OperatorResult<Tile> {
        let plan = self
            .plans
            .get(target.name())
            .ok_or_else(|| OperatorError::computation(format!("no plan for band '{}'", target.name())))?;

        let samples = match plan {
            BandPlan::Single(band) => filter(
                FilterSources::Single(sources.gathered(band)?),
                rect,
                self.filter_size_x,
                self.filter_size_y,
                target.no_data_value(),
                ctx,
            )?,
            BandPlan::Complex { i, q } => filter(
                FilterSources::Complex {
                    i: sources.gathered(i)?,
                    q: sources.gathered(q)?,
                },
                rect,
                self.filter_size_x,
                self.filter_size_y,
                target.no_data_value(),
                ctx,
            )?,
        };

        Ok(Tile::from_f64(
            target.id(),
            rect,
            target.data_type(),
            target.no_data_value(),
            &samples,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ComputeContext {
        ComputeContext::new("median", CancellationToken::new())
    }

    fn tile(rect: Rect, samples: &[f64]) -> Tile {
        Tile::from_f64(BandId::new("src", "B1"), rect, DataType::Float32, 0.0, samples).unwrap()
    }

    #[test]
    fn test_median_at_clipped_edge() {
        // 3x2 raster numbered 1..=6, 3x3 window at (1, 0) covers all six.
        let source = tile(Rect::of_size(3, 2), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = filter(FilterSources::Single(&source), Rect::new(1, 0, 1, 1), 3, 3, 0.0, &ctx()).unwrap();
        // Sorted [1..6], element count / 2.
        assert_eq!(out, vec![4.0]);
    }

    #[test]
    fn test_median_full_raster() {
        let source = tile(Rect::of_size(3, 2), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = filter(FilterSources::Single(&source), Rect::of_size(3, 2), 3, 3, 0.0, &ctx()).unwrap();
        // Edge columns see a 2x2 window, the centre column a 3x2 window.
        assert_eq!(out, vec![4.0, 4.0, 5.0, 4.0, 4.0, 5.0]);
    }

    #[test]
    fn test_no_data_samples_are_excluded() {
        let source = tile(Rect::of_size(3, 1), &[0.0, 9.0, 0.0]);
        let out = filter(FilterSources::Single(&source), Rect::of_size(3, 1), 3, 1, 0.0, &ctx()).unwrap();
        assert_eq!(out, vec![9.0, 9.0, 9.0]);
    }

    #[test]
    fn test_all_no_data_window_yields_no_data() {
        let source = tile(Rect::of_size(2, 2), &[0.0; 4]);
        let out = filter(FilterSources::Single(&source), Rect::of_size(2, 2), 3, 3, -1.0, &ctx()).unwrap();
        assert_eq!(out, vec![-1.0; 4]);
    }

    #[test]
    fn test_window_of_one_is_identity() {
        let samples = [3.0, 1.0, 2.0, 5.0];
        let source = tile(Rect::of_size(2, 2), &samples);
        let out = filter(FilterSources::Single(&source), Rect::of_size(2, 2), 1, 1, 0.0, &ctx()).unwrap();
        assert_eq!(out, samples.to_vec());
    }

    #[test]
    fn test_complex_pair_filters_intensity() {
        let rect = Rect::of_size(3, 1);
        let i = Tile::from_f64(BandId::new("src", "i_VV"), rect, DataType::Float32, 0.0, &[3.0, 1.0, 2.0]).unwrap();
        let q = Tile::from_f64(BandId::new("src", "q_VV"), rect, DataType::Float32, 0.0, &[4.0, 1.0, 0.0]).unwrap();

        let out = filter(FilterSources::Complex { i: &i, q: &q }, rect, 3, 1, 0.0, &ctx()).unwrap();

        // Intensities [25, 2, excluded]; the last pixel's q is no-data.
        assert_eq!(out, vec![25.0, 25.0, 2.0]);
    }

    #[test]
    fn test_target_inside_gathered_tile() {
        let source = tile(Rect::new(2, 2, 3, 3), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
        let out = filter(FilterSources::Single(&source), Rect::new(3, 3, 1, 1), 3, 3, 0.0, &ctx()).unwrap();
        assert_eq!(out, vec![5.0]);

        let err = filter(FilterSources::Single(&source), Rect::new(0, 0, 1, 1), 3, 3, 0.0, &ctx());
        assert!(matches!(err, Err(OperatorError::InvalidSource(_))));
    }

    #[test]
    fn test_cancelled_filter() {
        let token = CancellationToken::new();
        token.cancel();
        let source = tile(Rect::of_size(2, 2), &[1.0; 4]);
        let ctx = ComputeContext::new("median", token);

        let result = filter(FilterSources::Single(&source), Rect::of_size(2, 2), 3, 3, 0.0, &ctx);
        assert_eq!(result, Err(OperatorError::Cancelled));
    }

    #[test]
    fn test_filter_size_validation() {
        assert!(MedianFilterOp::from_parameters(&Parameters::new().with("filterSizeX", 5)).is_ok());
        for bad in [0, 2, -3] {
            let err = MedianFilterOp::from_parameters(&Parameters::new().with("filterSizeY", bad)).unwrap_err();
            assert!(matches!(err, OperatorError::InvalidParameter { ref parameter, .. } if parameter == "filterSizeY"));
        }
    }

    #[test]
    fn test_margin_is_half_window() {
        let op = MedianFilterOp::from_parameters(
            &Parameters::new().with("filterSizeX", 7).with("filterSizeY", 3),
        )
        .unwrap();
        assert_eq!(op.margin(), Margin::new(3, 1));
    }

    #[test]
    fn test_intensity_name() {
        assert_eq!(intensity_name("i_VV"), "Intensity_VV");
        assert_eq!(intensity_name("real"), "Intensity_real");
    }
}
