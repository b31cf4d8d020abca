//! Synthetic external sources declared in a run file.
//!
//! Each source is materialised as an in-memory product so graphs can be
//! exercised without any file-format reader.

use anyhow::{Context, Result};
use raster_common::{BandDescriptor, DataType, RasterDescriptor, Unit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tile_engine::{ExternalSources, MemorySource};

/// How the samples of a synthetic band are generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    /// `0, 1, 2, ...` in row-major order.
    Ramp,
    Constant { value: f64 },
    /// Fully developed speckle: exponentially distributed intensity around
    /// `mean`.
    Speckle {
        seed: u32,
        #[serde(default = "default_mean")]
        mean: f64,
    },
}

fn default_mean() -> f64 {
    100.0
}

fn default_data_type() -> DataType {
    DataType::Float32
}

fn default_product_type() -> String {
    "SYNTHETIC".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticBand {
    pub name: String,
    #[serde(default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default)]
    pub unit: Option<Unit>,
    #[serde(default)]
    pub no_data: f64,
    pub pattern: Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticSource {
    pub name: String,
    #[serde(default = "default_product_type")]
    pub product_type: String,
    pub width: usize,
    pub height: usize,
    pub bands: Vec<SyntheticBand>,
}

impl SyntheticSource {
    /// Generate every band into an in-memory source.
    pub fn materialize(&self) -> Result<MemorySource> {
        let descriptor = RasterDescriptor::builder(
            self.name.clone(),
            self.product_type.clone(),
            self.width,
            self.height,
        )
        .bands(self.bands.iter().map(|band| {
            let descriptor = BandDescriptor::new(band.name.clone(), band.data_type).with_no_data(band.no_data);
            match band.unit {
                Some(unit) => descriptor.with_unit(unit),
                None => descriptor,
            }
        }))
        .build()
        .with_context(|| format!("invalid synthetic source '{}'", self.name))?;

        let mut source = MemorySource::new(descriptor);
        for band in &self.bands {
            let samples = generate(&band.pattern, self.width, self.height);
            source = source
                .with_band(&band.name, &samples)
                .with_context(|| format!("failed to fill band '{}' of '{}'", band.name, self.name))?;
        }
        Ok(source)
    }
}

/// Materialise all sources of a run file.
pub fn build_sources(sources: &[SyntheticSource]) -> Result<ExternalSources> {
    let mut externals = ExternalSources::new();
    for source in sources {
        if externals.contains(&source.name) {
            anyhow::bail!("synthetic source '{}' is declared twice", source.name);
        }
        externals.insert(Arc::new(source.materialize()?));
    }
    Ok(externals)
}

pub fn generate(pattern: &Pattern, width: usize, height: usize) -> Vec<f64> {
    let len = width * height;
    match pattern {
        Pattern::Ramp => (0..len).map(|i| i as f64).collect(),
        Pattern::Constant { value } => vec![*value; len],
        Pattern::Speckle { seed, mean } => (0..len)
            .map(|i| {
                // Uniform in (0, 1], then inverse CDF of the exponential.
                let u = (mix(*seed as u64, i as u64) >> 11) as f64 / (1u64 << 53) as f64;
                -mean * (1.0 - u).ln()
            })
            .collect(),
    }
}

/// splitmix64 finaliser over the seed and sample index.
fn mix(seed: u64, index: u64) -> u64 {
    let mut z = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(index)
        .wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
