//! External raster sources: products that are read, not computed.

use async_trait::async_trait;
use raster_common::{RasterDescriptor, RasterError, Rect, Tile};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by external sources.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("band '{0}' is not available")]
    BandNotFound(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// A product whose bands are read from outside the graph.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    fn descriptor(&self) -> Arc<RasterDescriptor>;

    /// Read `rect` of the named band. The rectangle lies inside the raster.
    async fn read_tile(&self, band: &str, rect: Rect) -> Result<Tile, SourceError>;
}

/// An external source holding whole bands in memory.
pub struct MemorySource {
    descriptor: Arc<RasterDescriptor>,
    bands: HashMap<String, Tile>,
    reads: AtomicU64,
}

impl MemorySource {
    pub fn new(descriptor: RasterDescriptor) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            bands: HashMap::new(),
            reads: AtomicU64::new(0),
        }
    }

    /// Attach full-raster samples for a band declared in the descriptor.
    pub fn with_band(mut self, name: &str, samples: &[f64]) -> Result<Self, SourceError> {
        let band = self.descriptor.require_band(name)?;
        let tile = Tile::from_f64(
            band.id(),
            self.descriptor.bounds(),
            band.data_type(),
            band.no_data_value(),
            samples,
        )?;
        self.bands.insert(name.to_string(), tile);
        Ok(self)
    }

    /// Number of `read_tile` calls served.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExternalSource for MemorySource {
    fn descriptor(&self) -> Arc<RasterDescriptor> {
        Arc::clone(&self.descriptor)
    }

    async fn read_tile(&self, band: &str, rect: Rect) -> Result<Tile, SourceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tile = self
            .bands
            .get(band)
            .ok_or_else(|| SourceError::BandNotFound(band.to_string()))?;
        Ok(tile.crop(rect)?)
    }
}

/// External sources available to a graph, keyed by product name.
#[derive(Clone, Default)]
pub struct ExternalSources {
    sources: HashMap<String, Arc<dyn ExternalSource>>,
}

impl ExternalSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source under its descriptor's product name.
    pub fn insert(&mut self, source: Arc<dyn ExternalSource>) {
        let name = source.descriptor().name().to_string();
        self.sources.insert(name, source);
    }

    pub fn with(mut self, source: Arc<dyn ExternalSource>) -> Self {
        self.insert(source);
        self
    }

    pub fn get(&self, product: &str) -> Option<&Arc<dyn ExternalSource>> {
        self.sources.get(product)
    }

    pub fn contains(&self, product: &str) -> bool {
        self.sources.contains_key(product)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raster_common::{BandDescriptor, DataType};

    fn source() -> MemorySource {
        let descriptor = RasterDescriptor::builder("P", "GRD", 3, 2)
            .band(BandDescriptor::new("Amplitude_VV", DataType::UInt16))
            .build()
            .unwrap();
        MemorySource::new(descriptor)
            .with_band("Amplitude_VV", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap()
    }

    #[test]
    fn test_read_tile_crops_band() {
        let source = source();
        let tile = tokio_test::block_on(source.read_tile("Amplitude_VV", Rect::new(1, 0, 2, 2))).unwrap();
        assert_eq!(tile.to_f64_vec(), vec![2.0, 3.0, 5.0, 6.0]);
        assert_eq!(tile.data_type(), DataType::UInt16);
        assert_eq!(tile.band().product, "P");
        assert_eq!(source.reads(), 1);
    }

    #[test]
    fn test_unknown_band() {
        let source = source();
        let err = tokio_test::block_on(source.read_tile("Amplitude_VH", Rect::new(0, 0, 1, 1))).unwrap_err();
        assert_eq!(err, SourceError::BandNotFound("Amplitude_VH".into()));
    }

    #[test]
    fn test_with_band_checks_length() {
        let descriptor = RasterDescriptor::builder("P", "GRD", 2, 2)
            .band(BandDescriptor::new("B", DataType::Float32))
            .build()
            .unwrap();
        assert!(MemorySource::new(descriptor).with_band("B", &[1.0]).is_err());
    }

    #[test]
    fn test_sources_keyed_by_product() {
        let sources = ExternalSources::new().with(Arc::new(source()));
        assert!(sources.contains("P"));
        assert_eq!(sources.len(), 1);
    }
}
