//! Product and band metadata.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{RasterError, RasterResult};
use crate::rect::Rect;

/// Numeric element type of a band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one sample in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, Self::Float32 | Self::Float64)
    }

    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "int8" => Some(Self::Int8),
            "uint8" => Some(Self::UInt8),
            "int16" => Some(Self::Int16),
            "uint16" => Some(Self::UInt16),
            "int32" => Some(Self::Int32),
            "uint32" => Some(Self::UInt32),
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical unit of a band, used by algorithms that treat some bands specially
/// (e.g. real/imaginary pairs of complex SAR data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Amplitude,
    Intensity,
    Real,
    Imaginary,
    Phase,
    Db,
}

/// Identity of a band across the whole processing session: product name plus
/// band name. This is the back-reference from a band to its owning product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BandId {
    pub product: String,
    pub band: String,
}

impl BandId {
    pub fn new(product: impl Into<String>, band: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            band: band.into(),
        }
    }
}

impl fmt::Display for BandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.product, self.band)
    }
}

/// Metadata for one band of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandDescriptor {
    name: String,
    data_type: DataType,
    no_data_value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unit: Option<Unit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wavelength_nm: Option<f32>,
    /// Owning product name, assigned when the band is added to a descriptor.
    #[serde(default)]
    product: String,
}

impl BandDescriptor {
    /// Create a band with a no-data value of 0.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            no_data_value: 0.0,
            unit: None,
            wavelength_nm: None,
            product: String::new(),
        }
    }

    pub fn with_no_data(mut self, no_data_value: f64) -> Self {
        self.no_data_value = no_data_value;
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    pub fn with_wavelength(mut self, wavelength_nm: f32) -> Self {
        self.wavelength_nm = Some(wavelength_nm);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn no_data_value(&self) -> f64 {
        self.no_data_value
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn wavelength_nm(&self) -> Option<f32> {
        self.wavelength_nm
    }

    /// Name of the owning product.
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Session-wide identity of this band.
    pub fn id(&self) -> BandId {
        BandId::new(self.product.clone(), self.name.clone())
    }

    /// Check whether a sample is this band's no-data sentinel. A NaN
    /// sentinel matches every NaN sample.
    pub fn is_no_data(&self, value: f64) -> bool {
        is_no_data(value, self.no_data_value)
    }
}

pub(crate) fn is_no_data(value: f64, no_data_value: f64) -> bool {
    value == no_data_value || (no_data_value.is_nan() && value.is_nan())
}

/// Immutable metadata for a product: dimensions and its ordered bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterDescriptor {
    name: String,
    product_type: String,
    width: usize,
    height: usize,
    bands: Vec<BandDescriptor>,
}

impl RasterDescriptor {
    /// Start building a descriptor. Dimensions and band names are validated by
    /// [`RasterDescriptorBuilder::build`].
    pub fn builder(
        name: impl Into<String>,
        product_type: impl Into<String>,
        width: usize,
        height: usize,
    ) -> RasterDescriptorBuilder {
        RasterDescriptorBuilder {
            name: name.into(),
            product_type: product_type.into(),
            width,
            height,
            bands: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn product_type(&self) -> &str {
        &self.product_type
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Rectangle covering the whole raster.
    pub fn bounds(&self) -> Rect {
        Rect::of_size(self.width, self.height)
    }

    pub fn bands(&self) -> &[BandDescriptor] {
        &self.bands
    }

    pub fn band(&self, name: &str) -> Option<&BandDescriptor> {
        self.bands.iter().find(|band| band.name == name)
    }

    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.bands.iter().position(|band| band.name == name)
    }

    /// Look up a band, failing with BandNotFound.
    pub fn require_band(&self, name: &str) -> RasterResult<&BandDescriptor> {
        self.band(name)
            .ok_or_else(|| RasterError::band_not_found(&self.name, name))
    }

    /// Identity of the named band in this product.
    pub fn band_id(&self, name: &str) -> BandId {
        BandId::new(self.name.clone(), name)
    }
}

/// Builder for [`RasterDescriptor`].
#[derive(Debug, Clone)]
pub struct RasterDescriptorBuilder {
    name: String,
    product_type: String,
    width: usize,
    height: usize,
    bands: Vec<BandDescriptor>,
}

impl RasterDescriptorBuilder {
    pub fn band(mut self, band: BandDescriptor) -> Self {
        self.bands.push(band);
        self
    }

    pub fn bands(mut self, bands: impl IntoIterator<Item = BandDescriptor>) -> Self {
        self.bands.extend(bands);
        self
    }

    pub fn build(self) -> RasterResult<RasterDescriptor> {
        if self.width == 0 || self.height == 0 {
            return Err(RasterError::InvalidDimensions {
                product: self.name,
                width: self.width,
                height: self.height,
            });
        }

        let mut seen = HashSet::with_capacity(self.bands.len());
        for band in &self.bands {
            if !seen.insert(band.name.as_str()) {
                return Err(RasterError::DuplicateBand {
                    product: self.name.clone(),
                    band: band.name.clone(),
                });
            }
        }

        let product = self.name.clone();
        let bands = self
            .bands
            .into_iter()
            .map(|mut band| {
                band.product = product.clone();
                band
            })
            .collect();

        Ok(RasterDescriptor {
            name: self.name,
            product_type: self.product_type,
            width: self.width,
            height: self.height,
            bands,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sar_product() -> RasterDescriptor {
        RasterDescriptor::builder("S1A_SLC", "SLC", 100, 50)
            .band(BandDescriptor::new("i_VV", DataType::Float32).with_unit(Unit::Real))
            .band(BandDescriptor::new("q_VV", DataType::Float32).with_unit(Unit::Imaginary))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_assigns_owning_product() {
        let product = sar_product();
        assert_eq!(product.bands().len(), 2);
        for band in product.bands() {
            assert_eq!(band.product(), "S1A_SLC");
        }
        assert_eq!(product.band("q_VV").unwrap().id(), BandId::new("S1A_SLC", "q_VV"));
    }

    #[test]
    fn test_builder_rejects_zero_dimensions() {
        let err = RasterDescriptor::builder("p", "t", 0, 10).build().unwrap_err();
        assert!(matches!(err, RasterError::InvalidDimensions { width: 0, .. }));
    }

    #[test]
    fn test_builder_rejects_duplicate_bands() {
        let err = RasterDescriptor::builder("p", "t", 4, 4)
            .band(BandDescriptor::new("B1", DataType::UInt8))
            .band(BandDescriptor::new("B1", DataType::UInt16))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            RasterError::DuplicateBand {
                product: "p".to_string(),
                band: "B1".to_string()
            }
        );
    }

    #[test]
    fn test_band_lookup() {
        let product = sar_product();
        assert_eq!(product.band_index("q_VV"), Some(1));
        assert!(product.require_band("i_VH").is_err());
        assert_eq!(product.bounds(), Rect::new(0, 0, 100, 50));
    }

    #[test]
    fn test_no_data_nan_sentinel() {
        let band = BandDescriptor::new("b", DataType::Float32).with_no_data(f64::NAN);
        assert!(band.is_no_data(f64::NAN));
        assert!(!band.is_no_data(0.0));

        let band = BandDescriptor::new("b", DataType::Int16).with_no_data(-9999.0);
        assert!(band.is_no_data(-9999.0));
        assert!(!band.is_no_data(f64::NAN));
    }

    #[test]
    fn test_data_type_parse() {
        assert_eq!(DataType::parse("Float32"), Some(DataType::Float32));
        assert_eq!(DataType::parse("uint16"), Some(DataType::UInt16));
        assert_eq!(DataType::parse("complex"), None);
        assert_eq!(DataType::Int16.size_in_bytes(), 2);
        assert!(DataType::UInt32.is_integer());
    }

    #[test]
    fn test_unit_serde_names() {
        let json = serde_json::to_string(&Unit::Imaginary).unwrap();
        assert_eq!(json, "\"imaginary\"");
    }
}
