//! Tiles: decoded sample buffers for one band over one rectangle.

use num_traits::Bounded;
use std::sync::Arc;

use crate::descriptor::{is_no_data, BandId, DataType};
use crate::error::{RasterError, RasterResult};
use crate::rect::Rect;

/// Row-major sample buffer, one variant per [`DataType`].
///
/// Buffers are shared read-only through `Arc`; a tile never mutates its
/// buffer after construction.
#[derive(Debug, Clone)]
pub enum TileData {
    Int8(Arc<[i8]>),
    UInt8(Arc<[u8]>),
    Int16(Arc<[i16]>),
    UInt16(Arc<[u16]>),
    Int32(Arc<[i32]>),
    UInt32(Arc<[u32]>),
    Float32(Arc<[f32]>),
    Float64(Arc<[f64]>),
}

/// Apply an expression to the buffer of any variant.
macro_rules! with_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            TileData::Int8($buf) => $body,
            TileData::UInt8($buf) => $body,
            TileData::Int16($buf) => $body,
            TileData::UInt16($buf) => $body,
            TileData::Int32($buf) => $body,
            TileData::UInt32($buf) => $body,
            TileData::Float32($buf) => $body,
            TileData::Float64($buf) => $body,
        }
    };
}

/// Transform the buffer of any variant into a buffer of the same variant.
macro_rules! map_buffer {
    ($data:expr, $buf:ident => $body:expr) => {
        match $data {
            TileData::Int8($buf) => TileData::Int8($body),
            TileData::UInt8($buf) => TileData::UInt8($body),
            TileData::Int16($buf) => TileData::Int16($body),
            TileData::UInt16($buf) => TileData::UInt16($body),
            TileData::Int32($buf) => TileData::Int32($body),
            TileData::UInt32($buf) => TileData::UInt32($body),
            TileData::Float32($buf) => TileData::Float32($body),
            TileData::Float64($buf) => TileData::Float64($body),
        }
    };
}

/// A primitive sample type that can live in a [`TileData`] buffer.
///
/// Reads always widen to `f64`. Writes from `f64` into integer types round
/// to nearest and clamp to the type's range; NaN becomes 0.
pub trait Sample: Copy + PartialEq + Send + Sync + 'static {
    const DATA_TYPE: DataType;

    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
    fn wrap(values: Vec<Self>) -> TileData;
    fn slice(data: &TileData) -> Option<&[Self]>;
}

macro_rules! impl_integer_sample {
    ($t:ty, $variant:ident) => {
        impl Sample for $t {
            const DATA_TYPE: DataType = DataType::$variant;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                if value.is_nan() {
                    return 0;
                }
                let min = <$t as Bounded>::min_value() as f64;
                let max = <$t as Bounded>::max_value() as f64;
                value.round().clamp(min, max) as $t
            }

            fn wrap(values: Vec<Self>) -> TileData {
                TileData::$variant(values.into())
            }

            fn slice(data: &TileData) -> Option<&[Self]> {
                match data {
                    TileData::$variant(buf) => Some(buf),
                    _ => None,
                }
            }
        }
    };
}

impl_integer_sample!(i8, Int8);
impl_integer_sample!(u8, UInt8);
impl_integer_sample!(i16, Int16);
impl_integer_sample!(u16, UInt16);
impl_integer_sample!(i32, Int32);
impl_integer_sample!(u32, UInt32);

impl Sample for f32 {
    const DATA_TYPE: DataType = DataType::Float32;

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn wrap(values: Vec<Self>) -> TileData {
        TileData::Float32(values.into())
    }

    fn slice(data: &TileData) -> Option<&[Self]> {
        match data {
            TileData::Float32(buf) => Some(buf),
            _ => None,
        }
    }
}

impl Sample for f64 {
    const DATA_TYPE: DataType = DataType::Float64;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn wrap(values: Vec<Self>) -> TileData {
        TileData::Float64(values.into())
    }

    fn slice(data: &TileData) -> Option<&[Self]> {
        match data {
            TileData::Float64(buf) => Some(buf),
            _ => None,
        }
    }
}

impl TileData {
    /// Convert `f64` samples into a buffer of the given type.
    pub fn from_f64(data_type: DataType, values: &[f64]) -> Self {
        fn convert<T: Sample>(values: &[f64]) -> TileData {
            T::wrap(values.iter().map(|&v| T::from_f64(v)).collect())
        }

        match data_type {
            DataType::Int8 => convert::<i8>(values),
            DataType::UInt8 => convert::<u8>(values),
            DataType::Int16 => convert::<i16>(values),
            DataType::UInt16 => convert::<u16>(values),
            DataType::Int32 => convert::<i32>(values),
            DataType::UInt32 => convert::<u32>(values),
            DataType::Float32 => convert::<f32>(values),
            DataType::Float64 => convert::<f64>(values),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Int8(_) => DataType::Int8,
            Self::UInt8(_) => DataType::UInt8,
            Self::Int16(_) => DataType::Int16,
            Self::UInt16(_) => DataType::UInt16,
            Self::Int32(_) => DataType::Int32,
            Self::UInt32(_) => DataType::UInt32,
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, buf => buf.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at a linear offset, widened to `f64`.
    pub fn get(&self, offset: usize) -> f64 {
        with_buffer!(self, buf => buf[offset].to_f64())
    }

    /// Number of live references to the underlying buffer.
    pub fn buffer_refs(&self) -> usize {
        with_buffer!(self, buf => Arc::strong_count(buf))
    }

    /// Whether two buffers are the same allocation.
    pub fn ptr_eq(&self, other: &TileData) -> bool {
        match (self, other) {
            (Self::Int8(a), Self::Int8(b)) => Arc::ptr_eq(a, b),
            (Self::UInt8(a), Self::UInt8(b)) => Arc::ptr_eq(a, b),
            (Self::Int16(a), Self::Int16(b)) => Arc::ptr_eq(a, b),
            (Self::UInt16(a), Self::UInt16(b)) => Arc::ptr_eq(a, b),
            (Self::Int32(a), Self::Int32(b)) => Arc::ptr_eq(a, b),
            (Self::UInt32(a), Self::UInt32(b)) => Arc::ptr_eq(a, b),
            (Self::Float32(a), Self::Float32(b)) => Arc::ptr_eq(a, b),
            (Self::Float64(a), Self::Float64(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Element-wise equality (NaN samples compare equal to NaN).
    pub fn samples_eq(&self, other: &TileData) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.data_type() != other.data_type() || self.len() != other.len() {
            return false;
        }
        (0..self.len()).all(|i| {
            let (a, b) = (self.get(i), other.get(i));
            a == b || (a.is_nan() && b.is_nan())
        })
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_buffer!(self, buf => buf.iter().map(|v| v.to_f64()).collect())
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.data_type().size_in_bytes()
    }
}

/// A rectangular, contiguous buffer of samples for one band.
#[derive(Debug, Clone)]
pub struct Tile {
    band: BandId,
    rect: Rect,
    no_data_value: f64,
    data: TileData,
}

impl Tile {
    /// Create a tile, checking that the buffer length matches the rectangle.
    pub fn new(band: BandId, rect: Rect, no_data_value: f64, data: TileData) -> RasterResult<Self> {
        if rect.is_empty() {
            return Err(RasterError::EmptyRect(rect));
        }
        if data.len() != rect.area() {
            return Err(RasterError::BufferLength {
                expected: rect.area(),
                actual: data.len(),
            });
        }
        Ok(Self {
            band,
            rect,
            no_data_value,
            data,
        })
    }

    /// Create a tile from typed samples.
    pub fn from_samples<T: Sample>(
        band: BandId,
        rect: Rect,
        no_data_value: f64,
        samples: Vec<T>,
    ) -> RasterResult<Self> {
        Self::new(band, rect, no_data_value, T::wrap(samples))
    }

    /// Create a tile from `f64` samples, converting into `data_type` with
    /// explicit rounding and clamping for integer types.
    pub fn from_f64(
        band: BandId,
        rect: Rect,
        data_type: DataType,
        no_data_value: f64,
        samples: &[f64],
    ) -> RasterResult<Self> {
        Self::new(band, rect, no_data_value, TileData::from_f64(data_type, samples))
    }

    /// Create a tile where every sample has the same value.
    pub fn filled(
        band: BandId,
        rect: Rect,
        data_type: DataType,
        no_data_value: f64,
        value: f64,
    ) -> RasterResult<Self> {
        Self::from_f64(band, rect, data_type, no_data_value, &vec![value; rect.area()])
    }

    pub fn band(&self) -> &BandId {
        &self.band
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn no_data_value(&self) -> f64 {
        self.no_data_value
    }

    pub fn data(&self) -> &TileData {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Typed view of the buffer, if `T` matches the element type.
    pub fn samples<T: Sample>(&self) -> Option<&[T]> {
        T::slice(&self.data)
    }

    /// Sample at absolute raster coordinates.
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        if !self.rect.contains(x, y) {
            return None;
        }
        Some(self.sample_at((y - self.rect.y) * self.rect.width + (x - self.rect.x)))
    }

    /// Sample at a linear buffer offset.
    pub fn sample_at(&self, offset: usize) -> f64 {
        self.data.get(offset)
    }

    pub fn is_no_data(&self, value: f64) -> bool {
        is_no_data(value, self.no_data_value)
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64_vec()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.size_in_bytes()
    }

    /// Number of live references to this tile's buffer, the cache's own
    /// reference included.
    pub fn buffer_refs(&self) -> usize {
        self.data.buffer_refs()
    }

    /// Whether both tiles cover the same rectangle with identical samples.
    pub fn same_samples(&self, other: &Tile) -> bool {
        self.rect == other.rect && self.data.samples_eq(&other.data)
    }

    /// Copy of the samples inside `rect`. Asking for the tile's own rectangle
    /// shares the buffer instead of copying.
    pub fn crop(&self, rect: Rect) -> RasterResult<Tile> {
        if rect == self.rect {
            return Ok(self.clone());
        }
        if rect.is_empty() {
            return Err(RasterError::EmptyRect(rect));
        }
        if !self.rect.contains_rect(&rect) {
            return Err(RasterError::out_of_bounds(rect, self.rect));
        }

        let src_rect = self.rect;
        let data = map_buffer!(&self.data, buf => crop_rows(buf, src_rect, rect).into());

        Ok(Tile {
            band: self.band.clone(),
            rect,
            no_data_value: self.no_data_value,
            data,
        })
    }

    /// Assemble non-overlapping tiles into one tile covering `bounds`.
    ///
    /// Every pixel of `bounds` must be covered; tiles may extend beyond it.
    pub fn mosaic(
        band: BandId,
        bounds: Rect,
        data_type: DataType,
        no_data_value: f64,
        tiles: &[Tile],
    ) -> RasterResult<Tile> {
        if bounds.is_empty() {
            return Err(RasterError::EmptyRect(bounds));
        }

        let mut covered = vec![false; bounds.area()];
        let mut samples = vec![no_data_value; bounds.area()];

        for tile in tiles {
            let Some(overlap) = tile.rect.intersection(&bounds) else {
                continue;
            };
            for y in overlap.y..overlap.y_max() {
                let src_row = (y - tile.rect.y) * tile.rect.width;
                let dst_row = (y - bounds.y) * bounds.width;
                for x in overlap.x..overlap.x_max() {
                    let dst = dst_row + (x - bounds.x);
                    samples[dst] = tile.sample_at(src_row + (x - tile.rect.x));
                    covered[dst] = true;
                }
            }
        }

        if covered.iter().any(|c| !c) {
            return Err(RasterError::IncompleteMosaic(bounds));
        }

        Tile::from_f64(band, bounds, data_type, no_data_value, &samples)
    }
}

fn crop_rows<T: Copy>(src: &[T], src_rect: Rect, rect: Rect) -> Vec<T> {
    let mut out = Vec::with_capacity(rect.area());
    for y in rect.y..rect.y_max() {
        let start = (y - src_rect.y) * src_rect.width + (rect.x - src_rect.x);
        out.extend_from_slice(&src[start..start + rect.width]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn band() -> BandId {
        BandId::new("prod", "B1")
    }

    fn ramp_tile(rect: Rect) -> Tile {
        let samples: Vec<f64> = (0..rect.area()).map(|i| i as f64).collect();
        Tile::from_f64(band(), rect, DataType::Float32, -1.0, &samples).unwrap()
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let err = Tile::from_samples(band(), Rect::new(0, 0, 2, 2), 0.0, vec![1u8, 2, 3]).unwrap_err();
        assert_eq!(err, RasterError::BufferLength { expected: 4, actual: 3 });
    }

    #[test]
    fn test_new_rejects_empty_rect() {
        let err = Tile::from_samples::<u8>(band(), Rect::new(0, 0, 0, 2), 0.0, vec![]).unwrap_err();
        assert!(matches!(err, RasterError::EmptyRect(_)));
    }

    #[test]
    fn test_integer_conversion_rounds_and_clamps() {
        assert_eq!(u8::from_f64(254.6), 255);
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-3.0), 0);
        assert_eq!(i16::from_f64(-2.5), -3);
        assert_eq!(i8::from_f64(f64::NAN), 0);
        assert_eq!(u32::from_f64(1e12), u32::MAX);
        assert!(f32::from_f64(f64::NAN).is_nan());
    }

    #[test]
    fn test_get_uses_absolute_coordinates() {
        let tile = ramp_tile(Rect::new(10, 20, 3, 2));
        assert_eq!(tile.get(10, 20), Some(0.0));
        assert_eq!(tile.get(12, 20), Some(2.0));
        assert_eq!(tile.get(10, 21), Some(3.0));
        assert_eq!(tile.get(9, 20), None);
        assert_eq!(tile.get(10, 22), None);
    }

    #[test]
    fn test_crop_copies_sub_rectangle() {
        let tile = ramp_tile(Rect::new(0, 0, 4, 3));
        let cropped = tile.crop(Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(cropped.to_f64_vec(), vec![5.0, 6.0, 9.0, 10.0]);
        assert_eq!(cropped.data_type(), DataType::Float32);
        assert!(!cropped.data().ptr_eq(tile.data()));
    }

    #[test]
    fn test_crop_same_rect_shares_buffer() {
        let tile = ramp_tile(Rect::new(0, 0, 4, 3));
        let same = tile.crop(tile.rect()).unwrap();
        assert!(same.data().ptr_eq(tile.data()));
        assert_eq!(tile.buffer_refs(), 2);
    }

    #[test]
    fn test_crop_outside_fails() {
        let tile = ramp_tile(Rect::new(0, 0, 4, 3));
        assert!(matches!(
            tile.crop(Rect::new(2, 2, 3, 1)),
            Err(RasterError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_mosaic_assembles_tiles() {
        let full = ramp_tile(Rect::new(0, 0, 5, 3));
        let parts: Vec<Tile> = Rect::tile_grid(5, 3, 2, 2)
            .into_iter()
            .map(|rect| full.crop(rect).unwrap())
            .collect();

        let mosaic = Tile::mosaic(band(), full.rect(), DataType::Float32, -1.0, &parts).unwrap();
        assert!(mosaic.same_samples(&full));
    }

    #[test]
    fn test_mosaic_detects_gaps() {
        let full = ramp_tile(Rect::new(0, 0, 4, 4));
        let parts = vec![full.crop(Rect::new(0, 0, 4, 2)).unwrap()];
        assert!(matches!(
            Tile::mosaic(band(), full.rect(), DataType::Float32, -1.0, &parts),
            Err(RasterError::IncompleteMosaic(_))
        ));
    }

    #[test]
    fn test_typed_samples_view() {
        let tile = Tile::from_samples(band(), Rect::new(0, 0, 2, 1), 0.0, vec![7i16, -7]).unwrap();
        assert_eq!(tile.samples::<i16>(), Some(&[7i16, -7][..]));
        assert!(tile.samples::<f32>().is_none());
        assert_eq!(tile.size_in_bytes(), 4);
    }

    #[test]
    fn test_same_samples_treats_nan_as_equal() {
        let a = Tile::from_samples(band(), Rect::new(0, 0, 2, 1), f64::NAN, vec![f32::NAN, 1.0]).unwrap();
        let b = Tile::from_samples(band(), Rect::new(0, 0, 2, 1), f64::NAN, vec![f32::NAN, 1.0]).unwrap();
        assert!(a.same_samples(&b));
        assert!(a.is_no_data(f64::NAN));
    }
}
