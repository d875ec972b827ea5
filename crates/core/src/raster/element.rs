//! Raster element trait for generic cell values

use num_traits::{NumCast, Zero};
use serde::Serialize;
use std::fmt::{self, Debug};

/// Storage type of a raster band, as reported by [`crate::io::open_raster`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    I64,
    U64,
    F32,
    F64,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::U8 => "Byte",
            DataType::U16 => "UInt16",
            DataType::U32 => "UInt32",
            DataType::U64 => "UInt64",
            DataType::I8 => "Int8",
            DataType::I16 => "Int16",
            DataType::I32 => "Int32",
            DataType::I64 => "Int64",
            DataType::F32 => "Float32",
            DataType::F64 => "Float64",
        };
        f.write_str(name)
    }
}

/// Trait for types that can be stored in a raster cell.
pub trait RasterElement:
    Copy + Clone + Debug + PartialOrd + PartialEq + NumCast + Zero + Send + Sync + 'static
{
    /// Storage type tag
    fn data_type() -> DataType;

    /// Default no-data value for this type
    fn default_nodata() -> Self;

    /// Check if this value represents no-data
    fn is_nodata(&self, nodata: Option<Self>) -> bool;

    /// Convert self to f64
    fn to_f64(self) -> Option<f64> {
        NumCast::from(self)
    }

    /// Lossy conversion from f64, `None` when out of range or NaN for integers
    fn from_f64(value: f64) -> Option<Self> {
        NumCast::from(value)
    }
}

macro_rules! impl_raster_element_int {
    ($t:ty, $dt:ident, $nodata:expr) => {
        impl RasterElement for $t {
            fn data_type() -> DataType {
                DataType::$dt
            }

            fn default_nodata() -> Self {
                $nodata
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                nodata.map_or(false, |nd| *self == nd)
            }
        }
    };
}

macro_rules! impl_raster_element_float {
    ($t:ty, $dt:ident) => {
        impl RasterElement for $t {
            fn data_type() -> DataType {
                DataType::$dt
            }

            fn default_nodata() -> Self {
                <$t>::NAN
            }

            fn is_nodata(&self, nodata: Option<Self>) -> bool {
                if self.is_nan() {
                    return true;
                }
                match nodata {
                    Some(nd) if nd.is_nan() => false,
                    Some(nd) => (self - nd).abs() <= <$t>::EPSILON * nd.abs().max(1.0),
                    None => false,
                }
            }
        }
    };
}

// Byte rasters reserve 255 for nodata so that 0/1 masks stay usable
impl_raster_element_int!(u8, U8, u8::MAX);
impl_raster_element_int!(u16, U16, u16::MAX);
impl_raster_element_int!(u32, U32, u32::MAX);
impl_raster_element_int!(u64, U64, u64::MAX);
impl_raster_element_int!(i8, I8, i8::MIN);
impl_raster_element_int!(i16, I16, i16::MIN);
impl_raster_element_int!(i32, I32, i32::MIN);
impl_raster_element_int!(i64, I64, i64::MIN);
impl_raster_element_float!(f32, F32);
impl_raster_element_float!(f64, F64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_nodata_matches_sentinel_and_nan() {
        assert!((-1.0f64).is_nodata(Some(-1.0)));
        assert!(f64::NAN.is_nodata(None));
        assert!(!0.5f64.is_nodata(Some(-1.0)));
        assert!(!0.5f64.is_nodata(Some(f64::NAN)));
    }

    #[test]
    fn test_byte_nodata() {
        assert_eq!(u8::default_nodata(), 255);
        assert!(255u8.is_nodata(Some(255)));
        assert!(!1u8.is_nodata(Some(255)));
        assert_eq!(u8::data_type(), DataType::U8);
    }
}
