//! I/O operations for reading and writing geospatial data

mod align;
#[cfg(feature = "gdal")]
mod gdal_io;
mod info;
mod mapped;
#[cfg_attr(feature = "gdal", allow(dead_code))]
mod native;

pub use align::{align_rasters, AlignParams, ExtentMode, ResampleMode};
pub use info::{create_from_base, open_raster, RasterInfo};
pub use mapped::{map_raster, MappedRaster, ScratchBuffer, ScratchElement, ScratchPolicy};

#[cfg(feature = "gdal")]
pub use gdal_io::{read_geotiff, write_geotiff, GeoTiffOptions};

#[cfg(not(feature = "gdal"))]
pub use native::{read_geotiff, write_geotiff, GeoTiffOptions};

/// Cell types the active raster backend can read and write
#[cfg(feature = "gdal")]
pub trait IoElement: crate::raster::RasterElement + gdal::raster::GdalType {}
#[cfg(feature = "gdal")]
impl<T: crate::raster::RasterElement + gdal::raster::GdalType> IoElement for T {}

/// Cell types the active raster backend can read and write
#[cfg(not(feature = "gdal"))]
pub trait IoElement: crate::raster::RasterElement {}
#[cfg(not(feature = "gdal"))]
impl<T: crate::raster::RasterElement> IoElement for T {}
