//! Raster headers and template-based creation

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io::{write_geotiff, IoElement};
use crate::raster::{DataType, Extent, GeoTransform, Raster};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Grid description of a raster on disk, read without loading its pixels
#[derive(Debug, Clone, Serialize)]
pub struct RasterInfo {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Option<CRS>,
    pub nodata: Option<f64>,
    pub data_type: DataType,
}

impl RasterInfo {
    pub fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    pub fn bounding_box(&self) -> Extent {
        self.transform.extent(self.width, self.height)
    }

    pub fn projection_wkt(&self) -> Option<&str> {
        self.crs.as_ref().and_then(|c| c.wkt())
    }

    /// An in-memory raster on this grid with every cell set to `fill`
    pub fn blank<T: IoElement>(&self, fill: T, nodata: Option<T>) -> Raster<T> {
        let mut raster = Raster::filled(self.height, self.width, fill);
        raster.set_transform(self.transform);
        raster.set_crs(self.crs.clone());
        raster.set_nodata(nodata);
        raster
    }
}

/// Read the header of the raster at `path`.
pub fn open_raster<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    #[cfg(feature = "gdal")]
    {
        crate::io::gdal_io::read_info(path)
    }
    #[cfg(not(feature = "gdal"))]
    {
        crate::io::native::read_info(path)
    }
}

/// Create a raster at `path` on the grid of `base`.
///
/// Cells hold `fill_value`, or the nodata value when no fill is given. The
/// file is written immediately and the in-memory copy returned.
pub fn create_from_base<T, P>(base: &RasterInfo, path: P, nodata: Option<T>, fill_value: Option<T>) -> Result<Raster<T>>
where
    T: IoElement,
    P: AsRef<Path>,
{
    let fill = match (fill_value, nodata) {
        (Some(fill), _) => fill,
        (None, Some(nd)) => nd,
        (None, None) => {
            return Err(Error::InvalidParameter {
                name: "fill_value",
                value: "None".into(),
                reason: "a fill value is required when the raster has no nodata".into(),
            })
        }
    };
    let raster = base.blank(fill, nodata);
    write_geotiff(&raster, path, None)?;
    Ok(raster)
}
