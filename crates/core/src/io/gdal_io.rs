//! GeoTIFF reading and writing using GDAL

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io::mapped::Window;
use crate::io::RasterInfo;
use crate::raster::{DataType, GeoTransform, Raster, RasterElement, DEFAULT_BLOCK_SIZE};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, GdalDataType, GdalType};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use std::path::Path;

/// Options for writing GeoTIFF files
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    /// Compression type: "DEFLATE", "LZW", "ZSTD", "NONE"
    pub compression: String,
    /// Tile size for tiled TIFFs (0 for strips)
    pub tile_size: usize,
    /// BigTIFF for files > 4GB
    pub bigtiff: bool,
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
            tile_size: 256,
            bigtiff: false,
        }
    }
}

fn open(path: &Path) -> Result<Dataset> {
    Dataset::open(path).map_err(|e| Error::raster_io(path, e))
}

fn dataset_crs(dataset: &Dataset) -> Option<CRS> {
    let srs = dataset.spatial_ref().ok()?;
    let wkt = srs.to_wkt().ok()?;
    Some(CRS::from_wkt(wkt))
}

/// Read the header of a raster in any GDAL format.
pub fn read_info<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    let path = path.as_ref();
    let dataset = open(path)?;
    let band = dataset.rasterband(1).map_err(|e| Error::raster_io(path, e))?;
    let (width, height) = dataset.raster_size();

    let data_type = match band.band_type() {
        GdalDataType::UInt8 => DataType::U8,
        GdalDataType::UInt16 => DataType::U16,
        GdalDataType::UInt32 => DataType::U32,
        GdalDataType::UInt64 => DataType::U64,
        GdalDataType::Int8 => DataType::I8,
        GdalDataType::Int16 => DataType::I16,
        GdalDataType::Int32 => DataType::I32,
        GdalDataType::Int64 => DataType::I64,
        GdalDataType::Float32 => DataType::F32,
        GdalDataType::Float64 => DataType::F64,
        other => return Err(Error::UnsupportedDataType(format!("{:?}", other))),
    };

    Ok(RasterInfo {
        path: path.to_path_buf(),
        width,
        height,
        transform: dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .unwrap_or_default(),
        crs: dataset_crs(&dataset),
        nodata: band.no_data_value(),
        data_type,
    })
}

/// Read a band (1-indexed, default 1) into a Raster
pub fn read_geotiff<T, P>(path: P, band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement + GdalType,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let dataset = open(path)?;
    let rasterband = dataset
        .rasterband(band.unwrap_or(1))
        .map_err(|e| Error::raster_io(path, e))?;

    let (cols, rows) = dataset.raster_size();
    let buffer = rasterband
        .read_as::<T>((0, 0), (cols, rows), (cols, rows), None)
        .map_err(|e| Error::raster_io(path, e))?;

    let mut raster = Raster::from_vec(buffer.data().to_vec(), rows, cols)?;

    if let Ok(gt) = dataset.geo_transform() {
        raster.set_transform(GeoTransform::from_gdal(gt));
    }
    raster.set_crs(dataset_crs(&dataset));
    if let Some(nodata) = rasterband.no_data_value() {
        raster.set_nodata(Some(T::from_f64(nodata).unwrap_or_else(T::default_nodata)));
    }

    Ok(raster)
}

/// Read the first band in full-width strips of [`DEFAULT_BLOCK_SIZE`] rows.
pub(crate) fn read_windows<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(Window<'_>) -> Result<()>,
{
    let dataset = open(path)?;
    let band = dataset.rasterband(1).map_err(|e| Error::raster_io(path, e))?;
    let (cols, rows) = dataset.raster_size();

    for row in (0..rows).step_by(DEFAULT_BLOCK_SIZE) {
        let strip = DEFAULT_BLOCK_SIZE.min(rows - row);
        let buffer = band
            .read_as::<f64>((0, row as isize), (cols, strip), (cols, strip), None)
            .map_err(|e| Error::raster_io(path, e))?;
        visit(Window {
            row,
            col: 0,
            rows: strip,
            cols,
            stride: cols,
            samples: buffer.data(),
        })?;
    }
    Ok(())
}

/// Write a Raster as a tiled, compressed GeoTIFF
pub fn write_geotiff<T, P>(raster: &Raster<T>, path: P, options: Option<GeoTiffOptions>) -> Result<()>
where
    T: RasterElement + GdalType,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let opts = options.unwrap_or_default();
    let driver = DriverManager::get_driver_by_name("GTiff")?;

    let (rows, cols) = raster.shape();

    let mut create_options = CslStringList::new();
    create_options.set_name_value("COMPRESS", &opts.compression)?;
    if opts.tile_size > 0 {
        create_options.set_name_value("TILED", "YES")?;
        create_options.set_name_value("BLOCKXSIZE", &opts.tile_size.to_string())?;
        create_options.set_name_value("BLOCKYSIZE", &opts.tile_size.to_string())?;
    }
    if opts.bigtiff {
        create_options.set_name_value("BIGTIFF", "YES")?;
    }

    let mut dataset = driver
        .create_with_band_type_with_options::<T, _>(path, cols, rows, 1, &create_options)
        .map_err(|e| Error::raster_io(path, e))?;

    dataset.set_geo_transform(&raster.transform().to_gdal())?;

    if let Some(crs) = raster.crs() {
        let srs = match (crs.wkt(), crs.epsg()) {
            (Some(wkt), _) => Some(SpatialRef::from_wkt(wkt)?),
            (None, Some(code)) => Some(SpatialRef::from_epsg(code)?),
            (None, None) => None,
        };
        if let Some(srs) = srs {
            dataset.set_spatial_ref(&srs)?;
        }
    }

    let mut band = dataset.rasterband(1)?;
    if let Some(nodata) = raster.nodata().and_then(|nd| nd.to_f64()) {
        band.set_no_data_value(Some(nodata))?;
    }

    let mut buffer = Buffer::new((cols, rows), raster.data().iter().copied().collect());
    band.write((0, 0), (cols, rows), &mut buffer)
        .map_err(|e| Error::raster_io(path, e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_read_roundtrip() {
        let mut raster: Raster<f64> = Raster::new(20, 30);
        raster.set_transform(GeoTransform::new(0.0, 100.0, 1.0, -1.0));
        raster.set_crs(Some(CRS::from_epsg(32630)));
        raster.set_nodata(Some(-1.0));
        raster.set(5, 7, 42.0).unwrap();

        let tmp = NamedTempFile::with_suffix(".tif").unwrap();
        write_geotiff(&raster, tmp.path(), None).unwrap();

        let loaded: Raster<f64> = read_geotiff(tmp.path(), None).unwrap();
        assert_eq!(loaded.shape(), raster.shape());
        assert_eq!(loaded.get(5, 7).unwrap(), 42.0);
        assert_eq!(loaded.nodata(), Some(-1.0));
        assert_eq!(read_info(tmp.path()).unwrap().data_type, DataType::F64);
    }
}
