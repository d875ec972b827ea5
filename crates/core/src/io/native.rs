//! Native GeoTIFF reading/writing (without GDAL dependency)
//!
//! Uses the `tiff` crate. Georeferencing is carried by the pixel scale and
//! tiepoint tags, the projection by an EPSG geokey, and nodata by the GDAL
//! nodata ASCII tag so that rasters written here open cleanly in GDAL.

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::io::mapped::Window;
use crate::io::RasterInfo;
use crate::raster::{DataType, GeoTransform, Raster, RasterElement};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::compression::{Compression, Deflate, Uncompressed};
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;

const GT_MODEL_TYPE: u64 = 1024;
const GEOGRAPHIC_TYPE: u64 = 2048;
const PROJECTED_CS_TYPE: u64 = 3072;

/// Options for writing GeoTIFF files
#[derive(Debug, Clone)]
pub struct GeoTiffOptions {
    /// "DEFLATE" or "NONE"
    pub compression: String,
}

impl Default for GeoTiffOptions {
    fn default() -> Self {
        Self {
            compression: "DEFLATE".to_string(),
        }
    }
}

/// Read the first band of a GeoTIFF file into a Raster.
///
/// Samples are converted to `T`; values `T` cannot represent become `T`'s
/// nodata.
pub fn read_geotiff<T, P>(path: P, _band: Option<usize>) -> Result<Raster<T>>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::raster_io(path, e))?;
    decode_geotiff(BufReader::new(file), path)
}

/// Read only the header of a GeoTIFF file.
pub fn read_info<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::raster_io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| Error::raster_io(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| Error::raster_io(path, e))?;
    let data_type = sample_type(&mut decoder).map_err(|reason| Error::raster_io(path, reason))?;

    Ok(RasterInfo {
        path: path.to_path_buf(),
        width: width as usize,
        height: height as usize,
        transform: read_geotransform(&mut decoder).unwrap_or_default(),
        crs: read_crs(&mut decoder),
        nodata: read_nodata(&mut decoder),
        data_type,
    })
}

fn sample_type<R: Read + Seek>(decoder: &mut Decoder<R>) -> std::result::Result<DataType, String> {
    let bits = match decoder.colortype().map_err(|e| e.to_string())? {
        tiff::ColorType::Gray(bits) => bits,
        other => return Err(format!("unsupported color type {:?}", other)),
    };
    // 1 = unsigned, 2 = signed, 3 = IEEE float
    let format = decoder.get_tag_u32(Tag::SampleFormat).unwrap_or(1);
    let dt = match (format, bits) {
        (1, 8) => DataType::U8,
        (1, 16) => DataType::U16,
        (1, 32) => DataType::U32,
        (1, 64) => DataType::U64,
        (2, 8) => DataType::I8,
        (2, 16) => DataType::I16,
        (2, 32) => DataType::I32,
        (2, 64) => DataType::I64,
        (3, 32) => DataType::F32,
        (3, 64) => DataType::F64,
        _ => return Err(format!("unsupported sample format {} with {} bits", format, bits)),
    };
    Ok(dt)
}

fn convert<S, T>(buf: Vec<S>, nodata: T) -> Vec<T>
where
    S: num_traits::ToPrimitive + Copy,
    T: RasterElement,
{
    buf.into_iter()
        .map(|v| v.to_f64().and_then(T::from_f64).unwrap_or(nodata))
        .collect()
}

/// Internal: decode a GeoTIFF from any `Read + Seek` source
fn decode_geotiff<T, R>(reader: R, path: &Path) -> Result<Raster<T>>
where
    T: RasterElement,
    R: Read + Seek,
{
    let mut decoder = Decoder::new(reader).map_err(|e| Error::raster_io(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| Error::raster_io(path, e))?;
    let rows = height as usize;
    let cols = width as usize;

    let file_nodata = read_nodata(&mut decoder);
    let nodata = file_nodata.and_then(T::from_f64);
    let fallback = nodata.unwrap_or_else(T::default_nodata);

    let result = decoder
        .read_image()
        .map_err(|e| Error::raster_io(path, format!("cannot read image data: {}", e)))?;

    let data: Vec<T> = match result {
        DecodingResult::U8(buf) => convert(buf, fallback),
        DecodingResult::U16(buf) => convert(buf, fallback),
        DecodingResult::U32(buf) => convert(buf, fallback),
        DecodingResult::U64(buf) => convert(buf, fallback),
        DecodingResult::I8(buf) => convert(buf, fallback),
        DecodingResult::I16(buf) => convert(buf, fallback),
        DecodingResult::I32(buf) => convert(buf, fallback),
        DecodingResult::I64(buf) => convert(buf, fallback),
        DecodingResult::F32(buf) => convert(buf, fallback),
        DecodingResult::F64(buf) => convert(buf, fallback),
    };

    if data.len() != rows * cols {
        return Err(Error::raster_io(
            path,
            format!("expected {} samples for {}x{}, found {}", rows * cols, cols, rows, data.len()),
        ));
    }

    let mut raster = Raster::from_vec(data, rows, cols)?;
    if let Some(transform) = read_geotransform(&mut decoder) {
        raster.set_transform(transform);
    }
    raster.set_crs(read_crs(&mut decoder));
    // a sentinel T cannot hold (NaN in an integer file) still needs a marker
    raster.set_nodata(if file_nodata.is_some() { Some(fallback) } else { None });

    Ok(raster)
}

/// Decode the first band one strip or tile at a time, as f64.
pub(crate) fn read_windows<F>(path: &Path, mut visit: F) -> Result<()>
where
    F: FnMut(Window<'_>) -> Result<()>,
{
    let file = File::open(path).map_err(|e| Error::raster_io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(|e| Error::raster_io(path, e))?;

    let (width, height) = decoder.dimensions().map_err(|e| Error::raster_io(path, e))?;
    let (chunk_w, chunk_h) = decoder.chunk_dimensions();
    if chunk_w == 0 || chunk_h == 0 {
        return Err(Error::raster_io(path, "zero-sized strips or tiles"));
    }
    // strips span the full width, so `across` is 1 for them
    let across = width.div_ceil(chunk_w);
    let down = height.div_ceil(chunk_h);

    for index in 0..across * down {
        let (data_w, data_h) = decoder.chunk_data_dimensions(index);
        let (data_w, data_h) = (data_w as usize, data_h as usize);
        let samples = match decoder
            .read_chunk(index)
            .map_err(|e| Error::raster_io(path, format!("cannot read chunk {}: {}", index, e)))?
        {
            DecodingResult::U8(buf) => widen(buf),
            DecodingResult::U16(buf) => widen(buf),
            DecodingResult::U32(buf) => widen(buf),
            DecodingResult::U64(buf) => widen(buf),
            DecodingResult::I8(buf) => widen(buf),
            DecodingResult::I16(buf) => widen(buf),
            DecodingResult::I32(buf) => widen(buf),
            DecodingResult::I64(buf) => widen(buf),
            DecodingResult::F32(buf) => widen(buf),
            DecodingResult::F64(buf) => buf,
        };

        // edge tiles may come back padded to the full tile width
        let stride = if samples.len() == data_w * data_h {
            data_w
        } else {
            chunk_w as usize
        };
        if data_h > 0 && samples.len() < (data_h - 1) * stride + data_w {
            return Err(Error::raster_io(
                path,
                format!("chunk {} holds {} samples for {}x{}", index, samples.len(), data_w, data_h),
            ));
        }

        visit(Window {
            row: (index / across * chunk_h) as usize,
            col: (index % across * chunk_w) as usize,
            rows: data_h,
            cols: data_w,
            stride,
            samples: &samples,
        })?;
    }
    Ok(())
}

fn widen<S: num_traits::ToPrimitive + Copy>(buf: Vec<S>) -> Vec<f64> {
    buf.into_iter().map(|v| v.to_f64().unwrap_or(f64::NAN)).collect()
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    let text = decoder.get_tag_ascii_string(Tag::GdalNodata).ok()?;
    let text = text.trim_matches(char::from(0)).trim();
    if text.eq_ignore_ascii_case("nan") {
        Some(f64::NAN)
    } else {
        text.parse().ok()
    }
}

/// GeoTransform from ModelPixelScaleTag + ModelTiepointTag
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<GeoTransform> {
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;

    if scale.len() >= 2 && tiepoint.len() >= 6 {
        // tiepoint: [I, J, K, X, Y, Z], scale: [ScaleX, ScaleY, ScaleZ]
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
        return Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]));
    }
    None
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<CRS> {
    let keys = decoder.get_tag_u64_vec(Tag::GeoKeyDirectoryTag).ok()?;
    // header is 4 entries, then (key, location, count, value) quads
    keys.get(4..)?
        .chunks_exact(4)
        .find(|k| (k[0] == PROJECTED_CS_TYPE || k[0] == GEOGRAPHIC_TYPE) && k[1] == 0)
        .and_then(|k| u32::try_from(k[3]).ok())
        .map(CRS::from_epsg)
}

/// Write a Raster to a GeoTIFF file, keeping its sample type.
///
/// u8, i32, f32 and f64 rasters are supported; other element types are
/// rejected with [`Error::UnsupportedDataType`].
pub fn write_geotiff<T, P>(raster: &Raster<T>, path: P, options: Option<GeoTiffOptions>) -> Result<()>
where
    T: RasterElement,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let opts = options.unwrap_or_default();
    let file = File::create(path).map_err(|e| Error::raster_io(path, e))?;
    let mut writer = BufWriter::new(file);

    match opts.compression.to_ascii_uppercase().as_str() {
        "DEFLATE" => encode_geotiff(raster, &mut writer, Deflate::default()),
        "NONE" => encode_geotiff(raster, &mut writer, Uncompressed),
        other => Err(Error::InvalidParameter {
            name: "compression",
            value: other.to_string(),
            reason: "native writer supports DEFLATE and NONE".into(),
        }),
    }
    .map_err(|e| match e {
        Error::InvalidParameter { .. } | Error::UnsupportedDataType(_) => e,
        other => Error::raster_io(path, other),
    })?;

    writer.flush().map_err(|e| Error::raster_io(path, e))
}

fn encode_geotiff<T, W, D>(raster: &Raster<T>, writer: W, compression: D) -> Result<()>
where
    T: RasterElement,
    W: Write + Seek,
    D: Compression,
{
    match T::data_type() {
        DataType::U8 => encode_as::<colortype::Gray8, T, W, D>(raster, writer, compression),
        DataType::I32 => encode_as::<colortype::GrayI32, T, W, D>(raster, writer, compression),
        DataType::F32 => encode_as::<colortype::Gray32Float, T, W, D>(raster, writer, compression),
        DataType::F64 => encode_as::<colortype::Gray64Float, T, W, D>(raster, writer, compression),
        other => Err(Error::UnsupportedDataType(format!("cannot write {} rasters", other))),
    }
}

fn encode_as<C, T, W, D>(raster: &Raster<T>, writer: W, compression: D) -> Result<()>
where
    C: ColorType,
    C::Inner: RasterElement,
    [C::Inner]: tiff::encoder::TiffValue,
    T: RasterElement,
    W: Write + Seek,
    D: Compression,
{
    let tiff_err = |e: tiff::TiffError| Error::Other(e.to_string());
    let mut encoder = TiffEncoder::new(writer).map_err(tiff_err)?;

    let (rows, cols) = raster.shape();
    let samples = raster.cast::<C::Inner>();
    let data: Vec<C::Inner> = samples.data().iter().copied().collect();

    let mut image = encoder
        .new_image_with_compression::<C, D>(cols as u32, rows as u32, compression)
        .map_err(tiff_err)?;

    let gt = raster.transform();
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[gt.pixel_width, gt.pixel_height.abs(), 0.0][..])
        .map_err(tiff_err)?;
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0][..])
        .map_err(tiff_err)?;

    // GTModelType 1 = projected, 2 = geographic; GTRasterType 1 = PixelIsArea
    let mut geokeys: Vec<u16> = vec![1, 1, 0, 2, GT_MODEL_TYPE as u16, 0, 1, 1, 1025, 0, 1, 1];
    if let Some(crs) = raster.crs() {
        if let Some(code) = crs.epsg().and_then(|c| u16::try_from(c).ok()) {
            let projected = crs.is_projected();
            geokeys[7] = if projected { 1 } else { 2 };
            let key = if projected { PROJECTED_CS_TYPE } else { GEOGRAPHIC_TYPE };
            geokeys.extend_from_slice(&[key as u16, 0, 1, code]);
            geokeys[3] = 3;
        }
    }
    image
        .encoder()
        .write_tag(Tag::GeoKeyDirectoryTag, &geokeys[..])
        .map_err(tiff_err)?;

    let nodata = raster.nodata().and(samples.nodata()).and_then(|nd| nd.to_f64());
    if let Some(nodata) = nodata {
        image
            .encoder()
            .write_tag(Tag::GdalNodata, &nodata.to_string()[..])
            .map_err(tiff_err)?;
    }

    image.write_data(&data).map_err(tiff_err)?;
    Ok(())
}
