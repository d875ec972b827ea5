//! Co-registration of rasters onto a common grid

use crate::error::{Error, Result};
use crate::raster::{Extent, GeoTransform, Raster};
use crate::vector::FeatureCollection;

/// How the target extent of an alignment is chosen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtentMode {
    /// Area covered by every input
    Intersection,
    /// Area covered by any input
    Union,
    /// An explicit bounding box
    BoundingBox(Extent),
    /// The extent of the input at this index
    Dataset(usize),
}

/// Resampling kernel used when a raster moves onto the target grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResampleMode {
    #[default]
    Nearest,
    Bilinear,
    Cubic,
    /// Most frequent value in the target cell footprint, for categorical data
    Mode,
}

/// Parameters for [`align_rasters`]
#[derive(Debug, Clone)]
pub struct AlignParams {
    /// Target cell size; defaults to the cell size of the `align_index` input
    pub cell_size: Option<f64>,
    pub extent: ExtentMode,
    /// Input whose lattice the target grid snaps to
    pub align_index: usize,
    /// Cells whose center falls outside the AOI become nodata
    pub aoi: Option<FeatureCollection>,
    /// Skip projection checks
    pub assume_projected: bool,
}

impl Default for AlignParams {
    fn default() -> Self {
        Self {
            cell_size: None,
            extent: ExtentMode::Intersection,
            align_index: 0,
            aoi: None,
            assume_projected: false,
        }
    }
}

/// Resample every input onto one grid.
///
/// `modes` gives the kernel per input. Output nodata is the input's nodata,
/// or NaN when the input has none.
pub fn align_rasters(inputs: &[&Raster<f64>], modes: &[ResampleMode], params: &AlignParams) -> Result<Vec<Raster<f64>>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    if modes.len() != inputs.len() {
        return Err(Error::InvalidParameter {
            name: "resample_modes",
            value: modes.len().to_string(),
            reason: format!("expected one mode per input ({})", inputs.len()),
        });
    }
    let anchor = inputs.get(params.align_index).ok_or_else(|| Error::InvalidParameter {
        name: "align_index",
        value: params.align_index.to_string(),
        reason: format!("only {} inputs", inputs.len()),
    })?;

    if !params.assume_projected {
        check_projections(inputs)?;
    }

    let cell_size = params.cell_size.unwrap_or_else(|| anchor.cell_size());
    if !(cell_size > 0.0) {
        return Err(Error::InvalidParameter {
            name: "cell_size",
            value: cell_size.to_string(),
            reason: "must be positive".into(),
        });
    }

    let extent = target_extent(inputs, params.extent)?;
    let lattice = GeoTransform::new(anchor.transform().origin_x, anchor.transform().origin_y, cell_size, -cell_size);
    let extent = extent.snap_to(&lattice);
    if extent.is_empty() {
        return Err(Error::EmptyExtent(format!("{:?}", params.extent)));
    }

    let cols = (extent.width() / cell_size).round() as usize;
    let rows = (extent.height() / cell_size).round() as usize;
    let transform = GeoTransform::for_extent(&extent, cell_size);
    tracing::debug!(rows, cols, cell_size, "aligning {} rasters", inputs.len());

    let aoi = params.aoi.as_ref().map(|fc| fc.mask(&transform, rows, cols));

    let mut outputs = Vec::with_capacity(inputs.len());
    for (src, &mode) in inputs.iter().zip(modes) {
        let nodata = src.nodata().unwrap_or(f64::NAN);
        let mut out = Raster::filled(rows, cols, nodata);
        out.set_transform(transform);
        out.set_crs(anchor.crs().cloned());
        out.set_nodata(Some(nodata));

        let same = src.same_grid(&out);
        for row in 0..rows {
            for col in 0..cols {
                if let Some(mask) = &aoi {
                    if unsafe { mask.get_unchecked(row, col) } == 0 {
                        continue;
                    }
                }
                let value = if same {
                    src.value_at(row, col)
                } else {
                    let (x, y) = transform.pixel_to_geo(col, row);
                    sample(src, x, y, mode, cell_size)
                };
                if let Some(v) = value {
                    unsafe { out.set_unchecked(row, col, v) };
                }
            }
        }
        outputs.push(out);
    }
    Ok(outputs)
}

fn check_projections(inputs: &[&Raster<f64>]) -> Result<()> {
    let mut reference = None;
    for raster in inputs {
        let Some(crs) = raster.crs() else { continue };
        if !crs.is_projected() {
            return Err(Error::CrsMismatch(crs.identifier(), "a projected CRS".into()));
        }
        match reference {
            None => reference = Some(crs),
            Some(r) if !r.is_equivalent(crs) => {
                return Err(Error::CrsMismatch(r.identifier(), crs.identifier()));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn target_extent(inputs: &[&Raster<f64>], mode: ExtentMode) -> Result<Extent> {
    let mut extents = inputs.iter().map(|r| r.extent());
    match mode {
        ExtentMode::Intersection => Ok(extents
            .next()
            .map(|first| extents.fold(first, |acc, e| acc.intersection(&e)))
            .unwrap_or(Extent::new(0.0, 0.0, 0.0, 0.0))),
        ExtentMode::Union => Ok(extents
            .next()
            .map(|first| extents.fold(first, |acc, e| acc.union(&e)))
            .unwrap_or(Extent::new(0.0, 0.0, 0.0, 0.0))),
        ExtentMode::BoundingBox(bbox) => Ok(bbox),
        ExtentMode::Dataset(i) => inputs.get(i).map(|r| r.extent()).ok_or_else(|| Error::InvalidParameter {
            name: "extent",
            value: format!("Dataset({})", i),
            reason: format!("only {} inputs", inputs.len()),
        }),
    }
}

/// Value of `src` at map point (x, y)
fn sample(src: &Raster<f64>, x: f64, y: f64, mode: ResampleMode, target_cell: f64) -> Option<f64> {
    let (fc, fr) = src.geo_to_pixel(x, y);
    if !(fc >= 0.0 && fr >= 0.0 && fc < src.cols() as f64 && fr < src.rows() as f64) {
        return None;
    }
    match mode {
        ResampleMode::Nearest => src.value_at(fr as usize, fc as usize),
        ResampleMode::Bilinear => bilinear(src, fc, fr).or_else(|| src.value_at(fr as usize, fc as usize)),
        ResampleMode::Cubic => cubic(src, fc, fr)
            .or_else(|| bilinear(src, fc, fr))
            .or_else(|| src.value_at(fr as usize, fc as usize)),
        ResampleMode::Mode => majority(src, fc, fr, target_cell / src.cell_size()),
    }
}

/// Bilinear interpolation between the four surrounding centers, weights
/// renormalised over valid cells
fn bilinear(src: &Raster<f64>, fc: f64, fr: f64) -> Option<f64> {
    let cx = fc - 0.5;
    let cy = fr - 0.5;
    let c0 = cx.floor();
    let r0 = cy.floor();
    let tx = cx - c0;
    let ty = cy - r0;

    let mut sum = 0.0;
    let mut wsum = 0.0;
    for (dr, wy) in [(0.0, 1.0 - ty), (1.0, ty)] {
        for (dc, wx) in [(0.0, 1.0 - tx), (1.0, tx)] {
            let r = r0 + dr;
            let c = c0 + dc;
            if r < 0.0 || c < 0.0 {
                continue;
            }
            if let Some(v) = src.value_at(r as usize, c as usize) {
                let w = wx * wy;
                sum += w * v;
                wsum += w;
            }
        }
    }
    (wsum > 0.0).then(|| sum / wsum)
}

/// Keys cubic convolution kernel, a = -0.5
fn cubic_weight(t: f64) -> f64 {
    let t = t.abs();
    if t <= 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

/// Cubic convolution over the 4x4 neighbourhood; `None` if any sample is
/// missing
fn cubic(src: &Raster<f64>, fc: f64, fr: f64) -> Option<f64> {
    let cx = fc - 0.5;
    let cy = fr - 0.5;
    let c0 = cx.floor() as isize;
    let r0 = cy.floor() as isize;

    let mut sum = 0.0;
    for i in -1..=2isize {
        let wy = cubic_weight(cy - (r0 + i) as f64);
        for j in -1..=2isize {
            let wx = cubic_weight(cx - (c0 + j) as f64);
            let (r, c) = (r0 + i, c0 + j);
            if r < 0 || c < 0 {
                return None;
            }
            sum += wx * wy * src.value_at(r as usize, c as usize)?;
        }
    }
    Some(sum)
}

/// Most frequent valid value among source cells under a target cell that
/// spans `ratio` source cells; ties go to the smallest value
fn majority(src: &Raster<f64>, fc: f64, fr: f64, ratio: f64) -> Option<f64> {
    if ratio <= 1.0 {
        return src.value_at(fr as usize, fc as usize);
    }
    let half = ratio / 2.0;
    let r_lo = (fr - half).floor().max(0.0) as usize;
    let c_lo = (fc - half).floor().max(0.0) as usize;
    let r_hi = ((fr + half).ceil() as usize).min(src.rows());
    let c_hi = ((fc + half).ceil() as usize).min(src.cols());

    let mut counts: Vec<(f64, usize)> = Vec::new();
    for r in r_lo..r_hi {
        for c in c_lo..c_hi {
            let Some(v) = src.value_at(r, c) else { continue };
            match counts.iter_mut().find(|(value, _)| *value == v) {
                Some((_, n)) => *n += 1,
                None => counts.push((v, 1)),
            }
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.total_cmp(&a.0)))
        .map(|(v, _)| v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crs::CRS;
    use approx::assert_relative_eq;

    fn raster(data: Vec<f64>, rows: usize, cols: usize, gt: GeoTransform) -> Raster<f64> {
        let mut r = Raster::from_vec(data, rows, cols).unwrap();
        r.set_transform(gt);
        r
    }

    #[test]
    fn test_intersection_crops_to_overlap() {
        let a = raster((0..16).map(f64::from).collect(), 4, 4, GeoTransform::new(0.0, 4.0, 1.0, -1.0));
        let b = raster(vec![1.0; 16], 4, 4, GeoTransform::new(2.0, 4.0, 1.0, -1.0));

        let out = align_rasters(&[&a, &b], &[ResampleMode::Nearest; 2], &AlignParams::default()).unwrap();
        assert_eq!(out[0].shape(), (4, 2));
        assert_eq!(out[0].get(0, 0).unwrap(), 2.0);
        assert!(out[0].same_grid(&out[1]));
    }

    #[test]
    fn test_union_pads_with_nodata() {
        let a = raster(vec![1.0; 4], 2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        let b = raster(vec![2.0; 4], 2, 2, GeoTransform::new(2.0, 2.0, 1.0, -1.0));
        let params = AlignParams { extent: ExtentMode::Union, ..Default::default() };

        let out = align_rasters(&[&a, &b], &[ResampleMode::Nearest; 2], &params).unwrap();
        assert_eq!(out[0].shape(), (2, 4));
        assert!(!out[0].is_valid_at(0, 3));
        assert_eq!(out[1].get(1, 3).unwrap(), 2.0);
    }

    #[test]
    fn test_disjoint_intersection_is_empty() {
        let a = raster(vec![1.0; 4], 2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        let b = raster(vec![1.0; 4], 2, 2, GeoTransform::new(10.0, 2.0, 1.0, -1.0));
        let err = align_rasters(&[&a, &b], &[ResampleMode::Nearest; 2], &AlignParams::default()).unwrap_err();
        assert!(matches!(err, Error::EmptyExtent(_)));
    }

    #[test]
    fn test_projection_mismatch() {
        let mut a = raster(vec![1.0; 4], 2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        let mut b = a.clone();
        a.set_crs(Some(CRS::from_epsg(32630)));
        b.set_crs(Some(CRS::from_epsg(32631)));
        let err = align_rasters(&[&a, &b], &[ResampleMode::Nearest; 2], &AlignParams::default()).unwrap_err();
        assert!(matches!(err, Error::CrsMismatch(..)));

        let params = AlignParams { assume_projected: true, ..Default::default() };
        assert!(align_rasters(&[&a, &b], &[ResampleMode::Nearest; 2], &params).is_ok());
    }

    #[test]
    fn test_bilinear_refines_grid() {
        let a = raster(vec![0.0, 2.0, 0.0, 2.0], 2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        let params = AlignParams { cell_size: Some(0.5), ..Default::default() };
        let out = align_rasters(&[&a], &[ResampleMode::Bilinear], &params).unwrap();
        assert_eq!(out[0].shape(), (4, 4));
        // centers at x = 0.75 and 1.25 sit a quarter cell either side of the midpoint
        assert_relative_eq!(out[0].get(1, 1).unwrap(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(out[0].get(1, 2).unwrap(), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_mode_coarsens_categories() {
        let a = raster(vec![1.0, 1.0, 3.0, 2.0], 2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0));
        let params = AlignParams { cell_size: Some(2.0), ..Default::default() };
        let out = align_rasters(&[&a], &[ResampleMode::Mode], &params).unwrap();
        assert_eq!(out[0].shape(), (1, 1));
        assert_eq!(out[0].get(0, 0).unwrap(), 1.0);
    }
}
