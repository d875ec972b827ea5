//! Main Raster type

use crate::crs::CRS;
use crate::error::{Error, Result};
use crate::raster::{Extent, GeoTransform, RasterElement};
use ndarray::{s, Array2, ArrayView2, ArrayViewMut2};

/// Relative tolerance when comparing geotransforms of two grids
const GRID_TOLERANCE: f64 = 1e-9;

/// A georeferenced 2D raster grid.
///
/// `Raster<T>` stores values of type `T` in a 2D grid with associated
/// geographic metadata (transform, CRS and nodata sentinel).
///
/// # Example
///
/// ```
/// use routedem_core::Raster;
///
/// let mut dem: Raster<f64> = Raster::new(3, 3);
/// dem.set(1, 1, 42.0).unwrap();
/// assert_eq!(dem.get(1, 1).unwrap(), 42.0);
/// ```
#[derive(Debug, Clone)]
pub struct Raster<T: RasterElement> {
    /// Raster data stored in row-major order (row, col)
    data: Array2<T>,
    transform: GeoTransform,
    crs: Option<CRS>,
    nodata: Option<T>,
}

impl<T: RasterElement> Raster<T> {
    /// Create a new raster filled with zeros
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::from_array(Array2::zeros((rows, cols)))
    }

    /// Create a new raster filled with a specific value
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self::from_array(Array2::from_elem((rows, cols), value))
    }

    /// Create a raster from existing row-major data
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidDimensions {
                width: cols,
                height: rows,
            });
        }

        let array = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;

        Ok(Self::from_array(array))
    }

    /// Create a raster from an ndarray
    pub fn from_array(data: Array2<T>) -> Self {
        Self {
            data,
            transform: GeoTransform::default(),
            crs: None,
            nodata: None,
        }
    }

    /// Create a zero-filled raster on the same grid with a different cell type.
    /// The nodata value is not carried over.
    pub fn with_same_meta<U: RasterElement>(&self, rows: usize, cols: usize) -> Raster<U> {
        Raster {
            data: Array2::zeros((rows, cols)),
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: None,
        }
    }

    /// A raster on the same grid, every cell set to `fill`, with `nodata` as sentinel.
    pub fn derive<U: RasterElement>(&self, fill: U, nodata: Option<U>) -> Raster<U> {
        Raster {
            data: Array2::from_elem(self.data.dim(), fill),
            transform: self.transform,
            crs: self.crs.clone(),
            nodata,
        }
    }

    /// Create a raster with the same dimensions and metadata, filled with a value
    pub fn like(&self, fill_value: T) -> Self {
        self.derive(fill_value, self.nodata)
    }

    // Dimensions

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // Data access

    /// Get value at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        self.data
            .get((row, col))
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
    }

    /// Get value at (row, col) without bounds checking
    ///
    /// # Safety
    /// Caller must ensure row < self.rows() and col < self.cols()
    pub unsafe fn get_unchecked(&self, row: usize, col: usize) -> T {
        unsafe { *self.data.uget((row, col)) }
    }

    /// Set value at (row, col)
    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        if row >= self.rows() || col >= self.cols() {
            return Err(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            });
        }
        self.data[(row, col)] = value;
        Ok(())
    }

    /// Set value at (row, col) without bounds checking
    ///
    /// # Safety
    /// Caller must ensure row < self.rows() and col < self.cols()
    pub unsafe fn set_unchecked(&mut self, row: usize, col: usize, value: T) {
        unsafe {
            *self.data.uget_mut((row, col)) = value;
        }
    }

    pub fn view(&self) -> ArrayView2<'_, T> {
        self.data.view()
    }

    pub fn view_mut(&mut self) -> ArrayViewMut2<'_, T> {
        self.data.view_mut()
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<T> {
        &mut self.data
    }

    // Block access

    fn check_window(&self, row: usize, col: usize, nrows: usize, ncols: usize) -> Result<()> {
        if row + nrows > self.rows() || col + ncols > self.cols() {
            return Err(Error::IndexOutOfBounds {
                row: row + nrows.saturating_sub(1),
                col: col + ncols.saturating_sub(1),
                rows: self.rows(),
                cols: self.cols(),
            });
        }
        Ok(())
    }

    /// Borrow the window starting at (row, col).
    pub fn window(&self, row: usize, col: usize, nrows: usize, ncols: usize) -> Result<ArrayView2<'_, T>> {
        self.check_window(row, col, nrows, ncols)?;
        Ok(self.data.slice(s![row..row + nrows, col..col + ncols]))
    }

    /// Copy the window starting at (row, col) into a dense array.
    pub fn read_block(&self, row: usize, col: usize, nrows: usize, ncols: usize) -> Result<Array2<T>> {
        Ok(self.window(row, col, nrows, ncols)?.to_owned())
    }

    /// Overwrite the window starting at (row, col) with `block`.
    pub fn write_block(&mut self, row: usize, col: usize, block: ArrayView2<'_, T>) -> Result<()> {
        let (nrows, ncols) = block.dim();
        self.check_window(row, col, nrows, ncols)?;
        self.data
            .slice_mut(s![row..row + nrows, col..col + ncols])
            .assign(&block);
        Ok(())
    }

    // Metadata

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: GeoTransform) {
        self.transform = transform;
    }

    pub fn crs(&self) -> Option<&CRS> {
        self.crs.as_ref()
    }

    pub fn set_crs(&mut self, crs: Option<CRS>) {
        self.crs = crs;
    }

    pub fn nodata(&self) -> Option<T> {
        self.nodata
    }

    pub fn set_nodata(&mut self, nodata: Option<T>) {
        self.nodata = nodata;
    }

    /// Cell size (assumes square cells)
    pub fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    /// Geographic bounds of the grid
    pub fn extent(&self) -> Extent {
        self.transform.extent(self.cols(), self.rows())
    }

    /// Whether `other` lies on exactly the same grid: shape, origin and cell size.
    pub fn same_grid<U: RasterElement>(&self, other: &Raster<U>) -> bool {
        if self.shape() != other.shape() {
            return false;
        }
        let a = self.transform.to_gdal();
        let b = other.transform.to_gdal();
        let scale = self.cell_size().max(other.cell_size()).max(1.0);
        a.iter()
            .zip(b.iter())
            .all(|(x, y)| (x - y).abs() <= GRID_TOLERANCE * scale.max(x.abs()))
    }

    /// Fail with a config error unless `other` lies on this raster's grid.
    pub fn ensure_same_grid<U: RasterElement>(&self, other: &Raster<U>, name: &str) -> Result<()> {
        if self.shape() != other.shape() {
            let (er, ec) = self.shape();
            let (ar, ac) = other.shape();
            return Err(Error::SizeMismatch { er, ec, ar, ac });
        }
        if !self.same_grid(other) {
            return Err(Error::GridMismatch {
                name: name.to_string(),
                reason: format!(
                    "geotransform {:?} differs from {:?}",
                    other.transform.to_gdal(),
                    self.transform.to_gdal()
                ),
            });
        }
        Ok(())
    }

    /// Convert every cell to `U`. Nodata cells (and values `U` cannot
    /// represent) become `U`'s nodata: the converted sentinel, or the type default.
    pub fn cast<U: RasterElement>(&self) -> Raster<U> {
        let nodata = self
            .nodata
            .and_then(|nd| nd.to_f64())
            .and_then(U::from_f64)
            .unwrap_or_else(U::default_nodata);
        let src_nodata = self.nodata;
        let data = self.data.mapv(|v| {
            if v.is_nodata(src_nodata) {
                nodata
            } else {
                v.to_f64().and_then(U::from_f64).unwrap_or(nodata)
            }
        });
        Raster {
            data,
            transform: self.transform,
            crs: self.crs.clone(),
            nodata: Some(nodata),
        }
    }

    // Coordinate conversion

    /// Pixel center in map coordinates
    pub fn pixel_to_geo(&self, col: usize, row: usize) -> (f64, f64) {
        self.transform.pixel_to_geo(col, row)
    }

    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        self.transform.geo_to_pixel(x, y)
    }

    // Value checks

    pub fn is_nodata(&self, value: T) -> bool {
        value.is_nodata(self.nodata)
    }

    /// Whether (row, col) is inside the grid and holds data
    pub fn is_valid_at(&self, row: usize, col: usize) -> bool {
        match self.data.get((row, col)) {
            Some(&v) => !self.is_nodata(v),
            None => false,
        }
    }

    /// Value at (row, col) as f64, `None` for nodata or out of bounds
    pub fn value_at(&self, row: usize, col: usize) -> Option<f64> {
        let v = *self.data.get((row, col))?;
        if self.is_nodata(v) {
            None
        } else {
            v.to_f64()
        }
    }

    // Statistics

    /// Min, max, mean and count of valid cells
    pub fn statistics(&self) -> RasterStatistics<T> {
        let mut min: Option<T> = None;
        let mut max: Option<T> = None;
        let mut sum: f64 = 0.0;
        let mut count: usize = 0;

        for &value in self.data.iter() {
            if self.is_nodata(value) {
                continue;
            }

            if min.map_or(true, |m| value < m) {
                min = Some(value);
            }
            if max.map_or(true, |m| value > m) {
                max = Some(value);
            }

            if let Some(v) = value.to_f64() {
                sum += v;
                count += 1;
            }
        }

        let mean = if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        };

        RasterStatistics {
            min,
            max,
            mean,
            sum,
            valid_count: count,
            nodata_count: self.len() - count,
        }
    }
}

/// Basic statistics for a raster
#[derive(Debug, Clone)]
pub struct RasterStatistics<T> {
    pub min: Option<T>,
    pub max: Option<T>,
    pub mean: Option<f64>,
    pub sum: f64,
    pub valid_count: usize,
    pub nodata_count: usize,
}
