//! Memory-mapped raster views and scratch buffers backed by scratch files
//!
//! A [`MappedRaster`] is filled one strip or tile at a time straight from
//! the decoder, so opening a raster never holds more than one chunk of it
//! on the heap. [`ScratchBuffer`] gives the routing passes per-cell working
//! arrays that move to a mapped file once the grid passes a size threshold.

use crate::error::{Error, Result};
use crate::io::open_raster;
use crate::raster::{BlockIterator, GeoTransform, Raster, RasterElement, RasterStatistics};
use memmap2::{Mmap, MmapMut};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SAMPLE_BYTES: usize = std::mem::size_of::<f64>();

/// A decoded strip or tile, placed on the raster grid
pub(crate) struct Window<'a> {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
    /// Samples between the starts of consecutive rows
    pub stride: usize,
    pub samples: &'a [f64],
}

/// Decode the first band of `path` window by window with the active backend.
fn read_windows<F>(path: &Path, visit: F) -> Result<()>
where
    F: FnMut(Window<'_>) -> Result<()>,
{
    #[cfg(feature = "gdal")]
    {
        crate::io::gdal_io::read_windows(path, visit)
    }
    #[cfg(not(feature = "gdal"))]
    {
        crate::io::native::read_windows(path, visit)
    }
}

/// A scratch file of `len` bytes under `dir`, zero-filled and mapped writable
fn scratch_map(dir: &Path, len: usize) -> Result<(NamedTempFile, MmapMut)> {
    let scratch = NamedTempFile::new_in(dir)?;
    scratch.as_file().set_len(len as u64)?;
    // SAFETY: the file is private to the caller and only reached through
    // this map
    let map = unsafe { MmapMut::map_mut(scratch.as_file())? };
    Ok((scratch, map))
}

/// A read-only f64 view of a raster whose cells live in a memory-mapped
/// scratch file instead of the heap.
///
/// The scratch file is created inside the given directory and removed when
/// the view is dropped.
#[derive(Debug)]
pub struct MappedRaster {
    map: Mmap,
    rows: usize,
    cols: usize,
    transform: GeoTransform,
    nodata: Option<f64>,
    // keeps the backing file alive for the lifetime of the map
    _scratch: NamedTempFile,
}

impl MappedRaster {
    /// Copy an in-memory `raster` into a scratch file under `scratch_dir`.
    pub fn from_raster<T: RasterElement>(raster: &Raster<T>, scratch_dir: &Path) -> Result<Self> {
        let (rows, cols) = raster.shape();
        let nodata = raster.nodata().and_then(|nd| nd.to_f64());
        let (scratch, mut map) = scratch_map(scratch_dir, rows * cols * SAMPLE_BYTES)?;

        for (cell, &v) in map.chunks_exact_mut(SAMPLE_BYTES).zip(raster.data().iter()) {
            let v = if raster.is_nodata(v) {
                nodata.unwrap_or(f64::NAN)
            } else {
                v.to_f64().unwrap_or(f64::NAN)
            };
            cell.copy_from_slice(&v.to_le_bytes());
        }

        Self::finish(scratch, map, rows, cols, *raster.transform(), nodata)
    }

    fn finish(
        scratch: NamedTempFile,
        map: MmapMut,
        rows: usize,
        cols: usize,
        transform: GeoTransform,
        nodata: Option<f64>,
    ) -> Result<Self> {
        map.flush()?;
        let map = map.make_read_only()?;
        if map.len() != rows * cols * SAMPLE_BYTES {
            return Err(Error::Invariant(format!(
                "mapped {} bytes for a {}x{} raster",
                map.len(),
                rows,
                cols
            )));
        }
        Ok(Self {
            map,
            rows,
            cols,
            transform,
            nodata,
            _scratch: scratch,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Raw value at (row, col), `None` when out of bounds
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        let offset = (row * self.cols + col) * SAMPLE_BYTES;
        let bytes: [u8; SAMPLE_BYTES] = self.map[offset..offset + SAMPLE_BYTES].try_into().ok()?;
        Some(f64::from_le_bytes(bytes))
    }

    /// Value at (row, col), `None` for nodata
    pub fn value_at(&self, row: usize, col: usize) -> Option<f64> {
        self.get(row, col).filter(|v| !v.is_nodata(self.nodata))
    }

    /// Statistics over valid cells, read block by block
    pub fn statistics(&self) -> RasterStatistics<f64> {
        let mut stats = RasterStatistics {
            min: None,
            max: None,
            mean: None,
            sum: 0.0,
            valid_count: 0,
            nodata_count: 0,
        };
        for block in BlockIterator::with_default_size(self.rows, self.cols) {
            for r in 0..block.rows {
                for c in 0..block.cols {
                    let (row, col) = block.to_source_coords(r, c);
                    match self.value_at(row, col) {
                        Some(v) => {
                            stats.min = Some(stats.min.map_or(v, |m: f64| m.min(v)));
                            stats.max = Some(stats.max.map_or(v, |m: f64| m.max(v)));
                            stats.sum += v;
                            stats.valid_count += 1;
                        }
                        None => stats.nodata_count += 1,
                    }
                }
            }
        }
        if stats.valid_count > 0 {
            stats.mean = Some(stats.sum / stats.valid_count as f64);
        }
        stats
    }
}

/// Map the first band of the raster at `path` as an f64 view under
/// `scratch_dir`, decoding one strip or tile at a time.
pub fn map_raster<P: AsRef<Path>>(path: P, scratch_dir: &Path) -> Result<MappedRaster> {
    let path = path.as_ref();
    let info = open_raster(path)?;
    let (rows, cols) = (info.height, info.width);
    let (scratch, mut map) = scratch_map(scratch_dir, rows * cols * SAMPLE_BYTES)?;

    let mut windows = 0usize;
    read_windows(path, |w| {
        if w.row + w.rows > rows || w.col + w.cols > cols {
            return Err(Error::raster_io(
                path,
                format!("window at ({}, {}) of {}x{} overruns the grid", w.row, w.col, w.rows, w.cols),
            ));
        }
        for r in 0..w.rows {
            let line = &w.samples[r * w.stride..r * w.stride + w.cols];
            let start = ((w.row + r) * cols + w.col) * SAMPLE_BYTES;
            let target = &mut map[start..start + w.cols * SAMPLE_BYTES];
            for (cell, v) in target.chunks_exact_mut(SAMPLE_BYTES).zip(line) {
                cell.copy_from_slice(&v.to_le_bytes());
            }
        }
        windows += 1;
        Ok(())
    })?;
    tracing::debug!(path = %path.display(), windows, rows, cols, "raster mapped");

    MappedRaster::finish(scratch, map, rows, cols, info.transform, info.nodata)
}

/// Cell types a [`ScratchBuffer`] can hold. All-zero bytes read as zero.
pub trait ScratchElement: Copy + Default + sealed::Sealed {}

impl ScratchElement for u8 {}
impl ScratchElement for u32 {}
impl ScratchElement for f64 {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u32 {}
    impl Sealed for f64 {}
}

/// When per-cell scratch moves off the heap
#[derive(Debug, Clone)]
pub struct ScratchPolicy {
    /// Buffers of at least this many cells are memory-mapped
    pub mmap_threshold: usize,
    /// Directory for mapped scratch files, the system temp dir if unset
    pub dir: Option<PathBuf>,
}

impl Default for ScratchPolicy {
    fn default() -> Self {
        Self {
            mmap_threshold: 1 << 26,
            dir: None,
        }
    }
}

impl ScratchPolicy {
    /// Always map, with files under `dir`.
    pub fn mapped_in<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            mmap_threshold: 0,
            dir: Some(dir.into()),
        }
    }
}

enum Storage<T> {
    Heap(Vec<T>),
    Mapped {
        map: MmapMut,
        len: usize,
        _scratch: NamedTempFile,
        _cells: PhantomData<T>,
    },
}

/// A zero-initialised per-cell working array, on the heap or in a mapped
/// scratch file that is removed on drop.
pub struct ScratchBuffer<T: ScratchElement> {
    storage: Storage<T>,
}

impl<T: ScratchElement> ScratchBuffer<T> {
    pub fn zeroed(len: usize, policy: &ScratchPolicy) -> Result<Self> {
        if len == 0 || len < policy.mmap_threshold {
            return Ok(Self {
                storage: Storage::Heap(vec![T::default(); len]),
            });
        }
        let dir = policy.dir.clone().unwrap_or_else(std::env::temp_dir);
        let (scratch, map) = scratch_map(&dir, len * std::mem::size_of::<T>())?;
        tracing::debug!(cells = len, dir = %dir.display(), "scratch buffer mapped");
        Ok(Self {
            storage: Storage::Mapped {
                map,
                len,
                _scratch: scratch,
                _cells: PhantomData,
            },
        })
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.storage, Storage::Mapped { .. })
    }
}

impl<T: ScratchElement> Deref for ScratchBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        match &self.storage {
            Storage::Heap(v) => v.as_slice(),
            // SAFETY: the map is page aligned, holds `len` cells and is
            // zero-filled, a valid bit pattern for every ScratchElement
            Storage::Mapped { map, len, .. } => unsafe { std::slice::from_raw_parts(map.as_ptr().cast::<T>(), *len) },
        }
    }
}

impl<T: ScratchElement> DerefMut for ScratchBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Heap(v) => v.as_mut_slice(),
            // SAFETY: as in `deref`, and the map is borrowed mutably
            Storage::Mapped { map, len, .. } => unsafe {
                std::slice::from_raw_parts_mut(map.as_mut_ptr().cast::<T>(), *len)
            },
        }
    }
}

impl<T: ScratchElement> std::fmt::Debug for ScratchBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
