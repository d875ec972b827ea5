//! Error types for routedem

use std::path::PathBuf;
use thiserror::Error;

/// Broad classification of an [`Error`], used by front ends to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A raster or polygon file cannot be opened, read, written or created
    Io,
    /// Mismatched grids, missing fields, out-of-range parameters, empty extents
    Config,
    /// Inputs that are well formed but unusable (nodata-only, unresolvable flats)
    Data,
    /// An internal invariant was violated (cyclic flow graph, negative weights)
    Invariant,
    /// The caller cancelled the operation
    Cancelled,
}

/// Main error type for routedem operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot access raster {path}: {reason}")]
    RasterIo { path: PathBuf, reason: String },

    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("Grid mismatch for '{name}': {reason}")]
    GridMismatch { name: String, reason: String },

    #[error("CRS mismatch: {0} vs {1}")]
    CrsMismatch(String, String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Empty extent after alignment ({0})")]
    EmptyExtent(String),

    #[error("Missing field '{field}' in {path}")]
    MissingField { field: String, path: PathBuf },

    #[error("No valid data in '{0}'")]
    NoValidData(String),

    #[error("Flat at ({row}, {col}) cannot be resolved: {reason}")]
    UnresolvableFlat { row: usize, col: usize, reason: String },

    #[error("Invalid data: {0}")]
    Data(String),

    #[error("Flow graph is not acyclic: {unresolved} cells never drained (first at ({row}, {col}))")]
    CyclicFlowGraph { unresolved: usize, row: usize, col: usize },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("GDAL error: {0}")]
    #[cfg(feature = "gdal")]
    Gdal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a [`Error::RasterIo`] for `path`.
    pub fn raster_io(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::RasterIo {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) | Error::RasterIo { .. } => ErrorKind::Io,
            #[cfg(feature = "gdal")]
            Error::Gdal(_) => ErrorKind::Io,
            Error::InvalidDimensions { .. }
            | Error::IndexOutOfBounds { .. }
            | Error::SizeMismatch { .. }
            | Error::GridMismatch { .. }
            | Error::CrsMismatch(..)
            | Error::UnsupportedDataType(_)
            | Error::InvalidParameter { .. }
            | Error::EmptyExtent(_)
            | Error::MissingField { .. } => ErrorKind::Config,
            Error::NoValidData(_) | Error::UnresolvableFlat { .. } | Error::Data(_) | Error::Other(_) => {
                ErrorKind::Data
            }
            Error::CyclicFlowGraph { .. } | Error::Invariant(_) => ErrorKind::Invariant,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(feature = "gdal")]
impl From<gdal::errors::GdalError> for Error {
    fn from(e: gdal::errors::GdalError) -> Self {
        Error::Gdal(e.to_string())
    }
}

/// Result type alias for routedem operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::raster_io("dem.tif", "missing").kind(), ErrorKind::Io);
        assert_eq!(
            Error::EmptyExtent("intersection".into()).kind(),
            ErrorKind::Config
        );
        assert_eq!(
            Error::CyclicFlowGraph { unresolved: 2, row: 0, col: 1 }.kind(),
            ErrorKind::Invariant
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_raster_io_message_carries_path() {
        let err = Error::raster_io("/data/dem.tif", "no such file");
        assert!(err.to_string().contains("/data/dem.tif"));
    }
}
