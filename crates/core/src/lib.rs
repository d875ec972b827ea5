//! # routedem Core
//!
//! Core types, I/O and workspace handling for the routedem routing engine.
//!
//! This crate provides:
//! - `Raster<T>`: Generic georeferenced raster grid
//! - `GeoTransform` / `Extent`: Affine georeferencing and bounding boxes
//! - `CRS`: Projection identity used for alignment checks
//! - Raster I/O (native GeoTIFF, optional GDAL), alignment and memory-mapped views
//! - `Workspace`: persisted output layout and scoped scratch directories
//! - `CancelFlag`: cooperative cancellation shared by long-running operators

pub mod cancel;
pub mod crs;
pub mod error;
pub mod io;
pub mod raster;
pub mod vector;
pub mod workspace;

pub use cancel::CancelFlag;
pub use crs::CRS;
pub use error::{Error, ErrorKind, Result};
pub use raster::{DataType, Extent, GeoTransform, Raster, RasterElement};
pub use workspace::{Layer, Workspace};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cancel::CancelFlag;
    pub use crate::crs::CRS;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::raster::{Extent, GeoTransform, Raster, RasterElement};
    pub use crate::workspace::{Layer, Workspace};
    pub use crate::Algorithm;
}

/// Core trait for routing operators.
///
/// Operators are pure functions of their raster inputs and parameters.
pub trait Algorithm {
    /// Input type for the algorithm
    type Input;
    /// Output type for the algorithm
    type Output;
    /// Parameters controlling algorithm behavior
    type Params: Default;
    /// Error type for algorithm execution
    type Error: std::error::Error;

    /// Returns the algorithm name
    fn name(&self) -> &'static str;

    /// Returns a description of what the algorithm does
    fn description(&self) -> &'static str;

    /// Execute the algorithm
    fn execute(&self, input: Self::Input, params: Self::Params) -> std::result::Result<Self::Output, Self::Error>;

    /// Execute with default parameters
    fn execute_default(&self, input: Self::Input) -> std::result::Result<Self::Output, Self::Error> {
        self.execute(input, Self::Params::default())
    }
}
