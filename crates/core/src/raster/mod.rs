//! Raster data structures and operations

mod blocks;
mod element;
mod geotransform;
mod grid;
pub mod neighbors;
mod vectorize;

pub use blocks::{Block, BlockIterator, DEFAULT_BLOCK_SIZE};
pub use element::{DataType, RasterElement};
pub use geotransform::{Extent, GeoTransform};
pub use grid::{Raster, RasterStatistics};
pub use vectorize::{vectorize, PixelOp};
