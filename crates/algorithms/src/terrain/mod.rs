//! Terrain derivatives of the conditioned DEM

mod slope;

pub use slope::{slope, Slope, SlopeParams, SlopeUnits};
