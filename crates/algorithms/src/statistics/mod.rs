//! Statistics of rasters over polygon layers

pub mod aggregate;

pub use aggregate::{aggregate_raster_values, AggregateParams, ZoneSummary};
