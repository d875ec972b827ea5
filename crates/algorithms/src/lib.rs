//! # routedem Algorithms
//!
//! D-infinity routing operators for routedem.
//!
//! ## Modules
//!
//! - **hydrology**: pit filling, flat resolution, D-infinity flow direction,
//!   flow graph, route flux and the operators derived from it
//! - **terrain**: slope of the conditioned DEM
//! - **statistics**: per-polygon aggregation of raster values
//! - **pipeline**: `RouteDem`, end-to-end runs persisted into a workspace

pub(crate) mod maybe_rayon;

pub mod hydrology;
pub mod pipeline;
pub mod statistics;
pub mod terrain;

pub use pipeline::{ComputeSummary, RouteDem, RouteDemParams, Stage};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::hydrology::{
        build_flow_graph, distance_to_stream, fill_pits, flow_accumulation, flow_direction_dinf, flow_length,
        pixel_amount_exported, resolve_flats, route_flux, stream_threshold, AbsorptionMode, FlatParams,
        FlowGraph, FlowGraphParams, MassBalance, RouteFluxParams, RouteFluxResult,
    };
    pub use crate::pipeline::{RouteDem, RouteDemParams};
    pub use crate::statistics::{aggregate_raster_values, AggregateParams, ZoneSummary};
    pub use crate::terrain::{slope, SlopeParams, SlopeUnits};
    pub use routedem_core::prelude::*;
}
