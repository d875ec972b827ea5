//! Hydrological routing over D-infinity flow graphs
//!
//! - Pit filling: Priority-Flood depression filling (Barnes 2014)
//! - Flat resolution: drainable gradient over flats (Garbrecht & Martz 1997)
//! - Flow direction: D-infinity continuous angles (Tarboton 1997)
//! - Flow graph: per-cell outflow direction and weight
//! - Route flux: source/absorption transport producing flux and loss
//! - Derived operators: accumulation, streams, flow length,
//!   distance to stream, load exported to the stream

mod distance_to_stream;
mod export;
mod fill_pits;
mod flats;
mod flow_accumulation;
mod flow_direction_dinf;
pub(crate) mod flow_graph;
mod flow_length;
mod route_flux;
mod stream_network;

pub use distance_to_stream::distance_to_stream;
pub use export::{pixel_amount_exported, stream_reach_probability};
pub use fill_pits::{fill_pits, FillPits, FillPitsParams};
pub use flats::{resolve_flats, FlatParams, FlatResolution, ResolveFlats};
pub use flow_accumulation::{flow_accumulation, FlowAccumulation};
pub use flow_direction_dinf::{flow_direction_dinf, FlowDirectionDinf, NO_FLOW};
pub use flow_graph::{
    build_flow_graph, FlowGraph, FlowGraphParams, Receiver, NO_OUTFLOW, OUTFLOW_NODATA, WEIGHT_NODATA,
};
pub use flow_length::flow_length;
pub use route_flux::{route_flux, AbsorptionMode, MassBalance, RouteFluxParams, RouteFluxResult};
pub use stream_network::{stream_threshold, stream_thresholds, StreamParams, StreamThreshold, STREAM_NODATA};
