//! Flow accumulation algorithm
//!
//! Counts the cells draining through each cell, itself included, along the
//! D-infinity flow graph. Fractional counts arise where flow splits.

use routedem_core::raster::Raster;
use routedem_core::{Algorithm, CancelFlag, Error, Result};

use super::flow_graph::FlowGraph;
use super::route_flux::{route_flux, RouteFluxParams};

/// Flow accumulation algorithm
#[derive(Debug, Clone, Default)]
pub struct FlowAccumulation;

impl Algorithm for FlowAccumulation {
    type Input = FlowGraph;
    type Output = Raster<f64>;
    type Params = ();
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Accumulation"
    }

    fn description(&self) -> &'static str {
        "Upstream contributing cell count along the D-infinity flow graph"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        flow_accumulation(&input, &CancelFlag::new())
    }
}

/// Calculate flow accumulation over a flow graph.
///
/// Every cell contributes 1 and nothing is absorbed, so a headwater cell
/// has accumulation 1. Cells outside the DEM are NaN.
pub fn flow_accumulation(graph: &FlowGraph, cancel: &CancelFlag) -> Result<Raster<f64>> {
    let ones = graph.direction.derive(1.0, None);
    let zeros = graph.direction.derive(0.0, None);
    let routed = route_flux(graph, &ones, &zeros, None, &RouteFluxParams::default(), cancel)?;
    Ok(routed.flux)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::{build_flow_graph, flow_direction_dinf, FlowGraphParams};
    use approx::assert_relative_eq;

    fn accumulate(dem: Raster<f64>) -> Raster<f64> {
        let angles = flow_direction_dinf(&dem).unwrap();
        let graph = build_flow_graph(&angles, &FlowGraphParams::default()).unwrap();
        flow_accumulation(&graph, &CancelFlag::new()).unwrap()
    }

    #[test]
    fn test_single_cell_basin() {
        let dem = Raster::from_vec(vec![9.0, 9.0, 9.0, 9.0, 0.0, 9.0, 9.0, 9.0, 9.0], 3, 3).unwrap();
        let acc = accumulate(dem);
        assert_relative_eq!(acc.get(1, 1).unwrap(), 9.0, epsilon = 1e-9);
        for (i, &a) in acc.data().iter().enumerate() {
            if i != 4 {
                assert_relative_eq!(a, 1.0);
            }
        }
    }

    #[test]
    fn test_eastward_slope() {
        let acc = accumulate(Raster::from_vec(vec![4.0, 3.0, 2.0, 1.0, 0.0], 1, 5).unwrap());
        assert_eq!(acc.data().as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_split_flow_is_fractional() {
        // (1,0) is lowest on a plane tilted to the south-west, flow splits
        // between the neighbors bracketing the descent
        let mut dem = Raster::new(3, 3);
        for row in 0..3 {
            for col in 0..3 {
                dem.set(row, col, col as f64 * 2.0 - row as f64).unwrap();
            }
        }
        let acc = accumulate(dem);
        let total: f64 = acc.data().iter().sum();
        assert!(total > 9.0);
        assert!(acc.data().iter().any(|a| a.fract().abs() > 1e-6));
    }
}
