//! Per-cell flow length
//!
//! The distance water travels leaving a cell, averaged over the two
//! receivers by their outflow weights.

use routedem_core::raster::{neighbors, Raster};
use routedem_core::Result;

use super::flow_graph::FlowGraph;
use crate::maybe_rayon::collect_rows;

/// Travel distance from each cell to its receivers.
///
/// `cell_size · (f_k · w + f_{k+1} · (1 − w))` where `f` is 1 for cardinal
/// and √2 for diagonal neighbors. NaN for sinks and cells outside the DEM.
pub fn flow_length(graph: &FlowGraph) -> Result<Raster<f64>> {
    let (rows, cols) = graph.shape();
    let cell_size = graph.cell_size();

    let data = collect_rows(rows, cols, |row| {
        (0..cols)
            .map(|col| {
                if graph.is_sink(row, col) || !graph.is_valid(row, col) {
                    return f64::NAN;
                }
                graph
                    .receivers(row, col)
                    .map(|rx| rx.weight * neighbors::distance(rx.k, cell_size))
                    .sum()
            })
            .collect()
    })?;

    let mut output = graph.direction.derive(f64::NAN, Some(f64::NAN));
    *output.data_mut() = data;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::{build_flow_graph, FlowGraphParams};
    use approx::assert_relative_eq;
    use routedem_core::GeoTransform;
    use std::f64::consts::{FRAC_PI_4, SQRT_2};

    fn graph(angles: Vec<f64>, rows: usize, cols: usize, cell_size: f64) -> FlowGraph {
        let mut r = Raster::from_vec(angles, rows, cols).unwrap();
        r.set_transform(GeoTransform::new(0.0, rows as f64 * cell_size, cell_size, -cell_size));
        build_flow_graph(&r, &FlowGraphParams::default()).unwrap()
    }

    #[test]
    fn test_cardinal_and_sink() {
        let g = graph(vec![0.0, 0.0, 0.0, 0.0, -1.0], 1, 5, 30.0);
        let len = flow_length(&g).unwrap();
        for col in 0..4 {
            assert_relative_eq!(len.get(0, col).unwrap(), 30.0);
        }
        assert!(len.get(0, 4).unwrap().is_nan());
    }

    #[test]
    fn test_split_between_cardinal_and_diagonal() {
        // w = 0.5 between east and north-east
        let g = graph(vec![FRAC_PI_4 * 0.5], 1, 1, 10.0);
        let len = flow_length(&g).unwrap();
        assert_relative_eq!(len.get(0, 0).unwrap(), 10.0 * (0.5 + 0.5 * SQRT_2), epsilon = 1e-9);
    }
}
