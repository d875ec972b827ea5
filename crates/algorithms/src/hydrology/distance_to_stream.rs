//! Along-flow distance to the nearest downstream stream cell

use routedem_core::raster::{neighbors, Raster};
use routedem_core::{CancelFlag, Result};

use super::flow_graph::{FlowGraph, OUTFLOW_NODATA};

/// Distance from every cell to the stream along the flow graph.
///
/// Stream cells are 0. Elsewhere the distance is the weighted mean over
/// the receivers of `distance(receiver) + step length`. Receivers that
/// never reach a stream are left out and the remaining weights rescaled;
/// a cell none of whose receivers reach a stream is NaN.
pub fn distance_to_stream(graph: &FlowGraph, stream: &Raster<u8>, cancel: &CancelFlag) -> Result<Raster<f64>> {
    graph.direction.ensure_same_grid(stream, "stream")?;

    let cell_size = graph.cell_size();
    let mut distance = graph.direction.derive(f64::NAN, Some(f64::NAN));

    graph.visit_downstream_first(cancel, |row, col| {
        let d = if stream.value_at(row, col) == Some(1.0) {
            0.0
        } else {
            let (mut sum, mut weight) = (0.0, 0.0);
            for rx in graph.receivers(row, col) {
                let Some((r, c)) = rx.cell else { continue };
                let dr = unsafe { distance.get_unchecked(r, c) };
                if !dr.is_nan() {
                    sum += rx.weight * (dr + neighbors::distance(rx.k, cell_size));
                    weight += rx.weight;
                }
            }
            if weight > 0.0 {
                sum / weight
            } else {
                f64::NAN
            }
        };
        unsafe { distance.set_unchecked(row, col, d) };
    })?;

    let unreached = graph
        .direction
        .data()
        .iter()
        .zip(distance.data().iter())
        .filter(|(dir, d)| **dir != OUTFLOW_NODATA && d.is_nan())
        .count();
    tracing::debug!(unreached, "distance to stream done");
    Ok(distance)
}
