//! Amount of a per-pixel load that reaches the stream
//!
//! Each cell retains a fraction of what passes through it (its retention
//! efficiency). The probability that load leaving a cell reaches a stream
//! is propagated upstream from the stream cells and combined through the
//! outflow weights the same way flux is.

use routedem_core::raster::Raster;
use routedem_core::{CancelFlag, Result};

use super::flow_graph::FlowGraph;

/// Probability that load from each cell reaches a stream.
///
/// 1 on stream cells, `(1 − efficiency) · Σ w · P(receiver)` elsewhere.
/// Sinks off the stream, boundary receivers and receivers without a
/// defined probability contribute 0. NaN where efficiency is nodata.
pub fn stream_reach_probability(
    graph: &FlowGraph,
    stream: &Raster<u8>,
    efficiency: &Raster<f64>,
    cancel: &CancelFlag,
) -> Result<Raster<f64>> {
    graph.direction.ensure_same_grid(stream, "stream")?;
    graph.direction.ensure_same_grid(efficiency, "efficiency")?;

    let mut probability = graph.direction.derive(f64::NAN, Some(f64::NAN));
    let mut clamped = 0usize;

    graph.visit_downstream_first(cancel, |row, col| {
        let p = if stream.value_at(row, col) == Some(1.0) {
            1.0
        } else if let Some(eff) = efficiency.value_at(row, col).filter(|v| !v.is_nan()) {
            if !(0.0..=1.0).contains(&eff) {
                clamped += 1;
            }
            let reach: f64 = graph
                .receivers(row, col)
                .filter_map(|rx| {
                    let (r, c) = rx.cell?;
                    let pr = unsafe { probability.get_unchecked(r, c) };
                    (!pr.is_nan()).then(|| rx.weight * pr)
                })
                .sum();
            (1.0 - eff.clamp(0.0, 1.0)) * reach
        } else {
            f64::NAN
        };
        unsafe { probability.set_unchecked(row, col, p) };
    })?;

    if clamped > 0 {
        tracing::warn!(cells = clamped, "retention efficiency outside [0, 1] was clamped");
    }
    Ok(probability)
}

/// Per-pixel load that reaches the stream: `load · P(reach stream)`.
///
/// NaN where load or efficiency is nodata.
pub fn pixel_amount_exported(
    graph: &FlowGraph,
    stream: &Raster<u8>,
    efficiency: &Raster<f64>,
    load: &Raster<f64>,
    cancel: &CancelFlag,
) -> Result<Raster<f64>> {
    graph.direction.ensure_same_grid(load, "load")?;
    let probability = stream_reach_probability(graph, stream, efficiency, cancel)?;

    let (rows, cols) = graph.shape();
    let mut exported = graph.direction.derive(f64::NAN, Some(f64::NAN));
    let mut total = 0.0;
    for row in 0..rows {
        for col in 0..cols {
            let p = unsafe { probability.get_unchecked(row, col) };
            if let Some(l) = load.value_at(row, col).filter(|_| !p.is_nan()) {
                unsafe { exported.set_unchecked(row, col, l * p) };
                total += l * p;
            }
        }
    }
    tracing::debug!(total, "pixel export done");
    Ok(exported)
}
