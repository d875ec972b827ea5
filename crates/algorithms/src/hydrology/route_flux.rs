//! Flux transport along the flow graph
//!
//! Moves a per-cell source downslope in one topological pass (Kahn's
//! algorithm over the in-degree of every cell). Each cell removes a
//! fraction of what passes through it, given by its absorption rate, and
//! hands the rest to its receivers according to the outflow weights.

use std::collections::VecDeque;

use routedem_core::io::{ScratchBuffer, ScratchPolicy};
use routedem_core::raster::Raster;
use routedem_core::{CancelFlag, Error, Result};
use serde::Serialize;

use super::flow_graph::FlowGraph;

/// How absorption applies to the mass at a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsorptionMode {
    /// Absorb from local source plus inflow:
    /// `loss = A·(S + in)`, `flux = (1 − A)·(S + in)`
    #[default]
    SourceAndFlux,
    /// Absorb from inflow only, local source passes untouched:
    /// `loss = A·in`, `flux = (1 − A)·in + S`
    FluxOnly,
}

/// Parameters for [`route_flux`]
#[derive(Debug, Clone, Default)]
pub struct RouteFluxParams {
    pub mode: AbsorptionMode,
    /// Where the per-cell in-degree and inflow arrays live
    pub scratch: ScratchPolicy,
}

/// Where the routed mass ended up
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MassBalance {
    /// Source injected by routed cells
    pub total_source: f64,
    /// Mass absorbed along the way
    pub total_loss: f64,
    /// Mass that came to rest in sinks
    pub sink_flux: f64,
    /// Mass that left the grid, the DEM or the AOI
    pub boundary_loss: f64,
}

impl MassBalance {
    /// Source minus everything accounted for; zero up to rounding
    pub fn residual(&self) -> f64 {
        self.total_source - self.total_loss - self.sink_flux - self.boundary_loss
    }

    /// Whether the residual is within `rel_tol` of the total source
    pub fn is_balanced(&self, rel_tol: f64) -> bool {
        self.residual().abs() <= rel_tol * self.total_source.abs().max(1.0)
    }
}

/// Output of [`route_flux`]
#[derive(Debug, Clone)]
pub struct RouteFluxResult {
    /// Mass leaving each cell; NaN where undefined
    pub flux: Raster<f64>,
    /// Mass absorbed at each cell; NaN where undefined
    pub loss: Raster<f64>,
    pub balance: MassBalance,
}

/// Route `source` through `graph`, absorbing `absorption` at each cell.
///
/// `aoi`, when given, is a mask on the same grid: cells where it is not 1
/// take no part in the routing and mass flowing into them is counted as
/// boundary loss. Where `source` or `absorption` is nodata the cell passes
/// its inflow through unchanged and its own outputs are nodata.
///
/// Absorption rates outside [0, 1] are clamped.
///
/// Fails with [`Error::CyclicFlowGraph`] if some cell never becomes ready,
/// which cannot happen for a graph built from a resolved DEM.
pub fn route_flux(
    graph: &FlowGraph,
    source: &Raster<f64>,
    absorption: &Raster<f64>,
    aoi: Option<&Raster<u8>>,
    params: &RouteFluxParams,
    cancel: &CancelFlag,
) -> Result<RouteFluxResult> {
    let grid = &graph.direction;
    grid.ensure_same_grid(source, "source")?;
    grid.ensure_same_grid(absorption, "absorption")?;
    if let Some(mask) = aoi {
        grid.ensure_same_grid(mask, "aoi")?;
    }

    let (rows, cols) = graph.shape();
    let n = rows * cols;
    let mut active = ScratchBuffer::<u8>::zeroed(n, &params.scratch)?;
    for (i, cell) in active.iter_mut().enumerate() {
        let (row, col) = (i / cols, i % cols);
        if graph.is_valid(row, col) && aoi.map_or(true, |m| m.get(row, col).map_or(false, |v| v == 1)) {
            *cell = 1;
        }
    }

    let mut in_degree = ScratchBuffer::<u32>::zeroed(n, &params.scratch)?;
    for i in (0..n).filter(|&i| active[i] == 1) {
        for rx in graph.receivers(i / cols, i % cols) {
            if let Some((r, c)) = rx.cell {
                if active[r * cols + c] == 1 {
                    in_degree[r * cols + c] += 1;
                }
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| active[i] == 1 && in_degree[i] == 0).collect();
    let mut inflow = ScratchBuffer::<f64>::zeroed(n, &params.scratch)?;
    let mut flux = grid.derive(f64::NAN, Some(f64::NAN));
    let mut loss = grid.derive(f64::NAN, Some(f64::NAN));
    let mut balance = MassBalance::default();
    let mut clamped = 0usize;
    let mut popped = 0usize;

    while let Some(i) = queue.pop_front() {
        popped += 1;
        if popped % 4096 == 0 {
            cancel.check()?;
        }
        let (row, col) = (i / cols, i % cols);

        let s = source.value_at(row, col).filter(|v| !v.is_nan());
        let a = absorption.value_at(row, col).filter(|v| !v.is_nan());
        let incoming = inflow[i];

        let out = match (s, a) {
            (Some(s), Some(a)) => {
                let a = if (0.0..=1.0).contains(&a) {
                    a
                } else {
                    clamped += 1;
                    a.clamp(0.0, 1.0)
                };
                let (out, lost) = match params.mode {
                    AbsorptionMode::SourceAndFlux => {
                        let total = s + incoming;
                        ((1.0 - a) * total, a * total)
                    }
                    AbsorptionMode::FluxOnly => ((1.0 - a) * incoming + s, a * incoming),
                };
                balance.total_source += s;
                balance.total_loss += lost;
                unsafe {
                    flux.set_unchecked(row, col, out);
                    loss.set_unchecked(row, col, lost);
                }
                out
            }
            _ => incoming,
        };

        let mut drained = false;
        for rx in graph.receivers(row, col) {
            drained = true;
            let share = rx.weight * out;
            match rx.cell.map(|(r, c)| r * cols + c).filter(|&j| active[j] == 1) {
                Some(j) => {
                    inflow[j] += share;
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        queue.push_back(j);
                    }
                }
                None => balance.boundary_loss += share,
            }
        }
        if !drained {
            balance.sink_flux += out;
        }
    }

    if let Some(first) = (0..n).find(|&i| active[i] == 1 && in_degree[i] > 0) {
        let unresolved = in_degree.iter().filter(|&&d| d > 0).count();
        return Err(Error::CyclicFlowGraph {
            unresolved,
            row: first / cols,
            col: first % cols,
        });
    }

    if clamped > 0 {
        tracing::warn!(cells = clamped, "absorption outside [0, 1] was clamped");
    }
    tracing::debug!(
        cells = popped,
        source = balance.total_source,
        loss = balance.total_loss,
        sinks = balance.sink_flux,
        boundary = balance.boundary_loss,
        "route flux done"
    );

    Ok(RouteFluxResult { flux, loss, balance })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::flow_graph::{NO_OUTFLOW, WEIGHT_NODATA};
    use approx::assert_relative_eq;

    /// 1 x n strip draining east into a sink at the last cell
    fn east_strip(n: usize) -> FlowGraph {
        let mut dirs = vec![0u8; n];
        let mut weights = vec![1.0; n];
        dirs[n - 1] = NO_OUTFLOW;
        weights[n - 1] = WEIGHT_NODATA;
        FlowGraph::from_rasters(
            Raster::from_vec(dirs, 1, n).unwrap(),
            Raster::from_vec(weights, 1, n).unwrap(),
        )
        .unwrap()
    }

    fn strip(values: &[f64]) -> Raster<f64> {
        Raster::from_vec(values.to_vec(), 1, values.len()).unwrap()
    }

    fn run(graph: &FlowGraph, s: &[f64], a: &[f64], mode: AbsorptionMode) -> RouteFluxResult {
        route_flux(graph, &strip(s), &strip(a), None, &RouteFluxParams { mode, ..Default::default() }, &CancelFlag::new()).unwrap()
    }

    #[test]
    fn test_absorption_terminates_flux() {
        let res = run(&east_strip(3), &[1.0, 1.0, 1.0], &[0.0, 1.0, 0.0], AbsorptionMode::SourceAndFlux);
        assert_eq!(res.flux.data().as_slice().unwrap(), &[1.0, 0.0, 1.0]);
        assert_eq!(res.loss.data().as_slice().unwrap(), &[0.0, 2.0, 0.0]);
        assert_relative_eq!(res.balance.sink_flux, 1.0);
        assert!(res.balance.is_balanced(1e-9));
    }

    #[test]
    fn test_flux_only_keeps_local_source() {
        let res = run(&east_strip(3), &[1.0, 1.0, 1.0], &[0.0, 1.0, 0.0], AbsorptionMode::FluxOnly);
        assert_eq!(res.flux.data().as_slice().unwrap(), &[1.0, 1.0, 2.0]);
        assert_eq!(res.loss.data().as_slice().unwrap(), &[0.0, 1.0, 0.0]);
        assert!(res.balance.is_balanced(1e-9));
    }

    #[test]
    fn test_full_absorption() {
        let res = run(&east_strip(4), &[1.0, 2.0, 3.0, 4.0], &[1.0; 4], AbsorptionMode::SourceAndFlux);
        assert!(res.flux.data().iter().all(|&f| f == 0.0));
        assert_eq!(res.loss.data().as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_nodata_source_passes_inflow() {
        let mut s = strip(&[1.0, -9999.0, 1.0]);
        s.set_nodata(Some(-9999.0));
        let res = route_flux(
            &east_strip(3),
            &s,
            &strip(&[0.0; 3]),
            None,
            &RouteFluxParams::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert!(res.flux.get(0, 1).unwrap().is_nan());
        assert!(res.loss.get(0, 1).unwrap().is_nan());
        assert_eq!(res.flux.get(0, 2).unwrap(), 2.0);
        assert!(res.balance.is_balanced(1e-9));
    }

    #[test]
    fn test_aoi_boundary_loss() {
        let aoi = Raster::from_vec(vec![1u8, 1, 0], 1, 3).unwrap();
        let res = route_flux(
            &east_strip(3),
            &strip(&[1.0; 3]),
            &strip(&[0.0; 3]),
            Some(&aoi),
            &RouteFluxParams::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(res.flux.get(0, 1).unwrap(), 2.0);
        assert!(res.flux.get(0, 2).unwrap().is_nan());
        assert_relative_eq!(res.balance.boundary_loss, 2.0);
        assert_relative_eq!(res.balance.total_source, 2.0);
        assert!(res.balance.is_balanced(1e-9));
    }

    #[test]
    fn test_absorption_is_clamped() {
        let res = run(&east_strip(2), &[1.0, 1.0], &[1.5, -0.5], AbsorptionMode::SourceAndFlux);
        assert_eq!(res.loss.get(0, 0).unwrap(), 1.0);
        assert_eq!(res.flux.get(0, 1).unwrap(), 1.0);
    }

    #[test]
    fn test_cycle_is_reported() {
        // two cells pointing at each other
        let graph = FlowGraph::from_rasters(
            Raster::from_vec(vec![0u8, 4], 1, 2).unwrap(),
            Raster::from_vec(vec![1.0, 1.0], 1, 2).unwrap(),
        )
        .unwrap();
        let err = route_flux(
            &graph,
            &strip(&[1.0, 1.0]),
            &strip(&[0.0, 0.0]),
            None,
            &RouteFluxParams::default(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CyclicFlowGraph { unresolved: 2, row: 0, col: 0 }));
    }

    #[test]
    fn test_mapped_scratch_matches_heap() {
        let dir = tempfile::TempDir::new().unwrap();
        let graph = east_strip(6);
        let s = strip(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let a = strip(&[0.1, 0.0, 0.5, 0.2, 0.0, 0.3]);

        let heap = route_flux(&graph, &s, &a, None, &RouteFluxParams::default(), &CancelFlag::new()).unwrap();
        let params = RouteFluxParams {
            scratch: ScratchPolicy::mapped_in(dir.path()),
            ..Default::default()
        };
        let mapped = route_flux(&graph, &s, &a, None, &params, &CancelFlag::new()).unwrap();

        assert_eq!(heap.flux.data(), mapped.flux.data());
        assert_eq!(heap.loss.data(), mapped.loss.data());
        assert_eq!(heap.balance, mapped.balance);
        // scratch files are gone once routing returns
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_cancelled() {
        let cancel = CancelFlag::new();
        cancel.cancel();
        let n = 5000;
        let res = route_flux(
            &east_strip(n),
            &strip(&vec![1.0; n]),
            &strip(&vec![0.0; n]),
            None,
            &RouteFluxParams::default(),
            &cancel,
        );
        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
