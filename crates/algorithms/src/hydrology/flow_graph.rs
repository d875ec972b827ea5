//! Flow graph built from D-infinity angles
//!
//! Every draining cell sends a fraction `w` of its outflow to neighbor `k`
//! and `1 - w` to neighbor `k + 1`, the two neighbors bracketing its flow
//! angle. The graph is stored as two rasters so it can be persisted and
//! reloaded for later routing runs on the same landscape.

use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_4, TAU};

use routedem_core::io::{ScratchBuffer, ScratchPolicy};
use routedem_core::raster::{neighbors, Raster};
use routedem_core::{CancelFlag, Error, Result};

use crate::maybe_rayon::collect_rows;

/// Direction code of a valid cell without outflow
pub const NO_OUTFLOW: u8 = 8;

/// Direction code of a cell outside the DEM
pub const OUTFLOW_NODATA: u8 = 255;

/// Weight stored for sinks and cells outside the DEM
pub const WEIGHT_NODATA: f64 = -1.0;

/// Parameters for building the flow graph
#[derive(Debug, Clone)]
pub struct FlowGraphParams {
    /// Weights this close to 1 become 1; this close to 0 hand all flow to
    /// the next neighbor.
    pub snap_tolerance: f64,
}

impl Default for FlowGraphParams {
    fn default() -> Self {
        Self { snap_tolerance: 1e-3 }
    }
}

/// A downstream receiver of a cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Receiver {
    /// Neighbor index the flow leaves through
    pub k: usize,
    /// Fraction of the outflow, in (0, 1]
    pub weight: f64,
    /// Receiving cell, `None` when it is off the grid or outside the DEM
    pub cell: Option<(usize, usize)>,
}

/// Per-cell outflow direction and weight, plus the sink set
#[derive(Debug, Clone)]
pub struct FlowGraph {
    /// Primary neighbor index 0..=7, [`NO_OUTFLOW`] or [`OUTFLOW_NODATA`]
    pub direction: Raster<u8>,
    /// Weight on the primary neighbor, [`WEIGHT_NODATA`] where undefined
    pub weight: Raster<f64>,
    /// Valid cells without outflow, row-major
    pub sinks: Vec<(usize, usize)>,
}

impl FlowGraph {
    /// Rebuild a graph from persisted direction and weight rasters.
    pub fn from_rasters(direction: Raster<u8>, weight: Raster<f64>) -> Result<Self> {
        direction.ensure_same_grid(&weight, "outflow_weights")?;

        let (rows, cols) = direction.shape();
        let mut sinks = Vec::new();
        for row in 0..rows {
            for col in 0..cols {
                let d = unsafe { direction.get_unchecked(row, col) };
                match d {
                    OUTFLOW_NODATA => {}
                    NO_OUTFLOW => sinks.push((row, col)),
                    0..=7 => {
                        let w = unsafe { weight.get_unchecked(row, col) };
                        if !(0.0..=1.0).contains(&w) {
                            return Err(Error::Invariant(format!(
                                "outflow weight {} at ({}, {}) is outside [0, 1]",
                                w, row, col
                            )));
                        }
                    }
                    other => {
                        return Err(Error::Invariant(format!(
                            "outflow direction {} at ({}, {}) is not a neighbor index",
                            other, row, col
                        )))
                    }
                }
            }
        }
        Ok(Self { direction, weight, sinks })
    }

    pub fn rows(&self) -> usize {
        self.direction.rows()
    }

    pub fn cols(&self) -> usize {
        self.direction.cols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.direction.shape()
    }

    pub fn cell_size(&self) -> f64 {
        self.direction.cell_size()
    }

    /// Whether (row, col) is inside the grid and part of the DEM
    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        matches!(self.direction.get(row, col), Ok(d) if d != OUTFLOW_NODATA)
    }

    #[inline]
    pub fn is_sink(&self, row: usize, col: usize) -> bool {
        matches!(self.direction.get(row, col), Ok(NO_OUTFLOW))
    }

    /// Receivers of (row, col) with non-zero weight. Empty for sinks and
    /// cells outside the DEM.
    pub fn receivers(&self, row: usize, col: usize) -> impl Iterator<Item = Receiver> + '_ {
        let mut out = [None, None];
        if let Ok(k @ 0..=7) = self.direction.get(row, col) {
            let k = k as usize;
            let w = unsafe { self.weight.get_unchecked(row, col) };
            for (slot, (k, weight)) in out.iter_mut().zip([(k, w), (neighbors::next(k), 1.0 - w)]) {
                if weight > 0.0 {
                    *slot = Some(Receiver {
                        k,
                        weight,
                        cell: self.receiving_cell(row, col, k),
                    });
                }
            }
        }
        out.into_iter().flatten()
    }

    /// Call `visit` on every valid cell, each one after all of its
    /// receivers. Used by operators that propagate values upstream.
    pub fn visit_downstream_first<F>(&self, cancel: &CancelFlag, visit: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.visit_downstream_first_in(&ScratchPolicy::default(), cancel, visit)
    }

    /// [`visit_downstream_first`](Self::visit_downstream_first) with the
    /// pending-receiver counts placed according to `scratch`.
    pub fn visit_downstream_first_in<F>(&self, scratch: &ScratchPolicy, cancel: &CancelFlag, mut visit: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        let (rows, cols) = self.shape();
        let n = rows * cols;
        let mut pending = ScratchBuffer::<u32>::zeroed(n, scratch)?;
        let mut queue = VecDeque::new();
        let mut valid = 0usize;

        for i in 0..n {
            let (row, col) = (i / cols, i % cols);
            if !self.is_valid(row, col) {
                continue;
            }
            valid += 1;
            pending[i] = self.receivers(row, col).filter(|rx| rx.cell.is_some()).count() as u32;
            if pending[i] == 0 {
                queue.push_back(i);
            }
        }

        let mut visited = 0usize;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            if visited % 4096 == 0 {
                cancel.check()?;
            }
            let (row, col) = (i / cols, i % cols);
            visit(row, col);

            for (_, r, c) in neighbors::around(row, col, rows, cols) {
                let j = r * cols + c;
                if pending[j] == 0 {
                    continue;
                }
                if self.receivers(r, c).any(|rx| rx.cell == Some((row, col))) {
                    pending[j] -= 1;
                    if pending[j] == 0 {
                        queue.push_back(j);
                    }
                }
            }
        }

        if visited < valid {
            let first = (0..n).find(|&i| pending[i] > 0).unwrap_or(0);
            return Err(Error::CyclicFlowGraph {
                unresolved: valid - visited,
                row: first / cols,
                col: first % cols,
            });
        }
        Ok(())
    }

    fn receiving_cell(&self, row: usize, col: usize, k: usize) -> Option<(usize, usize)> {
        let (rows, cols) = self.shape();
        neighbors::neighbor(row, col, k, rows, cols).filter(|&(r, c)| self.is_valid(r, c))
    }
}

/// Split an angle into `(k, w)`, snapping weights near 0 or 1.
fn split_angle(angle: f64, snap_tolerance: f64) -> (u8, f64) {
    let ratio = angle.rem_euclid(TAU) / FRAC_PI_4;
    let mut k = ratio.floor();
    let mut w = 1.0 - (ratio - k);
    if w < snap_tolerance {
        k += 1.0;
        w = 1.0;
    } else if w > 1.0 - snap_tolerance {
        w = 1.0;
    }
    ((k as usize % neighbors::COUNT) as u8, w)
}

/// Convert a D-infinity angle raster into a [`FlowGraph`].
///
/// Negative angles mark sinks, NaN marks cells outside the DEM.
pub fn build_flow_graph(flow_direction: &Raster<f64>, params: &FlowGraphParams) -> Result<FlowGraph> {
    if !(0.0..0.5).contains(&params.snap_tolerance) {
        return Err(Error::InvalidParameter {
            name: "snap_tolerance",
            value: params.snap_tolerance.to_string(),
            reason: "must be in [0, 0.5)".into(),
        });
    }

    let (rows, cols) = flow_direction.shape();
    let cells = collect_rows(rows, cols, |row| {
        let mut row_data = vec![(OUTFLOW_NODATA, WEIGHT_NODATA); cols];
        for col in 0..cols {
            let angle = unsafe { flow_direction.get_unchecked(row, col) };
            if angle.is_nan() || flow_direction.is_nodata(angle) {
                continue;
            }
            row_data[col] = if angle < 0.0 {
                (NO_OUTFLOW, WEIGHT_NODATA)
            } else {
                split_angle(angle, params.snap_tolerance)
            };
        }
        row_data
    })?;

    let mut direction = flow_direction.derive(OUTFLOW_NODATA, Some(OUTFLOW_NODATA));
    *direction.data_mut() = cells.mapv(|(dir, _)| dir);
    let mut weight = flow_direction.derive(WEIGHT_NODATA, Some(WEIGHT_NODATA));
    *weight.data_mut() = cells.mapv(|(_, w)| w);

    let graph = FlowGraph::from_rasters(direction, weight)?;
    tracing::debug!(rows, cols, sinks = graph.sinks.len(), "flow graph built");
    Ok(graph)
}
