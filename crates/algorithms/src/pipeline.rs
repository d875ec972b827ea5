//! End-to-end routing runs persisted into a [`Workspace`]
//!
//! `compute` conditions a DEM and derives the flow graph and its terrain
//! products once; `route` and `export` then reuse the persisted flow graph
//! for any number of source/absorption or load/efficiency inputs.
//!
//! Every run stages its rasters in workspace scratch and moves them into
//! place only once all of them are written, so a failed or cancelled run
//! leaves the workspace as it found it. Float products keep NaN as their
//! nodata on disk.

use routedem_core::io::read_geotiff;
use routedem_core::raster::Raster;
use routedem_core::{CancelFlag, Error, Layer, Result, Workspace};

use crate::hydrology::{
    build_flow_graph, distance_to_stream, fill_pits, flow_accumulation, flow_direction_dinf, flow_length,
    pixel_amount_exported, resolve_flats, route_flux, stream_threshold, stream_thresholds, FillPitsParams,
    FlatParams, FlowGraph, FlowGraphParams, MassBalance, RouteFluxParams,
};
use crate::terrain::{slope, SlopeParams};

/// Steps of [`RouteDem::compute`], reported as they start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FillPits,
    ResolveFlats,
    Slope,
    FlowDirection,
    FlowGraph,
    Accumulation,
    FlowLength,
    Streams,
    DistanceToStream,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::FillPits => "Filling pits",
            Stage::ResolveFlats => "Resolving flats",
            Stage::Slope => "Computing slope",
            Stage::FlowDirection => "Computing D-infinity flow direction",
            Stage::FlowGraph => "Building flow graph",
            Stage::Accumulation => "Accumulating flow",
            Stage::FlowLength => "Computing flow length",
            Stage::Streams => "Extracting streams",
            Stage::DistanceToStream => "Computing distance to stream",
        }
    }
}

/// Parameters for [`RouteDem::compute`]
#[derive(Debug, Clone)]
pub struct RouteDemParams {
    /// Fill depressions before resolving flats
    pub fill_pits: bool,
    pub flats: FlatParams,
    /// Write `slope.tif` of the resolved DEM
    pub slope: Option<SlopeParams>,
    pub flow_graph: FlowGraphParams,
    /// Accumulation threshold of `stream.tif`
    pub flow_threshold: f64,
    /// Extra stream masks as (lower, upper, step)
    pub thresholds: Option<(f64, f64, f64)>,
}

impl Default for RouteDemParams {
    fn default() -> Self {
        Self {
            fill_pits: true,
            flats: FlatParams::default(),
            slope: None,
            flow_graph: FlowGraphParams::default(),
            flow_threshold: 1000.0,
            thresholds: None,
        }
    }
}

/// What `compute` produced, beyond the files it wrote
#[derive(Debug, Clone)]
pub struct ComputeSummary {
    pub flats_resolved: usize,
    pub pit_cells: usize,
    pub sinks: usize,
    pub stream_cells: usize,
    pub max_accumulation: f64,
}

/// Routing runs over one workspace
#[derive(Debug, Clone)]
pub struct RouteDem {
    workspace: Workspace,
    cancel: CancelFlag,
}

impl RouteDem {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            cancel: CancelFlag::new(),
        }
    }

    /// Share a cancellation flag with the caller.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Condition `dem` and persist every terrain layer.
    ///
    /// `progress` is called as each stage starts. Nothing reaches the
    /// workspace unless every stage succeeds.
    pub fn compute<F>(&self, dem: &Raster<f64>, params: &RouteDemParams, mut progress: F) -> Result<ComputeSummary>
    where
        F: FnMut(Stage),
    {
        check_dem(dem)?;
        let ws = &self.workspace;
        let cancel = &self.cancel;
        let mut staged = ws.stage()?;

        let conditioned = if params.fill_pits {
            progress(Stage::FillPits);
            fill_pits(dem, &FillPitsParams::default(), cancel)?
        } else {
            dem.clone()
        };

        progress(Stage::ResolveFlats);
        let flats = resolve_flats(&conditioned, &params.flats, cancel)?;
        staged.write(&flats.dem, ws.path(Layer::ResolvedDem))?;

        match &params.slope {
            Some(slope_params) => {
                progress(Stage::Slope);
                staged.write(&slope(&flats.dem, slope_params)?, ws.path(Layer::Slope))?;
            }
            // a slope layer from an earlier run would no longer match
            None => staged.remove(ws.path(Layer::Slope)),
        }

        progress(Stage::FlowDirection);
        let angles = flow_direction_dinf(&flats.dem)?;
        staged.write(&angles, ws.path(Layer::FlowDirection))?;

        progress(Stage::FlowGraph);
        let graph = build_flow_graph(&angles, &params.flow_graph)?;
        staged.write(&graph.direction, ws.path(Layer::OutflowDirection))?;
        staged.write(&graph.weight, ws.path(Layer::OutflowWeights))?;

        progress(Stage::Accumulation);
        let accumulation = flow_accumulation(&graph, cancel)?;
        staged.write(&accumulation, ws.path(Layer::FlowAccumulation))?;

        progress(Stage::FlowLength);
        staged.write(&flow_length(&graph)?, ws.path(Layer::FlowLength))?;

        progress(Stage::Streams);
        let stream = stream_threshold(&accumulation, params.flow_threshold, cancel)?;
        staged.write(&stream, ws.path(Layer::Stream))?;
        if let Some((lower, upper, step)) = params.thresholds {
            for (t, mask) in stream_thresholds(&accumulation, lower, upper, step, cancel)? {
                staged.write(&mask, ws.stream_path(t))?;
            }
        }

        progress(Stage::DistanceToStream);
        let distance = distance_to_stream(&graph, &stream, cancel)?;
        staged.write(&distance, ws.path(Layer::DistanceToStream))?;

        cancel.check()?;
        staged.commit()?;

        let summary = ComputeSummary {
            flats_resolved: flats.flats_resolved,
            pit_cells: flats.pit_cells.len(),
            sinks: graph.sinks.len(),
            stream_cells: stream.data().iter().filter(|&&v| v == 1).count(),
            max_accumulation: accumulation.data().iter().copied().filter(|v| !v.is_nan()).fold(0.0, f64::max),
        };
        tracing::info!(
            root = %ws.root().display(),
            flats = summary.flats_resolved,
            sinks = summary.sinks,
            streams = summary.stream_cells,
            "terrain layers written"
        );
        Ok(summary)
    }

    /// Flow graph of an already resolved DEM.
    ///
    /// When the workspace holds a resolved DEM identical to `resolved_dem`
    /// cell for cell, its persisted D-infinity angles are reused; any other
    /// surface gets a fresh flow direction pass.
    pub fn flow_graph_for(&self, resolved_dem: &Raster<f64>, params: &FlowGraphParams) -> Result<FlowGraph> {
        check_dem(resolved_dem)?;
        let angles = match self.persisted_angles_for(resolved_dem)? {
            Some(angles) => {
                tracing::info!(root = %self.workspace.root().display(), "reusing persisted flow direction");
                angles
            }
            None => flow_direction_dinf(resolved_dem)?,
        };
        build_flow_graph(&angles, params)
    }

    fn persisted_angles_for(&self, resolved_dem: &Raster<f64>) -> Result<Option<Raster<f64>>> {
        let dem_path = self.workspace.path(Layer::ResolvedDem);
        let angles_path = self.workspace.path(Layer::FlowDirection);
        if !dem_path.is_file() || !angles_path.is_file() {
            return Ok(None);
        }
        let persisted = read_geotiff::<f64, _>(&dem_path, None)?;
        if !same_surface(&persisted, resolved_dem) {
            tracing::debug!(path = %dem_path.display(), "persisted resolved DEM differs");
            return Ok(None);
        }
        let angles = read_geotiff::<f64, _>(&angles_path, None)?;
        if angles.ensure_same_grid(resolved_dem, "flow_direction").is_err() {
            return Ok(None);
        }
        Ok(Some(angles))
    }

    /// Reload the flow graph written by [`RouteDem::compute`].
    pub fn load_flow_graph(&self) -> Result<FlowGraph> {
        let direction = read_geotiff::<u8, _>(self.workspace.path(Layer::OutflowDirection), None)?;
        let weight = read_geotiff::<f64, _>(self.workspace.path(Layer::OutflowWeights), None)?;
        FlowGraph::from_rasters(direction, weight)
    }

    /// Route `source` with `absorption` and persist flux and loss.
    pub fn route(
        &self,
        graph: &FlowGraph,
        source: &Raster<f64>,
        absorption: &Raster<f64>,
        aoi: Option<&Raster<u8>>,
        params: &RouteFluxParams,
    ) -> Result<MassBalance> {
        let routed = route_flux(graph, source, absorption, aoi, params, &self.cancel)?;
        let mut staged = self.workspace.stage()?;
        staged.write(&routed.flux, self.workspace.path(Layer::Flux))?;
        staged.write(&routed.loss, self.workspace.path(Layer::Loss))?;
        staged.commit()?;
        Ok(routed.balance)
    }

    /// Compute and persist the per-pixel load reaching the stream.
    pub fn export(
        &self,
        graph: &FlowGraph,
        stream: &Raster<u8>,
        efficiency: &Raster<f64>,
        load: &Raster<f64>,
    ) -> Result<Raster<f64>> {
        let exported = pixel_amount_exported(graph, stream, efficiency, load, &self.cancel)?;
        let mut staged = self.workspace.stage()?;
        staged.write(&exported, self.workspace.path(Layer::Exported))?;
        staged.commit()?;
        Ok(exported)
    }
}

/// Reject DEMs with no usable elevations.
fn check_dem(dem: &Raster<f64>) -> Result<()> {
    let (rows, cols) = dem.shape();
    let mut valid = 0usize;
    for row in 0..rows {
        for col in 0..cols {
            match dem.value_at(row, col) {
                Some(z) if !z.is_finite() => {
                    return Err(Error::Data(format!("non-finite elevation {} at ({}, {})", z, row, col)))
                }
                Some(_) => valid += 1,
                None => {}
            }
        }
    }
    if valid == 0 {
        return Err(Error::NoValidData("DEM".into()));
    }
    Ok(())
}

/// Same grid, and the same value or nodata in every cell
fn same_surface(a: &Raster<f64>, b: &Raster<f64>) -> bool {
    if a.ensure_same_grid(b, "resolved_dem").is_err() {
        return false;
    }
    let (rows, cols) = a.shape();
    (0..rows).all(|row| (0..cols).all(|col| a.value_at(row, col) == b.value_at(row, col)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::{NO_OUTFLOW, OUTFLOW_NODATA};
    use routedem_core::GeoTransform;
    use std::fs;
    use tempfile::TempDir;

    fn basin() -> Raster<f64> {
        let mut dem = Raster::from_vec(vec![9.0, 9.0, 9.0, 9.0, 0.0, 9.0, 9.0, 9.0, 9.0], 3, 3).unwrap();
        dem.set_transform(GeoTransform::new(0.0, 3.0, 1.0, -1.0));
        dem
    }

    fn strip(values: Vec<f64>) -> Raster<f64> {
        let n = values.len();
        let mut dem = Raster::from_vec(values, 1, n).unwrap();
        dem.set_transform(GeoTransform::new(0.0, 1.0, 1.0, -1.0));
        dem
    }

    fn files_in(dir: &std::path::Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_compute_writes_layout() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let params = RouteDemParams {
            fill_pits: false,
            slope: Some(SlopeParams::default()),
            flow_threshold: 5.0,
            thresholds: Some((2.0, 4.0, 2.0)),
            ..Default::default()
        };

        let mut stages = Vec::new();
        let summary = run.compute(&basin(), &params, |s| stages.push(s)).unwrap();
        assert_eq!(summary.sinks, 1);
        assert_eq!(summary.stream_cells, 1);
        assert!(!stages.contains(&Stage::FillPits));
        assert!(stages.contains(&Stage::Slope));

        for layer in Layer::ALL {
            if matches!(layer, Layer::Flux | Layer::Loss | Layer::Exported) {
                continue;
            }
            assert!(run.workspace().path(layer).is_file(), "{} missing", layer);
        }
        assert!(run.workspace().stream_path(2.0).is_file());
        assert!(run.workspace().stream_path(4.0).is_file());
        // scratch is gone once the layers are in place
        assert_eq!(files_in(run.workspace().root()), 2);

        let acc = read_geotiff::<f64, _>(run.workspace().path(Layer::FlowAccumulation), None).unwrap();
        assert_eq!(acc.get(1, 1).unwrap(), 9.0);

        let slope = read_geotiff::<f64, _>(run.workspace().path(Layer::Slope), None).unwrap();
        assert_eq!(slope.get(1, 1).unwrap(), 0.0);
        assert!(slope.value_at(0, 0).is_none());
    }

    #[test]
    fn test_slope_layer_dropped_when_not_requested() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let with_slope = RouteDemParams {
            fill_pits: false,
            slope: Some(SlopeParams::default()),
            ..Default::default()
        };
        run.compute(&basin(), &with_slope, |_| {}).unwrap();
        assert!(run.workspace().path(Layer::Slope).is_file());

        let without = RouteDemParams {
            fill_pits: false,
            ..Default::default()
        };
        run.compute(&basin(), &without, |_| {}).unwrap();
        assert!(!run.workspace().path(Layer::Slope).exists());
    }

    #[test]
    fn test_cancelled_compute_leaves_workspace_empty() {
        let dir = TempDir::new().unwrap();
        let cancel = CancelFlag::new();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap()).with_cancel(cancel.clone());
        cancel.cancel();

        let dem = strip((0..5000).rev().map(f64::from).collect());
        let params = RouteDemParams {
            fill_pits: false,
            ..Default::default()
        };
        let err = run.compute(&dem, &params, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let ws = run.workspace();
        assert_eq!(files_in(&ws.intermediate_dir()), 0);
        assert_eq!(files_in(&ws.output_dir()), 0);
        assert_eq!(files_in(ws.root()), 2);
    }

    #[test]
    fn test_failed_compute_keeps_earlier_layers() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let params = RouteDemParams {
            fill_pits: false,
            ..Default::default()
        };
        run.compute(&basin(), &params, |_| {}).unwrap();
        let before = fs::read(run.workspace().path(Layer::FlowAccumulation)).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let cancelled = run.clone().with_cancel(cancel);
        let east = strip(vec![4.0, 3.0, 2.0, 1.0, 0.0]);
        assert!(cancelled.compute(&east, &params, |_| {}).is_err());

        let after = fs::read(run.workspace().path(Layer::FlowAccumulation)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_route_reuses_persisted_graph() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let dem = basin();
        run.compute(
            &dem,
            &RouteDemParams {
                fill_pits: false,
                ..Default::default()
            },
            |_| {},
        )
        .unwrap();

        let graph = run.load_flow_graph().unwrap();
        let source = dem.like(1.0);
        let absorption = dem.like(0.0);
        let balance = run.route(&graph, &source, &absorption, None, &RouteFluxParams::default()).unwrap();
        assert_eq!(balance.sink_flux, 9.0);

        let flux = read_geotiff::<f64, _>(run.workspace().path(Layer::Flux), None).unwrap();
        assert_eq!(flux.get(1, 1).unwrap(), 9.0);
        assert!(flux.nodata().map_or(false, f64::is_nan));
    }

    #[test]
    fn test_negative_flux_survives_persisting() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let dem = strip(vec![2.0, 1.0, 0.0]);
        let graph = run.flow_graph_for(&dem, &FlowGraphParams::default()).unwrap();

        // a withdrawal of one unit at the top of the strip
        let source = strip(vec![-1.0, 0.0, 0.0]);
        run.route(&graph, &source, &dem.like(0.0), None, &RouteFluxParams::default())
            .unwrap();

        let flux = read_geotiff::<f64, _>(run.workspace().path(Layer::Flux), None).unwrap();
        for col in 0..3 {
            assert_eq!(flux.value_at(0, col), Some(-1.0));
        }
    }

    #[test]
    fn test_flow_graph_for_other_dem_on_same_grid() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let params = RouteDemParams {
            fill_pits: false,
            ..Default::default()
        };
        let east = strip(vec![4.0, 3.0, 2.0, 1.0, 0.0]);
        run.compute(&east, &params, |_| {}).unwrap();

        let west = strip(vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        let graph = run.flow_graph_for(&west, &FlowGraphParams::default()).unwrap();
        let directions: Vec<u8> = graph.direction.data().iter().copied().collect();
        assert_eq!(directions, vec![NO_OUTFLOW, 4, 4, 4, 4]);

        // the surface compute resolved is picked up from the workspace
        let resolved = read_geotiff::<f64, _>(run.workspace().path(Layer::ResolvedDem), None).unwrap();
        let graph = run.flow_graph_for(&resolved, &FlowGraphParams::default()).unwrap();
        let directions: Vec<u8> = graph.direction.data().iter().copied().collect();
        assert_eq!(directions, vec![0, 0, 0, 0, NO_OUTFLOW]);
        assert!(!directions.contains(&OUTFLOW_NODATA));
    }

    #[test]
    fn test_rejects_empty_dem() {
        let dir = TempDir::new().unwrap();
        let run = RouteDem::new(Workspace::create(dir.path()).unwrap());
        let mut dem = Raster::filled(2, 2, -9999.0);
        dem.set_nodata(Some(-9999.0));
        let err = run.compute(&dem, &RouteDemParams::default(), |_| {}).unwrap_err();
        assert!(matches!(err, Error::NoValidData(_)));
    }
}
