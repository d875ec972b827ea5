//! Routing invariants checked on synthetic terrain.
//!
//! The terrain is a tilted, terraced surface with pseudo-random noise and a
//! few punched pits, so it exercises pit filling, flats that spill to lower
//! ground, flats that only reach the grid edge, and split D-infinity flow.

use approx::assert_relative_eq;
use routedem_algorithms::hydrology::{
    build_flow_graph, distance_to_stream, fill_pits, flow_accumulation, flow_direction_dinf, resolve_flats,
    route_flux, stream_threshold, FillPitsParams, FlatParams, FlowGraph, FlowGraphParams, RouteFluxParams,
    NO_OUTFLOW,
};
use routedem_core::raster::neighbors;
use routedem_core::{CancelFlag, GeoTransform, Raster};

const ROWS: usize = 40;
const COLS: usize = 52;

/// Deterministic noise in [0, 1)
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn terrain(seed: u64) -> Raster<f64> {
    let mut rng = Lcg(seed);
    let mut dem = Raster::new(ROWS, COLS);
    dem.set_transform(GeoTransform::new(500.0, 900.0, 5.0, -5.0));
    for row in 0..ROWS {
        for col in 0..COLS {
            let z = 0.4 * row as f64 + 0.25 * col as f64 + 1.5 * rng.next();
            // terraces leave wide flats
            dem.set(row, col, (z / 2.0).floor() * 2.0 + 100.0).unwrap();
        }
    }
    for &(row, col) in &[(10, 10), (20, 33), (31, 7)] {
        dem.set(row, col, 90.0).unwrap();
    }
    dem.set(0, 0, -9999.0).unwrap();
    dem.set(25, 40, -9999.0).unwrap();
    dem.set_nodata(Some(-9999.0));
    dem
}

struct Routed {
    resolved: Raster<f64>,
    graph: FlowGraph,
}

fn condition(seed: u64) -> Routed {
    let cancel = CancelFlag::new();
    let filled = fill_pits(&terrain(seed), &FillPitsParams::default(), &cancel).unwrap();
    let flats = resolve_flats(&filled, &FlatParams::default(), &cancel).unwrap();
    assert!(flats.flats_resolved > 0);
    assert!(flats.pit_cells.is_empty(), "filled terrain leaves no pit flats");
    let angles = flow_direction_dinf(&flats.dem).unwrap();
    let graph = build_flow_graph(&angles, &FlowGraphParams::default()).unwrap();
    Routed {
        resolved: flats.dem,
        graph,
    }
}

fn random_field(seed: u64, like: &Raster<f64>) -> Raster<f64> {
    let mut rng = Lcg(seed);
    let mut r = like.like(0.0);
    r.set_nodata(None);
    r.data_mut().mapv_inplace(|_| rng.next());
    r
}

#[test]
fn interior_cells_drain_after_conditioning() {
    for seed in [1, 7, 42] {
        let Routed { resolved, .. } = condition(seed);
        for row in 1..ROWS - 1 {
            for col in 1..COLS - 1 {
                let Some(z) = resolved.value_at(row, col) else { continue };
                let has_lower = neighbors::around(row, col, ROWS, COLS)
                    .any(|(_, r, c)| resolved.value_at(r, c).map_or(false, |zn| zn < z));
                // cells next to nodata are outlets, like the grid edge
                let near_nodata =
                    neighbors::around(row, col, ROWS, COLS).any(|(_, r, c)| resolved.value_at(r, c).is_none());
                assert!(has_lower || near_nodata, "seed {}: ({}, {}) has no lower neighbor", seed, row, col);
            }
        }
    }
}

#[test]
fn outflow_weights_are_fractions() {
    let Routed { graph, .. } = condition(3);
    let mut split = 0;
    for row in 0..ROWS {
        for col in 0..COLS {
            let dir = graph.direction.get(row, col).unwrap();
            if !graph.is_valid(row, col) || dir == NO_OUTFLOW {
                continue;
            }
            let w = graph.weight.get(row, col).unwrap();
            assert!((0.0..=1.0).contains(&w), "weight {} at ({}, {})", w, row, col);
            let total: f64 = graph.receivers(row, col).map(|rx| rx.weight).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-12);
            if graph.receivers(row, col).count() == 2 {
                split += 1;
            }
        }
    }
    assert!(split > 0, "terrain should produce split flow");
}

#[test]
fn flow_graph_is_acyclic() {
    let Routed { graph, .. } = condition(5);
    let mut visited = 0usize;
    graph
        .visit_downstream_first(&CancelFlag::new(), |_, _| visited += 1)
        .unwrap();
    let valid = (0..ROWS * COLS).filter(|&i| graph.is_valid(i / COLS, i % COLS)).count();
    assert_eq!(visited, valid);

    // every edge goes strictly downhill on the resolved surface
    let Routed { resolved, graph } = condition(11);
    for row in 0..ROWS {
        for col in 0..COLS {
            if !graph.is_valid(row, col) {
                continue;
            }
            let z = resolved.get(row, col).unwrap();
            for rx in graph.receivers(row, col) {
                if let Some((r, c)) = rx.cell {
                    assert!(resolved.get(r, c).unwrap() < z);
                }
            }
        }
    }
}

#[test]
fn mass_is_conserved() {
    for seed in [2, 9] {
        let Routed { resolved, graph } = condition(seed);
        let source = random_field(seed + 100, &resolved);
        let absorption = random_field(seed + 200, &resolved);
        let routed = route_flux(
            &graph,
            &source,
            &absorption,
            None,
            &RouteFluxParams::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        let b = routed.balance;
        let tol = 1e-6 * b.total_source;
        let source_sum: f64 = (0..ROWS * COLS)
            .filter(|&i| graph.is_valid(i / COLS, i % COLS))
            .map(|i| source.get(i / COLS, i % COLS).unwrap())
            .sum();
        let loss_sum: f64 = routed.loss.data().iter().filter(|v| !v.is_nan()).sum();
        let sink_sum: f64 = graph
            .sinks
            .iter()
            .map(|&(r, c)| routed.flux.get(r, c).unwrap())
            .sum();

        assert_relative_eq!(b.total_source, source_sum, epsilon = tol);
        assert_relative_eq!(b.total_loss, loss_sum, epsilon = tol);
        assert_relative_eq!(b.sink_flux, sink_sum, epsilon = tol);
        // without an AOI every receiver is a valid cell
        assert_eq!(b.boundary_loss, 0.0);
        assert!(b.residual().abs() <= tol);
    }
}

#[test]
fn stream_threshold_is_idempotent() {
    let Routed { graph, .. } = condition(4);
    let acc = flow_accumulation(&graph, &CancelFlag::new()).unwrap();
    for threshold in [2.0, 10.0, 50.0] {
        let once = stream_threshold(&acc, threshold, &CancelFlag::new()).unwrap();
        let twice = stream_threshold(&once, 1.0, &CancelFlag::new()).unwrap();
        assert_eq!(once.data(), twice.data());
    }
}

#[test]
fn accumulation_grows_downstream() {
    let Routed { graph, .. } = condition(6);
    let acc = flow_accumulation(&graph, &CancelFlag::new()).unwrap();
    for row in 0..ROWS {
        for col in 0..COLS {
            if !graph.is_valid(row, col) {
                continue;
            }
            let a = acc.get(row, col).unwrap();
            for rx in graph.receivers(row, col) {
                let Some((r, c)) = rx.cell else { continue };
                let downstream = acc.get(r, c).unwrap();
                // a receiver holds at least its own cell plus its share of this one
                assert!(downstream >= 1.0 + rx.weight * a - 1e-9);
                if rx.weight == 1.0 {
                    assert!(downstream > a);
                }
            }
        }
    }
}

#[test]
fn zero_absorption_is_linear_propagation() {
    let Routed { resolved, graph } = condition(8);
    let source = random_field(300, &resolved);
    let routed = route_flux(
        &graph,
        &source,
        &resolved.like(0.0),
        None,
        &RouteFluxParams::default(),
        &CancelFlag::new(),
    )
    .unwrap();

    // reference: push mass from high to low elevation
    let mut order: Vec<(usize, usize)> = (0..ROWS * COLS)
        .map(|i| (i / COLS, i % COLS))
        .filter(|&(r, c)| graph.is_valid(r, c))
        .collect();
    order.sort_by(|a, b| resolved.get(b.0, b.1).unwrap().total_cmp(&resolved.get(a.0, a.1).unwrap()));
    let mut expected = vec![0.0f64; ROWS * COLS];
    for &(row, col) in &order {
        let out = expected[row * COLS + col] + source.get(row, col).unwrap();
        expected[row * COLS + col] = out;
        for rx in graph.receivers(row, col) {
            if let Some((r, c)) = rx.cell {
                expected[r * COLS + c] += rx.weight * out;
            }
        }
    }

    for &(row, col) in &order {
        assert_relative_eq!(
            routed.flux.get(row, col).unwrap(),
            expected[row * COLS + col],
            max_relative = 1e-9
        );
        assert_eq!(routed.loss.get(row, col).unwrap(), 0.0);
    }
}

#[test]
fn full_absorption_keeps_everything_local() {
    let Routed { resolved, graph } = condition(10);
    let source = random_field(400, &resolved);
    let routed = route_flux(
        &graph,
        &source,
        &resolved.like(1.0),
        None,
        &RouteFluxParams::default(),
        &CancelFlag::new(),
    )
    .unwrap();
    for row in 0..ROWS {
        for col in 0..COLS {
            if !graph.is_valid(row, col) {
                continue;
            }
            assert_eq!(routed.flux.get(row, col).unwrap(), 0.0);
            assert_eq!(routed.loss.get(row, col).unwrap(), source.get(row, col).unwrap());
        }
    }
    assert_eq!(routed.balance.boundary_loss, 0.0);
}

#[test]
fn nodata_source_is_local() {
    let Routed { resolved, graph } = condition(12);
    let (row, col) = (20, 20);
    assert!(graph.is_valid(row, col));

    let mut source = random_field(500, &resolved);
    let mut absorption = random_field(600, &resolved);
    absorption.data_mut().mapv_inplace(|a| a * 0.2);

    // pass-through behaves like a cell with no source and no absorption
    source.set(row, col, 0.0).unwrap();
    absorption.set(row, col, 0.0).unwrap();
    let reference = route_flux(&graph, &source, &absorption, None, &RouteFluxParams::default(), &CancelFlag::new())
        .unwrap();

    source.set(row, col, -1.0).unwrap();
    source.set_nodata(Some(-1.0));
    let routed = route_flux(&graph, &source, &absorption, None, &RouteFluxParams::default(), &CancelFlag::new())
        .unwrap();

    assert!(routed.flux.get(row, col).unwrap().is_nan());
    for r in 0..ROWS {
        for c in 0..COLS {
            if (r, c) == (row, col) || !graph.is_valid(r, c) {
                continue;
            }
            assert_relative_eq!(
                routed.flux.get(r, c).unwrap(),
                reference.flux.get(r, c).unwrap(),
                max_relative = 1e-12
            );
        }
    }
}

#[test]
fn distance_to_stream_is_weighted_step_mean() {
    let Routed { graph, .. } = condition(13);
    let cancel = CancelFlag::new();
    let acc = flow_accumulation(&graph, &cancel).unwrap();
    let stream = stream_threshold(&acc, 10.0, &cancel).unwrap();
    let d = distance_to_stream(&graph, &stream, &cancel).unwrap();
    let cell_size = graph.cell_size();

    let mut split = 0;
    let mut reached = 0;
    for row in 0..ROWS {
        for col in 0..COLS {
            if !graph.is_valid(row, col) {
                assert!(d.get(row, col).unwrap().is_nan());
                continue;
            }
            let here = d.get(row, col).unwrap();
            if stream.get(row, col).unwrap() == 1 {
                assert_eq!(here, 0.0);
                continue;
            }
            // receivers that reach a stream, with their step lengths
            let reaching: Vec<(f64, f64)> = graph
                .receivers(row, col)
                .filter_map(|rx| {
                    let (r, c) = rx.cell?;
                    let dr = d.get(r, c).unwrap();
                    (!dr.is_nan()).then(|| (rx.weight, dr + neighbors::distance(rx.k, cell_size)))
                })
                .collect();
            if reaching.is_empty() {
                assert!(here.is_nan(), "({}, {}) reaches no stream but has {}", row, col, here);
                continue;
            }
            reached += 1;
            if reaching.len() == 2 {
                split += 1;
            }
            let total: f64 = reaching.iter().map(|(w, _)| w).sum();
            let mean: f64 = reaching.iter().map(|(w, len)| w * len).sum::<f64>() / total;
            assert_relative_eq!(here, mean, max_relative = 1e-12);
            assert!(here >= cell_size - 1e-9);
        }
    }
    assert!(reached > 0);
    assert!(split > 0, "terrain should produce split paths to the stream");
}
