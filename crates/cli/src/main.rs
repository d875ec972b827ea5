//! route-dem: D-infinity routing from the command line

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use routedem_algorithms::hydrology::{AbsorptionMode, FlatParams, FlowGraph, FlowGraphParams, RouteFluxParams};
use routedem_algorithms::statistics::{aggregate_raster_values, AggregateParams};
use routedem_algorithms::{RouteDem, RouteDemParams};
use routedem_algorithms::terrain::SlopeParams;
use routedem_core::io::{
    align_rasters, map_raster, open_raster, read_geotiff, AlignParams, ExtentMode, ResampleMode, ScratchPolicy,
};
use routedem_core::vector::{FeatureCollection, PolygonLayer};
use routedem_core::{ErrorKind, Layer, Raster, Workspace};

// ─── CLI structure ──────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "route-dem")]
#[command(author, version, about = "D-infinity flow routing over DEMs", long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Condition a DEM and write every terrain layer into a workspace
    Compute {
        /// Input DEM
        dem: PathBuf,
        /// Workspace directory
        workspace: PathBuf,
        /// Accumulation threshold for stream.tif
        #[arg(short = 't', long, default_value = "1000")]
        flow_threshold: f64,
        /// Skip pit filling
        #[arg(long)]
        no_fill_pits: bool,
        /// Largest elevation step used to drain flats
        #[arg(short, long, default_value = "0.0001")]
        epsilon: f64,
        /// Extra stream masks as LOWER:UPPER:STEP
        #[arg(long, value_parser = parse_thresholds)]
        thresholds: Option<(f64, f64, f64)>,
        /// Also write intermediate/slope.tif (percent)
        #[arg(long)]
        slope: bool,
    },
    /// Route a source raster with absorption, writing flux and loss
    Flux {
        /// Resolved DEM, e.g. intermediate/resolved_dem.tif
        resolved_dem: PathBuf,
        /// Source per cell
        source: PathBuf,
        /// Absorption rate per cell, in [0, 1]
        absorption: PathBuf,
        /// Workspace directory
        workspace: PathBuf,
        /// Area of interest polygons (GeoJSON)
        #[arg(long)]
        aoi: Option<PathBuf>,
        /// Which mass absorption applies to
        #[arg(short, long, value_enum, default_value_t = Mode::SourceAndFlux)]
        mode: Mode,
        /// Memory-map routing scratch for grids of at least this many cells
        #[arg(long)]
        mmap_above: Option<usize>,
    },
    /// Load of each cell that reaches the stream
    Export {
        /// Resolved DEM
        resolved_dem: PathBuf,
        /// Stream mask (1 = stream)
        stream: PathBuf,
        /// Retention efficiency per cell, in [0, 1]
        efficiency: PathBuf,
        /// Load per cell
        load: PathBuf,
        /// Workspace directory
        workspace: PathBuf,
    },
    /// Summarise a raster over keyed polygons, as JSON
    Aggregate {
        /// Input raster
        raster: PathBuf,
        /// Polygons (GeoJSON)
        polygons: PathBuf,
        /// Integer attribute naming each polygon
        #[arg(short, long)]
        key_field: String,
        /// Cap the sum of one key, as KEY=AMOUNT
        #[arg(long = "threshold", value_parser = parse_key_threshold)]
        thresholds: Vec<(i64, f64)>,
        /// Count nodata cells towards the mean
        #[arg(long)]
        keep_nodata: bool,
    },
    /// Show information about a raster file
    Info {
        /// Input raster file
        input: PathBuf,
        /// Also compute statistics
        #[arg(short, long)]
        stats: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    SourceAndFlux,
    FluxOnly,
}

impl From<Mode> for AbsorptionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::SourceAndFlux => AbsorptionMode::SourceAndFlux,
            Mode::FluxOnly => AbsorptionMode::FluxOnly,
        }
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("warning: a global tracing subscriber was already set");
    }
}

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn read_f64(path: &Path) -> Result<Raster<f64>> {
    let pb = spinner("Reading raster...");
    let raster: Raster<f64> =
        read_geotiff(path, None).with_context(|| format!("Failed to read {}", path.display()))?;
    pb.finish_and_clear();
    info!("Input {}: {} x {}", path.display(), raster.cols(), raster.rows());
    Ok(raster)
}

fn read_u8(path: &Path) -> Result<Raster<u8>> {
    read_geotiff(path, None).with_context(|| format!("Failed to read {}", path.display()))
}

/// Resample `inputs` onto the grid of `dem`.
fn align_to(dem: &Raster<f64>, inputs: &[&Raster<f64>]) -> Result<Vec<Raster<f64>>> {
    let mut all = vec![dem];
    all.extend_from_slice(inputs);
    let modes = vec![ResampleMode::Nearest; all.len()];
    let params = AlignParams {
        extent: ExtentMode::Dataset(0),
        ..Default::default()
    };
    let mut aligned = align_rasters(&all, &modes, &params).context("Failed to align inputs to the DEM")?;
    aligned.remove(0);
    Ok(aligned)
}

/// Flow graph of `dem`, reusing the workspace's flow direction only when
/// `dem` is the resolved DEM stored there.
fn flow_graph(run: &RouteDem, dem: &Raster<f64>) -> Result<FlowGraph> {
    let pb = spinner("Building flow graph...");
    let graph = run
        .flow_graph_for(dem, &FlowGraphParams::default())
        .context("Failed to build flow graph")?;
    pb.finish_and_clear();
    Ok(graph)
}

fn parse_thresholds(s: &str) -> Result<(f64, f64, f64), String> {
    let parts: Vec<&str> = s.split(':').collect();
    let [lower, upper, step] = parts.as_slice() else {
        return Err(format!("expected LOWER:UPPER:STEP, got '{}'", s));
    };
    let num = |v: &str| v.trim().parse::<f64>().map_err(|e| format!("'{}': {}", v, e));
    Ok((num(lower)?, num(upper)?, num(step)?))
}

fn parse_key_threshold(s: &str) -> Result<(i64, f64), String> {
    let (key, amount) = s.split_once('=').ok_or_else(|| format!("expected KEY=AMOUNT, got '{}'", s))?;
    let key = key.trim().parse::<i64>().map_err(|e| format!("key '{}': {}", key, e))?;
    let amount = amount.trim().parse::<f64>().map_err(|e| format!("amount '{}': {}", amount, e))?;
    Ok((key, amount))
}

fn done(name: &str, path: &Path, elapsed: std::time::Duration) {
    println!("{} saved to: {}", name, path.display());
    println!("  Processing time: {:.2?}", elapsed);
}

/// Exit status for a command line clap rejected; help and version are not errors.
fn usage_exit_code(err: &clap::Error) -> u8 {
    if err.use_stderr() {
        1
    } else {
        0
    }
}

/// Exit status for a failed run, taken from the first core error in the chain.
fn exit_code(err: &anyhow::Error) -> u8 {
    let kind = err
        .chain()
        .find_map(|e| e.downcast_ref::<routedem_core::Error>())
        .map(routedem_core::Error::kind);
    match kind {
        Some(ErrorKind::Config) => 2,
        Some(ErrorKind::Invariant) => 3,
        Some(ErrorKind::Cancelled) => 130,
        Some(ErrorKind::Io) | Some(ErrorKind::Data) | None => 1,
    }
}

// ─── Commands ───────────────────────────────────────────────────────────

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Compute {
            dem,
            workspace,
            flow_threshold,
            no_fill_pits,
            epsilon,
            thresholds,
            slope,
        } => {
            let dem = read_f64(&dem)?;
            let run = RouteDem::new(Workspace::create(&workspace)?);
            let params = RouteDemParams {
                fill_pits: !no_fill_pits,
                flats: FlatParams { epsilon },
                flow_threshold,
                thresholds,
                slope: slope.then(SlopeParams::default),
                ..Default::default()
            };

            let start = Instant::now();
            let pb = spinner("Starting...");
            let summary = run
                .compute(&dem, &params, |stage| pb.set_message(stage.label()))
                .context("Failed to compute terrain layers")?;
            pb.finish_and_clear();

            println!("Workspace: {}", workspace.display());
            println!("  Flats resolved: {}", summary.flats_resolved);
            if summary.pit_cells > 0 {
                println!("  Undrained flat cells: {}", summary.pit_cells);
            }
            println!("  Sinks: {}", summary.sinks);
            println!("  Stream cells: {}", summary.stream_cells);
            println!("  Max accumulation: {}", summary.max_accumulation);
            println!("  Processing time: {:.2?}", start.elapsed());
        }

        Commands::Flux {
            resolved_dem,
            source,
            absorption,
            workspace,
            aoi,
            mode,
            mmap_above,
        } => {
            let dem = read_f64(&resolved_dem)?;
            let mut aligned = align_to(&dem, &[&read_f64(&source)?, &read_f64(&absorption)?])?;
            let (Some(absorption), Some(source)) = (aligned.pop(), aligned.pop()) else {
                bail!("alignment returned fewer rasters than requested");
            };
            let mask = match aoi {
                Some(path) => {
                    let polygons = FeatureCollection::read_geojson(&path)
                        .with_context(|| format!("Failed to read AOI {}", path.display()))?;
                    let (rows, cols) = dem.shape();
                    Some(polygons.mask(dem.transform(), rows, cols))
                }
                None => None,
            };

            let run = RouteDem::new(Workspace::create(&workspace)?);
            let graph = flow_graph(&run, &dem)?;
            let scratch = run.workspace().scratch()?;
            let params = RouteFluxParams {
                mode: mode.into(),
                scratch: ScratchPolicy {
                    mmap_threshold: mmap_above.unwrap_or(ScratchPolicy::default().mmap_threshold),
                    dir: Some(scratch.path().to_path_buf()),
                },
            };
            let start = Instant::now();
            let pb = spinner("Routing flux...");
            let balance = run
                .route(&graph, &source, &absorption, mask.as_ref(), &params)
                .context("Failed to route flux")?;
            pb.finish_and_clear();

            if !balance.is_balanced(1e-6) {
                tracing::warn!(residual = balance.residual(), "mass balance residual above tolerance");
            }
            println!("{}", serde_json::to_string_pretty(&balance)?);
            done("Flux", &run.workspace().path(Layer::Flux), start.elapsed());
        }

        Commands::Export {
            resolved_dem,
            stream,
            efficiency,
            load,
            workspace,
        } => {
            let dem = read_f64(&resolved_dem)?;
            let stream = read_u8(&stream)?;
            let mut aligned = align_to(&dem, &[&read_f64(&efficiency)?, &read_f64(&load)?])?;
            let (Some(load), Some(efficiency)) = (aligned.pop(), aligned.pop()) else {
                bail!("alignment returned fewer rasters than requested");
            };

            let run = RouteDem::new(Workspace::create(&workspace)?);
            let graph = flow_graph(&run, &dem)?;
            let start = Instant::now();
            let pb = spinner("Tracing load to the stream...");
            let exported = run
                .export(&graph, &stream, &efficiency, &load)
                .context("Failed to compute exported load")?;
            pb.finish_and_clear();

            let total: f64 = exported.data().iter().filter(|v| !v.is_nan()).sum();
            println!("Total exported: {}", total);
            done("Exported load", &run.workspace().path(Layer::Exported), start.elapsed());
        }

        Commands::Aggregate {
            raster,
            polygons,
            key_field,
            thresholds,
            keep_nodata,
        } => {
            let values = read_f64(&raster)?;
            let zones = PolygonLayer::read(&polygons, &key_field)
                .with_context(|| format!("Failed to read polygons {}", polygons.display()))?;
            let params = AggregateParams {
                ignore_nodata: !keep_nodata,
                thresholds: thresholds.into_iter().collect(),
                ..Default::default()
            };
            let summaries = aggregate_raster_values(&values, &zones, &params).context("Failed to aggregate")?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }

        Commands::Info { input, stats } => {
            let header = open_raster(&input).with_context(|| format!("Failed to open {}", input.display()))?;
            let bounds = header.bounding_box();

            println!("File: {}", input.display());
            println!(
                "Dimensions: {} x {} ({} cells)",
                header.width,
                header.height,
                header.width * header.height
            );
            println!("Data type: {}", header.data_type);
            println!("Cell size: {}", header.cell_size());
            println!(
                "Bounds: ({:.6}, {:.6}) - ({:.6}, {:.6})",
                bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y
            );
            if let Some(crs) = &header.crs {
                println!("CRS: {}", crs);
            }
            if let Some(nodata) = header.nodata {
                println!("NoData: {}", nodata);
            }

            if stats {
                let scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
                let pb = spinner("Scanning cells...");
                let mapped = map_raster(&input, scratch.path())?;
                let s = mapped.statistics();
                pb.finish_and_clear();

                println!("\nStatistics:");
                if let (Some(min), Some(max)) = (s.min, s.max) {
                    println!("  Min: {:.4}", min);
                    println!("  Max: {:.4}", max);
                }
                if let Some(mean) = s.mean {
                    println!("  Mean: {:.4}", mean);
                }
                let total = (s.valid_count + s.nodata_count).max(1);
                println!(
                    "  Valid cells: {} ({:.1}%)",
                    s.valid_count,
                    100.0 * s.valid_count as f64 / total as f64
                );
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(usage_exit_code(&err));
        }
    };
    setup_logging(cli.verbose);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}
