//! Persisted output layout and scoped scratch space

use crate::error::{Error, Result};
use crate::io::{write_geotiff, IoElement};
use crate::raster::Raster;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Rasters a routing run persists, and where each one lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    ResolvedDem,
    Slope,
    FlowDirection,
    OutflowDirection,
    OutflowWeights,
    FlowAccumulation,
    FlowLength,
    Stream,
    Flux,
    Loss,
    DistanceToStream,
    Exported,
}

impl Layer {
    pub const ALL: [Layer; 12] = [
        Layer::ResolvedDem,
        Layer::Slope,
        Layer::FlowDirection,
        Layer::OutflowDirection,
        Layer::OutflowWeights,
        Layer::FlowAccumulation,
        Layer::FlowLength,
        Layer::Stream,
        Layer::Flux,
        Layer::Loss,
        Layer::DistanceToStream,
        Layer::Exported,
    ];

    pub fn stem(self) -> &'static str {
        match self {
            Layer::ResolvedDem => "resolved_dem",
            Layer::Slope => "slope",
            Layer::FlowDirection => "flow_direction",
            Layer::OutflowDirection => "outflow_direction",
            Layer::OutflowWeights => "outflow_weights",
            Layer::FlowAccumulation => "flow_accumulation",
            Layer::FlowLength => "flow_length",
            Layer::Stream => "stream",
            Layer::Flux => "flux",
            Layer::Loss => "loss",
            Layer::DistanceToStream => "distance_to_stream",
            Layer::Exported => "exported",
        }
    }

    /// Final products go to `output/`, everything else to `intermediate/`
    pub fn is_output(self) -> bool {
        matches!(
            self,
            Layer::Flux | Layer::Loss | Layer::DistanceToStream | Layer::Exported
        )
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

/// A directory owning the persisted layout of a routing run:
///
/// ```text
/// <root>/intermediate/{resolved_dem,slope,flow_direction,...}.tif
/// <root>/output/{flux,loss,distance_to_stream,exported}.tif
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open `root`, creating it and its subdirectories as needed.
    pub fn create<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [root.join("intermediate"), root.join("output")] {
            fs::create_dir_all(&dir).map_err(|e| Error::raster_io(&dir, e))?;
        }
        tracing::debug!(root = %root.display(), "workspace ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn intermediate_dir(&self) -> PathBuf {
        self.root.join("intermediate")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Location of a persisted layer
    pub fn path(&self, layer: Layer) -> PathBuf {
        let dir = if layer.is_output() {
            self.output_dir()
        } else {
            self.intermediate_dir()
        };
        dir.join(format!("{}.tif", layer.stem()))
    }

    /// Stream mask for one of several thresholds, e.g. `stream_1000.tif`
    pub fn stream_path(&self, threshold: f64) -> PathBuf {
        self.intermediate_dir()
            .join(format!("{}_{}.tif", Layer::Stream.stem(), threshold))
    }

    /// A scratch directory inside the workspace, removed when dropped.
    pub fn scratch(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(&self.root)
            .map_err(|e| Error::raster_io(&self.root, e))
    }

    /// Start a set of rasters that land in the workspace together.
    pub fn stage(&self) -> Result<Staging> {
        Ok(Staging {
            scratch: self.scratch()?,
            moves: Vec::new(),
            removals: Vec::new(),
        })
    }
}

/// Rasters written to workspace scratch and moved to their final paths
/// only by [`Staging::commit`]. Dropping it uncommitted leaves the
/// workspace untouched.
#[derive(Debug)]
pub struct Staging {
    scratch: TempDir,
    moves: Vec<(PathBuf, PathBuf)>,
    removals: Vec<PathBuf>,
}

impl Staging {
    /// Write `raster` to scratch, to be moved to `target` on commit.
    pub fn write<T: IoElement>(&mut self, raster: &Raster<T>, target: PathBuf) -> Result<()> {
        let staged = self.scratch.path().join(format!("{}.tif", self.moves.len()));
        write_geotiff(raster, &staged, None)?;
        self.moves.push((staged, target));
        Ok(())
    }

    /// Delete `target` on commit, if it exists.
    pub fn remove(&mut self, target: PathBuf) {
        self.removals.push(target);
    }

    /// Number of staged rasters
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Move every staged raster into place.
    ///
    /// The scratch directory shares the workspace's file system, so each
    /// move is a rename.
    pub fn commit(self) -> Result<()> {
        for (staged, target) in &self.moves {
            fs::rename(staged, target).map_err(|e| Error::raster_io(target, e))?;
        }
        for target in self.removals.iter().filter(|p| p.exists()) {
            fs::remove_file(target).map_err(|e| Error::raster_io(target, e))?;
        }
        tracing::debug!(files = self.moves.len(), "staged rasters committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path().join("run")).unwrap();

        assert_eq!(
            ws.path(Layer::OutflowWeights),
            dir.path().join("run/intermediate/outflow_weights.tif")
        );
        assert_eq!(ws.path(Layer::Flux), dir.path().join("run/output/flux.tif"));
        assert_eq!(
            ws.stream_path(1000.0),
            dir.path().join("run/intermediate/stream_1000.tif")
        );
        assert!(ws.intermediate_dir().is_dir());
        assert!(ws.output_dir().is_dir());
    }

    #[test]
    fn test_staging_commits_together() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let raster = Raster::from_vec(vec![1.0, 2.0], 1, 2).unwrap();

        let mut staging = ws.stage().unwrap();
        staging.write(&raster, ws.path(Layer::Flux)).unwrap();
        staging.write(&raster, ws.path(Layer::Loss)).unwrap();
        assert_eq!(staging.len(), 2);
        assert!(!ws.path(Layer::Flux).exists());

        fs::write(ws.path(Layer::Slope), b"stale").unwrap();
        staging.remove(ws.path(Layer::Slope));

        staging.commit().unwrap();
        assert!(!ws.path(Layer::Slope).exists());
        assert!(ws.path(Layer::Flux).is_file());
        assert!(ws.path(Layer::Loss).is_file());
        // only intermediate/ and output/ remain
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 2);
    }

    #[test]
    fn test_dropped_staging_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        let mut staging = ws.stage().unwrap();
        staging
            .write(&Raster::from_vec(vec![1u8], 1, 1).unwrap(), ws.path(Layer::Stream))
            .unwrap();
        drop(staging);

        assert!(!ws.path(Layer::Stream).exists());
        assert_eq!(fs::read_dir(ws.root()).unwrap().count(), 2);
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();

        let scratch = ws.scratch().unwrap();
        let inner = scratch.path().to_path_buf();
        assert!(inner.starts_with(ws.root()));
        fs::write(inner.join("tmp.bin"), b"x").unwrap();

        drop(scratch);
        assert!(!inner.exists());
    }
}
