//! Stream network extraction
//!
//! Extracts a stream network from a flow accumulation raster by
//! thresholding: cells with accumulation >= threshold are classified
//! as stream cells.
//!
//! The output is a binary raster (1 = stream, 0 = non-stream, 255 = nodata).

use routedem_core::raster::{vectorize, PixelOp, Raster, RasterElement};
use routedem_core::{Algorithm, CancelFlag, Error, Result};

/// Stream mask value for cells outside the DEM
pub const STREAM_NODATA: u8 = 255;

/// Parameters for stream extraction
#[derive(Debug, Clone)]
pub struct StreamParams {
    /// Flow accumulation threshold (in cell counts).
    /// Cells with accumulation >= this value are classified as streams.
    pub threshold: f64,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self { threshold: 1000.0 }
    }
}

/// Stream extraction algorithm
#[derive(Debug, Clone, Default)]
pub struct StreamThreshold;

impl Algorithm for StreamThreshold {
    type Input = Raster<f64>;
    type Output = Raster<u8>;
    type Params = StreamParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Stream Threshold"
    }

    fn description(&self) -> &'static str {
        "Classify cells as stream where flow accumulation reaches a threshold"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        stream_threshold(&input, params.threshold, &CancelFlag::new())
    }
}

struct Threshold(f64);

impl PixelOp for Threshold {
    type Output = u8;

    fn apply(&self, values: &[Option<f64>]) -> Option<u8> {
        values[0].filter(|v| !v.is_nan()).map(|acc| u8::from(acc >= self.0))
    }
}

/// Extract a stream mask from flow accumulation.
///
/// Works on any cell type, so a stream mask can be re-thresholded.
pub fn stream_threshold<T: RasterElement>(
    flow_acc: &Raster<T>,
    threshold: f64,
    cancel: &CancelFlag,
) -> Result<Raster<u8>> {
    if !threshold.is_finite() {
        return Err(Error::InvalidParameter {
            name: "threshold",
            value: threshold.to_string(),
            reason: "must be finite".into(),
        });
    }
    let stream = vectorize(&[flow_acc], &Threshold(threshold), Some(STREAM_NODATA), cancel)?;
    let cells = stream.data().iter().filter(|&&v| v == 1).count();
    tracing::debug!(threshold, cells, "stream cells extracted");
    Ok(stream)
}

/// One stream mask per threshold in `lower..=upper`, stepping by `step`.
pub fn stream_thresholds(
    flow_acc: &Raster<f64>,
    lower: f64,
    upper: f64,
    step: f64,
    cancel: &CancelFlag,
) -> Result<Vec<(f64, Raster<u8>)>> {
    if !(step > 0.0) {
        return Err(Error::InvalidParameter {
            name: "step",
            value: step.to_string(),
            reason: "must be positive".into(),
        });
    }
    if !(lower <= upper) {
        return Err(Error::InvalidParameter {
            name: "lower",
            value: lower.to_string(),
            reason: format!("must not exceed upper threshold {}", upper),
        });
    }

    let count = ((upper - lower) / step + 1e-9).floor() as usize + 1;
    (0..count)
        .map(|i| {
            let t = lower + i as f64 * step;
            stream_threshold(flow_acc, t, cancel).map(|mask| (t, mask))
        })
        .collect()
}
