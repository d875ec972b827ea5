//! Per-polygon aggregation
//!
//! Summarises a raster over the polygons of a keyed polygon layer. Polygons
//! are burned onto the raster grid by cell-center containment, so each
//! cell belongs to at most one key.

use std::collections::{BTreeMap, HashMap};

use routedem_core::raster::{Raster, RasterElement};
use routedem_core::vector::PolygonLayer;
use routedem_core::Result;
use serde::Serialize;

/// Parameters for [`aggregate_raster_values`]
#[derive(Debug, Clone)]
pub struct AggregateParams {
    /// Leave nodata cells out entirely. When false they still count
    /// towards `count` (and so lower `mean`) but add nothing to `sum`.
    pub ignore_nodata: bool,
    /// Values excluded from every statistic
    pub ignore_values: Vec<f64>,
    /// Per-key cap on the reported sum
    pub thresholds: HashMap<i64, f64>,
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self {
            ignore_nodata: true,
            ignore_values: Vec::new(),
            thresholds: HashMap::new(),
        }
    }
}

/// Statistics of one polygon key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneSummary {
    pub key: i64,
    pub count: usize,
    /// Sum of values, capped at the key's threshold if one is set
    pub sum: f64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ZoneSummary {
    fn empty(key: i64) -> Self {
        Self {
            key,
            count: 0,
            sum: 0.0,
            mean: None,
            min: None,
            max: None,
        }
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

/// Aggregate `values` over every key of `zones`, in ascending key order.
///
/// Keys whose polygons cover no cell center are reported with count 0 and
/// sum 0.
pub fn aggregate_raster_values<T: RasterElement>(
    values: &Raster<T>,
    zones: &PolygonLayer,
    params: &AggregateParams,
) -> Result<Vec<ZoneSummary>> {
    let keys = zones.rasterize(values);
    let mut summaries: BTreeMap<i64, ZoneSummary> =
        zones.keys().into_iter().map(|k| (k, ZoneSummary::empty(k))).collect();

    let (rows, cols) = values.shape();
    for row in 0..rows {
        for col in 0..cols {
            let key = unsafe { keys.get_unchecked(row, col) };
            if key == PolygonLayer::NO_ZONE {
                continue;
            }
            let Some(summary) = summaries.get_mut(&key) else { continue };
            match values.value_at(row, col).filter(|v| !v.is_nan()) {
                Some(v) if params.ignore_values.contains(&v) => {}
                Some(v) => summary.add(v),
                None if !params.ignore_nodata => summary.count += 1,
                None => {}
            }
        }
    }

    let mut out: Vec<ZoneSummary> = summaries.into_values().collect();
    for summary in &mut out {
        if summary.count > 0 {
            summary.mean = Some(summary.sum / summary.count as f64);
        }
        if let Some(&cap) = params.thresholds.get(&summary.key) {
            summary.sum = summary.sum.min(cap);
        }
    }

    tracing::debug!(
        path = %zones.path.display(),
        keys = out.len(),
        empty = out.iter().filter(|s| s.count == 0).count(),
        "aggregation done"
    );
    Ok(out)
}
