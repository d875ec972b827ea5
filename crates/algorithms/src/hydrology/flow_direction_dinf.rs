//! D-infinity (D∞) flow direction algorithm
//!
//! Computes continuous flow direction angles based on triangular facets
//! fitted to the 3×3 neighborhood. Flow direction is the steepest
//! downslope angle, which can point in any direction (0–2π).
//!
//! Facet `i` spans the angles between neighbor `i` and neighbor `i + 1`
//! (see [`neighbors`]). One of the two is a cardinal neighbor, the other a
//! diagonal one.
//!
//! Reference:
//! Tarboton, D.G. (1997). A new method for the determination of flow
//! directions and upslope areas in grid digital elevation models.
//! *Water Resources Research*, 33(2), 309–319.

use std::f64::consts::{FRAC_PI_4, SQRT_2, TAU};

use routedem_core::raster::{neighbors, Raster};
use routedem_core::{Algorithm, Error, Result};

use crate::maybe_rayon::collect_rows;

/// Angle stored for cells with no downslope neighbor
pub const NO_FLOW: f64 = -1.0;

/// D-infinity flow direction
#[derive(Debug, Clone, Default)]
pub struct FlowDirectionDinf;

impl Algorithm for FlowDirectionDinf {
    type Input = Raster<f64>;
    type Output = Raster<f64>;
    type Params = ();
    type Error = Error;

    fn name(&self) -> &'static str {
        "FlowDirectionDinf"
    }

    fn description(&self) -> &'static str {
        "Continuous steepest-descent flow angle over eight triangular facets"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        flow_direction_dinf(&input)
    }
}

/// Steepest descent on facet `i` as `(angle, slope)`.
///
/// `e0` is the center elevation, `z` the neighbor elevations indexed like
/// [`neighbors::ROW_OFFSETS`].
fn facet(i: usize, e0: f64, z: &[f64; 8], cell_size: f64) -> (f64, f64) {
    // even facets start on their cardinal edge, odd facets end on it
    let (card, diag) = if i % 2 == 0 { (i, i + 1) } else { (neighbors::next(i), i) };
    let (e1, e2) = (z[card], z[diag]);

    let s1 = (e0 - e1) / cell_size;
    let s2 = (e1 - e2) / cell_size;
    let mut r = s2.atan2(s1);
    let s = if r < 0.0 {
        r = 0.0;
        s1
    } else if r > FRAC_PI_4 {
        r = FRAC_PI_4;
        (e0 - e2) / (SQRT_2 * cell_size)
    } else {
        (s1 * s1 + s2 * s2).sqrt()
    };

    let alpha = if i % 2 == 0 {
        i as f64 * FRAC_PI_4 + r
    } else {
        (i + 1) as f64 * FRAC_PI_4 - r
    };
    (alpha.rem_euclid(TAU), s)
}

/// Flow angle of one cell; `None` marks a sink.
fn cell_angle(dem: &Raster<f64>, row: usize, col: usize, e0: f64, cell_size: f64) -> Option<f64> {
    let (rows, cols) = dem.shape();

    let mut z = [f64::NAN; 8];
    for (k, r, c) in neighbors::around(row, col, rows, cols) {
        if let Some(v) = dem.value_at(r, c) {
            z[k] = v;
        }
    }

    let mut best_slope = 0.0_f64;
    let mut best_angle = None;
    for i in 0..neighbors::COUNT {
        if z[i].is_nan() || z[neighbors::next(i)].is_nan() {
            continue;
        }
        let (alpha, s) = facet(i, e0, &z, cell_size);
        if s > best_slope {
            best_slope = s;
            best_angle = Some(alpha);
        }
    }
    if best_angle.is_some() {
        return best_angle;
    }

    // No complete facet drains, which happens along borders and nodata:
    // fall back to the steepest single neighbor
    for k in 0..neighbors::COUNT {
        if z[k].is_nan() {
            continue;
        }
        let s = (e0 - z[k]) / neighbors::distance(k, cell_size);
        if s > best_slope {
            best_slope = s;
            best_angle = Some(neighbors::angle(k));
        }
    }
    best_angle
}

/// Compute D-infinity flow direction angles.
///
/// # Arguments
/// * `dem` - Input DEM (should be hydrologically conditioned)
///
/// # Returns
/// Raster<f64> with flow angles in radians counter-clockwise from east, in
/// [0, 2π). [`NO_FLOW`] marks pits, NaN marks nodata.
pub fn flow_direction_dinf(dem: &Raster<f64>) -> Result<Raster<f64>> {
    let (rows, cols) = dem.shape();
    let cell_size = dem.cell_size();
    if !(cell_size > 0.0) {
        return Err(Error::InvalidParameter {
            name: "cell_size",
            value: cell_size.to_string(),
            reason: "DEM cell size must be positive".into(),
        });
    }
    if !dem.transform().is_north_up() {
        return Err(Error::InvalidParameter {
            name: "geotransform",
            value: format!("{:?}", dem.transform().to_gdal()),
            reason: "flow angles need a north-up grid".into(),
        });
    }

    let angles = collect_rows(rows, cols, |row| {
        let mut row_data = vec![f64::NAN; cols];
        for col in 0..cols {
            let Some(e0) = dem.value_at(row, col) else { continue };
            row_data[col] = cell_angle(dem, row, col, e0, cell_size).unwrap_or(NO_FLOW);
        }
        row_data
    })?;

    let mut output = dem.with_same_meta::<f64>(rows, cols);
    output.set_nodata(Some(f64::NAN));
    *output.data_mut() = angles;

    let sinks = output.data().iter().filter(|&&a| a == NO_FLOW).count();
    tracing::debug!(rows, cols, sinks, "D-infinity flow direction done");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use routedem_core::GeoTransform;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn plane(f: impl Fn(usize, usize) -> f64) -> Raster<f64> {
        let mut dem = Raster::new(5, 5);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 0..5 {
            for col in 0..5 {
                dem.set(row, col, f(row, col)).unwrap();
            }
        }
        dem
    }

    #[test]
    fn test_dinf_east_slope() {
        let angles = flow_direction_dinf(&plane(|_, col| (5 - col) as f64 * 10.0)).unwrap();
        assert_relative_eq!(angles.get(2, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_dinf_south_slope() {
        let angles = flow_direction_dinf(&plane(|row, _| (5 - row) as f64 * 10.0)).unwrap();
        assert_relative_eq!(angles.get(2, 2).unwrap(), 3.0 * FRAC_PI_2);
    }

    #[test]
    fn test_dinf_oblique_plane() {
        // z falls twice as fast eastward as northward: angle = atan(1/2)
        let angles = flow_direction_dinf(&plane(|row, col| row as f64 - 2.0 * col as f64)).unwrap();
        assert_relative_eq!(angles.get(2, 2).unwrap(), 0.5_f64.atan(), epsilon = 1e-12);
    }

    #[test]
    fn test_dinf_northwest_diagonal() {
        let angles = flow_direction_dinf(&plane(|row, col| (row + col) as f64)).unwrap();
        assert_relative_eq!(angles.get(2, 2).unwrap(), 3.0 * FRAC_PI_4, epsilon = 1e-12);
    }

    #[test]
    fn test_dinf_pit_is_sink() {
        let mut dem = plane(|_, _| 5.0);
        dem.set(2, 2, 1.0).unwrap();
        let angles = flow_direction_dinf(&dem).unwrap();
        assert_eq!(angles.get(2, 2).unwrap(), NO_FLOW);
        // the ring around the pit points at it
        assert_relative_eq!(angles.get(2, 1).unwrap(), 0.0);
        assert_relative_eq!(angles.get(1, 2).unwrap(), 3.0 * FRAC_PI_2);
        assert_relative_eq!(angles.get(2, 3).unwrap(), PI);
    }

    #[test]
    fn test_single_row_uses_cardinal_fallback() {
        let dem = Raster::from_vec(vec![4.0, 3.0, 2.0, 1.0, 0.0], 1, 5).unwrap();
        let angles = flow_direction_dinf(&dem).unwrap();
        for col in 0..4 {
            assert_eq!(angles.get(0, col).unwrap(), 0.0);
        }
        assert_eq!(angles.get(0, 4).unwrap(), NO_FLOW);
    }

    #[test]
    fn test_nodata_stays_nan_and_is_skipped() {
        let mut dem = Raster::from_vec(vec![3.0, 2.0, -9999.0], 1, 3).unwrap();
        dem.set_nodata(Some(-9999.0));
        let angles = flow_direction_dinf(&dem).unwrap();
        assert!(angles.get(0, 2).unwrap().is_nan());
        assert_eq!(angles.get(0, 0).unwrap(), 0.0);
        // nodata is not lower ground
        assert_eq!(angles.get(0, 1).unwrap(), NO_FLOW);
    }

    #[test]
    fn test_dinf_angle_range() {
        let mut dem = Raster::new(10, 10);
        dem.set_transform(GeoTransform::new(0.0, 10.0, 1.0, -1.0));
        for row in 0..10 {
            for col in 0..10 {
                let base = (row + col) as f64;
                let var = ((row * 7 + col * 13) % 100) as f64 / 10.0;
                dem.set(row, col, base + var).unwrap();
            }
        }

        let angles = flow_direction_dinf(&dem).unwrap();
        for &a in angles.data().iter() {
            assert!(a == NO_FLOW || (0.0..TAU).contains(&a), "angle {} out of range", a);
        }
    }

    #[test]
    fn test_south_up_grid_is_rejected() {
        let mut dem = plane(|_, col| col as f64);
        dem.set_transform(GeoTransform::new(0.0, 0.0, 1.0, 1.0));
        let err = flow_direction_dinf(&dem).unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { name: "geotransform", .. }));
    }
}
