//! Slope from a DEM
//!
//! Horn (1981) finite differences over the 3x3 neighborhood:
//! ```text
//! a b c
//! d e f
//! g h i
//! ```
//! dz/dx = ((c + 2f + i) - (a + 2d + g)) / (8 · cellsize)
//! dz/dy = ((g + 2h + i) - (a + 2b + c)) / (8 · cellsize)

use routedem_core::raster::Raster;
use routedem_core::{Algorithm, Error, Result};

use crate::maybe_rayon::collect_rows;

/// Units for slope output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlopeUnits {
    /// Rise over run times 100
    #[default]
    Percent,
    /// 0-90
    Degrees,
    /// 0-π/2
    Radians,
}

/// Parameters for slope calculation
#[derive(Debug, Clone, Default)]
pub struct SlopeParams {
    pub units: SlopeUnits,
}

/// Slope algorithm
#[derive(Debug, Clone, Default)]
pub struct Slope;

impl Algorithm for Slope {
    type Input = Raster<f64>;
    type Output = Raster<f64>;
    type Params = SlopeParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Slope"
    }

    fn description(&self) -> &'static str {
        "Slope of a DEM by Horn's method"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        slope(&input, &params)
    }
}

/// Slope of every cell with a complete 3x3 neighborhood of valid
/// elevations; NaN on the grid border and next to nodata.
pub fn slope(dem: &Raster<f64>, params: &SlopeParams) -> Result<Raster<f64>> {
    let (rows, cols) = dem.shape();
    let eight_cell_size = 8.0 * dem.cell_size();

    let data = collect_rows(rows, cols, |row| {
        (0..cols)
            .map(|col| {
                if row == 0 || col == 0 || row + 1 == rows || col + 1 == cols {
                    return f64::NAN;
                }
                let mut z = [0.0; 9];
                for (i, cell) in z.iter_mut().enumerate() {
                    match dem.value_at(row + i / 3 - 1, col + i % 3 - 1) {
                        Some(v) => *cell = v,
                        None => return f64::NAN,
                    }
                }
                let [a, b, c, d, _, f, g, h, i] = z;

                let dz_dx = ((c + 2.0 * f + i) - (a + 2.0 * d + g)) / eight_cell_size;
                let dz_dy = ((g + 2.0 * h + i) - (a + 2.0 * b + c)) / eight_cell_size;
                let rise = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt();

                match params.units {
                    SlopeUnits::Percent => rise * 100.0,
                    SlopeUnits::Degrees => rise.atan().to_degrees(),
                    SlopeUnits::Radians => rise.atan(),
                }
            })
            .collect()
    })?;

    let mut output = dem.derive(f64::NAN, Some(f64::NAN));
    *output.data_mut() = data;
    Ok(output)
}
