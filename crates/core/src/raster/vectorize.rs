//! Per-pixel operations over co-registered rasters

use crate::cancel::CancelFlag;
use crate::error::{Error, Result};
use crate::raster::{BlockIterator, Raster, RasterElement};

/// A per-pixel function applied across a stack of aligned rasters.
///
/// `values` holds one entry per input, `None` where that input is nodata.
/// Returning `None` writes the output nodata value.
pub trait PixelOp {
    type Output: RasterElement;

    fn apply(&self, values: &[Option<f64>]) -> Option<Self::Output>;
}

/// Apply `op` cell by cell over `inputs`, block by block.
///
/// All inputs must share the first input's grid. The output inherits that
/// grid and uses `nodata` (or the output type's default) as sentinel.
pub fn vectorize<T, P>(
    inputs: &[&Raster<T>],
    op: &P,
    nodata: Option<P::Output>,
    cancel: &CancelFlag,
) -> Result<Raster<P::Output>>
where
    T: RasterElement,
    P: PixelOp,
{
    let base = inputs
        .first()
        .ok_or_else(|| Error::Other("vectorize needs at least one input".into()))?;
    for (i, other) in inputs.iter().enumerate().skip(1) {
        base.ensure_same_grid(other, &format!("input {}", i))?;
    }

    let nodata = nodata.unwrap_or_else(P::Output::default_nodata);
    let mut output = base.derive(nodata, Some(nodata));
    let mut values = vec![None; inputs.len()];

    let (rows, cols) = base.shape();
    for block in BlockIterator::with_default_size(rows, cols) {
        cancel.check()?;
        for local_row in 0..block.rows {
            for local_col in 0..block.cols {
                let (row, col) = block.to_source_coords(local_row, local_col);
                for (slot, raster) in values.iter_mut().zip(inputs.iter()) {
                    *slot = raster.value_at(row, col);
                }
                let out = op.apply(&values).unwrap_or(nodata);
                unsafe { output.set_unchecked(row, col, out) };
            }
        }
    }

    Ok(output)
}
