//! Row-parallel raster passes, with or without rayon.
//!
//! Per-cell passes whose cells are independent (flow direction, flow graph
//! construction, flow length) build their output with [`collect_rows`].
//! With the `parallel` feature rows are computed on the rayon pool;
//! without it they run in order. Both produce identical arrays.

use ndarray::Array2;
use routedem_core::{Error, Result};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(not(feature = "parallel"))]
use sequential::*;

#[cfg(not(feature = "parallel"))]
mod sequential {
    /// `into_par_iter()` for builds without rayon
    pub trait IntoParallelIterator {
        type Iter;
        fn into_par_iter(self) -> Self::Iter;
    }

    impl<I: IntoIterator> IntoParallelIterator for I {
        type Iter = I::IntoIter;
        fn into_par_iter(self) -> Self::Iter {
            self.into_iter()
        }
    }
}

/// Build a `rows × cols` array from `row_fn`, which returns one full row.
pub(crate) fn collect_rows<T, F>(rows: usize, cols: usize, row_fn: F) -> Result<Array2<T>>
where
    T: Send,
    F: Fn(usize) -> Vec<T> + Sync + Send,
{
    let data: Vec<T> = (0..rows).into_par_iter().flat_map(|row| row_fn(row)).collect();
    if data.len() != rows * cols {
        return Err(Error::Invariant(format!(
            "row pass produced {} cells for a {}x{} grid",
            data.len(),
            rows,
            cols
        )));
    }
    Array2::from_shape_vec((rows, cols), data).map_err(|e| Error::Other(e.to_string()))
}
