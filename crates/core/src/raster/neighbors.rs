//! Eight-neighbor geometry shared by every routing operator
//!
//! Neighbors are numbered counter-clockwise starting east, so neighbor `k`
//! lies at angle `k * π/4` from the center cell:
//!
//! ```text
//!   3 2 1
//!   4 x 0
//!   5 6 7
//! ```

use std::f64::consts::{FRAC_PI_4, SQRT_2};

/// Number of neighbors
pub const COUNT: usize = 8;

/// Row offsets, indexed by neighbor
pub const ROW_OFFSETS: [isize; COUNT] = [0, -1, -1, -1, 0, 1, 1, 1];

/// Column offsets, indexed by neighbor
pub const COL_OFFSETS: [isize; COUNT] = [1, 1, 0, -1, -1, -1, 0, 1];

/// Distance factors: 1 for cardinal neighbors, √2 for diagonals
pub const DISTANCE_FACTORS: [f64; COUNT] = [1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2, 1.0, SQRT_2];

/// Grid position of neighbor `k` of (row, col), `None` when it falls off a
/// `rows` x `cols` grid.
#[inline]
pub fn neighbor(row: usize, col: usize, k: usize, rows: usize, cols: usize) -> Option<(usize, usize)> {
    let nr = row as isize + ROW_OFFSETS[k];
    let nc = col as isize + COL_OFFSETS[k];
    if nr < 0 || nc < 0 || nr >= rows as isize || nc >= cols as isize {
        None
    } else {
        Some((nr as usize, nc as usize))
    }
}

/// Physical distance to neighbor `k`
#[inline]
pub fn distance(k: usize, cell_size: f64) -> f64 {
    DISTANCE_FACTORS[k] * cell_size
}

/// Angle of neighbor `k`, radians counter-clockwise from east
#[inline]
pub fn angle(k: usize) -> f64 {
    k as f64 * FRAC_PI_4
}

/// The neighbor pointing back at the center
#[inline]
pub fn opposite(k: usize) -> usize {
    (k + 4) % COUNT
}

/// The next neighbor counter-clockwise
#[inline]
pub fn next(k: usize) -> usize {
    (k + 1) % COUNT
}

/// Positions of all in-grid neighbors of (row, col), paired with their index
pub fn around(row: usize, col: usize, rows: usize, cols: usize) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..COUNT).filter_map(move |k| neighbor(row, col, k, rows, cols).map(|(r, c)| (k, r, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_table_matches_angles() {
        for k in 0..COUNT {
            let a = angle(k);
            // screen rows grow southward
            assert_relative_eq!(a.cos().round(), COL_OFFSETS[k] as f64);
            assert_relative_eq!(-a.sin().round(), ROW_OFFSETS[k] as f64);
        }
    }

    #[test]
    fn test_opposite_and_next() {
        assert_eq!(opposite(0), 4);
        assert_eq!(opposite(3), 7);
        assert_eq!(opposite(6), 2);
        assert_eq!(next(7), 0);
    }

    #[test]
    fn test_edges() {
        assert_eq!(neighbor(0, 0, 2, 3, 3), None);
        assert_eq!(neighbor(0, 0, 7, 3, 3), Some((1, 1)));
        assert_eq!(around(0, 0, 3, 3).count(), 3);
        assert_eq!(around(1, 1, 3, 3).count(), 8);
        assert_relative_eq!(distance(1, 10.0), 10.0 * SQRT_2);
    }
}
