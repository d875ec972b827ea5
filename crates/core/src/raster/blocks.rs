//! Block-wise traversal of a raster grid

/// Default block edge, in cells
pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// A rectangular window of a raster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Row offset in the source raster
    pub row: usize,
    /// Column offset in the source raster
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Block {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self { row, col, rows, cols }
    }

    /// Convert block-local coordinates to source raster coordinates
    pub fn to_source_coords(&self, local_row: usize, local_col: usize) -> (usize, usize) {
        (self.row + local_row, self.col + local_col)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over non-overlapping blocks covering a raster, row-major
#[derive(Debug, Clone)]
pub struct BlockIterator {
    total_rows: usize,
    total_cols: usize,
    block_rows: usize,
    block_cols: usize,
    current_row: usize,
    current_col: usize,
}

impl BlockIterator {
    pub fn new(total_rows: usize, total_cols: usize, block_rows: usize, block_cols: usize) -> Self {
        Self {
            total_rows,
            // an empty grid yields no blocks
            total_cols: if total_rows == 0 { 0 } else { total_cols },
            block_rows: block_rows.max(1),
            block_cols: block_cols.max(1),
            current_row: if total_cols == 0 { total_rows } else { 0 },
            current_col: 0,
        }
    }

    /// Square blocks of [`DEFAULT_BLOCK_SIZE`]
    pub fn with_default_size(total_rows: usize, total_cols: usize) -> Self {
        Self::new(total_rows, total_cols, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE)
    }
}

impl Iterator for BlockIterator {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_row >= self.total_rows {
            return None;
        }

        let rows = self.block_rows.min(self.total_rows - self.current_row);
        let cols = self.block_cols.min(self.total_cols - self.current_col);
        let block = Block::new(self.current_row, self.current_col, rows, cols);

        self.current_col += self.block_cols;
        if self.current_col >= self.total_cols {
            self.current_col = 0;
            self.current_row += self.block_rows;
        }

        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_coverage() {
        let rows = 100;
        let cols = 70;
        let mut covered = vec![vec![0u8; cols]; rows];

        for block in BlockIterator::new(rows, cols, 32, 32) {
            for r in block.row..block.row + block.rows {
                for c in block.col..block.col + block.cols {
                    covered[r][c] += 1;
                }
            }
        }

        for r in 0..rows {
            for c in 0..cols {
                assert_eq!(covered[r][c], 1, "Cell ({}, {}) covered {} times", r, c, covered[r][c]);
            }
        }
    }

    #[test]
    fn test_edge_blocks_are_clipped() {
        let blocks: Vec<_> = BlockIterator::new(5, 5, 4, 4).collect();
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[3], Block::new(4, 4, 1, 1));
        assert_eq!(BlockIterator::new(0, 5, 4, 4).count(), 0);
        assert_eq!(BlockIterator::new(5, 0, 4, 4).count(), 0);
    }
}
