//! Sparse encoding of a batch of variable-length targets

use serde::{Deserialize, Serialize};

/// Coordinate-list encoding of a ragged `[rows, max_len]` matrix
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SparseTarget {
    /// `(row, position)` of every value, row-major
    pub indices: Vec<[usize; 2]>,
    /// Class index at each coordinate
    pub values: Vec<u32>,
    /// `[rows, longest row]`
    pub dense_shape: [usize; 2],
}

impl SparseTarget {
    /// Encode one sequence per row; rows may be empty
    pub fn from_sequences(sequences: &[Vec<u32>]) -> Self {
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let total = sequences.iter().map(Vec::len).sum();

        let mut indices = Vec::with_capacity(total);
        let mut values = Vec::with_capacity(total);
        for (row, sequence) in sequences.iter().enumerate() {
            for (pos, &value) in sequence.iter().enumerate() {
                indices.push([row, pos]);
                values.push(value);
            }
        }

        Self {
            indices,
            values,
            dense_shape: [sequences.len(), max_len],
        }
    }

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.dense_shape[0]
    }

    /// Decode back to one sequence per row
    pub fn sequences(&self) -> Vec<Vec<u32>> {
        let mut sequences = vec![Vec::new(); self.rows()];
        for (&[row, _], &value) in self.indices.iter().zip(&self.values) {
            if let Some(sequence) = sequences.get_mut(row) {
                sequence.push(value);
            }
        }
        sequences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let sparse = SparseTarget::from_sequences(&[vec![4, 2], vec![], vec![7]]);
        assert_eq!(sparse.indices, vec![[0, 0], [0, 1], [2, 0]]);
        assert_eq!(sparse.values, vec![4, 2, 7]);
        assert_eq!(sparse.dense_shape, [3, 2]);
        assert_eq!(sparse.sequences(), vec![vec![4, 2], vec![], vec![7]]);
    }
}
