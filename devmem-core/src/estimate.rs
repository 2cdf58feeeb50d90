//! Device footprint estimation.
//!
//! Pure functions: the caller picks the representation from measured
//! sparsity, the estimator only prices it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{DENSE_ELEMENT_BYTES, SPARSE_NONZERO_BYTES, SPARSE_ROW_POINTER_BYTES};

/// Device-side layout of a matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Row-major array of doubles
    Dense,
    /// Compressed sparse rows (values, column indices, row pointers)
    Sparse,
}

impl Representation {
    /// Pick the representation for a write of the given sparsity.
    #[must_use]
    pub fn from_sparse_flag(sparse: bool) -> Self {
        if sparse {
            Self::Sparse
        } else {
            Self::Dense
        }
    }

    /// Get the representation name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sparse => "sparse",
        }
    }

    /// Whether this is the sparse layout.
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse)
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Representation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dense" => Ok(Self::Dense),
            "sparse" | "csr" => Ok(Self::Sparse),
            other => Err(format!("unknown representation: {other}")),
        }
    }
}

/// Dimensions and nonzero count of a logical matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MatrixShape {
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
    /// Number of nonzero cells (an estimate for unmaterialized matrices)
    pub nnz: usize,
}

impl MatrixShape {
    /// Create a shape.
    ///
    /// # Panics
    /// Panics if `nnz` exceeds `rows * cols`.
    #[must_use]
    pub fn new(rows: usize, cols: usize, nnz: usize) -> Self {
        assert!(
            nnz <= rows.saturating_mul(cols),
            "nnz {} exceeds cell count {}x{}",
            nnz,
            rows,
            cols
        );
        Self { rows, cols, nnz }
    }

    /// A fully dense shape (every cell counted as nonzero).
    #[must_use]
    pub fn dense(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, rows.saturating_mul(cols))
    }

    /// Total number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Fraction of nonzero cells, 0.0 for an empty matrix.
    #[must_use]
    pub fn sparsity(&self) -> f64 {
        let cells = self.cells();
        if cells == 0 {
            return 0.0;
        }
        self.nnz as f64 / cells as f64
    }

    /// Device footprint of this shape in the given representation.
    #[must_use]
    pub fn size_bytes(&self, representation: Representation) -> usize {
        estimate_size_bytes(self.rows, self.cols, self.nnz, representation)
    }
}

/// Device-memory footprint of a matrix in bytes.
///
/// - Dense: `rows * cols * 8`
/// - Sparse: `nnz * 12 + rows * 4` (value + column index per nonzero, one
///   row pointer per row)
///
/// Saturates instead of overflowing; never fails.
#[must_use]
pub fn estimate_size_bytes(
    rows: usize,
    cols: usize,
    nnz: usize,
    representation: Representation,
) -> usize {
    match representation {
        Representation::Dense => rows
            .saturating_mul(cols)
            .saturating_mul(DENSE_ELEMENT_BYTES),
        Representation::Sparse => nnz
            .saturating_mul(SPARSE_NONZERO_BYTES)
            .saturating_add(rows.saturating_mul(SPARSE_ROW_POINTER_BYTES)),
    }
}
