//! Host-side matrix handles.
//!
//! `TigerStyle`: The host copy is authoritative whenever no dirty device copy
//! exists. A `HostMatrix` is shared (`Arc`) between the collaborator that
//! owns the logical matrix and the `DeviceObject` that mirrors it.

use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use devmem_core::{MatrixShape, Representation};

/// Stable identity of a logical matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatrixId(pub u64);

impl fmt::Display for MatrixId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl From<u64> for MatrixId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// =============================================================================
// Blocks
// =============================================================================

/// Compressed sparse row block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsrBlock {
    rows: usize,
    cols: usize,
    row_ptr: Vec<u32>,
    col_idx: Vec<u32>,
    values: Vec<f64>,
}

impl CsrBlock {
    /// Build a CSR block from its raw arrays.
    ///
    /// # Panics
    /// Panics if the arrays do not describe a well-formed `rows x cols` matrix.
    #[must_use]
    pub fn new(
        rows: usize,
        cols: usize,
        row_ptr: Vec<u32>,
        col_idx: Vec<u32>,
        values: Vec<f64>,
    ) -> Self {
        assert_eq!(row_ptr.len(), rows + 1, "row_ptr must have rows + 1 entries");
        assert_eq!(col_idx.len(), values.len(), "col_idx and values must align");
        assert_eq!(
            row_ptr.last().copied().unwrap_or(0) as usize,
            values.len(),
            "row_ptr must end at nnz"
        );
        assert!(
            row_ptr.windows(2).all(|w| w[0] <= w[1]),
            "row_ptr must be non-decreasing"
        );
        assert!(
            col_idx.iter().all(|c| (*c as usize) < cols),
            "column index out of range"
        );

        Self {
            rows,
            cols,
            row_ptr,
            col_idx,
            values,
        }
    }

    /// An all-zero sparse block.
    #[must_use]
    pub fn empty(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, vec![0; rows + 1], Vec::new(), Vec::new())
    }

    /// Number of stored nonzeros.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Value at `(row, col)`, zero if not stored.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        assert!(row < self.rows && col < self.cols, "index out of bounds");
        let start = self.row_ptr[row] as usize;
        let end = self.row_ptr[row + 1] as usize;
        self.col_idx[start..end]
            .iter()
            .position(|c| *c as usize == col)
            .map_or(0.0, |offset| self.values[start + offset])
    }
}

/// Materialised matrix contents in either representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostBlock {
    /// Row-major doubles
    Dense {
        /// Number of rows
        rows: usize,
        /// Number of columns
        cols: usize,
        /// `rows * cols` values
        values: Vec<f64>,
    },
    /// CSR layout
    Sparse(CsrBlock),
}

impl HostBlock {
    /// Build a dense block.
    ///
    /// # Panics
    /// Panics if `values.len() != rows * cols`.
    #[must_use]
    pub fn dense(rows: usize, cols: usize, values: Vec<f64>) -> Self {
        assert_eq!(
            values.len(),
            rows * cols,
            "dense block needs rows * cols values"
        );
        Self::Dense { rows, cols, values }
    }

    /// A dense block filled with one value.
    #[must_use]
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self::dense(rows, cols, vec![value; rows * cols])
    }

    /// An all-zero block in the given representation.
    #[must_use]
    pub fn zeros(shape: MatrixShape, representation: Representation) -> Self {
        match representation {
            Representation::Dense => Self::filled(shape.rows, shape.cols, 0.0),
            Representation::Sparse => Self::Sparse(CsrBlock::empty(shape.rows, shape.cols)),
        }
    }

    /// Representation of the stored layout.
    #[must_use]
    pub fn representation(&self) -> Representation {
        match self {
            Self::Dense { .. } => Representation::Dense,
            Self::Sparse(_) => Representation::Sparse,
        }
    }

    /// Shape with the true nonzero count.
    #[must_use]
    pub fn shape(&self) -> MatrixShape {
        match self {
            Self::Dense { rows, cols, values } => {
                MatrixShape::new(*rows, *cols, values.iter().filter(|v| **v != 0.0).count())
            }
            Self::Sparse(csr) => MatrixShape::new(csr.rows, csr.cols, csr.nnz()),
        }
    }

    /// Device footprint of this block in its own representation.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.shape().size_bytes(self.representation())
    }

    /// Value at `(row, col)`.
    ///
    /// # Panics
    /// Panics if the index is out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        match self {
            Self::Dense { rows, cols, values } => {
                assert!(row < *rows && col < *cols, "index out of bounds");
                values[row * cols + col]
            }
            Self::Sparse(csr) => csr.get(row, col),
        }
    }
}

// =============================================================================
// HostMatrix
// =============================================================================

#[derive(Debug)]
struct HostState {
    shape: MatrixShape,
    block: Option<HostBlock>,
}

/// A host-resident logical matrix.
///
/// Holds a shape (possibly an nnz estimate for matrices not yet computed) and
/// optional contents. Write-back from the device replaces the contents.
#[derive(Debug)]
pub struct HostMatrix {
    id: MatrixId,
    state: RwLock<HostState>,
}

impl HostMatrix {
    /// A matrix with materialised contents.
    #[must_use]
    pub fn new(id: impl Into<MatrixId>, block: HostBlock) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(HostState {
                shape: block.shape(),
                block: Some(block),
            }),
        }
    }

    /// A matrix that will be produced on the device (no host contents yet).
    #[must_use]
    pub fn empty(id: impl Into<MatrixId>, shape: MatrixShape) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(HostState { shape, block: None }),
        }
    }

    /// Identity.
    #[must_use]
    pub fn id(&self) -> MatrixId {
        self.id
    }

    /// Current shape.
    #[must_use]
    pub fn shape(&self) -> MatrixShape {
        self.state.read().shape
    }

    /// Whether host contents exist.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.state.read().block.is_some()
    }

    /// A copy of the host contents.
    #[must_use]
    pub fn block(&self) -> Option<HostBlock> {
        self.state.read().block.clone()
    }

    /// Single element of the host contents.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.state.read().block.as_ref().map(|b| b.get(row, col))
    }

    /// Run `f` against the host contents under the read lock.
    pub fn with_block<R>(&self, f: impl FnOnce(Option<&HostBlock>) -> R) -> R {
        f(self.state.read().block.as_ref())
    }

    /// Replace the host contents; the shape follows the block.
    pub fn replace_block(&self, block: HostBlock) {
        let mut state = self.state.write();
        state.shape = block.shape();
        state.block = Some(block);
    }
}
