//! Sparse linear algebra support
//!
//! Two concerns live here: assembling the transposed measurement Jacobian
//! (and re-viewing it as CSR without copying), and turning the final
//! Jacobian into covariance blocks via faer's sparse Cholesky.

pub mod covariance;
pub mod jacobian;

use thiserror::Error;
use tracing::error;

/// Linear algebra error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// A Jacobian entry was pushed out of order within a measurement
    #[error(
        "Jacobian entry out of order in measurement {column}: \
         state index {got} after {previous}"
    )]
    UnorderedEntry {
        column: usize,
        got: usize,
        previous: usize,
    },

    /// A Jacobian entry referenced a state index past the state dimension
    #[error(
        "Jacobian entry in measurement {column} references state index {got}, \
         but the state has {num_states} elements"
    )]
    EntryOutOfRange {
        column: usize,
        got: usize,
        num_states: usize,
    },

    /// `push` was called before any measurement column was started
    #[error("Jacobian entry pushed before any measurement was started")]
    PushBeforeMeasurement,

    /// More measurement columns were started than the layout declared
    #[error("more measurements started than the layout declared ({expected})")]
    TooManyMeasurements { expected: usize },

    /// The assembly finished with the wrong number of measurement columns
    #[error("assembled {got} measurements but the layout declared {expected}")]
    MeasurementCountMismatch { got: usize, expected: usize },

    /// The assembly finished with the wrong number of nonzeros
    #[error("assembled {got} Jacobian nonzeros but the layout declared {expected}")]
    NnzMismatch { got: usize, expected: usize },

    /// Failed to create a sparse matrix from assembled data
    #[error("Failed to create sparse matrix: {0}")]
    SparseMatrixCreation(String),

    /// Matrix factorization failed (Cholesky)
    #[error("Matrix factorization failed: {0}")]
    FactorizationFailed(String),

    /// Singular or near-singular matrix detected
    #[error("Singular matrix detected (matrix is not invertible)")]
    SingularMatrix,

    /// Matrix format conversion failed
    #[error("Matrix conversion failed: {0}")]
    MatrixConversion(String),
}

impl LinAlgError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party
    /// library (faer's CreationError, LltError, and friends)
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

pub use covariance::{compute_covariances, to_faer, CovarianceReport};
pub use jacobian::{CscStorage, CsrView, JacobianBuilder};
