//! Error types for the gridcal library
//!
//! This module provides the main error and result types used throughout the library.
//! All errors use the `thiserror` crate for automatic trait implementations.
//!
//! # Error Hierarchy
//!
//! The library uses a hierarchical error system where:
//! - **`GridcalError`** is the top-level error exposed to users via public APIs
//! - **Module errors** (`ValidationError`, `SolveError`, etc.) are wrapped inside GridcalError
//! - **Error sources** are preserved, allowing full error chain inspection
//!
//! Example error chain:
//! ```text
//! GridcalError::Solve(
//!     SolveError::Validation(
//!         ValidationError::CountMismatch { .. }
//!     )
//! )
//! ```

use crate::core::{OrderingError, ValidationError};
use crate::linalg::LinAlgError;
use crate::model::ModelError;
use crate::solver::SolveError;
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the gridcal library
pub type GridcalResult<T> = Result<T, GridcalError>;

/// Main error type for the gridcal library
///
/// This is the top-level error type exposed by public APIs. It wraps module-specific
/// errors while preserving the full error chain for debugging.
///
/// # Error Chain Access
///
/// You can access the full error chain using the `chain()` method:
///
/// ```rust,ignore
/// if let Err(e) = problem.optimize(&projection, &mut solver) {
///     warn!("Error: {}", e);
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum GridcalError {
    /// Lens model name parsing and configuration errors
    #[error(transparent)]
    Model(#[from] ModelError),

    /// Input validation errors (counts, index ranges, monotonicity)
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Skip list ordering errors
    #[error(transparent)]
    Ordering(#[from] OrderingError),

    /// Jacobian assembly and covariance computation errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Solve driver errors
    #[error(transparent)]
    Solve(#[from] SolveError),
}

// Module-specific errors are automatically converted via #[from] attributes above

impl GridcalError {
    /// Get the full error chain as a string for logging and debugging.
    ///
    /// This method traverses the error source chain and returns a formatted string
    /// showing the hierarchy of errors from the top-level GridcalError down to the
    /// root cause.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// match problem.optimize(&projection, &mut solver) {
    ///     Ok(report) => { /* ... */ }
    ///     Err(e) => {
    ///         warn!("Solve failed!");
    ///         warn!("Error chain: {}", e.chain());
    ///     }
    /// }
    /// ```
    pub fn chain(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(format!("  → {}", err));
            source = err.source();
        }

        chain.join("\n")
    }

    /// Get a compact single-line error chain for logging
    ///
    /// Similar to `chain()` but formats as a single line with arrow separators.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// error!("Solve failed: {}", gridcal_err.chain_compact());
    /// ```
    pub fn chain_compact(&self) -> String {
        let mut chain = vec![self.to_string()];
        let mut source = self.source();

        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }

        chain.join(" → ")
    }
}
