//! Core problem-assembly components
//!
//! This module contains everything needed to turn caller-supplied
//! calibration data into a well-formed optimization problem:
//! - Problem configuration flags
//! - Input data model
//! - Observation skip resolution
//! - Input consistency validation
//! - State and measurement vector layouts, with pack/unpack scaling

pub mod config;
pub mod layout;
pub mod skip;
pub mod types;
pub mod validate;

use thiserror::Error;
use tracing::error;

/// Input consistency errors
///
/// Each variant names the offending array or row and carries both
/// conflicting values, so a failure can be traced to the exact input
/// element without re-running anything.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// Two arrays that must agree on a count do not
    #[error("'{array}' has {got} elements but {counted_by} requires {expected}")]
    CountMismatch {
        array: &'static str,
        got: usize,
        expected: usize,
        counted_by: &'static str,
    },

    /// An index in an observation row references a nonexistent entity
    #[error("{what} out of range in row {row}: got {got}, valid range is [{min}, {max})")]
    IndexOutOfRange {
        what: &'static str,
        row: usize,
        got: i64,
        min: i64,
        max: i64,
    },

    /// An observation index sequence violates its ordering requirement
    #[error("{what} must be {requirement}: row {row} has {got} after {previous}")]
    NonMonotonic {
        what: &'static str,
        requirement: &'static str,
        row: usize,
        got: i64,
        previous: i64,
    },

    /// A layout query referenced an entity past the declared count
    #[error("{what} index {got} out of range: the problem has {count}")]
    EntityOutOfRange {
        what: &'static str,
        got: usize,
        count: usize,
    },

    /// A layout query referenced a block the configuration left out of the
    /// state vector
    #[error("state block '{0}' is disabled by the problem configuration")]
    DisabledBlock(&'static str),

    /// The chessboard grid is too small to constrain anything
    #[error("calibration object grid must be at least 2x2, got width {0}")]
    GridTooSmall(usize),

    /// The chessboard corner spacing must be positive
    #[error("calibration_object_spacing must be > 0, got {0}")]
    NonPositiveSpacing(f64),

    /// The warp is being optimized but no seed value was given
    #[error("calobject_warp must be supplied when optimize_calobject_warp is set")]
    MissingCalobjectWarp,

    /// Outlier rejection needs a positive pixel noise estimate
    #[error("observed_pixel_uncertainty must be > 0 when outlier rejection runs, got {0}")]
    NonPositiveUncertainty(f64),

    /// A pack/unpack buffer is not a stack of whole state vectors
    #[error("state array length {got} is not a nonzero multiple of the state size {num_states}")]
    StateLengthMismatch { got: usize, num_states: usize },
}

impl ValidationError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error from a third-party library
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Malformed skip-list errors
///
/// Skip lists must be strictly increasing observation indices within range.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum OrderingError {
    /// A skip value repeats or decreases
    #[error(
        "skipped {kind} observations must be strictly increasing: \
         position {position} has {got} after {previous}"
    )]
    NotIncreasing {
        kind: &'static str,
        position: usize,
        got: usize,
        previous: usize,
    },

    /// A skip value references a nonexistent observation
    #[error(
        "skipped {kind} observation {got} at position {position} out of range: \
         the problem has {count} observations"
    )]
    OutOfRange {
        kind: &'static str,
        position: usize,
        got: usize,
        count: usize,
    },
}

impl OrderingError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for skip resolution
pub type OrderingResult<T> = Result<T, OrderingError>;
