//! # Gridcal
//!
//! Problem assembly and state indexing for chessboard camera calibration.
//! Gridcal turns raw calibration inputs (corner detections, seed intrinsics,
//! camera and board poses, discrete points) into a fully-indexed sparse
//! nonlinear least squares problem, then drives a caller-supplied solver over
//! it and packages the results.
//!
//! ## What the crate owns
//!
//! - **Lens model registry**: parsing `LENSMODEL_*` names, parameter counts,
//!   and the splined-stereographic configuration grammar
//! - **State and measurement layout**: deterministic variable ordering,
//!   packed-state scaling, and `offset_of`-style index queries
//! - **Input validation**: every cross-array count and index checked up
//!   front, so assembly and evaluation never see a bad index
//! - **Jacobian assembly**: column-by-column CSC construction of the
//!   transposed Jacobian, re-viewable zero-copy as CSR of `J`
//! - **The solve driver**: outlier rejection passes, result packaging,
//!   covariance extraction via faer's sparse Cholesky
//!
//! ## What the caller supplies
//!
//! The two pieces of math this crate deliberately does not own arrive
//! through traits: [`ProjectionModel`](solver::ProjectionModel) (camera
//! projection and its gradients) and
//! [`NonlinearSolver`](solver::NonlinearSolver) (the minimization
//! algorithm).

pub mod core;
pub mod error;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod model;
pub mod solver;

// Re-export core types
pub use crate::core::config::ProblemConfig;
pub use crate::core::layout::{EntityCounts, MeasurementLayout, StateLayout};
pub use crate::core::types::{
    BoardIndices, CalibrationInputs, ExtrinsicsIndex, PixelObservation, PointFlags, PointIndices,
    PointPixel, Pose,
};
pub use error::{GridcalError, GridcalResult};

pub use linalg::{CovarianceReport, CscStorage, CsrView, JacobianBuilder};
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use model::LensModel;
pub use solver::{
    CalibrationProblem, DriverPhase, NonlinearSolver, ProblemEval, ProjectionModel, SolveOptions,
    SolveReport,
};
