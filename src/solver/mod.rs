//! Problem driver and collaborator seams
//!
//! The driver owns the full pipeline: validate inputs, resolve skips,
//! compute layouts, assemble residuals and the transposed Jacobian, run a
//! caller-supplied nonlinear solver, and package results. The two pieces of
//! math this crate deliberately does not own arrive through traits:
//! [`ProjectionModel`] (camera projection and its gradients) and
//! [`NonlinearSolver`] (the minimization algorithm).

pub mod driver;
pub mod snapshot;

use nalgebra::{Vector2, Vector3};
use thiserror::Error;
use tracing::error;

use crate::core::types::Pose;
use crate::core::{OrderingError, ValidationError};
use crate::linalg::{CovarianceReport, CscStorage, JacobianBuilder, LinAlgError};
use snapshot::SolverSnapshot;

/// Errors raised while driving a solve
#[derive(Debug, Error)]
pub enum SolveError {
    /// The nonlinear solver reported failure
    #[error("solver reported failure (final norm {final_norm2})")]
    SolverFailed { final_norm2: f64 },

    /// The projection model produced a NaN or infinite residual
    #[error("non-finite residual at measurement row {row}")]
    NonFiniteResidual { row: usize },

    /// Outlier rejection kept finding new outliers past the pass limit
    #[error("outlier rejection did not settle after {passes} passes")]
    TooManyOutlierPasses { passes: usize },

    /// Input validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A skip list was malformed
    #[error(transparent)]
    Ordering(#[from] OrderingError),

    /// Jacobian assembly or covariance computation failed
    #[error(transparent)]
    LinAlg(#[from] LinAlgError),
}

impl SolveError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for driver operations
pub type SolveResult<T> = Result<T, SolveError>;

/// Where the driver currently is in its pipeline
///
/// `Failed` is reachable from every other phase; accessors on a report are
/// only meaningful once `Done` is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    Validating,
    Assembling,
    Solving,
    Packaging,
    Done,
    Failed,
}

impl std::fmt::Display for DriverPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverPhase::Validating => "validating",
            DriverPhase::Assembling => "assembling",
            DriverPhase::Solving => "solving",
            DriverPhase::Packaging => "packaging",
            DriverPhase::Done => "done",
            DriverPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Inputs for projecting one chessboard corner
#[derive(Debug, Clone, Copy)]
pub struct BoardPointQuery<'a> {
    /// Full intrinsics row of the observing camera, core first
    pub intrinsics: &'a [f64],
    /// Camera pose; `None` when the camera sits at the reference
    pub extrinsics: Option<Pose>,
    /// Chessboard pose for this frame
    pub frame: Pose,
    /// Calibration-object warp parameters, if the problem carries them
    pub calobject_warp: Option<[f64; 2]>,
    /// Corner position in the flat board plane, object units
    pub object_point: Vector3<f64>,
    /// Corner position as a fraction of the grid in each direction, in
    /// [0, 1]; this is what the warp deformation is a function of
    pub grid_fraction: Vector2<f64>,
}

/// Inputs for projecting one discrete point
#[derive(Debug, Clone, Copy)]
pub struct PointQuery<'a> {
    pub intrinsics: &'a [f64],
    pub extrinsics: Option<Pose>,
    /// Point position in the reference coordinate system
    pub point: Vector3<f64>,
}

/// Gradient output buffers for one projected board corner
///
/// All buffers are 2 x N row-major (pixel x row first, then pixel y).
/// `d_extrinsics` is left untouched for reference-camera observations.
pub struct BoardPointGradients<'a> {
    /// 2 x Nlens, over the full intrinsics row
    pub d_intrinsics: &'a mut [f64],
    /// 2 x 6, over the camera's (r, t)
    pub d_extrinsics: &'a mut [f64],
    /// 2 x 6, over the frame's (r, t)
    pub d_frame: &'a mut [f64],
    /// 2 x 2, over the warp parameters
    pub d_calobject_warp: &'a mut [f64],
}

/// Gradient output buffers for one projected discrete point
pub struct PointGradients<'a> {
    /// 2 x Nlens
    pub d_intrinsics: &'a mut [f64],
    /// 2 x 6
    pub d_extrinsics: &'a mut [f64],
    /// 2 x 3, over the point position
    pub d_point: &'a mut [f64],
}

/// Camera projection and its gradients, supplied by the caller
///
/// Both methods return the predicted pixel and, when gradient buffers are
/// handed in, fill them at the same linearization point.
pub trait ProjectionModel {
    fn project_board_point(
        &self,
        query: &BoardPointQuery<'_>,
        gradients: Option<&mut BoardPointGradients<'_>>,
    ) -> Vector2<f64>;

    fn project_point(
        &self,
        query: &PointQuery<'_>,
        gradients: Option<&mut PointGradients<'_>>,
    ) -> Vector2<f64>;
}

/// Problem evaluation interface handed to the nonlinear solver
///
/// The state is always in packed units; the Jacobian entries the builder
/// receives are with respect to the packed state.
pub trait ProblemEval {
    /// Measurement vector length
    fn num_measurements(&self) -> usize;

    /// Fresh builder pre-sized for this problem's Jacobian
    fn new_jacobian_builder(&self) -> JacobianBuilder;

    /// Evaluate residuals (and optionally assemble the transposed Jacobian)
    /// at the given packed state
    fn evaluate(
        &mut self,
        state: &[f64],
        residuals: &mut [f64],
        jacobian: Option<&mut JacobianBuilder>,
    ) -> SolveResult<()>;
}

/// What a nonlinear solver reports back
///
/// A negative `final_norm2` is the failure sentinel; the driver turns it
/// into [`SolveError::SolverFailed`].
#[derive(Debug, Clone, Copy)]
pub struct SolveOutcome {
    /// Final squared residual norm, or a negative value on failure
    pub final_norm2: f64,
    pub iterations: usize,
}

/// The minimization algorithm, supplied by the caller
///
/// `state` arrives seeded and packed; the solver iterates it in place
/// through the evaluation callback.
pub trait NonlinearSolver {
    fn solve(&mut self, state: &mut [f64], eval: &mut dyn ProblemEval) -> SolveResult<SolveOutcome>;
}

/// Knobs of a single `optimize` run
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// Expected 1-sigma noise of the corner detector, pixels
    pub observed_pixel_uncertainty: f64,
    /// Disable driver-level outlier rejection entirely
    pub skip_outlier_rejection: bool,
    /// Features beyond `threshold x uncertainty` pixels of error are outliers
    pub outlier_threshold: f64,
    /// Re-solve at most this many times while new outliers appear
    pub max_outlier_passes: usize,
    /// Compute intrinsics/extrinsics covariance blocks after the solve
    pub with_covariances: bool,
    /// Log per-pass details at info level instead of debug
    pub verbose: bool,
}

impl Default for SolveOptions {
    fn default() -> Self {
        SolveOptions {
            observed_pixel_uncertainty: 1.0,
            skip_outlier_rejection: false,
            outlier_threshold: 4.0,
            max_outlier_passes: 10,
            with_covariances: false,
            verbose: false,
        }
    }
}

/// Everything an optimization run produces
#[derive(Debug)]
pub struct SolveReport {
    /// Optimized intrinsics, `Ncameras_intrinsics x Nlens` flat row-major
    pub intrinsics: Vec<f64>,
    /// Optimized non-reference camera poses
    pub extrinsics: Vec<Pose>,
    /// Optimized frame poses
    pub frames: Vec<Pose>,
    /// Optimized point positions
    pub points: Vec<Vector3<f64>>,
    /// Optimized warp, if it was in the state
    pub calobject_warp: Option<[f64; 2]>,

    /// RMS reprojection error over the active (nonzero-weight) features
    pub rms_reproj_error_pixels: f64,
    /// Final squared residual norm from the solver
    pub final_norm2: f64,
    pub iterations: usize,

    /// All board features excluded as outliers, pre-declared ones included,
    /// sized to the true count
    pub outlier_indices: Vec<usize>,
    /// Board features excluded for falling outside their camera's ROI
    pub outside_roi_indices: Vec<usize>,

    /// Covariance blocks, when requested
    pub covariances: Option<CovarianceReport>,

    pub elapsed: std::time::Duration,

    /// Owned handle over the final state, residuals and Jacobian
    pub snapshot: SolverSnapshot,
}

/// Output of a single-callback evaluation at the seed state: no solver, no
/// iteration, just the assembled problem
#[derive(Debug)]
pub struct CallbackOutput {
    /// Packed seed state the evaluation ran at
    pub state: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Transposed Jacobian; view it as CSR of `J` with
    /// [`CscStorage::as_csr`]
    pub jacobian_t: CscStorage,
}

pub use driver::CalibrationProblem;
pub use snapshot::MeasurementCounts;
