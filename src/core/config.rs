//! Problem configuration flags
//!
//! Six booleans select which parameter blocks enter the optimization state
//! vector and whether regularization rows are appended to the measurement
//! vector. The state and measurement layouts are pure functions of these
//! flags plus the entity counts, so flipping a flag re-derives every offset.

/// Selects the variable set and the regularization policy of a problem
///
/// Defaults match the common calibration case: all geometry and intrinsics
/// are optimized, the calibration-object warp is held fixed, and
/// regularization is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemConfig {
    /// Optimize the fx/fy/cx/cy core of each camera's intrinsics
    pub optimize_intrinsics_core: bool,
    /// Optimize the distortion parameters of each camera's intrinsics
    pub optimize_intrinsics_distortions: bool,
    /// Optimize the poses of the non-reference cameras
    pub optimize_extrinsics: bool,
    /// Optimize the chessboard frame poses and the discrete point positions
    pub optimize_frames: bool,
    /// Optimize the 2-parameter calibration-object deformation
    pub optimize_calobject_warp: bool,
    /// Omit the regularization rows from the measurement vector
    pub skip_regularization: bool,
}

impl Default for ProblemConfig {
    fn default() -> Self {
        ProblemConfig {
            optimize_intrinsics_core: true,
            optimize_intrinsics_distortions: true,
            optimize_extrinsics: true,
            optimize_frames: true,
            optimize_calobject_warp: false,
            skip_regularization: false,
        }
    }
}

impl ProblemConfig {
    /// True if any intrinsics parameters are in the state vector
    pub fn optimizes_intrinsics(&self) -> bool {
        self.optimize_intrinsics_core || self.optimize_intrinsics_distortions
    }
}
