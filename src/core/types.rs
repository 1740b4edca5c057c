//! Input data model for calibration problems
//!
//! All observation data is caller-owned and borrowed for the duration of a
//! call. Index rows reference the entity arrays (cameras, frames, points) by
//! position; validation checks every reference before any layout or assembly
//! work happens.

use nalgebra::{Vector2, Vector3};

/// A rigid transform as a Rodrigues rotation vector plus a translation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Rotation as an axis-angle (Rodrigues) vector
    pub r: Vector3<f64>,
    /// Translation
    pub t: Vector3<f64>,
}

impl Pose {
    pub fn identity() -> Self {
        Pose {
            r: Vector3::zeros(),
            t: Vector3::zeros(),
        }
    }

    pub fn new(r: Vector3<f64>, t: Vector3<f64>) -> Self {
        Pose { r, t }
    }
}

/// Which extrinsics slot an observation was taken through
///
/// The reference camera defines the coordinate system and has no extrinsics
/// state; every other camera is addressed by its position in the extrinsics
/// array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtrinsicsIndex {
    /// The camera sitting at the reference coordinate system
    Reference,
    /// Index into the extrinsics array
    Camera(usize),
}

impl ExtrinsicsIndex {
    /// Index into the extrinsics array, `None` for the reference camera
    pub fn camera(&self) -> Option<usize> {
        match self {
            ExtrinsicsIndex::Reference => None,
            ExtrinsicsIndex::Camera(i) => Some(*i),
        }
    }

    /// Signed representation used for ordering checks and error messages:
    /// the reference camera sorts before camera 0
    pub fn as_i64(&self) -> i64 {
        match self {
            ExtrinsicsIndex::Reference => -1,
            ExtrinsicsIndex::Camera(i) => *i as i64,
        }
    }
}

/// Index row of one chessboard observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardIndices {
    /// Frame (chessboard pose) this observation belongs to
    pub frame: usize,
    /// Camera whose intrinsics were used
    pub cam_intrinsics: usize,
    /// Camera pose the observation was taken through
    pub cam_extrinsics: ExtrinsicsIndex,
}

/// Per-point-observation flags, unpacked from the wire representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointFlags {
    /// The range from the reference coordinate origin to this point is known
    pub has_ref_range: bool,
    /// The position of this point is known; it is held fixed during a solve
    pub has_ref_position: bool,
}

/// Index row of one discrete-point observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointIndices {
    /// Point this observation belongs to
    pub point: usize,
    /// Camera whose intrinsics were used
    pub cam_intrinsics: usize,
    /// Camera pose the observation was taken through
    pub cam_extrinsics: ExtrinsicsIndex,
    /// Prior-knowledge flags for this point
    pub flags: PointFlags,
}

/// One observed chessboard corner: pixel coordinates and a weight
///
/// A weight of zero excludes the corner from the residual while keeping its
/// rows (and Jacobian sparsity pattern) in place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelObservation {
    pub px: Vector2<f64>,
    pub weight: f64,
}

/// One observed discrete point: pixel coordinates and, optionally, the
/// measured range from the reference origin (used iff `has_ref_range`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointPixel {
    pub px: Vector2<f64>,
    pub ref_range: f64,
}

/// Everything a calibration problem is assembled from
///
/// Array shapes and cross-references are checked by the consistency
/// validator before anything else runs:
/// - `intrinsics` is `Ncameras_intrinsics × Nlens`, flat row-major
/// - `corners_board` is `indices_board.len() × W²` where
///   `W = calibration_object_width_n`, rows of corners stored row-major
///   within each observation
/// - `observations_point` pairs 1:1 with `indices_point`
#[derive(Debug, Clone, Copy)]
pub struct CalibrationInputs<'a> {
    pub intrinsics: &'a [f64],
    pub extrinsics: &'a [Pose],
    pub frames: &'a [Pose],
    pub points: &'a [Vector3<f64>],
    pub calobject_warp: Option<[f64; 2]>,

    pub indices_board: &'a [BoardIndices],
    pub corners_board: &'a [PixelObservation],
    pub indices_point: &'a [PointIndices],
    pub observations_point: &'a [PointPixel],

    /// Imager `[width, height]` per intrinsics camera
    pub imagersizes: &'a [[u32; 2]],
    /// Optional region of interest `[cx, cy, width, height]` per intrinsics
    /// camera; board corners observed outside it are down-weighted to zero
    pub roi: Option<&'a [[f64; 4]]>,

    /// Distance between adjacent chessboard corners, in object units
    pub calibration_object_spacing: f64,
    /// Number of corners along each side of the chessboard grid
    pub calibration_object_width_n: usize,

    /// Strictly increasing board-observation indices to drop from the problem
    pub skipped_observations_board: &'a [usize],
    /// Strictly increasing point-observation indices to drop from the problem
    pub skipped_observations_point: &'a [usize],

    /// Flat board-feature indices (`i_observation·W² + i_corner`) known bad
    /// ahead of time; excluded from the residual from the first pass
    pub outlier_indices: &'a [usize],
}

impl<'a> CalibrationInputs<'a> {
    /// Inputs with no observations and no entities; useful as a starting
    /// point for tests and incremental construction
    pub fn empty() -> Self {
        CalibrationInputs {
            intrinsics: &[],
            extrinsics: &[],
            frames: &[],
            points: &[],
            calobject_warp: None,
            indices_board: &[],
            corners_board: &[],
            indices_point: &[],
            observations_point: &[],
            imagersizes: &[],
            roi: None,
            calibration_object_spacing: 0.0,
            calibration_object_width_n: 0,
            skipped_observations_board: &[],
            skipped_observations_point: &[],
            outlier_indices: &[],
        }
    }

    pub fn num_cameras_intrinsics(&self) -> usize {
        self.imagersizes.len()
    }

    pub fn num_cameras_extrinsics(&self) -> usize {
        self.extrinsics.len()
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    /// Corners per board observation (`W²`)
    pub fn corners_per_board(&self) -> usize {
        self.calibration_object_width_n * self.calibration_object_width_n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extrinsics_index_ordering_representation() {
        assert_eq!(ExtrinsicsIndex::Reference.as_i64(), -1);
        assert_eq!(ExtrinsicsIndex::Camera(0).as_i64(), 0);
        assert_eq!(ExtrinsicsIndex::Camera(7).as_i64(), 7);
        assert!(ExtrinsicsIndex::Reference.as_i64() < ExtrinsicsIndex::Camera(0).as_i64());
        assert_eq!(ExtrinsicsIndex::Reference.camera(), None);
        assert_eq!(ExtrinsicsIndex::Camera(3).camera(), Some(3));
    }

    #[test]
    fn test_empty_inputs_counts() {
        let inputs = CalibrationInputs::empty();
        assert_eq!(inputs.num_cameras_intrinsics(), 0);
        assert_eq!(inputs.num_cameras_extrinsics(), 0);
        assert_eq!(inputs.num_frames(), 0);
        assert_eq!(inputs.num_points(), 0);
        assert_eq!(inputs.corners_per_board(), 0);
    }
}
