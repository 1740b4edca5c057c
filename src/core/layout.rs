//! State and measurement vector layouts
//!
//! The optimization state vector concatenates, in canonical order:
//! intrinsics (core then distortions, per camera), extrinsics (6 per
//! non-reference camera), frames (6 each), points (3 each), and the
//! 2-element calibration-object warp. Each block is present iff its
//! configuration flag is set and its entity count is nonzero.
//!
//! The measurement vector concatenates board reprojection residuals, point
//! residuals, and regularization residuals. Skipped observations contribute
//! no rows.
//!
//! Everything downstream (assembly, the sparse bridge, the snapshot
//! queries) consults these two layouts; offsets are computed nowhere else.
//!
//! The solver state is stored *packed*: each element is divided by a
//! per-block scale constant so that a unit step means roughly the same
//! thing in every direction. [`StateLayout::pack`] and
//! [`StateLayout::unpack`] convert in place and accept stacks of state
//! vectors.

use crate::core::config::ProblemConfig;
use crate::core::skip::SkipFlags;
use crate::core::types::{BoardIndices, CalibrationInputs, PointIndices};
use crate::core::ValidationError;
use crate::model::{LensModel, NUM_INTRINSICS_CORE};

pub const SCALE_INTRINSICS_FOCAL_LENGTH: f64 = 500.0;
pub const SCALE_INTRINSICS_CENTER_PIXEL: f64 = 20.0;
pub const SCALE_DISTORTION: f64 = 2.0;
pub const SCALE_ROTATION_CAMERA: f64 = 0.1;
pub const SCALE_TRANSLATION_CAMERA: f64 = 1.0;
pub const SCALE_ROTATION_FRAME: f64 = 0.1;
pub const SCALE_TRANSLATION_FRAME: f64 = 1.0;
pub const SCALE_POSITION_POINT: f64 = 1.0;
pub const SCALE_CALOBJECT_WARP: f64 = 0.01;

/// How many of each entity a problem has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityCounts {
    pub cameras_intrinsics: usize,
    pub cameras_extrinsics: usize,
    pub frames: usize,
    pub points: usize,
}

impl EntityCounts {
    pub fn from_inputs(inputs: &CalibrationInputs<'_>) -> Self {
        EntityCounts {
            cameras_intrinsics: inputs.num_cameras_intrinsics(),
            cameras_extrinsics: inputs.num_cameras_extrinsics(),
            frames: inputs.num_frames(),
            points: inputs.num_points(),
        }
    }
}

/// Offsets and sizes of every block of the state vector
#[derive(Debug, Clone)]
pub struct StateLayout {
    counts: EntityCounts,
    num_distortions: usize,
    core_in_state: bool,
    distortions_in_state: bool,
    extrinsics_in_state: bool,
    frames_in_state: bool,
    warp_in_state: bool,
    offset_extrinsics: usize,
    offset_frames: usize,
    offset_points: usize,
    offset_calobject_warp: usize,
    num_states: usize,
    scales: Vec<f64>,
}

impl StateLayout {
    pub fn new(counts: EntityCounts, config: &ProblemConfig, model: &LensModel) -> Self {
        let num_distortions = model.distortion_count();
        let core_in_state = config.optimize_intrinsics_core && model.has_core();
        let distortions_in_state = config.optimize_intrinsics_distortions && num_distortions > 0;
        let extrinsics_in_state = config.optimize_extrinsics && counts.cameras_extrinsics > 0;
        let frames_in_state = config.optimize_frames;
        let warp_in_state = config.optimize_calobject_warp;

        let per_camera = (if core_in_state { NUM_INTRINSICS_CORE } else { 0 })
            + (if distortions_in_state { num_distortions } else { 0 });

        let offset_extrinsics = per_camera * counts.cameras_intrinsics;
        let offset_frames = offset_extrinsics
            + if extrinsics_in_state {
                6 * counts.cameras_extrinsics
            } else {
                0
            };
        let offset_points = offset_frames + if frames_in_state { 6 * counts.frames } else { 0 };
        let offset_calobject_warp =
            offset_points + if frames_in_state { 3 * counts.points } else { 0 };
        let num_states = offset_calobject_warp + if warp_in_state { 2 } else { 0 };

        let mut scales = Vec::with_capacity(num_states);
        for _ in 0..counts.cameras_intrinsics {
            if core_in_state {
                scales.extend_from_slice(&[
                    SCALE_INTRINSICS_FOCAL_LENGTH,
                    SCALE_INTRINSICS_FOCAL_LENGTH,
                    SCALE_INTRINSICS_CENTER_PIXEL,
                    SCALE_INTRINSICS_CENTER_PIXEL,
                ]);
            }
            if distortions_in_state {
                scales.extend(std::iter::repeat(SCALE_DISTORTION).take(num_distortions));
            }
        }
        if extrinsics_in_state {
            for _ in 0..counts.cameras_extrinsics {
                scales.extend(std::iter::repeat(SCALE_ROTATION_CAMERA).take(3));
                scales.extend(std::iter::repeat(SCALE_TRANSLATION_CAMERA).take(3));
            }
        }
        if frames_in_state {
            for _ in 0..counts.frames {
                scales.extend(std::iter::repeat(SCALE_ROTATION_FRAME).take(3));
                scales.extend(std::iter::repeat(SCALE_TRANSLATION_FRAME).take(3));
            }
            scales.extend(std::iter::repeat(SCALE_POSITION_POINT).take(3 * counts.points));
        }
        if warp_in_state {
            scales.extend(std::iter::repeat(SCALE_CALOBJECT_WARP).take(2));
        }
        debug_assert_eq!(scales.len(), num_states);

        StateLayout {
            counts,
            num_distortions,
            core_in_state,
            distortions_in_state,
            extrinsics_in_state,
            frames_in_state,
            warp_in_state,
            offset_extrinsics,
            offset_frames,
            offset_points,
            offset_calobject_warp,
            num_states,
            scales,
        }
    }

    pub fn counts(&self) -> &EntityCounts {
        &self.counts
    }

    /// Length of the full state vector
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// State entries per camera's intrinsics under the current configuration
    pub fn num_intrinsics_state_per_camera(&self) -> usize {
        (if self.core_in_state { NUM_INTRINSICS_CORE } else { 0 })
            + (if self.distortions_in_state {
                self.num_distortions
            } else {
                0
            })
    }

    /// Distortion parameter count of the lens model
    pub fn num_distortions(&self) -> usize {
        self.num_distortions
    }

    pub fn core_in_state(&self) -> bool {
        self.core_in_state
    }

    pub fn distortions_in_state(&self) -> bool {
        self.distortions_in_state
    }

    pub fn extrinsics_in_state(&self) -> bool {
        self.extrinsics_in_state
    }

    pub fn frames_in_state(&self) -> bool {
        self.frames_in_state
    }

    pub fn warp_in_state(&self) -> bool {
        self.warp_in_state
    }

    /// Per-element pack scales, indexed by state position
    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    fn check_entity(
        &self,
        what: &'static str,
        index: usize,
        count: usize,
    ) -> Result<(), ValidationError> {
        if index >= count {
            return Err(ValidationError::EntityOutOfRange {
                what,
                got: index,
                count,
            }
            .log());
        }
        Ok(())
    }

    /// State offset of camera `i_cam`'s intrinsics block
    pub fn index_intrinsics(&self, i_cam: usize) -> Result<usize, ValidationError> {
        let per_camera = self.num_intrinsics_state_per_camera();
        if per_camera == 0 {
            return Err(ValidationError::DisabledBlock("intrinsics").log());
        }
        self.check_entity("intrinsics camera", i_cam, self.counts.cameras_intrinsics)?;
        Ok(i_cam * per_camera)
    }

    /// State offset of non-reference camera `i_cam`'s 6-element pose block
    pub fn index_extrinsics(&self, i_cam: usize) -> Result<usize, ValidationError> {
        if !self.extrinsics_in_state {
            return Err(ValidationError::DisabledBlock("extrinsics").log());
        }
        self.check_entity("extrinsics camera", i_cam, self.counts.cameras_extrinsics)?;
        Ok(self.offset_extrinsics + 6 * i_cam)
    }

    /// State offset of frame `i_frame`'s 6-element pose block
    pub fn index_frame(&self, i_frame: usize) -> Result<usize, ValidationError> {
        if !self.frames_in_state {
            return Err(ValidationError::DisabledBlock("frames").log());
        }
        self.check_entity("frame", i_frame, self.counts.frames)?;
        Ok(self.offset_frames + 6 * i_frame)
    }

    /// State offset of point `i_point`'s 3-element position block
    pub fn index_point(&self, i_point: usize) -> Result<usize, ValidationError> {
        if !self.frames_in_state {
            return Err(ValidationError::DisabledBlock("points").log());
        }
        self.check_entity("point", i_point, self.counts.points)?;
        Ok(self.offset_points + 3 * i_point)
    }

    /// State offset of the 2-element calibration-object warp block
    pub fn index_calobject_warp(&self) -> Result<usize, ValidationError> {
        if !self.warp_in_state {
            return Err(ValidationError::DisabledBlock("calobject_warp").log());
        }
        Ok(self.offset_calobject_warp)
    }

    fn check_stack(&self, len: usize) -> Result<(), ValidationError> {
        if self.num_states == 0 {
            if len == 0 {
                return Ok(());
            }
            return Err(ValidationError::StateLengthMismatch {
                got: len,
                num_states: 0,
            }
            .log());
        }
        if len == 0 || len % self.num_states != 0 {
            return Err(ValidationError::StateLengthMismatch {
                got: len,
                num_states: self.num_states,
            }
            .log());
        }
        Ok(())
    }

    /// Scale a state vector (or a stack of them) into packed solver units,
    /// in place
    ///
    /// # Errors
    /// `ValidationError::StateLengthMismatch` unless the length is a nonzero
    /// multiple of [`StateLayout::num_states`] (or zero for an empty state).
    pub fn pack(&self, state: &mut [f64]) -> Result<(), ValidationError> {
        self.check_stack(state.len())?;
        for chunk in state.chunks_exact_mut(self.num_states.max(1)) {
            for (value, scale) in chunk.iter_mut().zip(&self.scales) {
                *value /= scale;
            }
        }
        Ok(())
    }

    /// Scale a packed state vector (or a stack of them) back into natural
    /// units, in place
    pub fn unpack(&self, state: &mut [f64]) -> Result<(), ValidationError> {
        self.check_stack(state.len())?;
        for chunk in state.chunks_exact_mut(self.num_states.max(1)) {
            for (value, scale) in chunk.iter_mut().zip(&self.scales) {
                *value *= scale;
            }
        }
        Ok(())
    }
}

/// Row counts and boundaries of the measurement vector, plus the exact
/// Jacobian nonzero count the assembly will produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementLayout {
    /// Board reprojection rows (block starts at row 0)
    pub num_measurements_boards: usize,
    /// Point observation rows
    pub num_measurements_points: usize,
    /// Regularization rows
    pub num_measurements_regularization: usize,
    /// First point row
    pub offset_points: usize,
    /// First regularization row
    pub offset_regularization: usize,
    /// Total rows
    pub num_measurements: usize,
    /// Exact nonzero count of the Jacobian
    pub jacobian_nnz: usize,
}

impl MeasurementLayout {
    /// Compute the measurement layout for resolved (skip-annotated)
    /// observations
    ///
    /// `board_skips` and `point_skips` pair 1:1 with the index arrays; both
    /// come from the skip resolver.
    pub fn new(
        state: &StateLayout,
        config: &ProblemConfig,
        width_n: usize,
        indices_board: &[BoardIndices],
        board_skips: &[SkipFlags],
        indices_point: &[PointIndices],
        point_skips: &[SkipFlags],
    ) -> Self {
        debug_assert_eq!(indices_board.len(), board_skips.len());
        debug_assert_eq!(indices_point.len(), point_skips.len());

        let per_camera = state.num_intrinsics_state_per_camera();
        let rows_per_board = 2 * width_n * width_n;

        let mut num_measurements_boards = 0;
        let mut jacobian_nnz = 0;
        for (indices, skip) in indices_board.iter().zip(board_skips) {
            if skip.skip_observation {
                continue;
            }
            let mut cols = per_camera;
            if state.extrinsics_in_state() && indices.cam_extrinsics.camera().is_some() {
                cols += 6;
            }
            if state.frames_in_state() {
                cols += 6;
            }
            if state.warp_in_state() {
                cols += 2;
            }
            num_measurements_boards += rows_per_board;
            jacobian_nnz += rows_per_board * cols;
        }

        let mut num_measurements_points = 0;
        for (indices, skip) in indices_point.iter().zip(point_skips) {
            if skip.skip_observation {
                continue;
            }
            let mut cols = per_camera;
            if state.extrinsics_in_state() && indices.cam_extrinsics.camera().is_some() {
                cols += 6;
            }
            let point_cols = if state.frames_in_state() { 3 } else { 0 };
            cols += point_cols;

            num_measurements_points += 2;
            jacobian_nnz += 2 * cols;
            if indices.flags.has_ref_range {
                num_measurements_points += 1;
                jacobian_nnz += point_cols;
            }
        }

        let num_measurements_regularization = if config.skip_regularization {
            0
        } else {
            let per_camera_rows = (if state.core_in_state() { 2 } else { 0 })
                + (if state.distortions_in_state() {
                    state.num_distortions()
                } else {
                    0
                });
            state.counts().cameras_intrinsics * per_camera_rows
        };
        jacobian_nnz += num_measurements_regularization;

        let offset_points = num_measurements_boards;
        let offset_regularization = offset_points + num_measurements_points;

        MeasurementLayout {
            num_measurements_boards,
            num_measurements_points,
            num_measurements_regularization,
            offset_points,
            offset_regularization,
            num_measurements: offset_regularization + num_measurements_regularization,
            jacobian_nnz,
        }
    }
}
