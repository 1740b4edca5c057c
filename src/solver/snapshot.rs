//! Owned solver snapshot handle
//!
//! After a drive completes, callers often want to keep interrogating the
//! problem: where does camera 2's intrinsics block start, how many
//! measurement rows were regularization, what did the final Jacobian look
//! like. The snapshot owns everything those queries need (final packed
//! state, residuals, transposed Jacobian, both layouts), so it stays valid
//! for as long as the caller holds it and frees itself when dropped.

use crate::core::layout::{MeasurementLayout, StateLayout};
use crate::core::{ValidationError, ValidationResult};
use crate::linalg::{CscStorage, CsrView};

/// Measurement vector breakdown by block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementCounts {
    pub boards: usize,
    pub points: usize,
    pub regularization: usize,
    pub total: usize,
}

/// Frozen view of a finished drive
#[derive(Debug)]
pub struct SolverSnapshot {
    state: Vec<f64>,
    residuals: Vec<f64>,
    jacobian_t: CscStorage,
    state_layout: StateLayout,
    measurement_layout: MeasurementLayout,
}

impl SolverSnapshot {
    pub(crate) fn new(
        state: Vec<f64>,
        residuals: Vec<f64>,
        jacobian_t: CscStorage,
        state_layout: StateLayout,
        measurement_layout: MeasurementLayout,
    ) -> Self {
        SolverSnapshot {
            state,
            residuals,
            jacobian_t,
            state_layout,
            measurement_layout,
        }
    }

    /// Final state, in packed units
    pub fn state(&self) -> &[f64] {
        &self.state
    }

    /// Final residual vector
    pub fn residuals(&self) -> &[f64] {
        &self.residuals
    }

    /// Final transposed Jacobian, CSC
    pub fn jacobian_t(&self) -> &CscStorage {
        &self.jacobian_t
    }

    /// Final Jacobian as a zero-copy CSR view (measurements x states)
    pub fn jacobian(&self) -> CsrView<'_> {
        self.jacobian_t.as_csr()
    }

    pub fn num_states(&self) -> usize {
        self.state_layout.num_states()
    }

    pub fn state_layout(&self) -> &StateLayout {
        &self.state_layout
    }

    pub fn measurement_counts(&self) -> MeasurementCounts {
        MeasurementCounts {
            boards: self.measurement_layout.num_measurements_boards,
            points: self.measurement_layout.num_measurements_points,
            regularization: self.measurement_layout.num_measurements_regularization,
            total: self.measurement_layout.num_measurements,
        }
    }

    /// State offset of camera `i_cam`'s intrinsics block
    pub fn state_index_intrinsics(&self, i_cam: usize) -> ValidationResult<usize> {
        self.state_layout.index_intrinsics(i_cam)
    }

    /// State offset of non-reference camera `i_cam`'s pose block
    pub fn state_index_extrinsics(&self, i_cam: usize) -> ValidationResult<usize> {
        self.state_layout.index_extrinsics(i_cam)
    }

    /// State offset of frame `i_frame`'s pose block
    pub fn state_index_frame(&self, i_frame: usize) -> ValidationResult<usize> {
        self.state_layout.index_frame(i_frame)
    }

    /// State offset of point `i_point`'s position block
    pub fn state_index_point(&self, i_point: usize) -> ValidationResult<usize> {
        self.state_layout.index_point(i_point)
    }

    /// State offset of the calibration-object warp block
    pub fn state_index_calobject_warp(&self) -> ValidationResult<usize> {
        self.state_layout.index_calobject_warp()
    }

    /// Scale a state stack into packed units, in place
    pub fn pack(&self, state: &mut [f64]) -> Result<(), ValidationError> {
        self.state_layout.pack(state)
    }

    /// Scale a packed state stack back to natural units, in place
    pub fn unpack(&self, state: &mut [f64]) -> Result<(), ValidationError> {
        self.state_layout.unpack(state)
    }
}
