//! Calibration problem driver
//!
//! [`CalibrationProblem`] runs the whole pipeline: validation, skip
//! resolution, layout computation, residual/Jacobian assembly, the solver
//! loop with outlier rejection, and result packaging. Assembly is
//! single-threaded and deterministic: measurement order and Jacobian
//! sparsity depend only on the inputs, never on timing.

use nalgebra::{Vector2, Vector3};
use tracing::{debug, info};
use web_time::Instant;

use crate::core::config::ProblemConfig;
use crate::core::layout::{
    EntityCounts, MeasurementLayout, StateLayout, SCALE_DISTORTION, SCALE_INTRINSICS_CENTER_PIXEL,
};
use crate::core::skip::{resolve_skips, SkipFlags};
use crate::core::types::{BoardIndices, CalibrationInputs, PixelObservation, PointIndices, PointPixel, Pose};
use crate::core::validate::validate;
use crate::linalg::{compute_covariances, JacobianBuilder};
use crate::model::{LensModel, NUM_INTRINSICS_CORE};
use crate::solver::snapshot::SolverSnapshot;
use crate::solver::{
    BoardPointGradients, BoardPointQuery, CallbackOutput, DriverPhase, NonlinearSolver,
    PointGradients, PointQuery, ProblemEval, ProjectionModel, SolveError, SolveOptions,
    SolveReport, SolveResult,
};

/// Weight of the rows pulling cx/cy toward the imager center
const REGULARIZATION_WEIGHT_CORE: f64 = 1e-3;
/// Weight of the rows pulling distortion parameters toward zero
const REGULARIZATION_WEIGHT_DISTORTION: f64 = 1e-3;

/// Unpacked parameter set at some state
struct Params {
    intrinsics: Vec<f64>,
    extrinsics: Vec<Pose>,
    frames: Vec<Pose>,
    points: Vec<Vector3<f64>>,
    calobject_warp: Option<[f64; 2]>,
}

/// An assembled, validated calibration problem
///
/// Construction runs the validating and assembling phases; a successful
/// `new` means every index was checked and both layouts are final.
/// [`CalibrationProblem::optimize`] runs the solving and packaging phases;
/// [`CalibrationProblem::callback`] evaluates once at the seed state
/// without touching a solver.
#[derive(Debug)]
pub struct CalibrationProblem {
    model: LensModel,
    config: ProblemConfig,
    options: SolveOptions,

    intrinsics: Vec<f64>,
    extrinsics: Vec<Pose>,
    frames: Vec<Pose>,
    points: Vec<Vector3<f64>>,
    calobject_warp: Option<[f64; 2]>,

    indices_board: Vec<BoardIndices>,
    corners_board: Vec<PixelObservation>,
    indices_point: Vec<PointIndices>,
    observations_point: Vec<PointPixel>,
    imagersizes: Vec<[u32; 2]>,
    spacing: f64,
    width_n: usize,

    board_skips: Vec<SkipFlags>,
    point_skips: Vec<SkipFlags>,
    state_layout: StateLayout,
    measurement_layout: MeasurementLayout,

    /// Per board feature: corner weight, zeroed for pre-declared outliers
    /// and out-of-ROI corners
    feature_weights: Vec<f64>,
    input_outliers: Vec<usize>,
    outside_roi_indices: Vec<usize>,

    phase: DriverPhase,
}

impl CalibrationProblem {
    /// Validate inputs, resolve skips and compute both layouts
    pub fn new(
        inputs: &CalibrationInputs<'_>,
        model: LensModel,
        config: ProblemConfig,
        options: SolveOptions,
    ) -> SolveResult<Self> {
        debug!("driver phase: {}", DriverPhase::Validating);
        validate(
            inputs,
            &model,
            &config,
            options.observed_pixel_uncertainty,
            options.skip_outlier_rejection,
        )?;

        let board_skips = resolve_skips(
            "board",
            inputs.indices_board.len(),
            |i| inputs.indices_board[i].frame,
            inputs.skipped_observations_board,
        )?;
        let point_skips = resolve_skips(
            "point",
            inputs.indices_point.len(),
            |i| inputs.indices_point[i].point,
            inputs.skipped_observations_point,
        )?;

        debug!("driver phase: {}", DriverPhase::Assembling);
        let counts = EntityCounts::from_inputs(inputs);
        let state_layout = StateLayout::new(counts, &config, &model);
        let measurement_layout = MeasurementLayout::new(
            &state_layout,
            &config,
            inputs.calibration_object_width_n,
            inputs.indices_board,
            &board_skips,
            inputs.indices_point,
            &point_skips,
        );

        let corners_per_board = inputs.corners_per_board();
        let mut feature_weights: Vec<f64> = inputs
            .corners_board
            .iter()
            .map(|c| c.weight.max(0.0))
            .collect();
        for &feature in inputs.outlier_indices {
            feature_weights[feature] = 0.0;
        }

        let mut outside_roi_indices = Vec::new();
        if let Some(roi) = inputs.roi {
            for (i_obs, indices) in inputs.indices_board.iter().enumerate() {
                let rect = roi[indices.cam_intrinsics];
                for cell in 0..corners_per_board {
                    let feature = i_obs * corners_per_board + cell;
                    let px = inputs.corners_board[feature].px;
                    let outside = (px.x - rect[0]).abs() > rect[2] / 2.0
                        || (px.y - rect[1]).abs() > rect[3] / 2.0;
                    if outside && feature_weights[feature] > 0.0 {
                        feature_weights[feature] = 0.0;
                        outside_roi_indices.push(feature);
                    }
                }
            }
        }

        info!(
            "assembled problem: {} states, {} measurements \
             ({} board / {} point / {} regularization), {} Jacobian nonzeros",
            state_layout.num_states(),
            measurement_layout.num_measurements,
            measurement_layout.num_measurements_boards,
            measurement_layout.num_measurements_points,
            measurement_layout.num_measurements_regularization,
            measurement_layout.jacobian_nnz,
        );

        Ok(CalibrationProblem {
            model,
            config,
            options,
            intrinsics: inputs.intrinsics.to_vec(),
            extrinsics: inputs.extrinsics.to_vec(),
            frames: inputs.frames.to_vec(),
            points: inputs.points.to_vec(),
            calobject_warp: inputs.calobject_warp,
            indices_board: inputs.indices_board.to_vec(),
            corners_board: inputs.corners_board.to_vec(),
            indices_point: inputs.indices_point.to_vec(),
            observations_point: inputs.observations_point.to_vec(),
            imagersizes: inputs.imagersizes.to_vec(),
            spacing: inputs.calibration_object_spacing,
            width_n: inputs.calibration_object_width_n,
            board_skips,
            point_skips,
            state_layout,
            measurement_layout,
            feature_weights,
            input_outliers: inputs.outlier_indices.to_vec(),
            outside_roi_indices,
            phase: DriverPhase::Assembling,
        })
    }

    pub fn phase(&self) -> DriverPhase {
        self.phase
    }

    pub fn state_layout(&self) -> &StateLayout {
        &self.state_layout
    }

    pub fn measurement_layout(&self) -> &MeasurementLayout {
        &self.measurement_layout
    }

    pub fn num_states(&self) -> usize {
        self.state_layout.num_states()
    }

    pub fn num_measurements(&self) -> usize {
        self.measurement_layout.num_measurements
    }

    /// Resolved skip flags per board observation
    pub fn board_skips(&self) -> &[SkipFlags] {
        &self.board_skips
    }

    /// Resolved skip flags per point observation
    pub fn point_skips(&self) -> &[SkipFlags] {
        &self.point_skips
    }

    /// Board features excluded for falling outside their camera's ROI
    pub fn outside_roi_indices(&self) -> &[usize] {
        &self.outside_roi_indices
    }

    /// Builder pre-sized for this problem's Jacobian
    pub fn jacobian_builder(&self) -> JacobianBuilder {
        JacobianBuilder::new(
            self.state_layout.num_states(),
            self.measurement_layout.num_measurements,
            self.measurement_layout.jacobian_nnz,
        )
    }

    /// Packed seed state, built from the input parameter values
    pub fn seed_state(&self) -> SolveResult<Vec<f64>> {
        let layout = &self.state_layout;
        let mut state = vec![0.0; layout.num_states()];
        let num_lens = self.model.param_count();

        if layout.num_intrinsics_state_per_camera() > 0 {
            for cam in 0..self.imagersizes.len() {
                let row = &self.intrinsics[cam * num_lens..(cam + 1) * num_lens];
                let mut cursor = layout.index_intrinsics(cam)?;
                if layout.core_in_state() {
                    state[cursor..cursor + NUM_INTRINSICS_CORE]
                        .copy_from_slice(&row[..NUM_INTRINSICS_CORE]);
                    cursor += NUM_INTRINSICS_CORE;
                }
                if layout.distortions_in_state() {
                    state[cursor..cursor + layout.num_distortions()]
                        .copy_from_slice(&row[NUM_INTRINSICS_CORE..]);
                }
            }
        }
        if layout.extrinsics_in_state() {
            for (i, pose) in self.extrinsics.iter().enumerate() {
                let start = layout.index_extrinsics(i)?;
                write_pose(&mut state[start..start + 6], pose);
            }
        }
        if layout.frames_in_state() {
            for (i, pose) in self.frames.iter().enumerate() {
                let start = layout.index_frame(i)?;
                write_pose(&mut state[start..start + 6], pose);
            }
            for (i, point) in self.points.iter().enumerate() {
                let start = layout.index_point(i)?;
                state[start..start + 3].copy_from_slice(point.as_slice());
            }
        }
        if layout.warp_in_state() {
            let start = layout.index_calobject_warp()?;
            let warp = self.calobject_warp.unwrap_or([0.0, 0.0]);
            state[start..start + 2].copy_from_slice(&warp);
        }

        layout.pack(&mut state)?;
        Ok(state)
    }

    /// Unpack a state and merge it over the seed parameters
    fn params_at(&self, packed_state: &[f64]) -> SolveResult<Params> {
        let layout = &self.state_layout;
        let mut state = packed_state.to_vec();
        layout.unpack(&mut state)?;

        let mut params = Params {
            intrinsics: self.intrinsics.clone(),
            extrinsics: self.extrinsics.clone(),
            frames: self.frames.clone(),
            points: self.points.clone(),
            calobject_warp: self.calobject_warp,
        };
        let num_lens = self.model.param_count();

        if layout.num_intrinsics_state_per_camera() > 0 {
            for cam in 0..self.imagersizes.len() {
                let row = &mut params.intrinsics[cam * num_lens..(cam + 1) * num_lens];
                let mut cursor = layout.index_intrinsics(cam)?;
                if layout.core_in_state() {
                    row[..NUM_INTRINSICS_CORE]
                        .copy_from_slice(&state[cursor..cursor + NUM_INTRINSICS_CORE]);
                    cursor += NUM_INTRINSICS_CORE;
                }
                if layout.distortions_in_state() {
                    row[NUM_INTRINSICS_CORE..]
                        .copy_from_slice(&state[cursor..cursor + layout.num_distortions()]);
                }
            }
        }
        if layout.extrinsics_in_state() {
            for i in 0..params.extrinsics.len() {
                let start = layout.index_extrinsics(i)?;
                params.extrinsics[i] = read_pose(&state[start..start + 6]);
            }
        }
        if layout.frames_in_state() {
            for i in 0..params.frames.len() {
                let start = layout.index_frame(i)?;
                params.frames[i] = read_pose(&state[start..start + 6]);
            }
            for i in 0..params.points.len() {
                let start = layout.index_point(i)?;
                params.points[i] = Vector3::new(state[start], state[start + 1], state[start + 2]);
            }
        }
        if layout.warp_in_state() {
            let start = layout.index_calobject_warp()?;
            params.calobject_warp = Some([state[start], state[start + 1]]);
        }
        Ok(params)
    }

    /// Assemble residuals (and optionally the transposed Jacobian) at a
    /// packed state, with the given per-feature weights
    fn evaluate_at(
        &self,
        packed_state: &[f64],
        residuals: &mut [f64],
        mut jacobian: Option<&mut JacobianBuilder>,
        projection: &dyn ProjectionModel,
        weights: &[f64],
    ) -> SolveResult<()> {
        let params = self.params_at(packed_state)?;
        let layout = &self.state_layout;
        let scales = layout.scales();
        let num_lens = self.model.param_count();
        let per_camera = layout.num_intrinsics_state_per_camera();
        let width = self.width_n;
        let mut row = 0usize;

        let mut d_intrinsics = vec![0.0; 2 * num_lens];
        let mut d_extrinsics = vec![0.0; 12];
        let mut d_frame = vec![0.0; 12];
        let mut d_warp = vec![0.0; 4];
        let mut d_point = vec![0.0; 6];

        for (i_obs, indices) in self.indices_board.iter().enumerate() {
            if self.board_skips[i_obs].skip_observation {
                continue;
            }
            let intrinsics_row = &params.intrinsics
                [indices.cam_intrinsics * num_lens..(indices.cam_intrinsics + 1) * num_lens];
            let extrinsics_pose = indices.cam_extrinsics.camera().map(|i| params.extrinsics[i]);
            let frame_pose = params.frames[indices.frame];

            let index_intrinsics = if per_camera > 0 {
                Some(layout.index_intrinsics(indices.cam_intrinsics)?)
            } else {
                None
            };
            let index_extrinsics = match indices.cam_extrinsics.camera() {
                Some(i) if layout.extrinsics_in_state() => Some(layout.index_extrinsics(i)?),
                _ => None,
            };
            let index_frame = if layout.frames_in_state() {
                Some(layout.index_frame(indices.frame)?)
            } else {
                None
            };
            let index_warp = if layout.warp_in_state() {
                Some(layout.index_calobject_warp()?)
            } else {
                None
            };

            for iy in 0..width {
                for ix in 0..width {
                    let feature = i_obs * width * width + iy * width + ix;
                    let weight = weights[feature];
                    let observed = &self.corners_board[feature];
                    let query = BoardPointQuery {
                        intrinsics: intrinsics_row,
                        extrinsics: extrinsics_pose,
                        frame: frame_pose,
                        calobject_warp: params.calobject_warp,
                        object_point: Vector3::new(
                            ix as f64 * self.spacing,
                            iy as f64 * self.spacing,
                            0.0,
                        ),
                        grid_fraction: Vector2::new(
                            ix as f64 / (width - 1) as f64,
                            iy as f64 / (width - 1) as f64,
                        ),
                    };
                    let predicted = if jacobian.is_some() {
                        let mut gradients = BoardPointGradients {
                            d_intrinsics: &mut d_intrinsics,
                            d_extrinsics: &mut d_extrinsics,
                            d_frame: &mut d_frame,
                            d_calobject_warp: &mut d_warp,
                        };
                        projection.project_board_point(&query, Some(&mut gradients))
                    } else {
                        projection.project_board_point(&query, None)
                    };

                    for axis in 0..2 {
                        let value = (predicted[axis] - observed.px[axis]) * weight;
                        if !value.is_finite() {
                            return Err(SolveError::NonFiniteResidual { row }.log());
                        }
                        residuals[row] = value;

                        if let Some(builder) = jacobian.as_deref_mut() {
                            builder.begin_measurement()?;
                            if let Some(start) = index_intrinsics {
                                let mut col = start;
                                if layout.core_in_state() {
                                    for p in 0..NUM_INTRINSICS_CORE {
                                        let g = d_intrinsics[axis * num_lens + p];
                                        builder.push(col, g * weight * scales[col])?;
                                        col += 1;
                                    }
                                }
                                if layout.distortions_in_state() {
                                    for p in 0..layout.num_distortions() {
                                        let g =
                                            d_intrinsics[axis * num_lens + NUM_INTRINSICS_CORE + p];
                                        builder.push(col, g * weight * scales[col])?;
                                        col += 1;
                                    }
                                }
                            }
                            if let Some(start) = index_extrinsics {
                                for k in 0..6 {
                                    let col = start + k;
                                    let g = d_extrinsics[axis * 6 + k];
                                    builder.push(col, g * weight * scales[col])?;
                                }
                            }
                            if let Some(start) = index_frame {
                                for k in 0..6 {
                                    let col = start + k;
                                    let g = d_frame[axis * 6 + k];
                                    builder.push(col, g * weight * scales[col])?;
                                }
                            }
                            if let Some(start) = index_warp {
                                for k in 0..2 {
                                    let col = start + k;
                                    let g = d_warp[axis * 2 + k];
                                    builder.push(col, g * weight * scales[col])?;
                                }
                            }
                        }
                        row += 1;
                    }
                }
            }
        }

        for (i_obs, indices) in self.indices_point.iter().enumerate() {
            if self.point_skips[i_obs].skip_observation {
                continue;
            }
            let intrinsics_row = &params.intrinsics
                [indices.cam_intrinsics * num_lens..(indices.cam_intrinsics + 1) * num_lens];
            let extrinsics_pose = indices.cam_extrinsics.camera().map(|i| params.extrinsics[i]);
            let point = params.points[indices.point];
            let observed = &self.observations_point[i_obs];

            let index_intrinsics = if per_camera > 0 {
                Some(layout.index_intrinsics(indices.cam_intrinsics)?)
            } else {
                None
            };
            let index_extrinsics = match indices.cam_extrinsics.camera() {
                Some(i) if layout.extrinsics_in_state() => Some(layout.index_extrinsics(i)?),
                _ => None,
            };
            let index_point = if layout.frames_in_state() {
                Some(layout.index_point(indices.point)?)
            } else {
                None
            };
            // Points with a known reference position are held there: their
            // columns stay in the sparsity pattern but carry zeros
            let point_factor = if indices.flags.has_ref_position { 0.0 } else { 1.0 };

            let query = PointQuery {
                intrinsics: intrinsics_row,
                extrinsics: extrinsics_pose,
                point,
            };
            let predicted = if jacobian.is_some() {
                let mut gradients = PointGradients {
                    d_intrinsics: &mut d_intrinsics,
                    d_extrinsics: &mut d_extrinsics,
                    d_point: &mut d_point,
                };
                projection.project_point(&query, Some(&mut gradients))
            } else {
                projection.project_point(&query, None)
            };

            for axis in 0..2 {
                let value = predicted[axis] - observed.px[axis];
                if !value.is_finite() {
                    return Err(SolveError::NonFiniteResidual { row }.log());
                }
                residuals[row] = value;

                if let Some(builder) = jacobian.as_deref_mut() {
                    builder.begin_measurement()?;
                    if let Some(start) = index_intrinsics {
                        let mut col = start;
                        if layout.core_in_state() {
                            for p in 0..NUM_INTRINSICS_CORE {
                                builder.push(col, d_intrinsics[axis * num_lens + p] * scales[col])?;
                                col += 1;
                            }
                        }
                        if layout.distortions_in_state() {
                            for p in 0..layout.num_distortions() {
                                let g = d_intrinsics[axis * num_lens + NUM_INTRINSICS_CORE + p];
                                builder.push(col, g * scales[col])?;
                                col += 1;
                            }
                        }
                    }
                    if let Some(start) = index_extrinsics {
                        for k in 0..6 {
                            let col = start + k;
                            builder.push(col, d_extrinsics[axis * 6 + k] * scales[col])?;
                        }
                    }
                    if let Some(start) = index_point {
                        for k in 0..3 {
                            let col = start + k;
                            let g = d_point[axis * 3 + k] * point_factor;
                            builder.push(col, g * scales[col])?;
                        }
                    }
                }
                row += 1;
            }

            if indices.flags.has_ref_range {
                let norm = point.norm();
                let value = norm - observed.ref_range;
                if !value.is_finite() {
                    return Err(SolveError::NonFiniteResidual { row }.log());
                }
                residuals[row] = value;
                if let Some(builder) = jacobian.as_deref_mut() {
                    builder.begin_measurement()?;
                    if let Some(start) = index_point {
                        let direction = if norm > 0.0 {
                            point / norm
                        } else {
                            Vector3::zeros()
                        };
                        for k in 0..3 {
                            let col = start + k;
                            builder.push(col, direction[k] * point_factor * scales[col])?;
                        }
                    }
                }
                row += 1;
            }
        }

        if !self.config.skip_regularization && per_camera > 0 {
            for cam in 0..self.imagersizes.len() {
                let start = layout.index_intrinsics(cam)?;
                let intrinsics_row = &params.intrinsics[cam * num_lens..(cam + 1) * num_lens];
                if layout.core_in_state() {
                    for k in 0..2 {
                        let center = self.imagersizes[cam][k] as f64 / 2.0;
                        let value = REGULARIZATION_WEIGHT_CORE * (intrinsics_row[2 + k] - center)
                            / SCALE_INTRINSICS_CENTER_PIXEL;
                        residuals[row] = value;
                        if let Some(builder) = jacobian.as_deref_mut() {
                            builder.begin_measurement()?;
                            builder.push(start + 2 + k, REGULARIZATION_WEIGHT_CORE)?;
                        }
                        row += 1;
                    }
                }
                if layout.distortions_in_state() {
                    let offset = if layout.core_in_state() {
                        NUM_INTRINSICS_CORE
                    } else {
                        0
                    };
                    for d in 0..layout.num_distortions() {
                        let value = REGULARIZATION_WEIGHT_DISTORTION
                            * intrinsics_row[NUM_INTRINSICS_CORE + d]
                            / SCALE_DISTORTION;
                        residuals[row] = value;
                        if let Some(builder) = jacobian.as_deref_mut() {
                            builder.begin_measurement()?;
                            builder.push(start + offset + d, REGULARIZATION_WEIGHT_DISTORTION)?;
                        }
                        row += 1;
                    }
                }
            }
        }

        debug_assert_eq!(row, self.measurement_layout.num_measurements);
        Ok(())
    }

    /// One evaluation at the seed state: residuals plus the transposed
    /// Jacobian, no solver involved
    pub fn callback(&self, projection: &dyn ProjectionModel) -> SolveResult<CallbackOutput> {
        let state = self.seed_state()?;
        let mut residuals = vec![0.0; self.measurement_layout.num_measurements];
        let mut builder = self.jacobian_builder();
        self.evaluate_at(&state, &mut residuals, Some(&mut builder), projection, &self.feature_weights)?;
        Ok(CallbackOutput {
            state,
            residuals,
            jacobian_t: builder.finish()?,
        })
    }

    /// Run the full solve: solver loop, outlier rejection, packaging
    pub fn optimize(
        &mut self,
        projection: &dyn ProjectionModel,
        solver: &mut dyn NonlinearSolver,
    ) -> SolveResult<SolveReport> {
        match self.optimize_inner(projection, solver) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.phase = DriverPhase::Failed;
                debug!("driver phase: {}", self.phase);
                Err(e)
            }
        }
    }

    fn optimize_inner(
        &mut self,
        projection: &dyn ProjectionModel,
        solver: &mut dyn NonlinearSolver,
    ) -> SolveResult<SolveReport> {
        self.phase = DriverPhase::Solving;
        debug!("driver phase: {}", self.phase);
        let started = Instant::now();

        let num_measurements = self.measurement_layout.num_measurements;
        let mut state = self.seed_state()?;
        let mut weights = self.feature_weights.clone();
        let mut outlier_marks = vec![false; weights.len()];
        for &feature in &self.input_outliers {
            outlier_marks[feature] = true;
        }

        let mut residuals = vec![0.0; num_measurements];
        let corners_per_board = self.width_n * self.width_n;
        let mut pass = 0usize;
        let outcome = loop {
            let outcome = {
                let mut eval = DriverEval {
                    problem: self,
                    projection,
                    weights: &weights,
                };
                solver.solve(&mut state, &mut eval)?
            };
            if outcome.final_norm2 < 0.0 {
                return Err(SolveError::SolverFailed {
                    final_norm2: outcome.final_norm2,
                }
                .log());
            }
            if self.options.skip_outlier_rejection {
                break outcome;
            }

            self.evaluate_at(&state, &mut residuals, None, projection, &weights)?;
            let threshold =
                self.options.outlier_threshold * self.options.observed_pixel_uncertainty;
            let mut new_outliers = 0usize;
            let mut row = 0usize;
            for (i_obs, _) in self.indices_board.iter().enumerate() {
                if self.board_skips[i_obs].skip_observation {
                    continue;
                }
                for cell in 0..corners_per_board {
                    let feature = i_obs * corners_per_board + cell;
                    let weight = weights[feature];
                    if weight > 0.0 {
                        let ex = residuals[row] / weight;
                        let ey = residuals[row + 1] / weight;
                        if (ex * ex + ey * ey).sqrt() > threshold {
                            weights[feature] = 0.0;
                            outlier_marks[feature] = true;
                            new_outliers += 1;
                        }
                    }
                    row += 2;
                }
            }
            if new_outliers == 0 {
                break outcome;
            }
            pass += 1;
            if self.options.verbose {
                info!("outlier pass {pass}: marked {new_outliers} new outliers");
            } else {
                debug!("outlier pass {pass}: marked {new_outliers} new outliers");
            }
            if pass >= self.options.max_outlier_passes {
                return Err(SolveError::TooManyOutlierPasses { passes: pass }.log());
            }
        };

        self.phase = DriverPhase::Packaging;
        debug!("driver phase: {}", self.phase);

        let mut builder = self.jacobian_builder();
        self.evaluate_at(&state, &mut residuals, Some(&mut builder), projection, &weights)?;
        let jacobian_t = builder.finish()?;
        let params = self.params_at(&state)?;

        // RMS over the active reprojection components, in pixels
        let mut sum_sq = 0.0;
        let mut active = 0usize;
        let mut row = 0usize;
        for (i_obs, _) in self.indices_board.iter().enumerate() {
            if self.board_skips[i_obs].skip_observation {
                continue;
            }
            for cell in 0..corners_per_board {
                let feature = i_obs * corners_per_board + cell;
                let weight = weights[feature];
                if weight > 0.0 {
                    let ex = residuals[row] / weight;
                    let ey = residuals[row + 1] / weight;
                    sum_sq += ex * ex + ey * ey;
                    active += 2;
                }
                row += 2;
            }
        }
        for (i_obs, indices) in self.indices_point.iter().enumerate() {
            if self.point_skips[i_obs].skip_observation {
                continue;
            }
            sum_sq += residuals[row] * residuals[row] + residuals[row + 1] * residuals[row + 1];
            active += 2;
            row += 2;
            if indices.flags.has_ref_range {
                row += 1;
            }
        }
        let rms_reproj_error_pixels = if active > 0 {
            (sum_sq / active as f64).sqrt()
        } else {
            0.0
        };

        let covariances = if self.options.with_covariances {
            Some(compute_covariances(&jacobian_t, &self.state_layout)?)
        } else {
            None
        };

        let outlier_indices: Vec<usize> = outlier_marks
            .iter()
            .enumerate()
            .filter_map(|(feature, &marked)| marked.then_some(feature))
            .collect();

        let snapshot = SolverSnapshot::new(
            state,
            residuals,
            jacobian_t,
            self.state_layout.clone(),
            self.measurement_layout,
        );

        self.phase = DriverPhase::Done;
        let elapsed = started.elapsed();
        info!(
            "solve done in {} iterations: rms {:.4} px, {} outliers, {} outside ROI, {:.1?}",
            outcome.iterations,
            rms_reproj_error_pixels,
            outlier_indices.len(),
            self.outside_roi_indices.len(),
            elapsed,
        );

        Ok(SolveReport {
            intrinsics: params.intrinsics,
            extrinsics: params.extrinsics,
            frames: params.frames,
            points: params.points,
            calobject_warp: params.calobject_warp,
            rms_reproj_error_pixels,
            final_norm2: outcome.final_norm2,
            iterations: outcome.iterations,
            outlier_indices,
            outside_roi_indices: self.outside_roi_indices.clone(),
            covariances,
            elapsed,
            snapshot,
        })
    }
}

fn write_pose(slot: &mut [f64], pose: &Pose) {
    slot[..3].copy_from_slice(pose.r.as_slice());
    slot[3..6].copy_from_slice(pose.t.as_slice());
}

fn read_pose(slot: &[f64]) -> Pose {
    Pose::new(
        Vector3::new(slot[0], slot[1], slot[2]),
        Vector3::new(slot[3], slot[4], slot[5]),
    )
}

/// Evaluation adapter handed to the nonlinear solver: freezes the problem
/// and the per-feature weights of the current rejection pass
struct DriverEval<'a> {
    problem: &'a CalibrationProblem,
    projection: &'a dyn ProjectionModel,
    weights: &'a [f64],
}

impl ProblemEval for DriverEval<'_> {
    fn num_measurements(&self) -> usize {
        self.problem.measurement_layout.num_measurements
    }

    fn new_jacobian_builder(&self) -> JacobianBuilder {
        self.problem.jacobian_builder()
    }

    fn evaluate(
        &mut self,
        state: &[f64],
        residuals: &mut [f64],
        jacobian: Option<&mut JacobianBuilder>,
    ) -> SolveResult<()> {
        self.problem
            .evaluate_at(state, residuals, jacobian, self.projection, self.weights)
    }
}
