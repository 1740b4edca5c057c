//! Input consistency validation
//!
//! Everything here runs before any layout or assembly work: cross-array
//! count checks, per-row index range checks, and the monotonicity rules the
//! skip resolver and the Jacobian assembly depend on. Every error names the
//! offending array or row and both conflicting values.

use crate::core::config::ProblemConfig;
use crate::core::types::{CalibrationInputs, ExtrinsicsIndex};
use crate::core::ValidationError;
use crate::model::LensModel;

/// One row of the declarative count-consistency table
struct CountRule {
    array: &'static str,
    got: usize,
    expected: usize,
    counted_by: &'static str,
}

/// Validate a full set of calibration inputs against a model and a
/// configuration
///
/// `observed_pixel_uncertainty` is only required to be positive when outlier
/// rejection will actually run (`skip_outlier_rejection == false`).
///
/// Empty observation sets are valid; all checks then pass trivially.
pub fn validate(
    inputs: &CalibrationInputs<'_>,
    model: &LensModel,
    config: &ProblemConfig,
    observed_pixel_uncertainty: f64,
    skip_outlier_rejection: bool,
) -> Result<(), ValidationError> {
    let num_lens = model.param_count();
    let num_cameras_intrinsics = inputs.num_cameras_intrinsics();
    let num_cameras_extrinsics = inputs.num_cameras_extrinsics();
    let has_boards = !inputs.indices_board.is_empty();

    let counts = [
        CountRule {
            array: "intrinsics",
            got: inputs.intrinsics.len(),
            expected: num_cameras_intrinsics * num_lens,
            counted_by: "imagersizes x lens parameter count",
        },
        CountRule {
            array: "roi",
            got: inputs.roi.map_or(num_cameras_intrinsics, <[_]>::len),
            expected: num_cameras_intrinsics,
            counted_by: "imagersizes",
        },
        CountRule {
            array: "corners_board",
            got: inputs.corners_board.len(),
            expected: inputs.indices_board.len() * inputs.corners_per_board(),
            counted_by: "indices_board x grid size",
        },
        CountRule {
            array: "observations_point",
            got: inputs.observations_point.len(),
            expected: inputs.indices_point.len(),
            counted_by: "indices_point",
        },
    ];
    for rule in counts {
        if rule.got != rule.expected {
            return Err(ValidationError::CountMismatch {
                array: rule.array,
                got: rule.got,
                expected: rule.expected,
                counted_by: rule.counted_by,
            }
            .log());
        }
    }

    if has_boards {
        if inputs.calibration_object_width_n < 2 {
            return Err(ValidationError::GridTooSmall(inputs.calibration_object_width_n).log());
        }
        if inputs.calibration_object_spacing <= 0.0 {
            return Err(ValidationError::NonPositiveSpacing(inputs.calibration_object_spacing).log());
        }
    }

    if config.optimize_calobject_warp && inputs.calobject_warp.is_none() {
        return Err(ValidationError::MissingCalobjectWarp.log());
    }

    if !skip_outlier_rejection && observed_pixel_uncertainty <= 0.0 {
        return Err(ValidationError::NonPositiveUncertainty(observed_pixel_uncertainty).log());
    }

    validate_board_rows(inputs, num_cameras_intrinsics, num_cameras_extrinsics)?;
    validate_point_rows(inputs, num_cameras_intrinsics, num_cameras_extrinsics)?;

    let num_board_features = inputs.indices_board.len() * inputs.corners_per_board();
    for (position, &feature) in inputs.outlier_indices.iter().enumerate() {
        if feature >= num_board_features {
            return Err(ValidationError::IndexOutOfRange {
                what: "outlier feature index",
                row: position,
                got: feature as i64,
                min: 0,
                max: num_board_features as i64,
            }
            .log());
        }
    }

    Ok(())
}

fn check_camera_indices(
    row: usize,
    cam_intrinsics: usize,
    cam_extrinsics: ExtrinsicsIndex,
    num_cameras_intrinsics: usize,
    num_cameras_extrinsics: usize,
) -> Result<(), ValidationError> {
    if cam_intrinsics >= num_cameras_intrinsics {
        return Err(ValidationError::IndexOutOfRange {
            what: "camera intrinsics index",
            row,
            got: cam_intrinsics as i64,
            min: 0,
            max: num_cameras_intrinsics as i64,
        }
        .log());
    }
    if let Some(i) = cam_extrinsics.camera() {
        if i >= num_cameras_extrinsics {
            return Err(ValidationError::IndexOutOfRange {
                what: "camera extrinsics index",
                row,
                got: i as i64,
                min: -1,
                max: num_cameras_extrinsics as i64,
            }
            .log());
        }
    }
    Ok(())
}

fn validate_board_rows(
    inputs: &CalibrationInputs<'_>,
    num_cameras_intrinsics: usize,
    num_cameras_extrinsics: usize,
) -> Result<(), ValidationError> {
    let num_frames = inputs.num_frames();

    for (row, indices) in inputs.indices_board.iter().enumerate() {
        if indices.frame >= num_frames {
            return Err(ValidationError::IndexOutOfRange {
                what: "frame index",
                row,
                got: indices.frame as i64,
                min: 0,
                max: num_frames as i64,
            }
            .log());
        }
        check_camera_indices(
            row,
            indices.cam_intrinsics,
            indices.cam_extrinsics,
            num_cameras_intrinsics,
            num_cameras_extrinsics,
        )?;

        if row == 0 {
            continue;
        }
        let prev = &inputs.indices_board[row - 1];
        if indices.frame < prev.frame {
            return Err(ValidationError::NonMonotonic {
                what: "frame index",
                requirement: "non-decreasing",
                row,
                got: indices.frame as i64,
                previous: prev.frame as i64,
            }
            .log());
        }
        if indices.frame == prev.frame {
            if indices.cam_intrinsics <= prev.cam_intrinsics {
                return Err(ValidationError::NonMonotonic {
                    what: "camera intrinsics index within a frame",
                    requirement: "strictly increasing",
                    row,
                    got: indices.cam_intrinsics as i64,
                    previous: prev.cam_intrinsics as i64,
                }
                .log());
            }
            if indices.cam_extrinsics.as_i64() <= prev.cam_extrinsics.as_i64() {
                return Err(ValidationError::NonMonotonic {
                    what: "camera extrinsics index within a frame",
                    requirement: "strictly increasing",
                    row,
                    got: indices.cam_extrinsics.as_i64(),
                    previous: prev.cam_extrinsics.as_i64(),
                }
                .log());
            }
        }
    }
    Ok(())
}

fn validate_point_rows(
    inputs: &CalibrationInputs<'_>,
    num_cameras_intrinsics: usize,
    num_cameras_extrinsics: usize,
) -> Result<(), ValidationError> {
    let num_points = inputs.num_points();

    for (row, indices) in inputs.indices_point.iter().enumerate() {
        if indices.point >= num_points {
            return Err(ValidationError::IndexOutOfRange {
                what: "point index",
                row,
                got: indices.point as i64,
                min: 0,
                max: num_points as i64,
            }
            .log());
        }
        check_camera_indices(
            row,
            indices.cam_intrinsics,
            indices.cam_extrinsics,
            num_cameras_intrinsics,
            num_cameras_extrinsics,
        )?;

        if row == 0 {
            continue;
        }
        let prev = &inputs.indices_point[row - 1];
        if indices.point < prev.point {
            return Err(ValidationError::NonMonotonic {
                what: "point index",
                requirement: "non-decreasing",
                row,
                got: indices.point as i64,
                previous: prev.point as i64,
            }
            .log());
        }
        if indices.point == prev.point {
            if indices.cam_intrinsics <= prev.cam_intrinsics {
                return Err(ValidationError::NonMonotonic {
                    what: "camera intrinsics index within a point",
                    requirement: "strictly increasing",
                    row,
                    got: indices.cam_intrinsics as i64,
                    previous: prev.cam_intrinsics as i64,
                }
                .log());
            }
            if indices.cam_extrinsics.as_i64() <= prev.cam_extrinsics.as_i64() {
                return Err(ValidationError::NonMonotonic {
                    what: "camera extrinsics index within a point",
                    requirement: "strictly increasing",
                    row,
                    got: indices.cam_extrinsics.as_i64(),
                    previous: prev.cam_extrinsics.as_i64(),
                }
                .log());
            }
        }
    }
    Ok(())
}
