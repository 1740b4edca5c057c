//! Covariance extraction from the final-state Jacobian
//!
//! The covariance of the optimized state is `(JᵀJ)⁻¹`, computed by a sparse
//! Cholesky factorization of the normal matrix and a dense solve against
//! the identity. Only the blocks callers actually consume are sliced out:
//! one intrinsics block per camera, and the joint extrinsics block when
//! there is more than one camera pose to correlate.

use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
    sparse::{SparseColMat, Triplet},
};
use std::ops::Mul;

use crate::core::layout::StateLayout;
use crate::linalg::jacobian::CscStorage;
use crate::linalg::{LinAlgError, LinAlgResult};

/// Sliced covariance blocks of the optimized state
#[derive(Debug, Clone)]
pub struct CovarianceReport {
    /// One `Nintrinsics_state x Nintrinsics_state` block per camera, in
    /// camera order; empty when no intrinsics are in the state
    pub intrinsics: Vec<Mat<f64>>,
    /// Joint `6·Ncam x 6·Ncam` block over all camera poses; `None` unless
    /// more than one camera carries extrinsics state
    pub extrinsics: Option<Mat<f64>>,
}

/// Convert the transposed-CSC storage into a faer sparse matrix of the
/// untransposed Jacobian (measurements x states). This copies; the
/// zero-copy path is [`CscStorage::as_csr`].
pub fn to_faer(jt: &CscStorage) -> LinAlgResult<SparseColMat<usize, f64>> {
    let mut triplets = Vec::with_capacity(jt.nnz());
    for measurement in 0..jt.num_cols() {
        for (&state, &value) in jt.col_rows(measurement).iter().zip(jt.col_values(measurement)) {
            triplets.push(Triplet::new(measurement, state, value));
        }
    }
    SparseColMat::try_new_from_triplets(jt.num_cols(), jt.num_rows(), &triplets).map_err(|e| {
        LinAlgError::SparseMatrixCreation(
            "Failed to build the measurement Jacobian from assembled storage".to_string(),
        )
        .log_with_source(e)
    })
}

/// Compute the state covariance and slice the consumer-facing blocks
///
/// # Errors
/// `LinAlgError::SingularMatrix` when the normal matrix cannot be factored,
/// which happens whenever some state column received no measurements.
pub fn compute_covariances(
    jt: &CscStorage,
    layout: &StateLayout,
) -> LinAlgResult<CovarianceReport> {
    let jacobian = to_faer(jt)?;

    // H = J^T * J
    let hessian = jacobian
        .as_ref()
        .transpose()
        .to_col_major()
        .map_err(|e| {
            LinAlgError::MatrixConversion(
                "Failed to convert transposed Jacobian to column-major format".to_string(),
            )
            .log_with_source(e)
        })?
        .mul(jacobian.as_ref());

    let sym = SymbolicLlt::try_new(hessian.symbolic(), Side::Lower).map_err(|e| {
        LinAlgError::FactorizationFailed("Symbolic Cholesky decomposition failed".to_string())
            .log_with_source(e)
    })?;
    let cholesky = Llt::try_new_with_symbolic(sym, hessian.as_ref(), Side::Lower)
        .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;

    // Solve H * X = I to get the full covariance, then slice blocks
    let n = layout.num_states();
    let full = cholesky.solve(&Mat::<f64>::identity(n, n));

    let per_camera = layout.num_intrinsics_state_per_camera();
    let mut intrinsics = Vec::new();
    if per_camera > 0 {
        for i_cam in 0..layout.counts().cameras_intrinsics {
            if let Ok(start) = layout.index_intrinsics(i_cam) {
                let mut block = Mat::zeros(per_camera, per_camera);
                for i in 0..per_camera {
                    for j in 0..per_camera {
                        block[(i, j)] = full[(start + i, start + j)];
                    }
                }
                intrinsics.push(block);
            }
        }
    }

    let num_cameras_extrinsics = layout.counts().cameras_extrinsics;
    let extrinsics = if layout.extrinsics_in_state() && num_cameras_extrinsics > 1 {
        match layout.index_extrinsics(0) {
            Ok(start) => {
                let dim = 6 * num_cameras_extrinsics;
                let mut block = Mat::zeros(dim, dim);
                for i in 0..dim {
                    for j in 0..dim {
                        block[(i, j)] = full[(start + i, start + j)];
                    }
                }
                Some(block)
            }
            Err(_) => None,
        }
    } else {
        None
    };

    Ok(CovarianceReport {
        intrinsics,
        extrinsics,
    })
}
