//! Transposed Jacobian storage and the zero-copy CSR bridge
//!
//! The assembly writes the *transpose* of the measurement Jacobian, `Jt`,
//! in compressed-sparse-column form: one column per measurement, rows
//! indexed by state position. Writing column-by-column matches the
//! measurement-major assembly loop, and the finished arrays can be handed
//! to a CSR consumer without copying: the CSC arrays of `Jt` are exactly
//! the CSR arrays of `J` (rows = measurements, columns = state), provided
//! state indices are strictly increasing within each column. The builder
//! enforces that invariant at push time.

use crate::linalg::{LinAlgError, LinAlgResult};

/// Finished transposed Jacobian in CSC form
///
/// `num_rows` is the state dimension, `num_cols` the measurement count.
#[derive(Debug, Clone)]
pub struct CscStorage {
    num_rows: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CscStorage {
    /// State dimension
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Measurement count
    pub fn num_cols(&self) -> usize {
        self.col_ptr.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Column start offsets, `num_cols + 1` entries
    pub fn col_ptr(&self) -> &[usize] {
        &self.col_ptr
    }

    /// Row (state) indices, strictly increasing within each column
    pub fn row_idx(&self) -> &[usize] {
        &self.row_idx
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// State indices of one measurement's column
    pub fn col_rows(&self, col: usize) -> &[usize] {
        &self.row_idx[self.col_ptr[col]..self.col_ptr[col + 1]]
    }

    /// Values of one measurement's column
    pub fn col_values(&self, col: usize) -> &[f64] {
        &self.values[self.col_ptr[col]..self.col_ptr[col + 1]]
    }

    /// Reinterpret this storage as the CSR form of the untransposed
    /// Jacobian. Borrows the same three arrays; nothing is copied.
    pub fn as_csr(&self) -> CsrView<'_> {
        CsrView {
            indptr: &self.col_ptr,
            indices: &self.row_idx,
            data: &self.values,
            num_cols: self.num_rows,
        }
    }
}

/// CSR view of the measurement Jacobian `J`
///
/// `num_rows() == ` measurement count, `num_cols() == ` state dimension.
/// Column indices within each row are sorted ascending, which is the same
/// property the builder enforced on the transposed storage.
#[derive(Debug, Clone, Copy)]
pub struct CsrView<'a> {
    indptr: &'a [usize],
    indices: &'a [usize],
    data: &'a [f64],
    num_cols: usize,
}

impl<'a> CsrView<'a> {
    pub fn num_rows(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Row start offsets, `num_rows + 1` entries
    pub fn indptr(&self) -> &'a [usize] {
        self.indptr
    }

    /// Column indices, sorted ascending within each row
    pub fn indices(&self) -> &'a [usize] {
        self.indices
    }

    pub fn data(&self) -> &'a [f64] {
        self.data
    }

    /// Column indices of measurement `row`
    pub fn row_indices(&self, row: usize) -> &'a [usize] {
        &self.indices[self.indptr[row]..self.indptr[row + 1]]
    }

    /// Values of measurement `row`
    pub fn row_values(&self, row: usize) -> &'a [f64] {
        &self.data[self.indptr[row]..self.indptr[row + 1]]
    }
}

/// Streaming writer for the transposed Jacobian
///
/// The measurement and nonzero counts are declared up front (they are
/// closed-form properties of the measurement layout); `finish` fails if the
/// assembly produced anything else, so a drifting assembly loop is caught
/// at the first solve rather than as a corrupt matrix.
#[derive(Debug)]
pub struct JacobianBuilder {
    num_states: usize,
    expected_measurements: usize,
    expected_nnz: usize,
    col_starts: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
}

impl JacobianBuilder {
    pub fn new(num_states: usize, num_measurements: usize, nnz: usize) -> Self {
        JacobianBuilder {
            num_states,
            expected_measurements: num_measurements,
            expected_nnz: nnz,
            col_starts: Vec::with_capacity(num_measurements),
            row_idx: Vec::with_capacity(nnz),
            values: Vec::with_capacity(nnz),
        }
    }

    /// Start the column of the next measurement
    pub fn begin_measurement(&mut self) -> LinAlgResult<()> {
        if self.col_starts.len() == self.expected_measurements {
            return Err(LinAlgError::TooManyMeasurements {
                expected: self.expected_measurements,
            }
            .log());
        }
        self.col_starts.push(self.values.len());
        Ok(())
    }

    /// Append one entry to the current measurement's column
    ///
    /// State indices must be pushed in strictly increasing order within a
    /// measurement; this is what makes the finished storage a valid sorted
    /// CSR when viewed through the bridge.
    pub fn push(&mut self, state_index: usize, value: f64) -> LinAlgResult<()> {
        let col_start = match self.col_starts.last() {
            Some(&start) => start,
            None => return Err(LinAlgError::PushBeforeMeasurement.log()),
        };
        let column = self.col_starts.len() - 1;
        if state_index >= self.num_states {
            return Err(LinAlgError::EntryOutOfRange {
                column,
                got: state_index,
                num_states: self.num_states,
            }
            .log());
        }
        if self.row_idx.len() > col_start {
            let previous = self.row_idx[self.row_idx.len() - 1];
            if state_index <= previous {
                return Err(LinAlgError::UnorderedEntry {
                    column,
                    got: state_index,
                    previous,
                }
                .log());
            }
        }
        self.row_idx.push(state_index);
        self.values.push(value);
        Ok(())
    }

    /// Close the assembly and hand over the storage
    pub fn finish(mut self) -> LinAlgResult<CscStorage> {
        if self.col_starts.len() != self.expected_measurements {
            return Err(LinAlgError::MeasurementCountMismatch {
                got: self.col_starts.len(),
                expected: self.expected_measurements,
            }
            .log());
        }
        if self.values.len() != self.expected_nnz {
            return Err(LinAlgError::NnzMismatch {
                got: self.values.len(),
                expected: self.expected_nnz,
            }
            .log());
        }
        self.col_starts.push(self.values.len());
        Ok(CscStorage {
            num_rows: self.num_states,
            col_ptr: self.col_starts,
            row_idx: self.row_idx,
            values: self.values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    // 3 measurements over a 4-element state:
    //   m0: (0, 1.0) (2, 2.0)
    //   m1: (1, 3.0)
    //   m2: (0, 4.0) (3, 5.0)
    fn build() -> LinAlgResult<CscStorage> {
        let mut builder = JacobianBuilder::new(4, 3, 5);
        builder.begin_measurement()?;
        builder.push(0, 1.0)?;
        builder.push(2, 2.0)?;
        builder.begin_measurement()?;
        builder.push(1, 3.0)?;
        builder.begin_measurement()?;
        builder.push(0, 4.0)?;
        builder.push(3, 5.0)?;
        builder.finish()
    }

    #[test]
    fn test_csc_arrays() -> TestResult {
        let jt = build()?;
        assert_eq!(jt.num_rows(), 4);
        assert_eq!(jt.num_cols(), 3);
        assert_eq!(jt.nnz(), 5);
        assert_eq!(jt.col_ptr(), &[0, 2, 3, 5]);
        assert_eq!(jt.row_idx(), &[0, 2, 1, 0, 3]);
        assert_eq!(jt.values(), &[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(jt.col_rows(2), &[0, 3]);
        assert_eq!(jt.col_values(0), &[1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_csr_view_is_the_transpose() -> TestResult {
        let jt = build()?;
        let j = jt.as_csr();

        // Same arrays, reinterpreted: J is 3 measurements x 4 states
        assert_eq!(j.num_rows(), 3);
        assert_eq!(j.num_cols(), 4);
        assert_eq!(j.nnz(), 5);
        assert_eq!(j.indptr(), jt.col_ptr());
        assert_eq!(j.indices(), jt.row_idx());
        assert_eq!(j.data(), jt.values());

        assert_eq!(j.row_indices(0), &[0, 2]);
        assert_eq!(j.row_values(0), &[1.0, 2.0]);
        assert_eq!(j.row_indices(1), &[1]);
        assert_eq!(j.row_indices(2), &[0, 3]);

        // Sorted-column invariant of CSR holds in every row
        for row in 0..j.num_rows() {
            let idx = j.row_indices(row);
            assert!(idx.windows(2).all(|w| w[0] < w[1]));
        }
        Ok(())
    }

    #[test]
    fn test_unordered_push_rejected() {
        let mut builder = JacobianBuilder::new(4, 1, 2);
        builder.begin_measurement().unwrap();
        builder.push(2, 1.0).unwrap();
        let err = builder.push(2, 1.0).unwrap_err();
        assert!(matches!(
            err,
            LinAlgError::UnorderedEntry { column: 0, got: 2, previous: 2 }
        ));

        let mut builder = JacobianBuilder::new(4, 1, 2);
        builder.begin_measurement().unwrap();
        builder.push(3, 1.0).unwrap();
        assert!(matches!(
            builder.push(1, 1.0).unwrap_err(),
            LinAlgError::UnorderedEntry { .. }
        ));
    }

    #[test]
    fn test_push_requires_open_measurement() {
        let mut builder = JacobianBuilder::new(4, 1, 1);
        assert!(matches!(
            builder.push(0, 1.0).unwrap_err(),
            LinAlgError::PushBeforeMeasurement
        ));
    }

    #[test]
    fn test_state_index_bounds_checked() {
        let mut builder = JacobianBuilder::new(4, 1, 1);
        builder.begin_measurement().unwrap();
        assert!(matches!(
            builder.push(4, 1.0).unwrap_err(),
            LinAlgError::EntryOutOfRange { got: 4, num_states: 4, .. }
        ));
    }

    #[test]
    fn test_declared_counts_enforced() {
        // Too few measurements
        let mut builder = JacobianBuilder::new(4, 2, 1);
        builder.begin_measurement().unwrap();
        builder.push(0, 1.0).unwrap();
        assert!(matches!(
            builder.finish().unwrap_err(),
            LinAlgError::MeasurementCountMismatch { got: 1, expected: 2 }
        ));

        // Too many measurements
        let mut builder = JacobianBuilder::new(4, 1, 1);
        builder.begin_measurement().unwrap();
        assert!(matches!(
            builder.begin_measurement().unwrap_err(),
            LinAlgError::TooManyMeasurements { expected: 1 }
        ));

        // Wrong nnz
        let mut builder = JacobianBuilder::new(4, 1, 2);
        builder.begin_measurement().unwrap();
        builder.push(0, 1.0).unwrap();
        assert!(matches!(
            builder.finish().unwrap_err(),
            LinAlgError::NnzMismatch { got: 1, expected: 2 }
        ));
    }

    #[test]
    fn test_empty_measurement_columns_allowed() -> TestResult {
        // A measurement with no active state columns is legal
        let mut builder = JacobianBuilder::new(2, 2, 1);
        builder.begin_measurement()?;
        builder.begin_measurement()?;
        builder.push(1, 7.0)?;
        let jt = builder.finish()?;
        assert_eq!(jt.col_ptr(), &[0, 0, 1]);
        assert_eq!(jt.as_csr().row_indices(0), &[] as &[usize]);
        Ok(())
    }
}
