//! Dense symmetric positive-definite factorizations.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

use crate::NumericError;

/// A Cholesky factorization `A = L Lᵀ` kept around for repeated solves.
pub struct SymmetricSolver {
    factor: Cholesky<f64, Dyn>,
}

impl SymmetricSolver {
    /// Factors a symmetric positive-definite matrix.
    ///
    /// `stage` names the computation in the error if the matrix is not
    /// positive definite.
    ///
    /// # Errors
    ///
    /// Returns [`NumericError::NotPositiveDefinite`] if the factorization
    /// fails, or [`NumericError::DimensionMismatch`] for a non-square input.
    pub fn factor(matrix: DMatrix<f64>, stage: &'static str) -> Result<Self, NumericError> {
        if matrix.nrows() != matrix.ncols() {
            return Err(NumericError::DimensionMismatch {
                stage,
                expected: matrix.nrows(),
                actual: matrix.ncols(),
            });
        }
        match Cholesky::new(matrix.clone()) {
            Some(factor) => Ok(Self { factor }),
            None => Err(NumericError::NotPositiveDefinite {
                stage,
                dimension: matrix.nrows(),
                pivot: failing_pivot(&matrix),
            }),
        }
    }

    /// Solves `A x = b`.
    #[must_use]
    pub fn solve(&self, rhs: &DVector<f64>) -> DVector<f64> {
        self.factor.solve(rhs)
    }

    /// Solves `A X = B` column by column.
    #[must_use]
    pub fn solve_matrix(&self, rhs: &DMatrix<f64>) -> DMatrix<f64> {
        self.factor.solve(rhs)
    }

    /// `A⁻¹`.
    #[must_use]
    pub fn inverse(&self) -> DMatrix<f64> {
        self.factor.inverse()
    }

    /// `log |A|`, from the diagonal of the factor.
    #[must_use]
    pub fn log_determinant(&self) -> f64 {
        2.0 * self.factor.l_dirty().diagonal().iter().map(|d| d.ln()).sum::<f64>()
    }
}

/// First row at which a plain Cholesky elimination meets a pivot that is
/// not strictly positive. Falls back to the last row when rounding lets
/// every pivot through.
fn failing_pivot(matrix: &DMatrix<f64>) -> usize {
    let n = matrix.nrows();
    let mut lower = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let pivot = matrix[(j, j)] - (0..j).map(|k| lower[(j, k)].powi(2)).sum::<f64>();
        if pivot.is_nan() || pivot <= 0.0 {
            return j;
        }
        let root = pivot.sqrt();
        lower[(j, j)] = root;
        for i in j + 1..n {
            let dot: f64 = (0..j).map(|k| lower[(i, k)] * lower[(j, k)]).sum();
            lower[(i, j)] = (matrix[(i, j)] - dot) / root;
        }
    }
    n.saturating_sub(1)
}
