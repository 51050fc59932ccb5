#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Numeric building blocks for the autocorrelation tests and the count
//! models: standard normal tail probabilities and quantiles, Gaussian
//! mixtures, and dense symmetric positive-definite solves.

pub mod linalg;
pub mod normal;

use crime_risk_areal_models::ErrorCategory;
use thiserror::Error;

pub use linalg::SymmetricSolver;
pub use normal::{NormalMixture, normal_cdf, normal_quantile, two_sided_p_value};

/// Errors from dense numeric routines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NumericError {
    /// Cholesky factorization failed.
    #[error(
        "Matrix for {stage} ({dimension}x{dimension}) is not positive definite at pivot {pivot}"
    )]
    NotPositiveDefinite {
        /// Which computation produced the matrix.
        stage: &'static str,
        /// Matrix dimension.
        dimension: usize,
        /// 0-based row where the elimination found a non-positive pivot.
        pivot: usize,
    },

    /// A matrix or vector had the wrong shape for the requested operation.
    #[error("Dimension mismatch in {stage}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Which computation was attempted.
        stage: &'static str,
        /// Expected length.
        expected: usize,
        /// Provided length.
        actual: usize,
    },
}

impl NumericError {
    /// Error category for reporting.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::NotPositiveDefinite { .. } => ErrorCategory::NumericDegeneracy,
            Self::DimensionMismatch { .. } => ErrorCategory::InputInconsistency,
        }
    }
}
