#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Poisson regression of incident counts on exposure.
//!
//! Two models share the same design: an ordinary maximum-likelihood
//! Poisson GLM fitted by iteratively reweighted least squares, and a
//! Poisson model with an intrinsic CAR random effect whose posterior is
//! approximated by nested Laplace approximations integrated over a grid of
//! log-precisions.

pub mod baseline;
pub mod design;
pub mod icar;
pub mod summary;

use crime_risk_areal_models::{ErrorCategory, UnitIndex};
use crime_risk_numeric::NumericError;
use thiserror::Error;

pub use baseline::{BaselineFit, GlmOptions, fit_poisson_glm};
pub use design::{COEFFICIENT_NAMES, MissingExposurePolicy, ModelData};
pub use icar::{IcarOptions, PrecisionGridPoint, PrecisionSummary, SpatialFit, fit_icar_poisson};
pub use summary::{CoefficientSummary, Convergence, RateRatio};

/// A parameter of the spatial model's latent vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatentPosition {
    /// A fixed-effect coefficient.
    Coefficient(&'static str),
    /// The spatial effect of one unit, with the 0-based connected component
    /// it belongs to.
    Effect {
        index: UnitIndex,
        component: usize,
    },
    /// The sum-to-zero constraint of a 0-based connected component.
    Constraint { component: usize },
}

impl std::fmt::Display for LatentPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coefficient(name) => write!(f, "coefficient '{name}'"),
            Self::Effect { index, component } => {
                write!(f, "spatial effect of unit {index} (component {component})")
            }
            Self::Constraint { component } => {
                write!(f, "sum-to-zero constraint of component {component}")
            }
        }
    }
}

/// Errors that can occur while fitting count models.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegressionError {
    /// A unit has no exposure and the policy forbids exclusion.
    #[error("Areal unit {index} ('{id}') has no exposure value")]
    MissingExposure {
        /// The unit concerned.
        index: UnitIndex,
        /// Its identifier.
        id: String,
    },

    /// An exposure value is NaN or infinite.
    #[error("Areal unit {index} has a non-finite exposure value")]
    NonFiniteExposure {
        /// The unit concerned.
        index: UnitIndex,
    },

    /// No units remain to fit.
    #[error("No observations remain after applying the missing-exposure policy")]
    NoObservations,

    /// Fewer observations than parameters.
    #[error("{n} observations cannot identify {parameters} parameters")]
    TooFewObservations {
        /// Observations available.
        n: usize,
        /// Parameters to estimate.
        parameters: usize,
    },

    /// A covariate does not vary, so its coefficient is not identified.
    #[error("Covariate '{name}' is constant across all observations")]
    ConstantCovariate {
        /// Covariate name.
        name: &'static str,
    },

    /// Outcome and exposure have different lengths.
    #[error("{outcome} outcomes but {exposure} exposure values")]
    LengthMismatch {
        /// Outcome values supplied.
        outcome: usize,
        /// Exposure values supplied.
        exposure: usize,
    },

    /// Graph and data cover different numbers of units.
    #[error("Adjacency graph covers {graph} units but the data has {observations}")]
    GraphMismatch {
        /// Units in the graph.
        graph: usize,
        /// Units in the data.
        observations: usize,
    },

    /// An option is outside its valid range.
    #[error("Invalid option '{option}': {reason}")]
    InvalidOption {
        /// Option name.
        option: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// No precision grid point produced a usable approximation.
    #[error("Posterior over the precision grid is degenerate")]
    DegeneratePosterior,

    /// The spatial model's precision system is singular; `position` names
    /// the latent parameter where the factorization broke down.
    #[error("{stage} is not positive definite at {position}")]
    SingularSystem {
        /// Which factorization failed.
        stage: &'static str,
        /// Coefficient, unit or component at the failing pivot.
        position: LatentPosition,
    },

    /// A dense numeric step failed.
    #[error("Numeric failure: {0}")]
    Numeric(#[from] NumericError),

    /// The iterative solve ran out of budget and the caller asked for this
    /// to be fatal.
    #[error("{model} did not converge in {iterations} iterations (last change {change:e})")]
    NotConverged {
        /// Which model.
        model: &'static str,
        /// Iterations used.
        iterations: usize,
        /// Size of the last update.
        change: f64,
    },
}

impl RegressionError {
    /// Error category for reporting.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingExposure { .. }
            | Self::NonFiniteExposure { .. }
            | Self::NoObservations
            | Self::LengthMismatch { .. }
            | Self::GraphMismatch { .. }
            | Self::InvalidOption { .. } => ErrorCategory::InputInconsistency,
            Self::TooFewObservations { .. }
            | Self::ConstantCovariate { .. }
            | Self::DegeneratePosterior
            | Self::SingularSystem { .. } => ErrorCategory::NumericDegeneracy,
            Self::Numeric(e) => e.category(),
            Self::NotConverged { .. } => ErrorCategory::ConvergenceFailure,
        }
    }
}

/// Poisson deviance `2 Σ [y ln(y / μ) − (y − μ)]`.
#[must_use]
pub fn poisson_deviance(observed: &[f64], fitted: &[f64]) -> f64 {
    2.0 * observed
        .iter()
        .zip(fitted)
        .map(|(&y, &mu)| {
            let ratio_term = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
            ratio_term - (y - mu)
        })
        .sum::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deviance_is_zero_for_perfect_fit() {
        assert!(poisson_deviance(&[0.0, 3.0, 7.0], &[1e-300, 3.0, 7.0]).abs() < 1e-12);
    }

    #[test]
    fn deviance_is_positive_otherwise() {
        assert!(poisson_deviance(&[0.0, 3.0], &[1.0, 2.0]) > 0.0);
    }

    #[test]
    fn error_categories() {
        assert_eq!(
            RegressionError::NoObservations.category(),
            ErrorCategory::InputInconsistency
        );
        assert_eq!(
            RegressionError::NotConverged {
                model: "baseline",
                iterations: 3,
                change: 1.0
            }
            .category(),
            ErrorCategory::ConvergenceFailure
        );
        assert_eq!(
            RegressionError::Numeric(NumericError::NotPositiveDefinite {
                stage: "x",
                dimension: 2,
                pivot: 1
            })
            .category(),
            ErrorCategory::NumericDegeneracy
        );
    }
}
