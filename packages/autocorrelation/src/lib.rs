#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Spatial autocorrelation statistics over areal units.
//!
//! Global Moran's I with variance under the normality or randomization
//! null (or a seeded permutation test), and the local indicator of spatial
//! association for each unit with its cluster/outlier quadrant. Every
//! function takes the weights matrix as an explicit argument.

pub mod global;
pub mod local;

use crime_risk_areal_models::ErrorCategory;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use thiserror::Error;

pub use global::{MoranResult, global_moran};
pub use local::{LocalMoranSet, LocalMoranValue, Reconciliation, local_moran};

/// Errors that can occur while computing Moran statistics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoranError {
    /// Attribute vector and weights disagree on the number of units.
    #[error("Attribute has {actual} values but the weights cover {expected} units")]
    LengthMismatch {
        /// Units in the weights matrix.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },

    /// The attribute contains NaN or an infinity.
    #[error("Attribute value at position {position} is not finite")]
    NonFinite {
        /// 0-based position of the first bad value.
        position: usize,
    },

    /// Too few units for the requested variance formula.
    #[error("{null_model} inference needs at least {required} units, got {n}")]
    TooFewUnits {
        /// Null model requested.
        null_model: NullModel,
        /// Minimum number of units.
        required: usize,
        /// Units supplied.
        n: usize,
    },

    /// All weights are zero, so `S0 = 0`.
    #[error("Weights matrix has no non-zero entries")]
    NoWeights,

    /// The attribute is constant, so the statistic carries no information.
    #[error("Attribute has zero variance")]
    DegenerateAttribute,
}

impl MoranError {
    /// Error category for reporting.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::LengthMismatch { .. } | Self::NonFinite { .. } => {
                ErrorCategory::InputInconsistency
            }
            Self::TooFewUnits { .. } | Self::NoWeights | Self::DegenerateAttribute => {
                ErrorCategory::NumericDegeneracy
            }
        }
    }
}

/// Null model used to derive the variance of global Moran's I.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NullModel {
    /// Attribute values are independent normal draws.
    Normality,
    /// Observed values are randomly reassigned to units (analytic).
    #[default]
    Randomization,
    /// Observed values are reshuffled many times (Monte Carlo).
    Permutation,
}

/// Options for [`global_moran`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoranOptions {
    /// Null model for the variance and p-value.
    pub null_model: NullModel,
    /// Number of reshuffles for [`NullModel::Permutation`].
    pub permutations: usize,
    /// Seed for the permutation generator.
    pub seed: u64,
}

impl Default for MoranOptions {
    fn default() -> Self {
        Self {
            null_model: NullModel::Randomization,
            permutations: 999,
            seed: 20_240_601,
        }
    }
}

/// Centered attribute with its moments, shared by global and local
/// statistics.
pub(crate) struct Centered {
    pub deviations: Vec<f64>,
    pub sum_sq: f64,
    pub sum_quad: f64,
    pub degenerate: bool,
}

impl Centered {
    #[allow(clippy::cast_precision_loss)]
    pub fn new(x: &[f64], expected_len: usize) -> Result<Self, MoranError> {
        if x.len() != expected_len {
            return Err(MoranError::LengthMismatch {
                expected: expected_len,
                actual: x.len(),
            });
        }
        if let Some(position) = x.iter().position(|v| !v.is_finite()) {
            return Err(MoranError::NonFinite { position });
        }

        let n = x.len() as f64;
        let mean = x.iter().sum::<f64>() / n;
        let deviations: Vec<f64> = x.iter().map(|v| v - mean).collect();
        let sum_sq: f64 = deviations.iter().map(|d| d * d).sum();
        let sum_quad: f64 = deviations.iter().map(|d| d.powi(4)).sum();

        // Rounding in the mean leaves tiny residues for constant inputs.
        let scale = x.iter().fold(1.0_f64, |acc, v| acc.max(v.abs()));
        let degenerate = sum_sq <= n * (1e-12 * scale).powi(2);

        Ok(Self {
            deviations,
            sum_sq,
            sum_quad,
            degenerate,
        })
    }

    /// `Σᵢ zᵢ (W z)ᵢ`.
    pub fn cross_product(&self, lag: &[f64]) -> f64 {
        self.deviations.iter().zip(lag).map(|(z, l)| z * l).sum()
    }
}
