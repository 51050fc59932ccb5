#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! End-to-end areal analysis of incident counts against an exposure index.
//!
//! [`run_pipeline`] aggregates events into units, builds the contiguity
//! graph and weights, runs the Moran statistics and both count models, and
//! assembles a [`PipelineReport`]. Aggregation and graph errors abort the
//! run; failures of an individual analysis are recorded in the report.

pub mod config;
pub mod progress;
pub mod report;
mod run;

use crime_risk_areal_models::ErrorCategory;
use crime_risk_autocorrelation::MoranError;
use crime_risk_regression::RegressionError;
use crime_risk_spatial::SpatialError;
use thiserror::Error;

pub use config::{ContiguityConfig, ModelConfig, MoranConfig, PipelineConfig, WeightsConfig};
pub use progress::{NullProgress, ProgressCallback};
pub use report::{Outcome, PipelineReport, UnitReport};
pub use run::run_pipeline;

/// Errors surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Spatial(#[from] SpatialError),

    #[error(transparent)]
    Moran(#[from] MoranError),

    #[error(transparent)]
    Regression(#[from] RegressionError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    /// Error category for reporting.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Spatial(e) => e.category(),
            Self::Moran(e) => e.category(),
            Self::Regression(e) => e.category(),
            Self::Config(_) | Self::Io(_) | Self::Json(_) | Self::Csv(_) => {
                ErrorCategory::InputInconsistency
            }
        }
    }
}
