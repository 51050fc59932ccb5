//! Report records produced by a pipeline run, and their writers.

use std::collections::BTreeMap;
use std::io::Write;

use crime_risk_areal_models::{ClusterCategory, ErrorCategory, ReferenceFrame, UnitIndex};
use crime_risk_autocorrelation::{MoranResult, Reconciliation};
use crime_risk_regression::{
    BaselineFit, CoefficientSummary, MissingExposurePolicy, RateRatio, SpatialFit,
};
use crime_risk_spatial::{AggregationSummary, ContiguityRule, WeightStyle, ZeroPolicy};
use serde::Serialize;

use crate::{PipelineConfig, PipelineError};

/// Result of an analysis that does not abort the run when it fails.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Completed { result: T },
    Failed { category: ErrorCategory, message: String },
    Skipped { reason: String },
}

impl<T> Outcome<T> {
    /// Records a result, logging failures.
    pub fn record(stage: &str, result: Result<T, PipelineError>) -> Self {
        match result {
            Ok(result) => Self::Completed { result },
            Err(e) => {
                log::error!("{stage} failed ({}): {e}", e.category());
                Self::Failed {
                    category: e.category(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// The result, if the analysis completed.
    #[must_use]
    pub const fn completed(&self) -> Option<&T> {
        match self {
            Self::Completed { result } => Some(result),
            Self::Failed { .. } | Self::Skipped { .. } => None,
        }
    }
}

/// One row of the per-unit results table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub index: UnitIndex,
    pub id: String,
    pub count: u64,
    pub exposure: Option<f64>,
    /// Whether the unit entered the count models.
    pub modelled: bool,
    pub local_moran: Option<f64>,
    pub local_p_value: Option<f64>,
    pub cluster: ClusterCategory,
    /// `cluster`, or `unclassified` when not significant at the configured
    /// level.
    pub significant_cluster: ClusterCategory,
    pub baseline_fitted: Option<f64>,
    pub baseline_residual: Option<f64>,
    pub spatial_fitted: Option<f64>,
    pub spatial_residual: Option<f64>,
    pub spatial_effect: Option<f64>,
}

/// Shape of the contiguity graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub rule: ContiguityRule,
    pub units: usize,
    pub edges: usize,
    pub components: usize,
    pub isolates: Vec<UnitIndex>,
}

/// Weights settings and their normalizing constants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightsSummary {
    pub style: WeightStyle,
    pub zero_policy: ZeroPolicy,
    pub s0: f64,
    pub s1: f64,
    pub s2: f64,
}

/// Global and local autocorrelation of the raw counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutocorrelationReport {
    pub global: MoranResult,
    pub reconciliation: Reconciliation,
    /// Units per quadrant among those significant at `local_alpha`.
    pub significant_clusters: BTreeMap<ClusterCategory, usize>,
    pub local_alpha: f64,
}

/// Global Moran's I of the raw counts and of each model's residuals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResidualDiagnostics {
    pub raw_counts: Outcome<MoranResult>,
    pub spatial_residuals: Outcome<MoranResult>,
    pub baseline_residuals: Outcome<MoranResult>,
}

/// Which units the models saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingExposureReport {
    pub policy: MissingExposurePolicy,
    pub excluded: Vec<String>,
    pub imputed: Vec<String>,
}

/// One model's view of the exposure coefficient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientComparison {
    pub estimate: f64,
    pub std_error: f64,
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
    pub rate_ratio: RateRatio,
    pub deviance: f64,
    pub converged: bool,
}

impl CoefficientComparison {
    fn new(summary: &CoefficientSummary, deviance: f64, converged: bool) -> Self {
        Self {
            estimate: summary.estimate,
            std_error: summary.std_error,
            lower: summary.lower,
            upper: summary.upper,
            level: summary.level,
            rate_ratio: summary.rate_ratio(),
            deviance,
            converged,
        }
    }
}

/// The exposure coefficient under both models.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelComparison {
    pub coefficient: String,
    /// Posterior mean and credible interval.
    pub spatial: Option<CoefficientComparison>,
    /// MLE and Wald interval.
    pub baseline: Option<CoefficientComparison>,
    /// `spatial − baseline` estimate.
    pub shift: Option<f64>,
}

impl ModelComparison {
    pub(crate) fn new(
        coefficient: &str,
        spatial: Option<&SpatialFit>,
        baseline: Option<&BaselineFit>,
    ) -> Self {
        let spatial = spatial.and_then(|fit| {
            fit.coefficient(coefficient).map(|c| {
                CoefficientComparison::new(c, fit.deviance, fit.convergence.converged)
            })
        });
        let baseline = baseline.and_then(|fit| {
            fit.coefficient(coefficient).map(|c| {
                CoefficientComparison::new(c, fit.deviance, fit.convergence.converged)
            })
        });
        let shift = spatial
            .as_ref()
            .zip(baseline.as_ref())
            .map(|(s, b)| s.estimate - b.estimate);
        Self {
            coefficient: coefficient.to_string(),
            spatial,
            baseline,
            shift,
        }
    }
}

/// Everything a run produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub frame: Option<ReferenceFrame>,
    pub aggregation: AggregationSummary,
    pub graph: GraphSummary,
    pub weights: WeightsSummary,
    pub missing_exposure: MissingExposureReport,
    pub units: Vec<UnitReport>,
    pub autocorrelation: Outcome<AutocorrelationReport>,
    pub residuals: ResidualDiagnostics,
    pub baseline: Outcome<BaselineFit>,
    pub spatial: Outcome<SpatialFit>,
    pub comparison: ModelComparison,
    pub config: PipelineConfig,
}

impl PipelineReport {
    /// Writes the whole report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Json`] if serialization or the write fails.
    pub fn write_json(&self, writer: impl Write) -> Result<(), PipelineError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Writes the per-unit table as CSV with a header row.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Csv`] if a row cannot be written.
    pub fn write_units_csv(&self, writer: impl Write) -> Result<(), PipelineError> {
        let mut csv = csv::Writer::from_writer(writer);
        for unit in &self.units {
            csv.serialize(unit)?;
        }
        csv.flush()?;
        Ok(())
    }
}
