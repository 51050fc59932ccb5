//! Coefficient and convergence summaries shared by both models.

use serde::{Deserialize, Serialize};

/// Incidence rate ratio `exp(β)` with its interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateRatio {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Point estimate and interval for one coefficient.
///
/// For the baseline model `estimate` is the MLE and the interval is Wald;
/// for the spatial model `estimate` is the posterior mean and the interval
/// is an equal-tailed credible interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSummary {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub lower: f64,
    pub upper: f64,
    /// Interval coverage, e.g. `0.95`.
    pub level: f64,
}

impl CoefficientSummary {
    /// Exponentiated estimate and bounds.
    #[must_use]
    pub fn rate_ratio(&self) -> RateRatio {
        RateRatio {
            estimate: self.estimate.exp(),
            lower: self.lower.exp(),
            upper: self.upper.exp(),
        }
    }

    /// Whether the interval brackets the point estimate.
    #[must_use]
    pub fn contains_estimate(&self) -> bool {
        self.lower <= self.estimate && self.estimate <= self.upper
    }
}

/// How an iterative fit ended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
    pub max_iterations: usize,
    /// Size of the last update, on the scale the stopping rule uses.
    pub last_change: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_ratio_exponentiates_bounds() {
        let summary = CoefficientSummary {
            name: "exposure".to_string(),
            estimate: 0.0,
            std_error: 0.1,
            lower: -0.2,
            upper: 0.2,
            level: 0.95,
        };
        let irr = summary.rate_ratio();
        assert!((irr.estimate - 1.0).abs() < 1e-12);
        assert!(irr.lower < 1.0 && irr.upper > 1.0);
        assert!(summary.contains_estimate());
    }
}
