//! Non-spatial Poisson GLM with log link, fitted by IRLS.

use crime_risk_areal_models::UnitIndex;
use crime_risk_numeric::{SymmetricSolver, normal_quantile};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    COEFFICIENT_NAMES, CoefficientSummary, Convergence, ModelData, RegressionError,
    poisson_deviance,
};

/// Settings for [`fit_poisson_glm`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmOptions {
    /// IRLS iteration budget.
    pub max_iterations: usize,
    /// Stop when `|dev − dev_prev| / (|dev| + 0.1)` drops below this.
    pub tolerance: f64,
    /// Wald interval coverage.
    pub confidence_level: f64,
    /// Turn non-convergence into [`RegressionError::NotConverged`].
    pub require_convergence: bool,
}

impl Default for GlmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
            confidence_level: 0.95,
            require_convergence: false,
        }
    }
}

/// Result of the baseline fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineFit {
    /// Coefficients with Wald intervals, in [`COEFFICIENT_NAMES`] order.
    pub coefficients: Vec<CoefficientSummary>,
    /// Units in the model.
    pub indices: Vec<UnitIndex>,
    /// `μ̂ᵢ`.
    pub fitted: Vec<f64>,
    /// `yᵢ − μ̂ᵢ`.
    pub residuals: Vec<f64>,
    pub deviance: f64,
    pub convergence: Convergence,
}

impl BaselineFit {
    /// Coefficient by name.
    #[must_use]
    pub fn coefficient(&self, name: &str) -> Option<&CoefficientSummary> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// `Xᵀ diag(w) X` and `Xᵀ diag(w) z`.
fn weighted_normal_equations(
    x: &DMatrix<f64>,
    weights: &[f64],
    working: &[f64],
) -> (DMatrix<f64>, DVector<f64>) {
    let p = x.ncols();
    let mut xtwx = DMatrix::zeros(p, p);
    let mut xtwz = DVector::zeros(p);
    for (i, (&w, &z)) in weights.iter().zip(working).enumerate() {
        for a in 0..p {
            let xa = x[(i, a)] * w;
            xtwz[a] += xa * z;
            for b in 0..p {
                xtwx[(a, b)] += xa * x[(i, b)];
            }
        }
    }
    (xtwx, xtwz)
}

/// Fits `log μᵢ = β₀ + β₁ · exposureᵢ` by maximum likelihood.
///
/// A fit that exhausts the iteration budget is returned with
/// `convergence.converged == false` unless `require_convergence` is set.
///
/// # Errors
///
/// * [`RegressionError::TooFewObservations`] / [`RegressionError::ConstantCovariate`]
///   when the coefficients are not identified.
/// * [`RegressionError::Numeric`] when the information matrix is singular.
/// * [`RegressionError::NotConverged`] per `require_convergence`.
pub fn fit_poisson_glm(
    data: &ModelData,
    options: &GlmOptions,
) -> Result<BaselineFit, RegressionError> {
    data.check_identifiable()?;

    let y = data.outcome();
    let x = data.design();

    // Start from the data so that zero counts stay finite.
    let mut mu: Vec<f64> = y.iter().map(|v| v + 0.5).collect();
    let mut eta: Vec<f64> = mu.iter().map(|m| m.ln()).collect();
    let mut deviance = poisson_deviance(y, &mu);
    let mut beta = DVector::zeros(x.ncols());
    let mut convergence = Convergence {
        converged: false,
        iterations: 0,
        max_iterations: options.max_iterations,
        last_change: f64::INFINITY,
    };

    for iteration in 1..=options.max_iterations {
        let working: Vec<f64> = eta
            .iter()
            .zip(&mu)
            .zip(y)
            .map(|((e, m), v)| e + (v - m) / m)
            .collect();
        let (xtwx, xtwz) = weighted_normal_equations(&x, &mu, &working);
        beta = SymmetricSolver::factor(xtwx, "baseline information matrix")?.solve(&xtwz);

        eta = (&x * &beta).iter().copied().collect();
        mu = eta.iter().map(|e| e.exp()).collect();

        let previous = deviance;
        deviance = poisson_deviance(y, &mu);
        let change = (deviance - previous).abs() / (deviance.abs() + 0.1);

        log::trace!("IRLS iteration {iteration}: deviance={deviance:.6} change={change:e}");
        convergence.iterations = iteration;
        convergence.last_change = change;
        if change < options.tolerance {
            convergence.converged = true;
            break;
        }
    }

    if !convergence.converged {
        log::warn!(
            "Baseline GLM stopped after {} iterations without converging (change {:e})",
            convergence.iterations,
            convergence.last_change
        );
        if options.require_convergence {
            return Err(RegressionError::NotConverged {
                model: "baseline",
                iterations: convergence.iterations,
                change: convergence.last_change,
            });
        }
    }

    let (information, _) = weighted_normal_equations(&x, &mu, &eta);
    let covariance =
        SymmetricSolver::factor(information, "baseline coefficient covariance")?.inverse();
    let critical = normal_quantile(0.5 + options.confidence_level / 2.0);

    let coefficients = COEFFICIENT_NAMES
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let std_error = covariance[(k, k)].max(0.0).sqrt();
            CoefficientSummary {
                name: (*name).to_string(),
                estimate: beta[k],
                std_error,
                lower: critical.mul_add(-std_error, beta[k]),
                upper: critical.mul_add(std_error, beta[k]),
                level: options.confidence_level,
            }
        })
        .collect();

    log::debug!(
        "Baseline GLM: beta={:?} deviance={deviance:.4} iterations={}",
        beta.as_slice(),
        convergence.iterations
    );

    Ok(BaselineFit {
        coefficients,
        indices: data.indices().to_vec(),
        residuals: y.iter().zip(&mu).map(|(v, m)| v - m).collect(),
        fitted: mu,
        deviance,
        convergence,
    })
}

#[cfg(test)]
mod tests {
    use crime_risk_areal_models::ErrorCategory;

    use super::*;

    /// Counts equal to their expectations under `log μ = 0.5 + 0.8 x`.
    fn exact_data() -> ModelData {
        let exposure: Vec<f64> = (0..12).map(|i| f64::from(i) / 4.0).collect();
        let outcome = exposure.iter().map(|x| 0.8f64.mul_add(*x, 0.5).exp()).collect();
        ModelData::from_parts(outcome, exposure).expect("valid")
    }

    #[test]
    fn recovers_known_coefficients() {
        let fit = fit_poisson_glm(&exact_data(), &GlmOptions::default()).expect("fits");
        assert!(fit.convergence.converged);

        let intercept = fit.coefficient("(intercept)").expect("present");
        let slope = fit.coefficient("exposure").expect("present");
        assert!((intercept.estimate - 0.5).abs() < 1e-6, "{intercept:?}");
        assert!((slope.estimate - 0.8).abs() < 1e-6, "{slope:?}");
        assert!(fit.deviance.abs() < 1e-6);
        assert!(fit.residuals.iter().all(|r| r.abs() < 1e-5));
    }

    #[test]
    fn wald_interval_brackets_estimate() {
        let data = ModelData::from_parts(
            vec![0.0, 1.0, 1.0, 3.0, 2.0, 5.0, 4.0, 9.0],
            vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5],
        )
        .expect("valid");
        let fit = fit_poisson_glm(&data, &GlmOptions::default()).expect("fits");
        for coefficient in &fit.coefficients {
            assert!(coefficient.contains_estimate());
            assert!(coefficient.std_error > 0.0);
            let irr = coefficient.rate_ratio();
            assert!(irr.lower < irr.estimate && irr.estimate < irr.upper);
        }
        // Positive association in the data.
        assert!(fit.coefficient("exposure").expect("present").estimate > 0.0);
        // Score equations: residuals sum to zero with an intercept.
        assert!(fit.residuals.iter().sum::<f64>().abs() < 1e-6);
    }

    #[test]
    fn exhausted_budget_is_flagged_not_hidden() {
        let data = ModelData::from_parts(
            vec![0.0, 1.0, 1.0, 3.0, 2.0, 5.0, 4.0, 9.0],
            vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 3.5],
        )
        .expect("valid");
        let options = GlmOptions {
            max_iterations: 1,
            ..GlmOptions::default()
        };
        let fit = fit_poisson_glm(&data, &options).expect("returns flagged fit");
        assert!(!fit.convergence.converged);
        assert_eq!(fit.convergence.iterations, 1);

        let strict = GlmOptions {
            require_convergence: true,
            ..options
        };
        let err = fit_poisson_glm(&data, &strict).err().expect("fails");
        assert_eq!(err.category(), ErrorCategory::ConvergenceFailure);
    }

    #[test]
    fn constant_exposure_is_rejected() {
        let data = ModelData::from_parts(vec![1.0, 2.0, 3.0, 4.0], vec![1.0; 4]).expect("valid");
        let err = fit_poisson_glm(&data, &GlmOptions::default()).err().expect("fails");
        assert_eq!(err.category(), ErrorCategory::NumericDegeneracy);
    }

    #[test]
    fn all_zero_counts_drive_fitted_values_to_zero() {
        // No finite MLE exists; the intercept walks towards −∞.
        let data = ModelData::from_parts(vec![0.0; 5], vec![0.0, 1.0, 2.0, 3.0, 4.0])
            .expect("valid");
        let fit = fit_poisson_glm(&data, &GlmOptions::default()).expect("returns");
        assert!(fit.fitted.iter().all(|m| *m < 1e-3));
    }
}
