//! Poisson regression with an intrinsic CAR (ICAR) random effect.
//!
//! Model:
//!
//! ```text
//! yᵢ ~ Poisson(μᵢ)
//! log μᵢ = β₀ + β₁ · exposureᵢ + φᵢ
//! p(φ | τ) ∝ τ^((N − C) / 2) · exp(−τ / 2 · Σ_{i~j} (φᵢ − φⱼ)²)
//! Σ_{i ∈ component k} φᵢ = 0   for each of the C connected components
//! β ~ N(0, 1 / κ),  τ ~ Gamma(a, b)
//! ```
//!
//! For each log-precision on a fixed grid the latent field `(β, φ)` is
//! approximated by a Gaussian at its constrained mode. The grid points are
//! weighted by the Laplace approximation to `p(θ | y)`, and marginals are
//! the resulting normal mixtures.
//!
//! The constraints are handled by factoring `H + AᵀA`, which is positive
//! definite whenever `H` is positive definite on the null space of `A`,
//! and correcting the Newton step and covariance with the usual
//! conditioning-by-kriging update.
//!
//! All matrices are dense: every Newton step factors a `(P + N)²` system
//! and the covariance at each grid point is a full inverse, so a fit costs
//! `O(N³)` per iteration and grid point. This is comfortable up to a few
//! hundred units (about 0.2 s at N = 225 in release builds), slow at a
//! thousand (about 20 s at N = 1024) and impractical beyond that.

use crime_risk_areal_models::UnitIndex;
use crime_risk_numeric::{NormalMixture, SymmetricSolver};
use crime_risk_spatial::AdjacencyGraph;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crime_risk_numeric::NumericError;

use crate::{
    COEFFICIENT_NAMES, CoefficientSummary, Convergence, LatentPosition, ModelData,
    RegressionError, poisson_deviance,
};

/// Maximum number of step halvings in the Newton line search.
const MAX_HALVINGS: usize = 30;

/// Settings for [`fit_icar_poisson`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcarOptions {
    /// Newton iteration budget per grid point.
    pub max_iterations: usize,
    /// Stop when the largest latent update falls below this.
    pub tolerance: f64,
    /// Credible interval coverage.
    pub credible_level: f64,
    /// Prior precision `κ` of each fixed effect.
    pub fixed_effect_precision: f64,
    /// Gamma shape `a` of the precision prior.
    pub precision_prior_shape: f64,
    /// Gamma rate `b` of the precision prior.
    pub precision_prior_rate: f64,
    /// Lower end of the `log τ` grid.
    pub log_precision_min: f64,
    /// Upper end of the `log τ` grid.
    pub log_precision_max: f64,
    /// Number of grid points.
    pub log_precision_steps: usize,
    /// Turn non-convergence into [`RegressionError::NotConverged`].
    pub require_convergence: bool,
}

impl Default for IcarOptions {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-8,
            credible_level: 0.95,
            fixed_effect_precision: 1e-3,
            precision_prior_shape: 1.0,
            precision_prior_rate: 5e-5,
            log_precision_min: -2.0,
            log_precision_max: 8.0,
            log_precision_steps: 21,
            require_convergence: false,
        }
    }
}

impl IcarOptions {
    /// The `log τ` values the posterior is evaluated at.
    ///
    /// # Errors
    ///
    /// Returns [`RegressionError::InvalidOption`] for an empty or inverted
    /// grid, a non-positive tolerance, or a coverage outside `(0, 1)`.
    #[allow(clippy::cast_precision_loss)]
    pub fn log_precision_grid(&self) -> Result<Vec<f64>, RegressionError> {
        if self.log_precision_steps == 0 {
            return Err(RegressionError::InvalidOption {
                option: "log_precision_steps",
                reason: "must be at least 1",
            });
        }
        if !(self.log_precision_min.is_finite()
            && self.log_precision_max.is_finite()
            && self.log_precision_min <= self.log_precision_max)
        {
            return Err(RegressionError::InvalidOption {
                option: "log_precision_min",
                reason: "must be finite and not above log_precision_max",
            });
        }
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(RegressionError::InvalidOption {
                option: "tolerance",
                reason: "must be positive",
            });
        }
        if self.credible_level.is_nan()
            || self.credible_level <= 0.0
            || self.credible_level >= 1.0
        {
            return Err(RegressionError::InvalidOption {
                option: "credible_level",
                reason: "must lie strictly between 0 and 1",
            });
        }
        if self.fixed_effect_precision.is_nan() || self.fixed_effect_precision <= 0.0 {
            return Err(RegressionError::InvalidOption {
                option: "fixed_effect_precision",
                reason: "must be positive",
            });
        }

        if self.log_precision_steps == 1 {
            return Ok(vec![self.log_precision_min]);
        }
        let span = self.log_precision_max - self.log_precision_min;
        let last = (self.log_precision_steps - 1) as f64;
        Ok((0..self.log_precision_steps)
            .map(|k| span.mul_add(k as f64 / last, self.log_precision_min))
            .collect())
    }
}

/// One point of the precision grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrecisionGridPoint {
    /// `θ = log τ`.
    pub log_precision: f64,
    /// Unnormalized Laplace approximation to `log p(θ | y)`.
    pub log_posterior: f64,
    /// Normalized integration weight.
    pub weight: f64,
    /// How the conditional mode search ended.
    pub convergence: Convergence,
}

/// Posterior summary of the ICAR precision `τ`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionSummary {
    /// `E[τ | y]`.
    pub mean: f64,
    /// Grid point with the largest weight.
    pub mode: f64,
    /// Lower credible bound, read off the grid.
    pub lower: f64,
    /// Upper credible bound, read off the grid.
    pub upper: f64,
}

/// Result of the spatial model fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialFit {
    /// Posterior means and equal-tailed credible intervals, in
    /// [`COEFFICIENT_NAMES`] order.
    pub coefficients: Vec<CoefficientSummary>,
    /// Units in the model.
    pub indices: Vec<UnitIndex>,
    /// Posterior mean of `μᵢ`.
    pub fitted: Vec<f64>,
    /// `yᵢ − E[μᵢ | y]`.
    pub residuals: Vec<f64>,
    /// Posterior mean of `φᵢ`.
    pub spatial_effect: Vec<f64>,
    /// Posterior standard deviation of `φᵢ`.
    pub spatial_effect_sd: Vec<f64>,
    /// Connected components of the graph the effect was fitted on.
    pub components: usize,
    pub precision: PrecisionSummary,
    pub grid: Vec<PrecisionGridPoint>,
    /// Poisson deviance at the posterior mean fitted values.
    pub deviance: f64,
    /// Worst convergence over the grid.
    pub convergence: Convergence,
}

impl SpatialFit {
    /// Coefficient by name.
    #[must_use]
    pub fn coefficient(&self, name: &str) -> Option<&CoefficientSummary> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}

/// Gaussian approximation of the latent field at one precision.
struct Mode {
    latent: DVector<f64>,
    latent_variance: Vec<f64>,
    predictor_variance: Vec<f64>,
    log_posterior: f64,
    convergence: Convergence,
}

/// `H + AᵀA` factored, with the pieces needed to project onto `A x = 0`.
struct ConstrainedSystem {
    solver: SymmetricSolver,
    /// `(H + AᵀA)⁻¹ Aᵀ`.
    sigma_at: DMatrix<f64>,
    /// `A (H + AᵀA)⁻¹ Aᵀ`.
    projection: SymmetricSolver,
}

impl ConstrainedSystem {
    /// Removes the component of `v` that would violate the constraints.
    fn correct(&self, constraints: &DMatrix<f64>, v: &DVector<f64>) -> DVector<f64> {
        v - &self.sigma_at * self.projection.solve(&(constraints * v))
    }

    /// `log |H + AᵀA| + log |A (H + AᵀA)⁻¹ Aᵀ|`.
    fn log_determinant(&self) -> f64 {
        self.solver.log_determinant() + self.projection.log_determinant()
    }

    /// Covariance of the latent field conditional on `A x = 0`.
    fn covariance(&self) -> DMatrix<f64> {
        let unconstrained = self.solver.inverse();
        let correction = &self.sigma_at * self.projection.solve_matrix(&self.sigma_at.transpose());
        unconstrained - correction
    }
}

struct Problem<'a> {
    outcome: &'a [f64],
    indices: &'a [UnitIndex],
    /// Component of each modelled unit, by position.
    component_of: Vec<usize>,
    design: DMatrix<f64>,
    graph: AdjacencyGraph,
    /// `C x (P + N)`, one row of ones per component over its `φ` entries.
    constraints: DMatrix<f64>,
    constraint_gram: DMatrix<f64>,
    fixed_precision: f64,
}

impl<'a> Problem<'a> {
    fn new(
        data: &'a ModelData,
        graph: AdjacencyGraph,
        components: &[Vec<usize>],
        fixed_precision: f64,
    ) -> Self {
        let design = data.design();
        let p = design.ncols();
        let dim = p + data.len();

        let mut constraints = DMatrix::zeros(components.len(), dim);
        let mut component_of = vec![0; data.len()];
        for (k, members) in components.iter().enumerate() {
            for &i in members {
                constraints[(k, p + i)] = 1.0;
                component_of[i] = k;
            }
        }
        let constraint_gram = constraints.transpose() * &constraints;

        Self {
            outcome: data.outcome(),
            indices: data.indices(),
            component_of,
            design,
            graph,
            constraints,
            constraint_gram,
            fixed_precision,
        }
    }

    fn fixed_effects(&self) -> usize {
        self.design.ncols()
    }

    fn units(&self) -> usize {
        self.design.nrows()
    }

    /// Intercept at the log mean count, everything else zero.
    #[allow(clippy::cast_precision_loss)]
    fn initial_latent(&self) -> DVector<f64> {
        let mean = self.outcome.iter().sum::<f64>() / self.units() as f64;
        let mut latent = DVector::zeros(self.fixed_effects() + self.units());
        latent[0] = mean.max(1e-3).ln();
        latent
    }

    fn linear_predictor(&self, latent: &DVector<f64>) -> Vec<f64> {
        let p = self.fixed_effects();
        (0..self.units())
            .map(|i| {
                (0..p)
                    .map(|a| self.design[(i, a)] * latent[a])
                    .sum::<f64>()
                    + latent[p + i]
            })
            .collect()
    }

    /// `Σ_{i~j} (φᵢ − φⱼ)² = φᵀ Q φ`.
    fn smoothness(&self, latent: &DVector<f64>) -> f64 {
        self.graph
            .laplacian_form(&latent.as_slice()[self.fixed_effects()..])
    }

    fn fixed_norm(&self, latent: &DVector<f64>) -> f64 {
        (0..self.fixed_effects()).map(|a| latent[a] * latent[a]).sum()
    }

    fn log_likelihood(&self, eta: &[f64]) -> f64 {
        self.outcome
            .iter()
            .zip(eta)
            .map(|(y, e)| y * e - e.exp())
            .sum()
    }

    /// Negative log joint density of `(y, β, φ)` given `τ`, up to constants.
    fn objective(&self, latent: &DVector<f64>, tau: f64) -> f64 {
        let eta = self.linear_predictor(latent);
        0.5f64.mul_add(
            tau * self.smoothness(latent),
            0.5f64.mul_add(
                self.fixed_precision * self.fixed_norm(latent),
                -self.log_likelihood(&eta),
            ),
        )
    }

    /// Gradient of [`Self::objective`] and `H + AᵀA`.
    fn newton_system(&self, latent: &DVector<f64>, tau: f64) -> (DVector<f64>, DMatrix<f64>) {
        let p = self.fixed_effects();
        let n = self.units();
        let eta = self.linear_predictor(latent);

        let mut gradient = DVector::zeros(p + n);
        let mut hessian = self.constraint_gram.clone();
        let smoothing = self.graph.laplacian_apply(&latent.as_slice()[p..]);

        for (i, &e) in eta.iter().enumerate() {
            let mu = e.exp();
            let residual = mu - self.outcome[i];
            for a in 0..p {
                let xa = self.design[(i, a)];
                gradient[a] += xa * residual;
                hessian[(a, p + i)] += xa * mu;
                hessian[(p + i, a)] += xa * mu;
                for b in 0..p {
                    hessian[(a, b)] += xa * mu * self.design[(i, b)];
                }
            }

            gradient[p + i] = tau.mul_add(smoothing[i], residual);
            let neighbors = self.graph.neighbor_positions(i);
            #[allow(clippy::cast_precision_loss)]
            let degree = neighbors.len() as f64;
            hessian[(p + i, p + i)] += tau.mul_add(degree, mu);
            for &j in neighbors {
                hessian[(p + i, p + j)] -= tau;
            }
        }

        for a in 0..p {
            gradient[a] += self.fixed_precision * latent[a];
            hessian[(a, a)] += self.fixed_precision;
        }

        (gradient, hessian)
    }

    /// Latent parameter at row `pivot` of `H + AᵀA`.
    fn latent_position(&self, pivot: usize) -> LatentPosition {
        let p = self.fixed_effects();
        match pivot.checked_sub(p) {
            None => LatentPosition::Coefficient(
                COEFFICIENT_NAMES.get(pivot).copied().unwrap_or("(unnamed)"),
            ),
            Some(i) => LatentPosition::Effect {
                index: self.indices[i],
                component: self.component_of[i],
            },
        }
    }

    fn constrain(&self, hessian: DMatrix<f64>) -> Result<ConstrainedSystem, RegressionError> {
        let solver = SymmetricSolver::factor(hessian, "spatial model Hessian").map_err(|e| {
            match e {
                NumericError::NotPositiveDefinite { stage, pivot, .. } => {
                    RegressionError::SingularSystem {
                        stage,
                        position: self.latent_position(pivot),
                    }
                }
                other @ NumericError::DimensionMismatch { .. } => other.into(),
            }
        })?;
        let sigma_at = solver.solve_matrix(&self.constraints.transpose());
        let projection = SymmetricSolver::factor(
            &self.constraints * &sigma_at,
            "spatial model constraint projection",
        )
        .map_err(|e| match e {
            NumericError::NotPositiveDefinite { stage, pivot, .. } => {
                RegressionError::SingularSystem {
                    stage,
                    position: LatentPosition::Constraint { component: pivot },
                }
            }
            other @ NumericError::DimensionMismatch { .. } => other.into(),
        })?;
        Ok(ConstrainedSystem {
            solver,
            sigma_at,
            projection,
        })
    }

    /// Constrained Newton iterations from `start`, followed by the Gaussian
    /// approximation at the mode.
    #[allow(clippy::cast_precision_loss)]
    fn laplace(
        &self,
        log_precision: f64,
        start: DVector<f64>,
        options: &IcarOptions,
    ) -> Result<Mode, RegressionError> {
        let tau = log_precision.exp();
        let mut latent = start;
        let mut value = self.objective(&latent, tau);
        let mut convergence = Convergence {
            converged: false,
            iterations: 0,
            max_iterations: options.max_iterations,
            last_change: f64::INFINITY,
        };

        for iteration in 1..=options.max_iterations {
            convergence.iterations = iteration;
            let (gradient, hessian) = self.newton_system(&latent, tau);
            let system = self.constrain(hessian)?;
            let step = system.correct(&self.constraints, &system.solver.solve(&(-&gradient)));
            let size = step.amax();

            if size < options.tolerance {
                latent += &step;
                value = self.objective(&latent, tau);
                convergence.last_change = size;
                convergence.converged = true;
                break;
            }

            let slope = gradient.dot(&step);
            // Near the mode the predicted decrease is below rounding noise.
            let slack = 16.0 * f64::EPSILON * value.abs().max(1.0);
            let mut scale = 1.0;
            let mut accepted = None;
            for _ in 0..MAX_HALVINGS {
                let candidate = &latent + &step * scale;
                let candidate_value = self.objective(&candidate, tau);
                if candidate_value.is_finite()
                    && candidate_value <= (1e-4 * scale).mul_add(slope, value) + slack
                {
                    accepted = Some((candidate, candidate_value));
                    break;
                }
                scale *= 0.5;
            }

            let Some((candidate, candidate_value)) = accepted else {
                log::debug!(
                    "Line search stalled at log precision {log_precision:.3} after {iteration} iterations"
                );
                break;
            };
            latent = candidate;
            value = candidate_value;
            convergence.last_change = scale * size;
        }

        let (_, hessian) = self.newton_system(&latent, tau);
        let system = self.constrain(hessian)?;
        let covariance = system.covariance();

        let p = self.fixed_effects();
        let n = self.units();
        let latent_variance = (0..p + n).map(|k| covariance[(k, k)].max(0.0)).collect();
        let predictor_variance = (0..n)
            .map(|i| {
                let mut variance = covariance[(p + i, p + i)];
                for a in 0..p {
                    let xa = self.design[(i, a)];
                    variance += 2.0 * xa * covariance[(a, p + i)];
                    for b in 0..p {
                        variance += xa * self.design[(i, b)] * covariance[(a, b)];
                    }
                }
                variance.max(0.0)
            })
            .collect();

        let rank = (n - self.constraints.nrows()) as f64;
        let shape = 0.5f64.mul_add(rank, options.precision_prior_shape);
        let log_posterior = shape.mul_add(log_precision, -value)
            - options.precision_prior_rate * tau
            - 0.5 * system.log_determinant();

        Ok(Mode {
            latent,
            latent_variance,
            predictor_variance,
            log_posterior,
            convergence,
        })
    }
}

/// Normalized weights from unnormalized log densities. Non-finite entries
/// get weight zero.
fn softmax(log_values: &[f64]) -> Vec<f64> {
    let max = log_values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NEG_INFINITY, f64::max);
    let raw: Vec<f64> = log_values
        .iter()
        .map(|v| if v.is_finite() { (v - max).exp() } else { 0.0 })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|w| w / total).collect()
}

/// Reads a quantile off a discrete distribution over sorted grid values.
fn grid_quantile(values: &[f64], weights: &[f64], p: f64) -> f64 {
    let mut cumulative = 0.0;
    for (value, weight) in values.iter().zip(weights) {
        cumulative += weight;
        if cumulative >= p {
            return *value;
        }
    }
    values.last().copied().unwrap_or(f64::NAN)
}

/// Fits the Poisson ICAR model.
///
/// `graph` must cover every unit of the table `data` was built from;
/// units excluded for missing exposure are removed from it together with
/// their edges. Each connected component of the remaining graph gets its
/// own sum-to-zero constraint, so isolated units have `φ = 0`.
///
/// # Errors
///
/// * [`RegressionError::GraphMismatch`] if `graph` has the wrong size.
/// * [`RegressionError::InvalidOption`] for unusable settings.
/// * Identification errors as for the baseline model.
/// * [`RegressionError::Numeric`] if a Hessian is not positive definite.
/// * [`RegressionError::DegeneratePosterior`] if no grid point is usable.
/// * [`RegressionError::NotConverged`] per `require_convergence`.
#[allow(clippy::too_many_lines)]
pub fn fit_icar_poisson(
    data: &ModelData,
    graph: &AdjacencyGraph,
    options: &IcarOptions,
) -> Result<SpatialFit, RegressionError> {
    data.check_identifiable()?;
    let covered = data.len() + data.excluded().len();
    if graph.len() != covered {
        return Err(RegressionError::GraphMismatch {
            graph: graph.len(),
            observations: covered,
        });
    }
    let grid = options.log_precision_grid()?;

    let graph = graph.induced(&data.positions());
    let components = graph.connected_components();
    let singletons = components.iter().filter(|c| c.len() == 1).count();
    log::info!(
        "Fitting ICAR model on {} units, {} edges, {} components ({singletons} isolated), {} grid points",
        data.len(),
        graph.edge_count(),
        components.len(),
        grid.len()
    );

    let problem = Problem::new(data, graph, &components, options.fixed_effect_precision);
    let p = problem.fixed_effects();
    let n = problem.units();

    let mut start = problem.initial_latent();
    let mut modes = Vec::with_capacity(grid.len());
    for &log_precision in &grid {
        let mode = problem.laplace(log_precision, start.clone(), options)?;
        log::debug!(
            "log precision {log_precision:.3}: log posterior {:.4}, {} iterations",
            mode.log_posterior,
            mode.convergence.iterations
        );
        start = mode.latent.clone();
        modes.push(mode);
    }

    let weights = softmax(&modes.iter().map(|m| m.log_posterior).collect::<Vec<_>>());
    if weights.iter().any(|w| w.is_nan()) || weights.iter().all(|w| *w <= 0.0) {
        return Err(RegressionError::DegeneratePosterior);
    }

    let level = options.credible_level;
    let coefficients = COEFFICIENT_NAMES
        .iter()
        .enumerate()
        .map(|(a, name)| {
            let mixture = NormalMixture::new(
                modes
                    .iter()
                    .zip(&weights)
                    .map(|(m, &w)| (w, m.latent[a], m.latent_variance[a].sqrt())),
            )
            .ok_or(RegressionError::DegeneratePosterior)?;
            Ok(CoefficientSummary {
                name: (*name).to_string(),
                estimate: mixture.mean(),
                std_error: mixture.std_dev(),
                lower: mixture.quantile(0.5 - level / 2.0),
                upper: mixture.quantile(0.5 + level / 2.0),
                level,
            })
        })
        .collect::<Result<Vec<_>, RegressionError>>()?;

    let mut fitted = vec![0.0; n];
    let mut spatial_effect = vec![0.0; n];
    let mut second_moment = vec![0.0; n];
    for (mode, &w) in modes.iter().zip(&weights) {
        let eta = problem.linear_predictor(&mode.latent);
        for i in 0..n {
            fitted[i] += w * 0.5f64.mul_add(mode.predictor_variance[i], eta[i]).exp();
            let phi = mode.latent[p + i];
            spatial_effect[i] += w * phi;
            second_moment[i] += w * phi.mul_add(phi, mode.latent_variance[p + i]);
        }
    }
    let spatial_effect_sd = spatial_effect
        .iter()
        .zip(&second_moment)
        .map(|(m, s)| m.mul_add(-m, *s).max(0.0).sqrt())
        .collect();

    let precisions: Vec<f64> = grid.iter().map(|t| t.exp()).collect();
    let mode_position = weights
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(k, _)| k);
    let precision = PrecisionSummary {
        mean: precisions.iter().zip(&weights).map(|(t, w)| t * w).sum(),
        mode: precisions[mode_position],
        lower: grid_quantile(&precisions, &weights, 0.5 - level / 2.0),
        upper: grid_quantile(&precisions, &weights, 0.5 + level / 2.0),
    };

    let convergence = Convergence {
        converged: modes.iter().all(|m| m.convergence.converged),
        iterations: modes
            .iter()
            .map(|m| m.convergence.iterations)
            .max()
            .unwrap_or(0),
        max_iterations: options.max_iterations,
        last_change: modes
            .iter()
            .map(|m| m.convergence.last_change)
            .fold(0.0, f64::max),
    };
    if !convergence.converged {
        let failed = modes.iter().filter(|m| !m.convergence.converged).count();
        log::warn!(
            "ICAR mode search did not converge at {failed} of {} grid points",
            modes.len()
        );
        if options.require_convergence {
            return Err(RegressionError::NotConverged {
                model: "spatial",
                iterations: convergence.iterations,
                change: convergence.last_change,
            });
        }
    }
    if weights[0] > 0.5 || weights[weights.len() - 1] > 0.5 {
        log::warn!("Precision posterior is concentrated at the edge of the grid");
    }

    let outcome = data.outcome();
    let deviance = poisson_deviance(outcome, &fitted);
    let grid = grid
        .iter()
        .zip(&modes)
        .zip(&weights)
        .map(|((&log_precision, mode), &weight)| PrecisionGridPoint {
            log_precision,
            log_posterior: mode.log_posterior,
            weight,
            convergence: mode.convergence,
        })
        .collect();

    log::debug!(
        "ICAR fit: coefficients={:?} precision mean={:.4} deviance={deviance:.4}",
        coefficients.iter().map(|c| c.estimate).collect::<Vec<_>>(),
        precision.mean
    );

    Ok(SpatialFit {
        coefficients,
        indices: data.indices().to_vec(),
        residuals: outcome.iter().zip(&fitted).map(|(y, m)| y - m).collect(),
        fitted,
        spatial_effect,
        spatial_effect_sd,
        components: components.len(),
        precision,
        grid,
        deviance,
        convergence,
    })
}

#[cfg(test)]
mod tests {
    use crime_risk_areal_models::{AreaRecord, AreaTable, ErrorCategory};

    use super::*;
    use crate::{GlmOptions, MissingExposurePolicy, fit_poisson_glm};

    fn lattice(cols: usize, rows: usize) -> AdjacencyGraph {
        let at = |c: usize, r: usize| r * cols + c;
        let mut edges = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                if c + 1 < cols {
                    edges.push((at(c, r), at(c + 1, r)));
                }
                if r + 1 < rows {
                    edges.push((at(c, r), at(c, r + 1)));
                }
            }
        }
        AdjacencyGraph::from_edges(cols * rows, &edges).expect("lattice")
    }

    /// 5x5 lattice: counts rise towards the left columns independently of
    /// exposure.
    fn clustered() -> (ModelData, AdjacencyGraph) {
        let mut outcome = Vec::new();
        let mut exposure = Vec::new();
        for r in 0..5u32 {
            for c in 0..5u32 {
                outcome.push(f64::from((5 - c) * 3 + (r % 2)));
                exposure.push(f64::from((r * 7 + c * 3) % 5) / 2.0);
            }
        }
        (
            ModelData::from_parts(outcome, exposure).expect("valid"),
            lattice(5, 5),
        )
    }

    fn quick() -> IcarOptions {
        IcarOptions {
            log_precision_steps: 11,
            ..IcarOptions::default()
        }
    }

    #[test]
    fn credible_intervals_contain_posterior_means() {
        let (data, graph) = clustered();
        let fit = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        assert!(fit.convergence.converged, "{:?}", fit.convergence);
        for coefficient in &fit.coefficients {
            assert!(coefficient.contains_estimate(), "{coefficient:?}");
            assert!(coefficient.std_error > 0.0);
        }
        assert!((fit.grid.iter().map(|g| g.weight).sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(fit.precision.lower <= fit.precision.upper);
        assert_eq!(fit.components, 1);
    }

    #[test]
    fn effect_sums_to_zero_within_each_component() {
        // Path {0,1,2}, pair {3,4}, isolate {5}.
        let graph = AdjacencyGraph::from_edges(6, &[(0, 1), (1, 2), (3, 4)]).expect("valid");
        let data = ModelData::from_parts(
            vec![12.0, 9.0, 7.0, 1.0, 0.0, 4.0],
            vec![1.0, 2.0, 0.5, 1.5, 3.0, 2.5],
        )
        .expect("valid");
        let fit = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        assert_eq!(fit.components, 3);

        let phi = &fit.spatial_effect;
        assert!((phi[0] + phi[1] + phi[2]).abs() < 1e-8, "{phi:?}");
        assert!((phi[3] + phi[4]).abs() < 1e-8, "{phi:?}");
        assert!(phi[5].abs() < 1e-8);
        assert!(fit.spatial_effect_sd[5] < 1e-6);
    }

    #[test]
    fn singular_hessian_names_unit_and_component() {
        let graph = AdjacencyGraph::from_edges(6, &[(0, 1), (1, 2), (3, 4)]).expect("valid");
        let data = ModelData::from_parts(
            vec![12.0, 9.0, 7.0, 1.0, 0.0, 4.0],
            vec![1.0, 2.0, 0.5, 1.5, 3.0, 2.5],
        )
        .expect("valid");
        let components = graph.connected_components();
        let problem = Problem::new(&data, graph, &components, 1e-3);
        let p = problem.fixed_effects();

        let (_, mut hessian) = problem.newton_system(&problem.initial_latent(), 1.0);
        assert!(problem.constrain(hessian.clone()).is_ok());

        // Knock out unit 5 (position 4), which sits in the pair {3, 4}.
        hessian.row_mut(p + 4).fill(0.0);
        hessian.column_mut(p + 4).fill(0.0);
        let err = problem.constrain(hessian).err();
        assert_eq!(
            err,
            Some(RegressionError::SingularSystem {
                stage: "spatial model Hessian",
                position: LatentPosition::Effect {
                    index: UnitIndex::from_position(4),
                    component: 1,
                },
            })
        );
        assert_eq!(
            err.map(|e| e.category()),
            Some(ErrorCategory::NumericDegeneracy)
        );
    }

    #[test]
    fn reruns_are_identical() {
        let (data, graph) = clustered();
        let first = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        let second = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        assert_eq!(first, second);
    }

    #[test]
    fn spatial_effect_absorbs_clustering() {
        let (data, graph) = clustered();
        let spatial = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        let baseline = fit_poisson_glm(&data, &GlmOptions::default()).expect("fits");
        assert!(spatial.deviance < baseline.deviance);
        // Left columns carry a positive effect, right columns a negative one.
        assert!(spatial.spatial_effect[0] > 0.0);
        assert!(spatial.spatial_effect[4] < 0.0);
    }

    #[test]
    fn exhausted_budget_is_flagged() {
        let (data, graph) = clustered();
        let options = IcarOptions {
            max_iterations: 1,
            ..quick()
        };
        let fit = fit_icar_poisson(&data, &graph, &options).expect("returns flagged fit");
        assert!(!fit.convergence.converged);

        let strict = IcarOptions {
            require_convergence: true,
            ..options
        };
        let err = fit_icar_poisson(&data, &graph, &strict).err().expect("fails");
        assert_eq!(err.category(), ErrorCategory::ConvergenceFailure);
    }

    #[test]
    fn excluded_units_are_dropped_from_graph() {
        let records = (0..6)
            .map(|i| AreaRecord {
                index: UnitIndex::from_position(i),
                id: format!("u{i}"),
                count: [3, 5, 4, 8, 6, 7][i],
                exposure: if i == 2 { None } else { Some(i as f64) },
            })
            .collect();
        let table = AreaTable::new(records).expect("dense");
        let data = ModelData::from_table(&table, MissingExposurePolicy::Exclude).expect("ok");
        // Path 0-1-2-3-4-5; removing 2 splits it in two.
        let graph = lattice(6, 1);
        let fit = fit_icar_poisson(&data, &graph, &quick()).expect("fits");
        assert_eq!(fit.indices.len(), 5);
        assert_eq!(fit.components, 2);
        assert!(fit.indices.iter().all(|i| i.position() != 2));
    }

    #[test]
    fn graph_size_must_match() {
        let (data, _) = clustered();
        let err = fit_icar_poisson(&data, &lattice(2, 2), &quick()).err();
        assert!(matches!(
            err,
            Some(RegressionError::GraphMismatch {
                graph: 4,
                observations: 25
            })
        ));
    }

    #[test]
    fn invalid_grid_is_rejected() {
        let options = IcarOptions {
            log_precision_min: 3.0,
            log_precision_max: 1.0,
            ..IcarOptions::default()
        };
        assert!(options.log_precision_grid().is_err());
        let grid = IcarOptions::default().log_precision_grid().expect("valid");
        assert_eq!(grid.len(), 21);
        assert!((grid[0] + 2.0).abs() < 1e-12);
        assert!((grid[20] - 8.0).abs() < 1e-12);
    }
}
