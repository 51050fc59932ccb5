//! Global Moran's I.
//!
//! `I = (N / S0) · Σᵢⱼ wᵢⱼ zᵢ zⱼ / Σᵢ zᵢ²` with `z = x − mean(x)`, tested
//! against `E[I] = −1 / (N − 1)`.

use crime_risk_numeric::two_sided_p_value;
use crime_risk_spatial::WeightsMatrix;
use rand::SeedableRng as _;
use rand::rngs::StdRng;
use rand::seq::SliceRandom as _;
use serde::{Deserialize, Serialize};

use crate::{Centered, MoranError, MoranOptions, NullModel};

/// Global Moran's I with its null distribution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoranResult {
    /// The statistic.
    pub statistic: f64,
    /// Expectation under the null, `−1 / (N − 1)`.
    pub expectation: f64,
    /// Variance under the null (sample variance of the reshuffled
    /// statistics for the permutation test).
    pub variance: f64,
    /// `(I − E[I]) / sqrt(Var[I])`; absent for degenerate inputs.
    pub z_score: Option<f64>,
    /// Two-sided p-value; absent for degenerate inputs.
    pub p_value: Option<f64>,
    /// Null model used.
    pub null_model: NullModel,
    /// Number of reshuffles, for the permutation test.
    pub permutations: Option<usize>,
    /// Number of units.
    pub n: usize,
    /// Whether the attribute was constant (statistic fixed at zero).
    pub degenerate: bool,
}

impl MoranResult {
    /// Rejects degenerate results for callers that treat a constant
    /// attribute as fatal.
    ///
    /// # Errors
    ///
    /// Returns [`MoranError::DegenerateAttribute`] if the attribute was
    /// constant.
    pub const fn require_non_degenerate(&self) -> Result<&Self, MoranError> {
        if self.degenerate {
            Err(MoranError::DegenerateAttribute)
        } else {
            Ok(self)
        }
    }
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn statistic(centered: &Centered, weights: &WeightsMatrix, s0: f64) -> f64 {
    let n = centered.deviations.len() as f64;
    let lag = weights.lag(&centered.deviations);
    (n / s0) * centered.cross_product(&lag) / centered.sum_sq
}

/// Computes global Moran's I of `x` under `weights`.
///
/// A constant attribute yields `I = 0` with zero variance and no
/// z-score or p-value, flagged as degenerate.
///
/// # Errors
///
/// * [`MoranError::LengthMismatch`] / [`MoranError::NonFinite`] for bad input.
/// * [`MoranError::NoWeights`] when every weight is zero.
/// * [`MoranError::TooFewUnits`] when the chosen variance formula is
///   undefined for this many units.
#[allow(clippy::cast_precision_loss)]
pub fn global_moran(
    x: &[f64],
    weights: &WeightsMatrix,
    options: &MoranOptions,
) -> Result<MoranResult, MoranError> {
    let centered = Centered::new(x, weights.len())?;
    let len = x.len();

    let required = match options.null_model {
        NullModel::Randomization => 4,
        NullModel::Normality | NullModel::Permutation => 2,
    };
    if len < required {
        return Err(MoranError::TooFewUnits {
            null_model: options.null_model,
            required,
            n: len,
        });
    }

    let s0 = weights.s0();
    if s0 <= 0.0 {
        return Err(MoranError::NoWeights);
    }

    let n = len as f64;
    let expectation = -1.0 / (n - 1.0);
    let permutations =
        (options.null_model == NullModel::Permutation).then_some(options.permutations);

    if centered.degenerate {
        log::warn!("Moran's I requested for a constant attribute over {len} units");
        return Ok(MoranResult {
            statistic: 0.0,
            expectation,
            variance: 0.0,
            z_score: None,
            p_value: None,
            null_model: options.null_model,
            permutations,
            n: len,
            degenerate: true,
        });
    }

    let observed = statistic(&centered, weights, s0);

    let (variance, p_value) = match options.null_model {
        NullModel::Normality => {
            let variance = normality_variance(weights, n, s0) - expectation * expectation;
            (variance, None)
        }
        NullModel::Randomization => {
            let variance =
                randomization_variance(weights, &centered, n, s0) - expectation * expectation;
            (variance, None)
        }
        NullModel::Permutation => {
            let (variance, p) = permutation_test(
                &centered,
                weights,
                s0,
                observed,
                expectation,
                options,
            );
            (variance, Some(p))
        }
    };

    let z_score = (variance > 0.0).then(|| (observed - expectation) / variance.sqrt());
    let p_value = p_value.or_else(|| z_score.map(two_sided_p_value));

    log::debug!(
        "Moran's I = {observed:.5} (E = {expectation:.5}, Var = {variance:.6}, {} null)",
        options.null_model
    );

    Ok(MoranResult {
        statistic: observed,
        expectation,
        variance,
        z_score,
        p_value,
        null_model: options.null_model,
        permutations,
        n: len,
        degenerate: false,
    })
}

/// `E[I²]` under the normality assumption.
fn normality_variance(weights: &WeightsMatrix, n: f64, s0: f64) -> f64 {
    let s1 = weights.s1();
    let s2 = weights.s2();
    (n * n * s1 - n * s2 + 3.0 * s0 * s0) / (s0 * s0 * (n * n - 1.0))
}

/// `E[I²]` under the randomization assumption.
#[allow(clippy::cast_precision_loss)]
fn randomization_variance(weights: &WeightsMatrix, centered: &Centered, n: f64, s0: f64) -> f64 {
    let s1 = weights.s1();
    let s2 = weights.s2();
    let m2 = centered.sum_sq / n;
    let m4 = centered.sum_quad / n;
    let kurtosis = m4 / (m2 * m2);

    let first = n * ((n * n - 3.0 * n + 3.0) * s1 - n * s2 + 3.0 * s0 * s0);
    let second = kurtosis * ((n * n - n) * s1 - 2.0 * n * s2 + 6.0 * s0 * s0);
    (first - second) / ((n - 1.0) * (n - 2.0) * (n - 3.0) * s0 * s0)
}

/// Reshuffles the deviations `permutations` times with a seeded
/// generator. Returns the variance of the simulated statistics and the
/// two-sided pseudo p-value `(1 + #extreme) / (1 + permutations)`.
#[allow(clippy::cast_precision_loss)]
fn permutation_test(
    centered: &Centered,
    weights: &WeightsMatrix,
    s0: f64,
    observed: f64,
    expectation: f64,
    options: &MoranOptions,
) -> (f64, f64) {
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut shuffled = Centered {
        deviations: centered.deviations.clone(),
        sum_sq: centered.sum_sq,
        sum_quad: centered.sum_quad,
        degenerate: false,
    };

    let threshold = (observed - expectation).abs();
    let mut extreme = 0_usize;
    let mut simulated = Vec::with_capacity(options.permutations);

    for _ in 0..options.permutations {
        shuffled.deviations.shuffle(&mut rng);
        let value = statistic(&shuffled, weights, s0);
        if (value - expectation).abs() >= threshold {
            extreme += 1;
        }
        simulated.push(value);
    }

    let count = simulated.len().max(1) as f64;
    let mean = simulated.iter().sum::<f64>() / count;
    let variance = if simulated.len() > 1 {
        simulated.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0)
    } else {
        0.0
    };
    let p_value = (1.0 + extreme as f64) / (1.0 + options.permutations as f64);

    (variance, p_value)
}

#[cfg(test)]
mod tests {
    use crime_risk_spatial::{
        AdjacencyGraph, ContiguityRule, WeightStyle, ZeroPolicy, build_contiguity,
    };
    use geo::{MultiPolygon, Rect, coord};

    use super::*;

    /// Row-major grid of unit squares from the bottom-left.
    fn grid(cols: u32, rows: u32) -> Vec<MultiPolygon<f64>> {
        (0..rows)
            .flat_map(|row| {
                (0..cols).map(move |col| {
                    let (x, y) = (f64::from(col), f64::from(row));
                    MultiPolygon(vec![
                        Rect::new(coord! { x: x, y: y }, coord! { x: x + 1.0, y: y + 1.0 })
                            .to_polygon(),
                    ])
                })
            })
            .collect()
    }

    fn grid_weights(
        cols: u32,
        rows: u32,
        rule: ContiguityRule,
        style: WeightStyle,
    ) -> WeightsMatrix {
        let graph = build_contiguity(&grid(cols, rows), rule).expect("grid builds");
        WeightsMatrix::from_graph(graph, style, ZeroPolicy::Error).expect("no isolates")
    }

    fn options(null_model: NullModel) -> MoranOptions {
        MoranOptions {
            null_model,
            ..MoranOptions::default()
        }
    }

    #[test]
    fn checkerboard_is_negative() {
        let (cols, rows) = (6, 6);
        let weights = grid_weights(cols, rows, ContiguityRule::Rook, WeightStyle::RowStandardized);
        let x: Vec<f64> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| f64::from((r + c) % 2)))
            .collect();

        let result = global_moran(&x, &weights, &MoranOptions::default()).expect("computes");
        assert!((result.statistic + 1.0).abs() < 1e-12, "I = {}", result.statistic);
        assert!(result.z_score.is_some_and(|z| z < 0.0));
    }

    #[test]
    fn smooth_gradient_is_positive() {
        let (cols, rows) = (6, 6);
        let weights = grid_weights(cols, rows, ContiguityRule::Queen, WeightStyle::RowStandardized);
        let x: Vec<f64> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| f64::from(r + c)))
            .collect();

        let result = global_moran(&x, &weights, &MoranOptions::default()).expect("computes");
        assert!(result.statistic > 0.5, "I = {}", result.statistic);
        assert!(result.p_value.is_some_and(|p| p < 0.01));
    }

    #[test]
    fn two_by_two_alternating_counts_under_rook() {
        // Units listed counter-clockwise from the bottom-left, so each
        // unit's rook neighbors are the two units with the opposite count.
        let squares = grid(2, 2);
        let polygons = [0, 1, 3, 2].map(|k| squares[k].clone());
        let graph = build_contiguity(&polygons, ContiguityRule::Rook).expect("grid builds");
        assert_eq!(graph.edge_count(), 4);
        let weights =
            WeightsMatrix::from_graph(graph, WeightStyle::RowStandardized, ZeroPolicy::Error)
                .expect("builds");
        let result = global_moran(&[10.0, 0.0, 10.0, 0.0], &weights, &MoranOptions::default())
            .expect("computes");
        assert!(result.statistic < 0.0);
        assert!((result.statistic + 1.0).abs() < 1e-12, "I = {}", result.statistic);
        assert!((result.expectation + 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn constant_attribute_is_zero_and_flagged() {
        let weights = grid_weights(3, 3, ContiguityRule::Queen, WeightStyle::Binary);
        let result =
            global_moran(&[0.1; 9], &weights, &MoranOptions::default()).expect("not an error");
        assert!(result.statistic.abs() < f64::EPSILON);
        assert!(result.variance.abs() < f64::EPSILON);
        assert!(result.z_score.is_none());
        assert!(result.p_value.is_none());
        assert!(result.degenerate);
        assert_eq!(
            result.require_non_degenerate().err(),
            Some(MoranError::DegenerateAttribute)
        );
    }

    #[test]
    fn normality_variance_matches_closed_form() {
        // Binary 4-cycle: S0 = 8, S1 = 16, S2 = 64, n = 4.
        let weights = grid_weights(2, 2, ContiguityRule::Rook, WeightStyle::Binary);
        let result = global_moran(
            &[1.0, 2.0, 4.0, 3.0],
            &weights,
            &options(NullModel::Normality),
        )
        .expect("computes");
        let expected = (16.0 * 16.0 - 4.0 * 64.0 + 3.0 * 64.0) / (64.0 * 15.0) - 1.0 / 9.0;
        assert!((result.variance - expected).abs() < 1e-12);
    }

    #[test]
    fn binary_and_row_standardized_agree_on_regular_lattice_torus() {
        // Every unit of a cycle has two neighbors, so the styles differ by
        // a constant factor that cancels in I.
        let graph = AdjacencyGraph::from_edges(
            6,
            &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0)],
        )
        .expect("cycle");
        let binary =
            WeightsMatrix::from_graph(graph.clone(), WeightStyle::Binary, ZeroPolicy::Error)
                .expect("builds");
        let standardized =
            WeightsMatrix::from_graph(graph, WeightStyle::RowStandardized, ZeroPolicy::Error)
                .expect("builds");
        let x = [3.0, 1.0, 4.0, 1.0, 5.0, 9.0];
        let a = global_moran(&x, &binary, &MoranOptions::default()).expect("computes");
        let b = global_moran(&x, &standardized, &MoranOptions::default()).expect("computes");
        assert!((a.statistic - b.statistic).abs() < 1e-12);
        assert!((a.variance - b.variance).abs() < 1e-12);
    }

    #[test]
    fn permutation_test_is_reproducible() {
        let (cols, rows) = (5, 5);
        let weights = grid_weights(cols, rows, ContiguityRule::Queen, WeightStyle::RowStandardized);
        let x: Vec<f64> = (0..rows)
            .flat_map(|r| (0..cols).map(move |c| f64::from(r * c)))
            .collect();
        let opts = MoranOptions {
            null_model: NullModel::Permutation,
            permutations: 199,
            seed: 7,
        };

        let first = global_moran(&x, &weights, &opts).expect("computes");
        let second = global_moran(&x, &weights, &opts).expect("computes");
        assert_eq!(first, second);
        assert_eq!(first.permutations, Some(199));
        assert!(first.p_value.is_some_and(|p| p > 0.0 && p <= 1.0));
        assert!(first.p_value.is_some_and(|p| p < 0.05), "{first:?}");
    }

    #[test]
    fn rejects_bad_inputs() {
        let weights = grid_weights(2, 2, ContiguityRule::Rook, WeightStyle::Binary);
        assert_eq!(
            global_moran(&[1.0, 2.0], &weights, &MoranOptions::default()).err(),
            Some(MoranError::LengthMismatch {
                expected: 4,
                actual: 2
            })
        );
        assert_eq!(
            global_moran(&[1.0, f64::NAN, 0.0, 0.0], &weights, &MoranOptions::default()).err(),
            Some(MoranError::NonFinite { position: 1 })
        );

        let empty = AdjacencyGraph::from_edges(4, &[]).expect("valid");
        let zero =
            WeightsMatrix::from_graph(empty, WeightStyle::Binary, ZeroPolicy::ZeroRow).expect("ok");
        assert_eq!(
            global_moran(&[1.0, 2.0, 3.0, 4.0], &zero, &MoranOptions::default()).err(),
            Some(MoranError::NoWeights)
        );
    }

    #[test]
    fn randomization_needs_four_units() {
        let graph = AdjacencyGraph::from_edges(3, &[(0, 1), (1, 2)]).expect("path");
        let weights =
            WeightsMatrix::from_graph(graph, WeightStyle::Binary, ZeroPolicy::Error).expect("ok");
        assert!(matches!(
            global_moran(&[1.0, 2.0, 3.0], &weights, &MoranOptions::default()),
            Err(MoranError::TooFewUnits { required: 4, .. })
        ));
        assert!(
            global_moran(&[1.0, 2.0, 3.0], &weights, &options(NullModel::Normality)).is_ok()
        );
    }
}
