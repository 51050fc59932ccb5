//! Local Moran's I (LISA).
//!
//! `Iᵢ = (N − 1) · zᵢ / Σz² · Σⱼ wᵢⱼ zⱼ`. Summed over units and multiplied
//! by `N / (S0 · (N − 1))`, the local values give back global Moran's I.

use crime_risk_areal_models::{ClusterCategory, UnitIndex};
use crime_risk_numeric::two_sided_p_value;
use crime_risk_spatial::WeightsMatrix;
use serde::{Deserialize, Serialize};

use crate::{Centered, MoranError, MoranResult};

/// Local statistic for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMoranValue {
    /// Unit the value belongs to.
    pub index: UnitIndex,
    /// `Iᵢ`.
    pub statistic: f64,
    /// Deviation from the mean, `zᵢ`.
    pub deviation: f64,
    /// Spatial lag of the deviations, `Σⱼ wᵢⱼ zⱼ`.
    pub lag: f64,
    /// `E[Iᵢ]` under randomization.
    pub expectation: f64,
    /// `Var[Iᵢ]` under randomization.
    pub variance: f64,
    /// Standardized statistic, when the variance is positive.
    pub z_score: Option<f64>,
    /// Two-sided normal p-value, when a z-score exists.
    pub p_value: Option<f64>,
    /// Quadrant from the signs of `deviation` and `lag`.
    pub category: ClusterCategory,
}

impl LocalMoranValue {
    /// The quadrant if the unit is significant at `alpha`, otherwise
    /// [`ClusterCategory::Unclassified`].
    #[must_use]
    pub fn significant_category(&self, alpha: f64) -> ClusterCategory {
        match self.p_value {
            Some(p) if p <= alpha => self.category,
            _ => ClusterCategory::Unclassified,
        }
    }
}

/// Outcome of checking local values against the global statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// `N / (S0 · (N − 1)) · ΣIᵢ`.
    pub rescaled_sum: f64,
    /// Global statistic compared against.
    pub global: f64,
    /// Absolute difference.
    pub difference: f64,
    /// Whether the difference is within tolerance.
    pub consistent: bool,
}

/// Local statistics for every unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMoranSet {
    /// One value per unit, in index order.
    pub values: Vec<LocalMoranValue>,
    /// `S0` of the weights used.
    pub s0: f64,
    /// Whether the attribute was constant (all values zero).
    pub degenerate: bool,
}

impl LocalMoranSet {
    /// The factor that turns `ΣIᵢ` into global Moran's I.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rescaling_constant(&self) -> f64 {
        let n = self.values.len() as f64;
        n / (self.s0 * (n - 1.0))
    }

    /// `N / (S0 · (N − 1)) · ΣIᵢ`.
    #[must_use]
    pub fn rescaled_sum(&self) -> f64 {
        self.rescaling_constant() * self.values.iter().map(|v| v.statistic).sum::<f64>()
    }

    /// Compares the rescaled local sum with a global result computed on the
    /// same attribute and weights.
    #[must_use]
    pub fn reconcile(&self, global: &MoranResult, tolerance: f64) -> Reconciliation {
        let rescaled_sum = self.rescaled_sum();
        let difference = (rescaled_sum - global.statistic).abs();
        let consistent = difference <= tolerance * (1.0 + global.statistic.abs());
        if !consistent {
            log::warn!(
                "Local Moran sum {rescaled_sum:.6} does not reconcile with global I {:.6}",
                global.statistic
            );
        }
        Reconciliation {
            rescaled_sum,
            global: global.statistic,
            difference,
            consistent,
        }
    }
}

/// Computes local Moran's I for every unit.
///
/// # Errors
///
/// * [`MoranError::LengthMismatch`] / [`MoranError::NonFinite`] for bad input.
/// * [`MoranError::NoWeights`] when every weight is zero.
#[allow(clippy::cast_precision_loss)]
pub fn local_moran(x: &[f64], weights: &WeightsMatrix) -> Result<LocalMoranSet, MoranError> {
    let centered = Centered::new(x, weights.len())?;
    let s0 = weights.s0();
    if s0 <= 0.0 {
        return Err(MoranError::NoWeights);
    }

    let n = x.len() as f64;
    let lag = weights.lag(&centered.deviations);

    if centered.degenerate {
        log::warn!("Local Moran's I requested for a constant attribute");
    }

    // Moments for the randomization variance (Anselin 1995), expressed for
    // the `m2 = Σz² / N` scaling and rescaled by `(N − 1) / N` below.
    let m2 = centered.sum_sq / n;
    let b2 = if centered.degenerate {
        0.0
    } else {
        (centered.sum_quad / n) / (m2 * m2)
    };
    let scale = (n - 1.0) / n;

    let values = centered
        .deviations
        .iter()
        .zip(&lag)
        .enumerate()
        .map(|(i, (&z, &l))| {
            let statistic = if centered.degenerate {
                0.0
            } else {
                (n - 1.0) * z / centered.sum_sq * l
            };

            let row_sum = weights.row_sum(i);
            let row_sq: f64 = weights.row(i).iter().map(|(_, w)| w * w).sum();
            let cross = row_sum.mul_add(row_sum, -row_sq);

            let base_expectation = -row_sum / (n - 1.0);
            let base_second = if n > 2.0 {
                row_sq * (n - b2) / (n - 1.0)
                    + cross * 2.0f64.mul_add(b2, -n) / ((n - 1.0) * (n - 2.0))
            } else {
                f64::NAN
            };
            let expectation = scale * base_expectation;
            let variance = scale * scale * base_expectation.mul_add(-base_expectation, base_second);

            let z_score = (!centered.degenerate && variance.is_finite() && variance > 0.0)
                .then(|| (statistic - expectation) / variance.sqrt());

            LocalMoranValue {
                index: UnitIndex::from_position(i),
                statistic,
                deviation: z,
                lag: l,
                expectation,
                variance,
                z_score,
                p_value: z_score.map(two_sided_p_value),
                category: if centered.degenerate {
                    ClusterCategory::Unclassified
                } else {
                    ClusterCategory::from_signs(z, l)
                },
            }
        })
        .collect();

    Ok(LocalMoranSet {
        values,
        s0,
        degenerate: centered.degenerate,
    })
}
