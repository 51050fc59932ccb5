//! Model input assembled from the attribute table.

use crime_risk_areal_models::{AreaTable, UnitIndex};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::RegressionError;

/// Coefficient names in design-matrix column order.
pub const COEFFICIENT_NAMES: [&str; 2] = ["(intercept)", "exposure"];

/// Treatment of units whose exposure is missing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MissingExposurePolicy {
    /// Drop the unit from the model (and its edges from the graph).
    #[default]
    Exclude,
    /// Refuse to fit.
    Error,
    /// Substitute the mean of the observed exposures.
    ImputeMean,
}

/// Outcome and exposure for the units entering a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelData {
    indices: Vec<UnitIndex>,
    outcome: Vec<f64>,
    exposure: Vec<f64>,
    excluded: Vec<UnitIndex>,
    imputed: Vec<UnitIndex>,
}

impl ModelData {
    /// Extracts model input from the table.
    ///
    /// # Errors
    ///
    /// * [`RegressionError::MissingExposure`] under
    ///   [`MissingExposurePolicy::Error`], or under
    ///   [`MissingExposurePolicy::ImputeMean`] when no exposure is observed.
    /// * [`RegressionError::NoObservations`] when nothing is left.
    #[allow(clippy::cast_precision_loss)]
    pub fn from_table(
        table: &AreaTable,
        policy: MissingExposurePolicy,
    ) -> Result<Self, RegressionError> {
        let observed: Vec<f64> = table.records().iter().filter_map(|r| r.exposure).collect();
        let first_missing = table.records().iter().find(|r| r.exposure.is_none());

        let fill = match (policy, first_missing) {
            (_, None) | (MissingExposurePolicy::Exclude, _) => None,
            (MissingExposurePolicy::ImputeMean, Some(_)) if !observed.is_empty() => {
                Some(observed.iter().sum::<f64>() / observed.len() as f64)
            }
            (MissingExposurePolicy::Error | MissingExposurePolicy::ImputeMean, Some(record)) => {
                return Err(RegressionError::MissingExposure {
                    index: record.index,
                    id: record.id.clone(),
                });
            }
        };

        let mut data = Self {
            indices: Vec::with_capacity(table.len()),
            outcome: Vec::with_capacity(table.len()),
            exposure: Vec::with_capacity(table.len()),
            excluded: Vec::new(),
            imputed: Vec::new(),
        };

        for record in table.records() {
            let exposure = match (record.exposure, fill) {
                (Some(value), _) => value,
                (None, Some(mean)) => {
                    data.imputed.push(record.index);
                    mean
                }
                (None, None) => {
                    data.excluded.push(record.index);
                    continue;
                }
            };
            data.indices.push(record.index);
            data.outcome.push(record.count as f64);
            data.exposure.push(exposure);
        }

        if !data.excluded.is_empty() {
            log::warn!(
                "Excluding {} units with missing exposure from the models",
                data.excluded.len()
            );
        }
        if !data.imputed.is_empty() {
            log::warn!(
                "Imputed mean exposure for {} units",
                data.imputed.len()
            );
        }
        if data.indices.is_empty() {
            return Err(RegressionError::NoObservations);
        }

        Ok(data)
    }

    /// Builds model input directly, indexing units `1..=N`.
    ///
    /// # Errors
    ///
    /// * [`RegressionError::LengthMismatch`] if the slices differ in length.
    /// * [`RegressionError::NoObservations`] if they are empty.
    pub fn from_parts(outcome: Vec<f64>, exposure: Vec<f64>) -> Result<Self, RegressionError> {
        if outcome.len() != exposure.len() {
            return Err(RegressionError::LengthMismatch {
                outcome: outcome.len(),
                exposure: exposure.len(),
            });
        }
        if outcome.is_empty() {
            return Err(RegressionError::NoObservations);
        }
        Ok(Self {
            indices: (0..outcome.len()).map(UnitIndex::from_position).collect(),
            outcome,
            exposure,
            excluded: Vec::new(),
            imputed: Vec::new(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dense indices of the units in the model, ascending.
    #[must_use]
    pub fn indices(&self) -> &[UnitIndex] {
        &self.indices
    }

    /// 0-based positions of the modelled units in the full table.
    #[must_use]
    pub fn positions(&self) -> Vec<usize> {
        self.indices.iter().map(|i| i.position()).collect()
    }

    #[must_use]
    pub fn outcome(&self) -> &[f64] {
        &self.outcome
    }

    #[must_use]
    pub fn exposure(&self) -> &[f64] {
        &self.exposure
    }

    /// Units dropped for missing exposure.
    #[must_use]
    pub fn excluded(&self) -> &[UnitIndex] {
        &self.excluded
    }

    /// Units whose exposure was imputed.
    #[must_use]
    pub fn imputed(&self) -> &[UnitIndex] {
        &self.imputed
    }

    /// `[1, exposure]` per row.
    pub(crate) fn design(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.len(), COEFFICIENT_NAMES.len(), |i, j| {
            if j == 0 { 1.0 } else { self.exposure[i] }
        })
    }

    /// Fails when the coefficients cannot be identified from this data.
    pub(crate) fn check_identifiable(&self) -> Result<(), RegressionError> {
        let parameters = COEFFICIENT_NAMES.len();
        if self.len() <= parameters {
            return Err(RegressionError::TooFewObservations {
                n: self.len(),
                parameters,
            });
        }
        if let Some(position) = self.exposure.iter().position(|e| !e.is_finite()) {
            return Err(RegressionError::NonFiniteExposure {
                index: self.indices[position],
            });
        }
        let first = self.exposure[0];
        let scale = first.abs().max(1.0);
        if self
            .exposure
            .iter()
            .all(|e| (e - first).abs() <= 1e-12 * scale)
        {
            return Err(RegressionError::ConstantCovariate {
                name: COEFFICIENT_NAMES[1],
            });
        }
        Ok(())
    }
}
