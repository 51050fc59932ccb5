//! Sparse spatial weights derived from an adjacency graph.

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::{AdjacencyGraph, SpatialError};

/// How adjacency is turned into weights.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WeightStyle {
    /// `1` for each neighbor.
    Binary,
    /// `1 / cardinality` for each neighbor, so rows sum to one.
    #[default]
    RowStandardized,
}

/// What to do with units that have no neighbors.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ZeroPolicy {
    /// Refuse to build weights when any unit is isolated.
    #[default]
    Error,
    /// Give isolates an all-zero row; they contribute no weight anywhere.
    ZeroRow,
}

/// An `N x N` non-negative sparse weights matrix.
///
/// Owns the graph it was derived from, so the two can only be replaced
/// together. Row-standardized matrices are not symmetric.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightsMatrix {
    style: WeightStyle,
    zero_policy: ZeroPolicy,
    graph: AdjacencyGraph,
    rows: Vec<Vec<(usize, f64)>>,
    cardinalities: Vec<usize>,
}

impl WeightsMatrix {
    /// Normalizes `graph` into weights.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IsolatedUnit`] for the first isolate when
    /// `zero_policy` is [`ZeroPolicy::Error`].
    #[allow(clippy::cast_precision_loss)]
    pub fn from_graph(
        graph: AdjacencyGraph,
        style: WeightStyle,
        zero_policy: ZeroPolicy,
    ) -> Result<Self, SpatialError> {
        let isolates = graph.isolates();
        if let Some(&index) = isolates.first() {
            match zero_policy {
                ZeroPolicy::Error => return Err(SpatialError::IsolatedUnit { index }),
                ZeroPolicy::ZeroRow => log::warn!(
                    "{} isolated units receive zero weight rows (first: {index})",
                    isolates.len()
                ),
            }
        }

        let cardinalities: Vec<usize> = (0..graph.len()).map(|i| graph.cardinality(i)).collect();
        let rows = (0..graph.len())
            .map(|i| {
                let weight = match style {
                    WeightStyle::Binary => 1.0,
                    WeightStyle::RowStandardized if cardinalities[i] > 0 => {
                        1.0 / cardinalities[i] as f64
                    }
                    WeightStyle::RowStandardized => 0.0,
                };
                graph
                    .neighbor_positions(i)
                    .iter()
                    .map(|&j| (j, weight))
                    .collect()
            })
            .collect();

        Ok(Self {
            style,
            zero_policy,
            graph,
            rows,
            cardinalities,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub const fn style(&self) -> WeightStyle {
        self.style
    }

    #[must_use]
    pub const fn zero_policy(&self) -> ZeroPolicy {
        self.zero_policy
    }

    /// The adjacency graph these weights were built from.
    #[must_use]
    pub const fn graph(&self) -> &AdjacencyGraph {
        &self.graph
    }

    /// Non-zero entries of row `i` as `(column, weight)`.
    #[must_use]
    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        self.rows.get(i).map_or(&[], Vec::as_slice)
    }

    /// `w[i][j]`, zero when the units are not neighbors.
    #[must_use]
    pub fn weight(&self, i: usize, j: usize) -> f64 {
        let row = self.row(i);
        row.binary_search_by_key(&j, |&(col, _)| col)
            .map_or(0.0, |k| row[k].1)
    }

    /// Stored neighbor count per row.
    #[must_use]
    pub fn cardinalities(&self) -> &[usize] {
        &self.cardinalities
    }

    #[must_use]
    pub fn row_sum(&self, i: usize) -> f64 {
        self.row(i).iter().map(|(_, w)| w).sum()
    }

    fn column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.len()];
        for row in &self.rows {
            for &(j, w) in row {
                sums[j] += w;
            }
        }
        sums
    }

    /// `S0 = Σᵢⱼ wᵢⱼ`.
    #[must_use]
    pub fn s0(&self) -> f64 {
        self.rows.iter().flatten().map(|(_, w)| w).sum()
    }

    /// `S1 = ½ Σᵢⱼ (wᵢⱼ + wⱼᵢ)²`.
    #[must_use]
    pub fn s1(&self) -> f64 {
        let doubled: f64 = self
            .rows
            .iter()
            .enumerate()
            .flat_map(|(i, row)| row.iter().map(move |&(j, w)| (i, j, w)))
            .map(|(i, j, w)| (w + self.weight(j, i)).powi(2))
            .sum();
        0.5 * doubled
    }

    /// `S2 = Σᵢ (wᵢ. + w.ᵢ)²`.
    #[must_use]
    pub fn s2(&self) -> f64 {
        self.column_sums()
            .iter()
            .enumerate()
            .map(|(i, col)| (self.row_sum(i) + col).powi(2))
            .sum()
    }

    /// Spatial lag `W x`.
    ///
    /// # Panics
    ///
    /// Panics if `x` is shorter than the matrix dimension.
    #[must_use]
    pub fn lag(&self, x: &[f64]) -> Vec<f64> {
        assert!(x.len() >= self.len(), "attribute shorter than weights");
        self.rows
            .iter()
            .map(|row| row.iter().map(|&(j, w)| w * x[j]).sum())
            .collect()
    }
}
