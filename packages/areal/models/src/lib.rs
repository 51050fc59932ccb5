#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Areal unit and event point types shared by the spatial statistics
//! pipeline.
//!
//! Every downstream structure (adjacency graph, weights matrix, random
//! effect vector) is keyed by the dense [`UnitIndex`] assigned once during
//! aggregation, never by the unit identifier or by array position alone.

use std::collections::BTreeSet;

use geo::MultiPolygon;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Dense, 1-based index of an areal unit.
///
/// The set of indices in a table is always exactly `{1, ..., N}`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UnitIndex(usize);

impl UnitIndex {
    /// Creates an index from its 1-based value. Returns `None` for zero.
    #[must_use]
    pub const fn new(value: usize) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Creates the index for a 0-based array position.
    #[must_use]
    pub const fn from_position(position: usize) -> Self {
        Self(position + 1)
    }

    /// The 1-based value.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    /// The 0-based array position this index addresses.
    #[must_use]
    pub const fn position(self) -> usize {
        self.0 - 1
    }
}

impl std::fmt::Display for UnitIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Errors raised when a set of unit indices is not a bijection onto
/// `{1, ..., N}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    /// The same index was assigned to more than one unit.
    #[error("Unit index {index} is assigned more than once")]
    Duplicate {
        /// The repeated index.
        index: UnitIndex,
    },

    /// An index larger than the number of units was assigned, which
    /// necessarily leaves some index in `{1, ..., N}` unassigned.
    #[error("Unit index {index} exceeds the unit count {len}, leaving a gap")]
    Gapped {
        /// The offending index.
        index: UnitIndex,
        /// Number of units in the table.
        len: usize,
    },
}

/// Checks that `indices` is a bijection onto `{1, ..., indices.len()}`.
///
/// # Errors
///
/// Returns [`IndexError`] on the first duplicate or gap-producing index.
pub fn validate_dense_indices(indices: &[UnitIndex]) -> Result<(), IndexError> {
    let len = indices.len();
    let mut seen = BTreeSet::new();

    // N distinct values in 1..=N cover the whole range.
    for &index in indices {
        if index.get() > len {
            return Err(IndexError::Gapped { index, len });
        }
        if !seen.insert(index) {
            return Err(IndexError::Duplicate { index });
        }
    }

    Ok(())
}

/// A declared coordinate reference frame (e.g. `EPSG:4326`).
///
/// Frames are compared after trimming and upper-casing, so `epsg:4326` and
/// `EPSG:4326` name the same frame. No reprojection happens here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceFrame(String);

impl ReferenceFrame {
    /// Creates a normalized frame name.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_uppercase())
    }

    /// The normalized frame name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReferenceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A polygon-bounded unit of analysis as handed over by the ingestion
/// layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ArealUnit {
    /// Unique identifier (e.g. a postal code).
    pub id: String,
    /// Unit boundary, already in `frame`.
    pub geometry: MultiPolygon<f64>,
    /// Reference frame of `geometry`.
    pub frame: ReferenceFrame,
    /// Vulnerability index. `None` is an explicit "missing" marker.
    pub exposure: Option<f64>,
}

/// A geolocated incident.
#[derive(Debug, Clone, PartialEq)]
pub struct EventPoint {
    /// Easting or longitude.
    pub x: f64,
    /// Northing or latitude.
    pub y: f64,
    /// Reference frame of the coordinates.
    pub frame: ReferenceFrame,
}

impl EventPoint {
    #[must_use]
    pub const fn new(x: f64, y: f64, frame: ReferenceFrame) -> Self {
        Self { x, y, frame }
    }
}

/// One row of the aggregated attribute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AreaRecord {
    /// Dense index, the only key used by graph, weights and model.
    pub index: UnitIndex,
    /// Unit identifier.
    pub id: String,
    /// Number of events strictly inside the unit.
    pub count: u64,
    /// Exposure, missingness preserved.
    pub exposure: Option<f64>,
}

/// Attribute table keyed by dense index, with records stored in index
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaTable {
    records: Vec<AreaRecord>,
}

impl AreaTable {
    /// Builds a table, sorting records by index and validating that the
    /// indices are dense.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError`] if the indices are not a bijection onto
    /// `{1, ..., N}`.
    pub fn new(mut records: Vec<AreaRecord>) -> Result<Self, IndexError> {
        let indices: Vec<UnitIndex> = records.iter().map(|r| r.index).collect();
        validate_dense_indices(&indices)?;
        records.sort_by_key(|r| r.index);
        Ok(Self { records })
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in index order.
    #[must_use]
    pub fn records(&self) -> &[AreaRecord] {
        &self.records
    }

    /// Looks up the record for a dense index.
    #[must_use]
    pub fn get(&self, index: UnitIndex) -> Option<&AreaRecord> {
        self.records.get(index.position())
    }

    /// Outcome counts as floats, in index order.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn counts(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.count as f64).collect()
    }

    /// Exposure values in index order.
    #[must_use]
    pub fn exposures(&self) -> Vec<Option<f64>> {
        self.records.iter().map(|r| r.exposure).collect()
    }

    /// Identifiers of units whose exposure is missing.
    #[must_use]
    pub fn missing_exposure_ids(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.exposure.is_none())
            .map(|r| r.id.as_str())
            .collect()
    }
}

/// Classification of errors across the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Inputs contradict each other; fatal.
    InputInconsistency,
    /// Empty/invalid polygons or isolated units.
    GeometryDegeneracy,
    /// Singular systems, zero-variance attributes and similar.
    NumericDegeneracy,
    /// An iterative solve ran out of budget.
    ConvergenceFailure,
}

/// Local cluster/outlier category from the sign of a unit's deviation and
/// the sign of its spatial lag.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClusterCategory {
    /// Above the mean, surrounded by above-mean neighbors.
    HighHigh,
    /// Below the mean, surrounded by below-mean neighbors.
    LowLow,
    /// Above the mean, surrounded by below-mean neighbors.
    HighLow,
    /// Below the mean, surrounded by above-mean neighbors.
    LowHigh,
    /// Zero deviation, zero lag (isolates), or filtered as not significant.
    Unclassified,
}

impl ClusterCategory {
    /// Classifies from a deviation and its spatial lag.
    #[must_use]
    pub fn from_signs(deviation: f64, lag: f64) -> Self {
        if deviation > 0.0 && lag > 0.0 {
            Self::HighHigh
        } else if deviation < 0.0 && lag < 0.0 {
            Self::LowLow
        } else if deviation > 0.0 && lag < 0.0 {
            Self::HighLow
        } else if deviation < 0.0 && lag > 0.0 {
            Self::LowHigh
        } else {
            Self::Unclassified
        }
    }

    /// Whether this is a cluster (HH/LL) rather than an outlier (HL/LH).
    #[must_use]
    pub const fn is_cluster(self) -> bool {
        matches!(self, Self::HighHigh | Self::LowLow)
    }
}
