#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Areal aggregation and neighbor structures.
//!
//! Joins incident points to the polygons that strictly contain them using
//! an R-tree over polygon envelopes, derives queen or rook contiguity from
//! shared boundaries, and normalizes the resulting graph into a sparse
//! spatial weights matrix.

pub mod aggregate;
pub mod contiguity;
pub mod weights;

use crime_risk_areal_models::{ErrorCategory, IndexError, ReferenceFrame, UnitIndex};
use geo::{Area, BoundingRect, MultiPolygon};
use rstar::AABB;
use thiserror::Error;

pub use aggregate::{Aggregation, AggregationSummary, aggregate, zero_fill_counts};
pub use contiguity::{AdjacencyGraph, ContiguityRule, build_contiguity};
pub use weights::{WeightStyle, WeightsMatrix, ZeroPolicy};

/// Errors that can occur while aggregating events or building neighbor
/// structures.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// Two inputs declare different reference frames.
    #[error("Reference frame mismatch for {context}: expected {expected}, found {found}")]
    FrameMismatch {
        /// Which input disagreed (e.g. "unit 90210" or "event 17").
        context: String,
        /// Frame of the areal units.
        expected: ReferenceFrame,
        /// Frame that was found instead.
        found: ReferenceFrame,
    },

    /// Two areal units share an identifier.
    #[error("Duplicate areal unit identifier '{id}'")]
    DuplicateUnitId {
        /// The repeated identifier.
        id: String,
    },

    /// Dense indices are not a bijection.
    #[error("Invalid unit indices: {0}")]
    Index(#[from] IndexError),

    /// A unit has no polygon, or only rings without area.
    #[error("Areal unit {index} has an empty or invalid polygon")]
    EmptyGeometry {
        /// The unit concerned.
        index: UnitIndex,
    },

    /// A unit has no neighbors and the zero policy forbids isolates.
    #[error("Areal unit {index} has no neighbors and the zero policy is 'error'")]
    IsolatedUnit {
        /// The isolated unit.
        index: UnitIndex,
    },

    /// An explicit neighbor list violates the graph invariants.
    #[error("Invalid neighbor {neighbor} for unit {index}: {reason}")]
    InvalidNeighbor {
        /// Unit whose list is invalid.
        index: UnitIndex,
        /// The offending neighbor.
        neighbor: UnitIndex,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl SpatialError {
    /// Error category for reporting.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::FrameMismatch { .. }
            | Self::DuplicateUnitId { .. }
            | Self::Index(_)
            | Self::InvalidNeighbor { .. } => ErrorCategory::InputInconsistency,
            Self::EmptyGeometry { .. } | Self::IsolatedUnit { .. } => {
                ErrorCategory::GeometryDegeneracy
            }
        }
    }
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
///
/// Returns `None` for geometries without any coordinates.
pub(crate) fn compute_envelope(mp: &MultiPolygon<f64>) -> Option<AABB<[f64; 2]>> {
    mp.bounding_rect()
        .map(|rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]))
}

/// Whether a geometry has at least one polygon with positive area.
pub(crate) fn has_area(mp: &MultiPolygon<f64>) -> bool {
    mp.0.iter().any(|polygon| polygon.unsigned_area() > 0.0)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use geo::{MultiPolygon, Rect, coord};

    /// Axis-aligned unit square with its lower-left corner at `(col, row)`.
    pub fn unit_square(col: u32, row: u32) -> MultiPolygon<f64> {
        let x = f64::from(col);
        let y = f64::from(row);
        MultiPolygon(vec![
            Rect::new(coord! { x: x, y: y }, coord! { x: x + 1.0, y: y + 1.0 }).to_polygon(),
        ])
    }

    /// `cols x rows` grid of unit squares, row-major from the bottom-left.
    pub fn grid(cols: u32, rows: u32) -> Vec<MultiPolygon<f64>> {
        (0..rows)
            .flat_map(|row| (0..cols).map(move |col| unit_square(col, row)))
            .collect()
    }
}
