//! Point-in-polygon aggregation of events into areal units.
//!
//! Units are indexed in an R-tree by envelope; each event is tested only
//! against the units whose envelope contains it. Containment is strict, so
//! events on a shared boundary or outside every unit are dropped rather
//! than assigned.

use std::collections::{BTreeMap, BTreeSet};

use crime_risk_areal_models::{
    AreaRecord, AreaTable, ArealUnit, EventPoint, ReferenceFrame, UnitIndex,
};
use geo::{Contains, MultiPolygon};
use rstar::{AABB, RTree, RTreeObject};
use serde::{Deserialize, Serialize};

use crate::{SpatialError, compute_envelope, has_area};

/// An areal unit's envelope stored in the R-tree with its position.
struct UnitEntry {
    position: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for UnitEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Event bookkeeping for one aggregation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSummary {
    /// Events handed in.
    pub events_total: usize,
    /// Events strictly inside some unit.
    pub events_matched: usize,
    /// Events outside every unit, on a boundary, or with non-finite
    /// coordinates.
    pub events_dropped: usize,
}

/// Output of [`aggregate`]: the attribute table plus the unit geometries in
/// the same dense index order, ready for the contiguity builder.
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Counts and exposures keyed by dense index.
    pub table: AreaTable,
    /// Unit polygons, `geometries[index.position()]`.
    pub geometries: Vec<MultiPolygon<f64>>,
    /// Shared reference frame of units and events.
    pub frame: Option<ReferenceFrame>,
    /// Matched/dropped event counts.
    pub summary: AggregationSummary,
}

/// Substitutes zero for every unit without matched events.
///
/// This is the only place a default is filled in; exposure is never
/// touched.
#[must_use]
pub fn zero_fill_counts(matched: &BTreeMap<usize, u64>, len: usize) -> Vec<u64> {
    (0..len)
        .map(|position| matched.get(&position).copied().unwrap_or(0))
        .collect()
}

/// Joins events to areal units and builds the per-unit attribute table.
///
/// Dense indices are assigned in input order (`units[k]` gets index
/// `k + 1`). When polygons overlap, an event goes to the containing unit
/// with the lowest index.
///
/// # Errors
///
/// * [`SpatialError::FrameMismatch`] if any unit or event declares a frame
///   different from the first unit's.
/// * [`SpatialError::DuplicateUnitId`] if two units share an identifier.
/// * [`SpatialError::EmptyGeometry`] if a unit has no polygon with area.
pub fn aggregate(units: &[ArealUnit], events: &[EventPoint]) -> Result<Aggregation, SpatialError> {
    let frame = units.first().map(|u| u.frame.clone());

    if let Some(frame) = &frame {
        check_frames(units, events, frame)?;
    } else if !events.is_empty() {
        log::warn!(
            "No areal units supplied; all {} events will be dropped",
            events.len()
        );
    }

    let mut seen_ids = BTreeSet::new();
    let mut entries = Vec::with_capacity(units.len());

    for (position, unit) in units.iter().enumerate() {
        if !seen_ids.insert(unit.id.as_str()) {
            return Err(SpatialError::DuplicateUnitId {
                id: unit.id.clone(),
            });
        }

        let envelope = compute_envelope(&unit.geometry).filter(|_| has_area(&unit.geometry));
        let Some(envelope) = envelope else {
            log::warn!("Areal unit '{}' has an empty polygon", unit.id);
            return Err(SpatialError::EmptyGeometry {
                index: UnitIndex::from_position(position),
            });
        };

        entries.push(UnitEntry { position, envelope });
    }

    let tree = RTree::bulk_load(entries);
    let mut matched: BTreeMap<usize, u64> = BTreeMap::new();
    let mut events_matched = 0;

    for event in events {
        if let Some(position) = locate(&tree, units, event) {
            *matched.entry(position).or_default() += 1;
            events_matched += 1;
        }
    }

    let events_dropped = events.len() - events_matched;
    if events_dropped > 0 {
        log::warn!(
            "Dropped {events_dropped} of {} events outside or on the boundary of every unit",
            events.len()
        );
    }

    let counts = zero_fill_counts(&matched, units.len());
    let records = units
        .iter()
        .zip(counts)
        .enumerate()
        .map(|(position, (unit, count))| AreaRecord {
            index: UnitIndex::from_position(position),
            id: unit.id.clone(),
            count,
            exposure: unit.exposure,
        })
        .collect();
    let table = AreaTable::new(records)?;

    log::info!(
        "Aggregated {events_matched} events into {} areal units ({} with missing exposure)",
        table.len(),
        table.missing_exposure_ids().len()
    );

    Ok(Aggregation {
        table,
        geometries: units.iter().map(|u| u.geometry.clone()).collect(),
        frame,
        summary: AggregationSummary {
            events_total: events.len(),
            events_matched,
            events_dropped,
        },
    })
}

fn check_frames(
    units: &[ArealUnit],
    events: &[EventPoint],
    frame: &ReferenceFrame,
) -> Result<(), SpatialError> {
    if let Some(unit) = units.iter().find(|u| &u.frame != frame) {
        return Err(SpatialError::FrameMismatch {
            context: format!("unit '{}'", unit.id),
            expected: frame.clone(),
            found: unit.frame.clone(),
        });
    }

    if let Some((n, event)) = events.iter().enumerate().find(|(_, e)| &e.frame != frame) {
        return Err(SpatialError::FrameMismatch {
            context: format!("event {n}"),
            expected: frame.clone(),
            found: event.frame.clone(),
        });
    }

    Ok(())
}

/// Position of the lowest-indexed unit strictly containing the event.
fn locate(tree: &RTree<UnitEntry>, units: &[ArealUnit], event: &EventPoint) -> Option<usize> {
    if !event.x.is_finite() || !event.y.is_finite() {
        return None;
    }

    let point = geo::Point::new(event.x, event.y);
    let query_env = AABB::from_point([event.x, event.y]);

    tree.locate_in_envelope_intersecting(&query_env)
        .filter(|entry| units[entry.position].geometry.contains(&point))
        .map(|entry| entry.position)
        .min()
}

#[cfg(test)]
mod tests {
    use crate::fixtures::{grid, unit_square};

    use super::*;

    fn frame() -> ReferenceFrame {
        ReferenceFrame::new("EPSG:32618")
    }

    fn units(exposures: &[Option<f64>]) -> Vec<ArealUnit> {
        grid(2, 2)
            .into_iter()
            .zip(exposures)
            .enumerate()
            .map(|(n, (geometry, exposure))| ArealUnit {
                id: format!("Z{n}"),
                geometry,
                frame: frame(),
                exposure: *exposure,
            })
            .collect()
    }

    fn event(x: f64, y: f64) -> EventPoint {
        EventPoint::new(x, y, frame())
    }

    #[test]
    fn counts_events_strictly_inside() {
        let units = units(&[Some(0.1), Some(0.2), Some(0.3), Some(0.4)]);
        let events = vec![
            event(0.5, 0.5),
            event(0.25, 0.75),
            event(1.5, 1.5),
            // Shared edge between the two bottom squares: dropped.
            event(1.0, 0.5),
            // Outside the grid: dropped.
            event(5.0, 5.0),
        ];

        let aggregation = aggregate(&units, &events).expect("aggregates");
        let counts: Vec<u64> = aggregation.table.records().iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![2, 0, 0, 1]);
        assert_eq!(
            aggregation.summary,
            AggregationSummary {
                events_total: 5,
                events_matched: 3,
                events_dropped: 2,
            }
        );
    }

    #[test]
    fn units_without_events_get_zero_not_missing() {
        let aggregation = aggregate(&units(&[Some(1.0); 4]), &[]).expect("aggregates");
        assert!(aggregation.table.records().iter().all(|r| r.count == 0));
    }

    #[test]
    fn missing_exposure_is_preserved() {
        let aggregation =
            aggregate(&units(&[Some(1.0), None, Some(3.0), None]), &[event(0.5, 0.5)])
                .expect("aggregates");
        assert_eq!(
            aggregation.table.exposures(),
            vec![Some(1.0), None, Some(3.0), None]
        );
        assert_eq!(aggregation.table.missing_exposure_ids(), vec!["Z1", "Z3"]);
    }

    #[test]
    fn indices_follow_input_order() {
        let aggregation = aggregate(&units(&[None; 4]), &[]).expect("aggregates");
        for (position, record) in aggregation.table.records().iter().enumerate() {
            assert_eq!(record.index, UnitIndex::from_position(position));
            assert_eq!(record.id, format!("Z{position}"));
        }
        assert_eq!(aggregation.geometries.len(), 4);
    }

    #[test]
    fn mismatched_event_frame_fails_fast() {
        let events = vec![EventPoint::new(0.5, 0.5, ReferenceFrame::new("EPSG:4326"))];
        let err = aggregate(&units(&[None; 4]), &events).err();
        assert!(
            matches!(err, Some(SpatialError::FrameMismatch { ref context, .. }) if context == "event 0"),
            "unexpected result: {err:?}"
        );
    }

    #[test]
    fn mismatched_unit_frame_fails_fast() {
        let mut units = units(&[None; 4]);
        units[2].frame = ReferenceFrame::new("EPSG:4326");
        assert!(matches!(
            aggregate(&units, &[]),
            Err(SpatialError::FrameMismatch { .. })
        ));
    }

    #[test]
    fn duplicate_identifier_rejected() {
        let mut units = units(&[None; 4]);
        units[3].id = "Z0".to_string();
        assert!(matches!(
            aggregate(&units, &[]),
            Err(SpatialError::DuplicateUnitId { ref id }) if id == "Z0"
        ));
    }

    #[test]
    fn empty_polygon_rejected() {
        let mut units = units(&[None; 4]);
        units[1].geometry = MultiPolygon(vec![]);
        assert!(matches!(
            aggregate(&units, &[]),
            Err(SpatialError::EmptyGeometry { index }) if index == UnitIndex::from_position(1)
        ));
    }

    #[test]
    fn overlapping_units_assign_lowest_index() {
        let units = vec![
            ArealUnit {
                id: "a".to_string(),
                geometry: unit_square(0, 0),
                frame: frame(),
                exposure: None,
            },
            ArealUnit {
                id: "b".to_string(),
                geometry: unit_square(0, 0),
                frame: frame(),
                exposure: None,
            },
        ];
        let aggregation = aggregate(&units, &[event(0.5, 0.5)]).expect("aggregates");
        let counts: Vec<u64> = aggregation.table.records().iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[test]
    fn zero_fill_only_fills_gaps() {
        let matched = BTreeMap::from([(1, 4), (3, 2)]);
        assert_eq!(zero_fill_counts(&matched, 4), vec![0, 4, 0, 2]);
    }
}
