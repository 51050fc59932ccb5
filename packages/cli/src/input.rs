//! Input adapters: areal units from GeoJSON, events from CSV.

use std::io::Read;
use std::path::Path;

use crime_risk_areal_models::{ArealUnit, EventPoint, ReferenceFrame};
use geo::{Geometry, MultiPolygon};
use geojson::{Feature, GeoJson, feature::Id};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid GeoJSON: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("Expected a FeatureCollection of areal units")]
    NotACollection,

    #[error("Feature {feature} has no 'id' property or feature id")]
    MissingId { feature: usize },

    #[error("Unit '{id}' has no geometry")]
    MissingGeometry { id: String },

    #[error("Unit '{id}' has a {kind} geometry; only Polygon and MultiPolygon are supported")]
    UnsupportedGeometry { id: String, kind: &'static str },

    #[error("Unit '{id}' has a non-numeric exposure")]
    InvalidExposure { id: String },

    #[error("Invalid events CSV: {0}")]
    Csv(#[from] csv::Error),
}

fn read_file(path: &Path) -> Result<String, InputError> {
    std::fs::read_to_string(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn feature_id(feature: &Feature, position: usize) -> Result<String, InputError> {
    match feature.property("id") {
        Some(Value::String(s)) => return Ok(s.clone()),
        Some(Value::Number(n)) => return Ok(n.to_string()),
        _ => {}
    }
    match &feature.id {
        Some(Id::String(s)) => Ok(s.clone()),
        Some(Id::Number(n)) => Ok(n.to_string()),
        None => Err(InputError::MissingId { feature: position }),
    }
}

/// Reads `exposure`; `null` or an absent property is missing.
fn feature_exposure(feature: &Feature, id: &str) -> Result<Option<f64>, InputError> {
    match feature.property("exposure") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| InputError::InvalidExposure { id: id.to_string() }),
        Some(_) => Err(InputError::InvalidExposure { id: id.to_string() }),
    }
}

const fn geometry_kind(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Parses a GeoJSON `FeatureCollection` of areal units.
///
/// Each feature needs an identifier (`id` property, else the feature id)
/// and a Polygon or MultiPolygon geometry. `exposure` may be a number,
/// `null` or absent.
///
/// # Errors
///
/// Returns an [`InputError`] naming the offending feature.
pub fn parse_units(text: &str, frame: &ReferenceFrame) -> Result<Vec<ArealUnit>, InputError> {
    let GeoJson::FeatureCollection(collection) = text.parse::<GeoJson>()? else {
        return Err(InputError::NotACollection);
    };

    collection
        .features
        .into_iter()
        .enumerate()
        .map(|(position, feature)| {
            let id = feature_id(&feature, position)?;
            let exposure = feature_exposure(&feature, &id)?;
            let Some(geometry) = feature.geometry else {
                return Err(InputError::MissingGeometry { id });
            };
            let geometry = match Geometry::<f64>::try_from(geometry)? {
                Geometry::Polygon(polygon) => MultiPolygon(vec![polygon]),
                Geometry::MultiPolygon(multi) => multi,
                other => {
                    return Err(InputError::UnsupportedGeometry {
                        id,
                        kind: geometry_kind(&other),
                    });
                }
            };
            Ok(ArealUnit {
                id,
                geometry,
                frame: frame.clone(),
                exposure,
            })
        })
        .collect()
}

/// Loads areal units from a GeoJSON file.
///
/// # Errors
///
/// See [`parse_units`].
pub fn load_units(path: &Path, frame: &ReferenceFrame) -> Result<Vec<ArealUnit>, InputError> {
    let units = parse_units(&read_file(path)?, frame)?;
    log::info!("Loaded {} areal units from {}", units.len(), path.display());
    Ok(units)
}

#[derive(Debug, Deserialize)]
struct EventRow {
    x: f64,
    y: f64,
}

/// Parses events from CSV with `x` and `y` columns. Other columns are
/// ignored; rows that cannot be parsed are skipped with a warning.
///
/// # Errors
///
/// Returns [`InputError::Csv`] if the header cannot be read.
pub fn parse_events(
    reader: impl Read,
    frame: &ReferenceFrame,
) -> Result<Vec<EventPoint>, InputError> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    csv_reader.headers()?;

    let mut events = Vec::new();
    let mut skipped = 0usize;
    for result in csv_reader.deserialize::<EventRow>() {
        match result {
            Ok(row) => events.push(EventPoint::new(row.x, row.y, frame.clone())),
            Err(e) => {
                log::trace!("  skipping malformed event row: {e}");
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        log::warn!("Skipped {skipped} malformed event rows");
    }
    Ok(events)
}

/// Loads events from a CSV file.
///
/// # Errors
///
/// See [`parse_events`].
pub fn load_events(path: &Path, frame: &ReferenceFrame) -> Result<Vec<EventPoint>, InputError> {
    let file = std::fs::File::open(path).map_err(|source| InputError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let events = parse_events(file, frame)?;
    log::info!("Loaded {} events from {}", events.len(), path.display());
    Ok(events)
}
