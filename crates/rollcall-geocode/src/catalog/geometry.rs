//! Geometry payloads returned by remote feature services.

use serde::Deserialize;

/// Either an Esri JSON geometry or a GeoJSON one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Geometry {
    Point { x: f64, y: f64 },
    Rings { rings: Vec<Vec<Vec<f64>>> },
    GeoJson(GeoJsonGeometry),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum GeoJsonGeometry {
    Point { coordinates: Vec<f64> },
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
}

impl Geometry {
    /// `(lon, lat)` of a point, or the vertex average of the first ring of
    /// the first polygon.
    pub fn representative_point(&self) -> Option<(f64, f64)> {
        match self {
            Geometry::Point { x, y } => Some((*x, *y)),
            Geometry::Rings { rings } => ring_centroid(rings.first()?),
            Geometry::GeoJson(GeoJsonGeometry::Point { coordinates }) => xy(coordinates),
            Geometry::GeoJson(GeoJsonGeometry::Polygon { coordinates }) => {
                ring_centroid(coordinates.first()?)
            }
            Geometry::GeoJson(GeoJsonGeometry::MultiPolygon { coordinates }) => {
                ring_centroid(coordinates.first()?.first()?)
            }
        }
    }

    pub fn is_point(&self) -> bool {
        matches!(
            self,
            Geometry::Point { .. } | Geometry::GeoJson(GeoJsonGeometry::Point { .. })
        )
    }
}

fn xy(position: &[f64]) -> Option<(f64, f64)> {
    match position {
        [x, y, ..] if x.is_finite() && y.is_finite() => Some((*x, *y)),
        _ => None,
    }
}

/// Mean of a ring's vertices. A closing vertex that repeats the first one is
/// counted once.
pub fn ring_centroid(ring: &[Vec<f64>]) -> Option<(f64, f64)> {
    let mut points: Vec<(f64, f64)> = ring.iter().filter_map(|p| xy(p)).collect();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.is_empty() {
        return None;
    }

    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    Some((sx / n, sy / n))
}
