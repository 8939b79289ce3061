//! Bazaar Geo - Points, Distances and Grid Cells
//!
//! GeoJSON point parsing, great-circle distance and the fixed-size grid
//! used by geo2d indexes. Coordinates are `[longitude, latitude]` degrees.
//!
//! @version 0.1.0
//! @author Bazaar Development Team

use crate::types::{DocumentId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

// =============================================================================
// Geo Point
// =============================================================================

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lon: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }

    pub fn is_valid(&self) -> bool {
        self.lon.is_finite()
            && self.lat.is_finite()
            && (-180.0..=180.0).contains(&self.lon)
            && (-90.0..=90.0).contains(&self.lat)
    }

    /// Read a point from a GeoJSON `Point` object or a bare `[lon, lat]`
    /// array.
    pub fn from_value(value: &Value) -> Option<Self> {
        let coordinates = match value {
            Value::Object(obj) => {
                if obj.get("type").and_then(Value::as_str) != Some("Point") {
                    return None;
                }
                obj.get("coordinates")?.as_array()?
            }
            Value::Array(arr) => arr,
            _ => return None,
        };

        match coordinates.as_slice() {
            [lon, lat] => {
                let point = Self::new(lon.as_f64()?, lat.as_f64()?);
                point.is_valid().then_some(point)
            }
            _ => None,
        }
    }

    /// GeoJSON representation of this point.
    pub fn to_value(&self) -> Value {
        let mut obj = HashMap::new();
        obj.insert("type".to_string(), Value::from("Point"));
        obj.insert(
            "coordinates".to_string(),
            Value::Array(vec![Value::Float(self.lon), Value::Float(self.lat)]),
        );
        Value::Object(obj)
    }

    /// Great-circle distance in meters.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        haversine_distance(self, other)
    }
}

/// Haversine distance between two points, in meters.
pub fn haversine_distance(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

// =============================================================================
// Grid Index
// =============================================================================

type Cell = (i64, i64);

/// Buckets points into square lat/lon cells of a fixed size.
pub struct GeoGrid {
    cell_degrees: f64,
    cells: HashMap<Cell, BTreeSet<DocumentId>>,
    points: HashMap<DocumentId, GeoPoint>,
}

impl GeoGrid {
    pub fn new(cell_degrees: f64) -> Self {
        Self {
            cell_degrees,
            cells: HashMap::new(),
            points: HashMap::new(),
        }
    }

    fn cell_of(&self, point: &GeoPoint) -> Cell {
        (
            (point.lon / self.cell_degrees).floor() as i64,
            (point.lat / self.cell_degrees).floor() as i64,
        )
    }

    pub fn insert(&mut self, id: DocumentId, point: GeoPoint) {
        self.remove(&id);
        let cell = self.cell_of(&point);
        self.cells.entry(cell).or_default().insert(id.clone());
        self.points.insert(id, point);
    }

    pub fn remove(&mut self, id: &DocumentId) {
        let Some(point) = self.points.remove(id) else {
            return;
        };
        let cell = self.cell_of(&point);
        if let Some(ids) = self.cells.get_mut(&cell) {
            ids.remove(id);
            if ids.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Ids of every point in a cell overlapping the circle's bounding box.
    /// A superset of the points within `radius_m`.
    pub fn candidates(&self, center: &GeoPoint, radius_m: f64) -> BTreeSet<DocumentId> {
        let dlat = (radius_m / EARTH_RADIUS_M).to_degrees();
        let lat_min = center.lat - dlat;
        let lat_max = center.lat + dlat;

        // Boxes touching a pole or the antimeridian wrap; take everything.
        if !radius_m.is_finite() || lat_min <= -90.0 || lat_max >= 90.0 {
            return self.points.keys().cloned().collect();
        }
        let widest_lat = lat_min.abs().max(lat_max.abs()).to_radians();
        let dlon = dlat / widest_lat.cos();
        let lon_min = center.lon - dlon;
        let lon_max = center.lon + dlon;
        if lon_min < -180.0 || lon_max > 180.0 {
            return self.points.keys().cloned().collect();
        }

        let (x0, y0) = self.cell_of(&GeoPoint::new(lon_min, lat_min));
        let (x1, y1) = self.cell_of(&GeoPoint::new(lon_max, lat_max));
        let in_box = |(x, y): &Cell| (x0..=x1).contains(x) && (y0..=y1).contains(y);

        let box_cells = (x1 - x0 + 1).saturating_mul(y1 - y0 + 1);
        let mut out = BTreeSet::new();
        if box_cells as usize > self.cells.len() {
            for (cell, ids) in &self.cells {
                if in_box(cell) {
                    out.extend(ids.iter().cloned());
                }
            }
        } else {
            for x in x0..=x1 {
                for y in y0..=y1 {
                    if let Some(ids) = self.cells.get(&(x, y)) {
                        out.extend(ids.iter().cloned());
                    }
                }
            }
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
