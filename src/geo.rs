//! Geographic points and great-circle distance.
//!
//! Points travel on the wire as GeoJSON (`{"type":"Point","coordinates":[lng,lat]}`)
//! and are stored as two REAL columns.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A WGS 84 point. Longitude first, as in GeoJSON.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GeoJsonPoint", into = "GeoJsonPoint")]
pub struct GeoPoint {
    pub lng: f64,
    pub lat: f64,
}

/// Loose GeoJSON shape accepted from clients before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoJsonPoint {
    #[serde(rename = "type", default = "point_type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

fn point_type() -> String {
    "Point".to_string()
}

impl GeoPoint {
    /// Build a point, rejecting non-finite or out-of-range coordinates.
    pub fn new(lng: f64, lat: f64) -> Result<Self, String> {
        if !lng.is_finite() || !lat.is_finite() {
            return Err("location coordinates must be finite numbers".to_string());
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(format!("longitude {lng} is outside [-180, 180]"));
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(format!("latitude {lat} is outside [-90, 90]"));
        }
        Ok(Self { lng, lat })
    }

    /// Great-circle distance to `other` in meters (haversine).
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lng = (other.lng - self.lng).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_METERS * c
    }

    /// Latitude/longitude span (degrees) that encloses a circle of
    /// `radius_meters` around this point. Used to prefilter rows in SQL.
    pub fn bounding_deltas(&self, radius_meters: f64) -> (f64, f64) {
        let lat_delta = (radius_meters / EARTH_RADIUS_METERS).to_degrees();
        let cos_lat = self.lat.to_radians().cos().abs();
        let lng_delta = if cos_lat < 1e-6 {
            360.0
        } else {
            (lat_delta / cos_lat).min(360.0)
        };
        (lat_delta, lng_delta)
    }
}

impl TryFrom<GeoJsonPoint> for GeoPoint {
    type Error = String;

    fn try_from(raw: GeoJsonPoint) -> Result<Self, Self::Error> {
        if raw.kind != "Point" {
            return Err(format!("unsupported location type '{}'", raw.kind));
        }
        match raw.coordinates.as_slice() {
            [lng, lat] => GeoPoint::new(*lng, *lat),
            other => Err(format!(
                "location.coordinates must contain exactly 2 numbers, got {}",
                other.len()
            )),
        }
    }
}

impl From<GeoPoint> for GeoJsonPoint {
    fn from(point: GeoPoint) -> Self {
        Self {
            kind: point_type(),
            coordinates: vec![point.lng, point.lat],
        }
    }
}
