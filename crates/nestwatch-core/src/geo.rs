//! Great-circle distance and proximity scoring.

use serde::{Deserialize, Serialize};

use crate::Coordinates;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Ordered `(max distance in metres, points)` thresholds.
pub const GEO_SCORE_THRESHOLDS: &[(f64, u32)] = &[(30.0, 20), (50.0, 15), (100.0, 10), (200.0, 5)];

pub const MAX_GEO_POINTS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoScore {
    pub distance: Option<f64>,
    pub score: u32,
}

/// Distance in metres, rounded to 0.1 m.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    (EARTH_RADIUS_M * c * 10.0).round() / 10.0
}

/// `(0, 0)` counts as unset.
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite()
        && lon.is_finite()
        && (-90.0..=90.0).contains(&lat)
        && (-180.0..=180.0).contains(&lon)
        && !(lat == 0.0 && lon == 0.0)
}

pub fn valid_coordinates(coords: Option<Coordinates>) -> Option<Coordinates> {
    coords.filter(|c| is_valid_coordinate(c.latitude, c.longitude))
}

pub fn distance_between(a: Coordinates, b: Coordinates) -> Option<f64> {
    if !is_valid_coordinate(a.latitude, a.longitude) || !is_valid_coordinate(b.latitude, b.longitude)
    {
        return None;
    }
    Some(haversine_distance(
        a.latitude,
        a.longitude,
        b.latitude,
        b.longitude,
    ))
}

pub fn score_for_distance(distance: f64) -> u32 {
    GEO_SCORE_THRESHOLDS
        .iter()
        .find(|(max, _)| distance <= *max)
        .map(|(_, points)| *points)
        .unwrap_or(0)
}

pub fn calculate_geo_score(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> GeoScore {
    match distance_between(
        Coordinates {
            latitude: lat1,
            longitude: lon1,
        },
        Coordinates {
            latitude: lat2,
            longitude: lon2,
        },
    ) {
        Some(distance) => GeoScore {
            distance: Some(distance),
            score: score_for_distance(distance),
        },
        None => GeoScore {
            distance: None,
            score: 0,
        },
    }
}
