use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

// KML stores lon,lat; everywhere else we keep lat,lon.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

// Even-odd ray cast with the ray pointing east. Horizontal edges are
// skipped (they would divide by zero); under 3 vertices is never inside.
pub fn is_point_in_polygon(lat: f64, lon: f64, polygon: &[LatLon]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[j];
        j = i;

        if a.lat == b.lat {
            continue;
        }
        if (a.lat > lat) == (b.lat > lat) {
            continue;
        }
        let crossing_lon = a.lon + (lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
        if lon < crossing_lon {
            inside = !inside;
        }
    }
    inside
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

pub fn bearing_difference(b1: f64, b2: f64) -> f64 {
    let d = (b1 - b2).abs() % 360.0;
    d.min(360.0 - d)
}

// Heading from point 1 to point 2, for feeds that report position only.
pub fn initial_bearing(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let y = d_lambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lambda.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}
