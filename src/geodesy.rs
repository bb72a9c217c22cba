// Geodesy module - great-circle distances between grid locators
//
// Spherical Earth (radius 6371 km). Accuracy is well within what the
// propagation model needs; locator cells are already kilometres wide.

use std::f64::consts::PI;

use crate::constants::EARTH_RADIUS_KM;
use crate::propagation::locator::{Coordinate, GridLocator};

/// Degrees to radians conversion factor
pub const DTOR: f64 = PI / 180.0;

/// Radians to degrees conversion factor
pub const RTOD: f64 = 180.0 / PI;

/// Returns Haversine great-circle distance in km between two coordinates
///
/// The formula only depends on squared differences and the product of the
/// two latitude cosines, so swapping the arguments gives a bit-identical
/// result.
///
/// # Example
/// ```
/// use hf_voice_server::geodesy::haversine_km;
/// use hf_voice_server::propagation::locator::Coordinate;
///
/// let london = Coordinate::new(51.5074, -0.1278);
/// let paris = Coordinate::new(48.8566, 2.3522);
/// let d = haversine_km(london, paris);
/// assert!((d - 344.0).abs() < 5.0);
/// ```
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let lat1 = a.lat * DTOR;
    let lat2 = b.lat * DTOR;
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon) * DTOR;

    let s_lat = (dlat / 2.0).sin();
    let s_lon = (dlon / 2.0).sin();
    let h = s_lat * s_lat + lat1.cos() * lat2.cos() * s_lon * s_lon;

    // Guard against h creeping past 1.0 for antipodal points
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Returns great-circle distance in km between the centers of two locators
pub fn distance_km(a: &GridLocator, b: &GridLocator) -> f64 {
    haversine_km(a.to_coordinate(), b.to_coordinate())
}
