// Solar position at a grid locator, used for day/night weighting

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::geodesy::{DTOR, RTOD};
use crate::propagation::locator::GridLocator;

/// Solar zenith angle in degrees (0 = overhead, >90 = below the horizon).
///
/// Declination comes from the day of year (Cooper's approximation) and the
/// hour angle from UTC plus 4 minutes per degree of longitude.
pub fn solar_zenith_angle(grid: &GridLocator, at: DateTime<Utc>) -> f64 {
    let coord = grid.to_coordinate();

    let day_of_year = at.ordinal0() as f64;
    let hour_of_day = at.hour() as f64 + at.minute() as f64 / 60.0;

    let declination = 23.45 * (2.0 * std::f64::consts::PI * (284.0 + day_of_year) / 365.0).sin();

    // minutes
    let time_correction = 4.0 * coord.lon;
    let hour_angle = 15.0 * (hour_of_day + time_correction / 60.0 - 12.0);

    let lat = coord.lat * DTOR;
    let dec = declination * DTOR;
    let ha = hour_angle * DTOR;

    let cos_zenith = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
    cos_zenith.clamp(-1.0, 1.0).acos() * RTOD
}

pub fn is_daytime(grid: &GridLocator, at: DateTime<Utc>) -> bool {
    solar_zenith_angle(grid, at) < 90.0
}
