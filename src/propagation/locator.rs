// Maidenhead grid locators
//
// A locator names a cell of the globe:
// - field (2 letters A-R): 20° longitude x 10° latitude
// - square (2 digits 0-9): 2° x 1°
// - subsquare (2 letters a-x, optional): 5' x 2.5'
//
// Coordinates produced from a locator are always the center of the finest
// cell it resolves.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LocatorError;

const FIELD_LON_DEG: f64 = 20.0;
const FIELD_LAT_DEG: f64 = 10.0;
const SQUARE_LON_DEG: f64 = 2.0;
const SQUARE_LAT_DEG: f64 = 1.0;
const SUBSQUARE_LON_DEG: f64 = SQUARE_LON_DEG / 24.0;
const SUBSQUARE_LAT_DEG: f64 = SQUARE_LAT_DEG / 24.0;

/// Geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Coordinate { lat, lon }
    }
}

/// A validated, case-normalized 4- or 6-character grid locator.
///
/// Field letters are stored upper-case and subsquare letters lower-case,
/// so `"fn20AB"` and `"FN20ab"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GridLocator(String);

impl GridLocator {
    /// Parse and normalize a locator. Any length other than 4 or 6, or any
    /// character outside its position's class, is rejected.
    pub fn parse(text: &str) -> Result<Self, LocatorError> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() != 4 && chars.len() != 6 {
            return Err(LocatorError::InvalidLength(chars.len()));
        }

        let mut normalized = String::with_capacity(6);
        for (position, &c) in chars.iter().enumerate() {
            let valid = match position {
                0 | 1 => {
                    let u = c.to_ascii_uppercase();
                    ('A'..='R').contains(&u).then_some(u)
                }
                2 | 3 => c.is_ascii_digit().then_some(c),
                _ => {
                    let l = c.to_ascii_lowercase();
                    ('a'..='x').contains(&l).then_some(l)
                }
            };
            match valid {
                Some(v) => normalized.push(v),
                None => return Err(LocatorError::InvalidCharacter { position, found: c }),
            }
        }

        Ok(GridLocator(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 4 or 6.
    pub fn precision(&self) -> usize {
        self.0.len()
    }

    /// Center of the finest cell this locator resolves.
    pub fn to_coordinate(&self) -> Coordinate {
        let b = self.0.as_bytes();

        let mut lon = (b[0] - b'A') as f64 * FIELD_LON_DEG
            + (b[2] - b'0') as f64 * SQUARE_LON_DEG
            - 180.0;
        let mut lat = (b[1] - b'A') as f64 * FIELD_LAT_DEG
            + (b[3] - b'0') as f64 * SQUARE_LAT_DEG
            - 90.0;

        if b.len() == 6 {
            lon += (b[4] - b'a') as f64 * SUBSQUARE_LON_DEG + SUBSQUARE_LON_DEG / 2.0;
            lat += (b[5] - b'a') as f64 * SUBSQUARE_LAT_DEG + SUBSQUARE_LAT_DEG / 2.0;
        } else {
            lon += SQUARE_LON_DEG / 2.0;
            lat += SQUARE_LAT_DEG / 2.0;
        }

        Coordinate { lat, lon }
    }

    /// Locator of the cell containing (lat, lon). `precision >= 6` yields a
    /// 6-character locator, anything smaller a 4-character one.
    ///
    /// Longitude wraps into [-180, 180); latitude is clamped so the north
    /// pole lands in the top row of cells.
    pub fn from_coordinate(lat: f64, lon: f64, precision: usize) -> Self {
        let x = (lon + 180.0).rem_euclid(360.0);
        let y = (lat.clamp(-90.0, 90.0)) + 90.0;

        let lon_field = cell_index(x / FIELD_LON_DEG, 17);
        let lat_field = cell_index(y / FIELD_LAT_DEG, 17);
        let x = x - lon_field as f64 * FIELD_LON_DEG;
        let y = y - lat_field as f64 * FIELD_LAT_DEG;

        let lon_square = cell_index(x / SQUARE_LON_DEG, 9);
        let lat_square = cell_index(y / SQUARE_LAT_DEG, 9);
        let x = x - lon_square as f64 * SQUARE_LON_DEG;
        let y = y - lat_square as f64 * SQUARE_LAT_DEG;

        let mut out = String::with_capacity(6);
        out.push((b'A' + lon_field) as char);
        out.push((b'A' + lat_field) as char);
        out.push((b'0' + lon_square) as char);
        out.push((b'0' + lat_square) as char);

        if precision >= 6 {
            let lon_sub = cell_index(x / SUBSQUARE_LON_DEG, 23);
            let lat_sub = cell_index(y / SUBSQUARE_LAT_DEG, 23);
            out.push((b'a' + lon_sub) as char);
            out.push((b'a' + lat_sub) as char);
        }

        GridLocator(out)
    }
}

fn cell_index(v: f64, max: u8) -> u8 {
    if v <= 0.0 {
        0
    } else {
        (v.floor() as u32).min(max as u32) as u8
    }
}

impl fmt::Display for GridLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GridLocator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GridLocator::parse(s)
    }
}

impl TryFrom<String> for GridLocator {
    type Error = LocatorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        GridLocator::parse(&s)
    }
}

impl From<GridLocator> for String {
    fn from(g: GridLocator) -> Self {
        g.0
    }
}
