// Amateur band advice
//
// Band choice from path length and MUF, the mapping between bands and
// logical channel ids, and the human-readable recommendation text sent to a
// user after they set their locator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::BAND_METERS;

/// One of the nine canonical HF amateur bands, identified by wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Band(u32);

impl Band {
    pub const M10: Band = Band(10);
    pub const M12: Band = Band(12);
    pub const M15: Band = Band(15);
    pub const M17: Band = Band(17);
    pub const M20: Band = Band(20);
    pub const M30: Band = Band(30);
    pub const M40: Band = Band(40);
    pub const M80: Band = Band(80);
    pub const M160: Band = Band(160);

    /// Canonical band for a wavelength in metres, if there is one.
    pub fn from_meters(meters: u32) -> Option<Band> {
        BAND_METERS.contains(&meters).then_some(Band(meters))
    }

    pub fn meters(self) -> u32 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Band> {
        BAND_METERS.iter().map(|&m| Band(m))
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m", self.0)
    }
}

impl TryFrom<u32> for Band {
    type Error = String;

    fn try_from(meters: u32) -> Result<Self, Self::Error> {
        Band::from_meters(meters).ok_or_else(|| format!("{} m is not an HF band", meters))
    }
}

impl From<Band> for u32 {
    fn from(band: Band) -> u32 {
        band.0
    }
}

/// Long-path ladder: lowest MUF (exclusive) at which each band opens.
const LONG_PATH_LADDER: [(f64, Band); 8] = [
    (28.0, Band::M10),
    (24.0, Band::M12),
    (21.0, Band::M15),
    (18.0, Band::M17),
    (14.0, Band::M20),
    (10.0, Band::M30),
    (7.0, Band::M40),
    (3.5, Band::M80),
];

/// Best band for a path of `distance_km` given the path MUF.
///
/// Thresholds are strict: a MUF exactly on a threshold selects the next
/// band down.
pub fn recommend_band(distance_km: f64, muf_mhz: f64) -> Band {
    if distance_km < 500.0 {
        return Band::M20;
    }

    if distance_km < 2000.0 {
        return if muf_mhz > 21.0 {
            Band::M15
        } else if muf_mhz > 14.0 {
            Band::M20
        } else {
            Band::M40
        };
    }

    LONG_PATH_LADDER
        .iter()
        .find(|(threshold, _)| muf_mhz > *threshold)
        .map(|&(_, band)| band)
        .unwrap_or(Band::M160)
}

/// Channel id carrying a band; channels are numbered by wavelength.
pub fn band_to_channel(band: Band) -> u32 {
    band.meters()
}

/// Band carried by a channel, or `None` for channels that are not bands.
pub fn channel_to_band(channel_id: u32) -> Option<Band> {
    Band::from_meters(channel_id)
}

/// Bands expected to be open under the given conditions.
pub fn open_bands(solar_flux_index: i32, k_index: i32) -> Vec<Band> {
    let mut bands = if solar_flux_index > 150 {
        vec![Band::M10, Band::M12, Band::M15]
    } else if solar_flux_index > 100 {
        vec![Band::M15, Band::M17, Band::M20]
    } else {
        vec![Band::M40, Band::M80, Band::M160]
    };

    if k_index > 5 {
        bands.retain(|b| !matches!(*b, Band::M10 | Band::M12 | Band::M15));
    }
    bands
}

/// Text sent to a user after their locator is accepted.
pub fn band_recommendation_message(
    grid: &str,
    is_daytime: bool,
    solar_flux_index: i32,
    k_index: i32,
) -> String {
    let mut message = format!(
        "Band recommendations for {} ({}):\nSolar Flux Index: {}, K-Index: {}\n",
        grid,
        if is_daytime { "Day" } else { "Night" },
        solar_flux_index,
        k_index
    );

    if is_daytime {
        if solar_flux_index > 150 {
            message.push_str("Excellent conditions for DX on higher bands.\n");
            message.push_str("Recommended bands: 10m, 12m, 15m, 17m, 20m");
        } else if solar_flux_index > 100 {
            message.push_str("Good conditions for DX on mid-range bands.\n");
            message.push_str("Recommended bands: 15m, 17m, 20m, 30m");
        } else {
            message.push_str("Fair conditions, focus on lower bands.\n");
            message.push_str("Recommended bands: 20m, 30m, 40m");
        }
    } else {
        message.push_str("Nighttime conditions favor lower bands.\n");
        message.push_str("Recommended bands: 40m, 80m, 160m");
        if solar_flux_index > 150 {
            message.push_str(", 20m");
        }
    }

    message
}
