// Shared constants for the propagation engine and the audio routing path

/// Mean Earth radius (km) used by every spherical-Earth calculation.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Quality below which no audio passes between two users at all.
pub const MIN_COMMUNICATION_QUALITY: f64 = 0.05;

/// Noise factor above which static is applied to forwarded audio.
pub const NOISE_THRESHOLD: f64 = 0.1;

/// Jitter factor above which timing variation is applied.
pub const JITTER_THRESHOLD: f64 = 0.2;

// --- Ionospheric parameter bounds and defaults ---

/// Lowest accepted solar flux index. Configured values are clamped into range.
pub const MIN_SOLAR_FLUX_INDEX: i32 = 50;

/// Highest accepted solar flux index.
pub const MAX_SOLAR_FLUX_INDEX: i32 = 300;

/// Solar flux index at startup.
pub const DEFAULT_SOLAR_FLUX_INDEX: i32 = 120;

/// Planetary K-index range is 0..=9.
pub const MAX_K_INDEX: i32 = 9;

/// K-index at startup.
pub const DEFAULT_K_INDEX: i32 = 3;

/// Base critical frequency (MHz) before solar/geomagnetic/season scaling.
pub const BASE_CRITICAL_FREQUENCY_MHZ: f64 = 5.0;

/// Base F-layer reflection height (km).
pub const BASE_F_LAYER_HEIGHT_KM: f64 = 300.0;

// --- Volume adjustment ---

/// Smallest volume adjustment factor.
pub const MIN_ADJUSTMENT_FACTOR: f32 = 0.0;

/// Largest volume adjustment factor.
pub const MAX_ADJUSTMENT_FACTOR: f32 = 10.0;

/// Factor used when no per-listener override exists.
pub const DEFAULT_ADJUSTMENT_FACTOR: f32 = 1.0;

// --- Update loop ---

/// Routing update interval (minutes) for the server-wide loop.
pub const DEFAULT_UPDATE_INTERVAL_MINUTES: u64 = 30;

/// Nine canonical amateur HF bands, in meters, shortest wavelength first.
pub const BAND_METERS: [u32; 9] = [10, 12, 15, 17, 20, 30, 40, 80, 160];
