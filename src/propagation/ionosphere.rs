// Ionospheric model
//
// Holds the process-wide propagation parameters (solar flux, K-index,
// season, feed flags) and derives critical frequency, F-layer height and
// MUF from them. Every change that affects propagation bumps the state
// version; quality caches stamped with an older version are discarded.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Datelike;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{
    BASE_CRITICAL_FREQUENCY_MHZ, BASE_F_LAYER_HEIGHT_KM, DEFAULT_K_INDEX, DEFAULT_SOLAR_FLUX_INDEX,
    EARTH_RADIUS_KM, MAX_K_INDEX, MAX_SOLAR_FLUX_INDEX, MIN_SOLAR_FLUX_INDEX,
};
use crate::events::{EventBus, PropagationEvent};
use crate::geodesy::RTOD;
use crate::propagation::clock::Clock;

/// Shortest path used for MUF geometry. A zero-length path would put the
/// takeoff angle at exactly 90 degrees.
const MIN_PATH_KM: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl Season {
    /// Northern-hemisphere meteorological seasons. Southern-hemisphere users
    /// get the opposite season; this is a known approximation.
    pub fn from_month(month: u32) -> Self {
        match month {
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            9..=11 => Season::Fall,
            _ => Season::Winter,
        }
    }

    /// 0=Winter, 1=Spring, 2=Summer, 3=Fall (the stored configuration form).
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Season::Winter),
            1 => Some(Season::Spring),
            2 => Some(Season::Summer),
            3 => Some(Season::Fall),
            _ => None,
        }
    }

    pub fn index(self) -> i64 {
        match self {
            Season::Winter => 0,
            Season::Spring => 1,
            Season::Summer => 2,
            Season::Fall => 3,
        }
    }

    fn critical_frequency_factor(self) -> f64 {
        match self {
            Season::Winter => 0.8,
            Season::Summer => 1.2,
            Season::Spring | Season::Fall => 1.0,
        }
    }

    fn layer_height_factor(self) -> f64 {
        match self {
            Season::Winter => 1.1,
            Season::Summer => 0.9,
            Season::Spring | Season::Fall => 1.0,
        }
    }

    /// Contribution of the season to signal quality.
    pub fn quality_factor(self) -> f64 {
        match self {
            Season::Winter => 0.7,
            Season::Spring => 0.9,
            Season::Summer => 1.0,
            Season::Fall => 0.8,
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Fall => "Fall",
        };
        f.write_str(name)
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "winter" | "0" => Ok(Season::Winter),
            "spring" | "1" => Ok(Season::Spring),
            "summer" | "2" => Ok(Season::Summer),
            "fall" | "autumn" | "3" => Ok(Season::Fall),
            other => Err(format!("unknown season {:?}", other)),
        }
    }
}

/// Which external feeds are consulted when external data is enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSourceFlags {
    pub dxview: bool,
    pub swpc: bool,
}

/// Current ionospheric parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IonosphericState {
    pub solar_flux_index: i32,
    pub k_index: i32,
    pub season: Season,
    pub auto_time_enabled: bool,
    pub use_external_data: bool,
    pub external_sources: ExternalSourceFlags,
}

impl Default for IonosphericState {
    fn default() -> Self {
        IonosphericState {
            solar_flux_index: DEFAULT_SOLAR_FLUX_INDEX,
            k_index: DEFAULT_K_INDEX,
            season: Season::Winter,
            auto_time_enabled: true,
            use_external_data: false,
            external_sources: ExternalSourceFlags::default(),
        }
    }
}

impl IonosphericState {
    /// foF2 in MHz
    pub fn critical_frequency(&self) -> f64 {
        let sfi = self.solar_flux_index as f64;
        let k = self.k_index as f64;
        let solar = 1.0 + (sfi - 100.0) / 100.0;
        let geomagnetic = 1.0 - (k / 9.0) * 0.5;
        BASE_CRITICAL_FREQUENCY_MHZ * solar * geomagnetic * self.season.critical_frequency_factor()
    }

    /// F-layer reflection height in km
    pub fn f_layer_height(&self) -> f64 {
        let sfi = self.solar_flux_index as f64;
        let k = self.k_index as f64;
        let solar = 1.0 + (sfi - 100.0) / 200.0;
        let geomagnetic = 1.0 + (k / 9.0) * 0.2;
        BASE_F_LAYER_HEIGHT_KM * solar * geomagnetic * self.season.layer_height_factor()
    }

    /// Longest single-hop ground distance (km) for the current layer height
    pub fn max_single_hop_km(&self) -> f64 {
        2.0 * (self.f_layer_height() * 2.0 * EARTH_RADIUS_KM).sqrt()
    }

    /// Hops needed to cover `distance_km`, never fewer than one
    pub fn hop_count(&self, distance_km: f64) -> u32 {
        let d = distance_km.max(MIN_PATH_KM);
        ((d / self.max_single_hop_km()).ceil() as u32).max(1)
    }

    /// Takeoff angle in degrees for the path
    pub fn takeoff_angle(&self, distance_km: f64) -> f64 {
        let d = distance_km.max(MIN_PATH_KM);
        let hops = self.hop_count(d) as f64;
        (self.f_layer_height() / (d / (2.0 * hops))).atan() * RTOD
    }

    /// Secant-law MUF in MHz over `distance_km`
    pub fn maximum_usable_frequency(&self, distance_km: f64) -> f64 {
        let angle = self.takeoff_angle(distance_km).to_radians();
        self.critical_frequency() / angle.cos()
    }
}

/// State plus the version it was published under. Everything derived from
/// a snapshot is consistent with a single set of parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IonosphericSnapshot {
    pub state: IonosphericState,
    pub version: u64,
}

/// Owner of the ionospheric state. Share it by `Arc`; the setters are the
/// only mutation path.
pub struct IonosphericModel {
    current: RwLock<IonosphericSnapshot>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl IonosphericModel {
    /// Defaults (SFI 120, K 3), season taken from the clock.
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        let mut state = IonosphericState::default();
        state.season = Season::from_month(clock.now().month());
        Self::with_state(state, clock, events)
    }

    pub fn with_state(mut state: IonosphericState, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        state.solar_flux_index = clamp_sfi(state.solar_flux_index);
        state.k_index = clamp_k(state.k_index);
        IonosphericModel {
            current: RwLock::new(IonosphericSnapshot { state, version: 0 }),
            clock,
            events,
        }
    }

    pub fn snapshot(&self) -> IonosphericSnapshot {
        *self.current.read()
    }

    pub fn state(&self) -> IonosphericState {
        self.current.read().state
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    pub fn solar_flux_index(&self) -> i32 {
        self.state().solar_flux_index
    }

    pub fn k_index(&self) -> i32 {
        self.state().k_index
    }

    pub fn season(&self) -> Season {
        self.state().season
    }

    pub fn critical_frequency(&self) -> f64 {
        self.state().critical_frequency()
    }

    pub fn f_layer_height(&self) -> f64 {
        self.state().f_layer_height()
    }

    pub fn maximum_usable_frequency(&self, distance_km: f64) -> f64 {
        self.state().maximum_usable_frequency(distance_km)
    }

    /// Returns true when the value changed (after clamping to 50..=300).
    pub fn set_solar_flux_index(&self, sfi: i32) -> bool {
        let sfi = clamp_sfi(sfi);
        self.mutate(|s| {
            if s.solar_flux_index == sfi {
                return false;
            }
            s.solar_flux_index = sfi;
            true
        })
    }

    /// Returns true when the value changed (after clamping to 0..=9).
    pub fn set_k_index(&self, k_index: i32) -> bool {
        let k = clamp_k(k_index);
        self.mutate(|s| {
            if s.k_index == k {
                return false;
            }
            s.k_index = k;
            true
        })
    }

    pub fn set_season(&self, season: Season) -> bool {
        self.mutate(|s| {
            if s.season == season {
                return false;
            }
            s.season = season;
            true
        })
    }

    /// Apply a feed update in one step: both values land under a single
    /// version or neither does.
    pub fn apply_parameters(&self, solar_flux_index: Option<i32>, k_index: Option<i32>) -> bool {
        let sfi = solar_flux_index.map(clamp_sfi);
        let k = k_index.map(clamp_k);
        self.mutate(|s| {
            let mut changed = false;
            if let Some(sfi) = sfi {
                changed |= s.solar_flux_index != sfi;
                s.solar_flux_index = sfi;
            }
            if let Some(k) = k {
                changed |= s.k_index != k;
                s.k_index = k;
            }
            changed
        })
    }

    /// Enabling auto time immediately re-derives the season.
    pub fn set_auto_time_enabled(&self, enabled: bool) {
        self.current.write().state.auto_time_enabled = enabled;
        if enabled {
            self.update_season();
        }
    }

    pub fn set_use_external_data(&self, enabled: bool) {
        self.current.write().state.use_external_data = enabled;
    }

    pub fn set_use_dxview_data(&self, enabled: bool) {
        self.current.write().state.external_sources.dxview = enabled;
    }

    pub fn set_use_swpc_data(&self, enabled: bool) {
        self.current.write().state.external_sources.swpc = enabled;
    }

    /// Season from the clock's current month. Only changes state when auto
    /// time is enabled.
    pub fn update_season(&self) -> bool {
        if !self.state().auto_time_enabled {
            return false;
        }
        let season = Season::from_month(self.clock.now().month());
        self.set_season(season)
    }

    fn mutate<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut IonosphericState) -> bool,
    {
        let published = {
            let mut current = self.current.write();
            if !f(&mut current.state) {
                return false;
            }
            current.version += 1;
            *current
        };

        info!(
            sfi = published.state.solar_flux_index,
            k_index = published.state.k_index,
            season = %published.state.season,
            version = published.version,
            "Ionospheric conditions changed"
        );
        debug!(
            fof2 = published.state.critical_frequency(),
            height_km = published.state.f_layer_height(),
            "Derived layer parameters"
        );

        self.events.publish(PropagationEvent::ConditionsChanged {
            solar_flux_index: published.state.solar_flux_index,
            k_index: published.state.k_index,
            season: published.state.season,
        });
        true
    }
}

pub fn clamp_sfi(sfi: i32) -> i32 {
    sfi.clamp(MIN_SOLAR_FLUX_INDEX, MAX_SOLAR_FLUX_INDEX)
}

pub fn clamp_k(k: i32) -> i32 {
    k.clamp(0, MAX_K_INDEX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    const EPSILON: f64 = 1e-9;

    fn summer_state() -> IonosphericState {
        IonosphericState {
            season: Season::Summer,
            ..IonosphericState::default()
        }
    }

    fn model_at(month: u32) -> IonosphericModel {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, month, 15, 12, 0, 0).unwrap()));
        IonosphericModel::new(clock, EventBus::new())
    }

    #[test]
    fn test_season_from_month() {
        let expected = [
            (1, Season::Winter), (2, Season::Winter), (3, Season::Spring), (4, Season::Spring),
            (5, Season::Spring), (6, Season::Summer), (7, Season::Summer), (8, Season::Summer),
            (9, Season::Fall), (10, Season::Fall), (11, Season::Fall), (12, Season::Winter),
        ];
        for (month, season) in expected {
            assert_eq!(Season::from_month(month), season, "month {}", month);
        }
    }

    #[test]
    fn test_critical_frequency() {
        // 5 * (1 + 20/100) * (1 - 3/9 * 0.5) * 1.2
        let expected = 5.0 * 1.2 * (1.0 - 1.0 / 6.0) * 1.2;
        assert!((summer_state().critical_frequency() - expected).abs() < EPSILON);
    }

    #[test]
    fn test_f_layer_height() {
        // 300 * (1 + 20/200) * (1 + 3/9 * 0.2) * 0.9
        let expected = 300.0 * 1.1 * (1.0 + 0.2 / 3.0) * 0.9;
        assert!((summer_state().f_layer_height() - expected).abs() < EPSILON);
    }

    #[test]
    fn test_muf_single_hop() {
        let s = summer_state();
        let h = s.f_layer_height();
        assert_eq!(s.hop_count(3000.0), 1);
        let angle = (h / 1500.0).atan();
        let expected = s.critical_frequency() / angle.cos();
        assert!((s.maximum_usable_frequency(3000.0) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_muf_multi_hop() {
        let s = summer_state();
        let max_hop = s.max_single_hop_km();
        let d = max_hop * 2.5;
        assert_eq!(s.hop_count(d), 3);
        let angle = (s.f_layer_height() / (d / 6.0)).atan();
        let expected = s.critical_frequency() / angle.cos();
        assert!((s.maximum_usable_frequency(d) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_muf_zero_distance_is_finite() {
        let muf = summer_state().maximum_usable_frequency(0.0);
        assert!(muf.is_finite());
        assert!(muf > summer_state().critical_frequency());
    }

    #[test]
    fn test_new_uses_clock_season() {
        assert_eq!(model_at(7).season(), Season::Summer);
        assert_eq!(model_at(1).season(), Season::Winter);
        assert_eq!(model_at(4).solar_flux_index(), 120);
        assert_eq!(model_at(4).k_index(), 3);
    }

    #[test]
    fn test_setters_bump_version_only_on_change() {
        let model = model_at(7);
        let v0 = model.version();
        assert!(!model.set_solar_flux_index(120));
        assert_eq!(model.version(), v0);
        assert!(model.set_solar_flux_index(150));
        assert_eq!(model.version(), v0 + 1);
        assert!(model.set_k_index(8));
        assert!(model.set_season(Season::Fall));
        assert_eq!(model.version(), v0 + 3);
    }

    #[test]
    fn test_setters_clamp() {
        let model = model_at(7);
        model.set_solar_flux_index(10_000);
        assert_eq!(model.solar_flux_index(), 300);
        model.set_solar_flux_index(-5);
        assert_eq!(model.solar_flux_index(), 50);
        model.set_k_index(42);
        assert_eq!(model.k_index(), 9);
        model.set_k_index(-1);
        assert_eq!(model.k_index(), 0);
    }

    #[tokio::test]
    async fn test_change_notifies() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()));
        let model = IonosphericModel::new(clock, bus);
        model.set_k_index(5);
        match rx.recv().await.unwrap() {
            PropagationEvent::ConditionsChanged { solar_flux_index, k_index, season } => {
                assert_eq!(solar_flux_index, 120);
                assert_eq!(k_index, 5);
                assert_eq!(season, Season::Summer);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_update_season_respects_auto_flag() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()));
        let model = IonosphericModel::new(clock.clone(), EventBus::new());
        model.set_auto_time_enabled(false);
        clock.set(Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert!(!model.update_season());
        assert_eq!(model.season(), Season::Summer);
        model.set_auto_time_enabled(true);
        assert_eq!(model.season(), Season::Winter);
    }

    #[test]
    fn test_apply_parameters_single_version() {
        let model = model_at(7);
        let v0 = model.version();
        assert!(model.apply_parameters(Some(180), Some(1)));
        assert_eq!(model.version(), v0 + 1);
        assert_eq!(model.solar_flux_index(), 180);
        assert_eq!(model.k_index(), 1);
        assert!(!model.apply_parameters(Some(180), None));
    }

    #[test]
    fn test_season_parse() {
        assert_eq!("summer".parse::<Season>().unwrap(), Season::Summer);
        assert_eq!("Autumn".parse::<Season>().unwrap(), Season::Fall);
        assert!("monsoon".parse::<Season>().is_err());
        assert_eq!(Season::from_index(2), Some(Season::Summer));
        assert_eq!(Season::from_index(7), None);
    }
}
