// Server module capability surface
//
// A module is anything the server initializes at startup, exposes string
// settings for, and shuts down at exit. PropagationModule adapts the
// coordinator and its ionospheric model to that surface.

use std::sync::Arc;

use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::error::SettingError;
use crate::propagation::ionosphere::{clamp_k, clamp_sfi, Season};

pub trait ServerModule: Send + Sync {
    /// Returns false when the module could not start.
    fn initialize(&mut self) -> bool;
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;
    fn get_setting(&self, key: &str) -> Option<String>;
    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), SettingError>;
    fn shutdown(&mut self);
}

pub const PROPAGATION_MODULE_NAME: &str = "HF Band Simulation";

/// Setting keys understood by [`PropagationModule`].
pub const PROPAGATION_SETTING_KEYS: [&str; 9] = [
    "enabled",
    "solarFluxIndex",
    "kIndex",
    "season",
    "autoTimeEnabled",
    "useExternalData",
    "useDXViewData",
    "useSWPCData",
    "updateInterval",
];

pub struct PropagationModule {
    coordinator: Arc<Coordinator>,
    initialized: bool,
}

impl PropagationModule {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        PropagationModule {
            coordinator,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SettingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> SettingError {
    SettingError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

impl ServerModule for PropagationModule {
    fn initialize(&mut self) -> bool {
        let ionosphere = self.coordinator.ionosphere();
        ionosphere.update_season();
        let state = ionosphere.state();
        info!(
            module = PROPAGATION_MODULE_NAME,
            sfi = state.solar_flux_index,
            k_index = state.k_index,
            season = %state.season,
            auto_time = state.auto_time_enabled,
            "Module initialized"
        );
        self.initialized = true;
        true
    }

    fn name(&self) -> &str {
        PROPAGATION_MODULE_NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Simulates HF band conditions between users based on their grid locators"
    }

    fn get_setting(&self, key: &str) -> Option<String> {
        let state = self.coordinator.ionosphere().state();
        let value = match key {
            "enabled" => self.coordinator.is_enabled().to_string(),
            "solarFluxIndex" => state.solar_flux_index.to_string(),
            "kIndex" => state.k_index.to_string(),
            "season" => state.season.to_string(),
            "autoTimeEnabled" => state.auto_time_enabled.to_string(),
            "useExternalData" => state.use_external_data.to_string(),
            "useDXViewData" => state.external_sources.dxview.to_string(),
            "useSWPCData" => state.external_sources.swpc.to_string(),
            "updateInterval" => self.coordinator.settings().update_interval_minutes.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Numeric values outside their range are clamped, matching the
    /// startup configuration.
    fn set_setting(&mut self, key: &str, value: &str) -> Result<(), SettingError> {
        let ionosphere = self.coordinator.ionosphere();
        match key {
            "enabled" => self.coordinator.set_enabled(parse_bool(key, value)?),
            "solarFluxIndex" => {
                ionosphere.set_solar_flux_index(clamp_sfi(parse_num(key, value)?));
            }
            "kIndex" => {
                ionosphere.set_k_index(clamp_k(parse_num(key, value)?));
            }
            "season" => {
                let season: Season = value.parse().map_err(|_| invalid(key, value))?;
                ionosphere.set_season(season);
            }
            "autoTimeEnabled" => ionosphere.set_auto_time_enabled(parse_bool(key, value)?),
            "useExternalData" => ionosphere.set_use_external_data(parse_bool(key, value)?),
            "useDXViewData" => ionosphere.set_use_dxview_data(parse_bool(key, value)?),
            "useSWPCData" => ionosphere.set_use_swpc_data(parse_bool(key, value)?),
            "updateInterval" => {
                let minutes: u64 = parse_num(key, value)?;
                self.coordinator.set_update_interval_minutes(minutes);
            }
            _ => {
                warn!(module = PROPAGATION_MODULE_NAME, key, "Unknown setting");
                return Err(SettingError::UnknownKey(key.to_string()));
            }
        }
        info!(module = PROPAGATION_MODULE_NAME, key, value, "Setting changed");
        Ok(())
    }

    fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        self.coordinator.set_enabled(false);
        self.coordinator.audio().clear();
        self.initialized = false;
        info!(module = PROPAGATION_MODULE_NAME, "Module shut down");
    }
}

/// Owns the server's modules. Initialized in registration order, shut
/// down in reverse.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Box<dyn ServerModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, module: Box<dyn ServerModule>) {
        info!(module = module.name(), version = module.version(), "Module registered");
        self.modules.push(module);
    }

    /// Initialize every module. Returns the names of those that failed.
    pub fn initialize_all(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        for module in self.modules.iter_mut() {
            if !module.initialize() {
                warn!(module = module.name(), "Module failed to initialize");
                failed.push(module.name().to_string());
            }
        }
        failed
    }

    pub fn shutdown_all(&mut self) {
        for module in self.modules.iter_mut().rev() {
            module.shutdown();
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ServerModule> {
        self.modules.iter().find(|m| m.name() == name).map(|m| m.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn ServerModule>> {
        self.modules.iter_mut().find(|m| m.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropagationSettings;
    use crate::propagation::clock::FixedClock;
    use crate::propagation::random::FixedRandom;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    fn coordinator() -> Arc<Coordinator> {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap()));
        Arc::new(
            Coordinator::with_sources(
                PropagationSettings::default(),
                clock,
                Arc::new(FixedRandom(0.5)),
                String::new(),
                -1,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_get_settings() {
        let mut module = PropagationModule::new(coordinator());
        assert!(module.initialize());
        assert_eq!(module.get_setting("solarFluxIndex").as_deref(), Some("120"));
        assert_eq!(module.get_setting("kIndex").as_deref(), Some("3"));
        assert_eq!(module.get_setting("season").as_deref(), Some("Winter"));
        assert_eq!(module.get_setting("updateInterval").as_deref(), Some("30"));
        assert_eq!(module.get_setting("enabled").as_deref(), Some("true"));
        assert_eq!(module.get_setting("nope"), None);
        for key in PROPAGATION_SETTING_KEYS {
            assert!(module.get_setting(key).is_some(), "{}", key);
        }
    }

    #[test]
    fn test_set_settings_clamp_and_apply() {
        let c = coordinator();
        let mut module = PropagationModule::new(c.clone());
        module.set_setting("solarFluxIndex", "400").unwrap();
        module.set_setting("kIndex", "7").unwrap();
        module.set_setting("autoTimeEnabled", "false").unwrap();
        module.set_setting("season", "summer").unwrap();
        module.set_setting("updateInterval", "5").unwrap();
        module.set_setting("useSWPCData", "on").unwrap();

        let state = c.ionosphere().state();
        assert_eq!(state.solar_flux_index, 300);
        assert_eq!(state.k_index, 7);
        assert_eq!(state.season, Season::Summer);
        assert!(!state.auto_time_enabled);
        assert!(state.external_sources.swpc);
        assert_eq!(c.settings().update_interval_minutes, 5);
    }

    #[test]
    fn test_set_setting_errors() {
        let mut module = PropagationModule::new(coordinator());
        assert_eq!(
            module.set_setting("colour", "blue"),
            Err(SettingError::UnknownKey("colour".to_string()))
        );
        assert!(matches!(
            module.set_setting("kIndex", "high"),
            Err(SettingError::InvalidValue { .. })
        ));
        assert!(matches!(
            module.set_setting("useExternalData", "maybe"),
            Err(SettingError::InvalidValue { .. })
        ));
        assert_eq!(module.get_setting("kIndex").as_deref(), Some("3"));
    }

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        ok: bool,
    }

    impl ServerModule for Recorder {
        fn initialize(&mut self) -> bool {
            self.log.lock().push(format!("init {}", self.name));
            self.ok
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            "0"
        }
        fn description(&self) -> &str {
            ""
        }
        fn get_setting(&self, _key: &str) -> Option<String> {
            None
        }
        fn set_setting(&mut self, key: &str, _value: &str) -> Result<(), SettingError> {
            Err(SettingError::UnknownKey(key.to_string()))
        }
        fn shutdown(&mut self) {
            self.log.lock().push(format!("shutdown {}", self.name));
        }
    }

    #[test]
    fn test_registry_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ModuleRegistry::new();
        for (name, ok) in [("a", true), ("b", false), ("c", true)] {
            registry.register(Box::new(Recorder {
                name: name.to_string(),
                log: log.clone(),
                ok,
            }));
        }
        assert_eq!(registry.initialize_all(), vec!["b".to_string()]);
        registry.shutdown_all();
        assert_eq!(
            *log.lock(),
            vec!["init a", "init b", "init c", "shutdown c", "shutdown b", "shutdown a"]
        );
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_shutdown_disables_propagation() {
        let c = coordinator();
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(PropagationModule::new(c.clone())));
        assert!(registry.initialize_all().is_empty());
        registry
            .get_mut(PROPAGATION_MODULE_NAME)
            .unwrap()
            .set_setting("kIndex", "5")
            .unwrap();
        assert_eq!(c.ionosphere().k_index(), 5);
        registry.shutdown_all();
        assert!(!c.is_enabled());
        assert!(c.audio().table().is_empty());
    }
}
