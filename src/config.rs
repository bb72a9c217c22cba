use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::{DEFAULT_K_INDEX, DEFAULT_SOLAR_FLUX_INDEX, DEFAULT_UPDATE_INTERVAL_MINUTES};
use crate::propagation::ionosphere::{clamp_k, clamp_sfi, ExternalSourceFlags, IonosphericState, Season};

/// HF voice server configuration
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Listen on [host:]port for voice clients.
    #[arg(long, value_name = "ADDR")]
    pub client_listen: Vec<String>,

    /// Set the server MOTD sent to clients.
    #[arg(long, default_value = "")]
    pub motd: String,

    /// Directory for status output (conditions.json, routing.json). Empty disables.
    #[arg(long, value_name = "DIR", default_value = "")]
    pub work_dir: String,

    /// Status logging interval in seconds, -1 to disable
    #[arg(long, default_value_t = 60)]
    pub status_interval: i32,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,

    /// Worker threads for the pairwise update pass, 0 = one per core
    #[arg(long, default_value_t = 0)]
    pub worker_threads: usize,

    /// Enable the HF propagation simulation
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub propagation_enabled: bool,

    /// Initial solar flux index (clamped to 50..=300)
    #[arg(long, default_value_t = DEFAULT_SOLAR_FLUX_INDEX, allow_negative_numbers = true)]
    pub solar_flux_index: i32,

    /// Initial planetary K-index (clamped to 0..=9)
    #[arg(long, default_value_t = DEFAULT_K_INDEX, allow_negative_numbers = true)]
    pub k_index: i32,

    /// Derive the season from the current month
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_season: bool,

    /// Season used when auto-season is off (winter, spring, summer, fall)
    #[arg(long, default_value = "winter")]
    pub season: Season,

    /// Minutes between routing update passes (at least 1)
    #[arg(long, default_value_t = DEFAULT_UPDATE_INTERVAL_MINUTES)]
    pub update_interval: u64,

    /// Refresh solar/geomagnetic parameters from external feeds
    #[arg(long, default_value_t = false)]
    pub use_external_data: bool,

    /// Consult the DXView feed
    #[arg(long, default_value_t = false)]
    pub use_dxview_data: bool,

    /// Consult the SWPC feed
    #[arg(long, default_value_t = false)]
    pub use_swpc_data: bool,

    /// Directory holding dxview.json / swpc.json feed documents
    #[arg(long, value_name = "DIR")]
    pub feed_dir: Option<PathBuf>,
}

impl Config {
    pub fn propagation_settings(&self) -> PropagationSettings {
        PropagationSettings {
            enabled: self.propagation_enabled,
            solar_flux_index: self.solar_flux_index,
            k_index: self.k_index,
            auto_season: self.auto_season,
            season: self.season,
            update_interval_minutes: self.update_interval,
            use_external_data: self.use_external_data,
            external_sources: ExternalSourceFlags {
                dxview: self.use_dxview_data,
                swpc: self.use_swpc_data,
            },
            feed_dir: self.feed_dir.clone(),
            worker_threads: self.worker_threads,
        }
        .clamped()
    }
}

/// Propagation settings with every value inside its documented range.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationSettings {
    pub enabled: bool,
    pub solar_flux_index: i32,
    pub k_index: i32,
    pub auto_season: bool,
    pub season: Season,
    pub update_interval_minutes: u64,
    pub use_external_data: bool,
    pub external_sources: ExternalSourceFlags,
    pub feed_dir: Option<PathBuf>,
    pub worker_threads: usize,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        PropagationSettings {
            enabled: true,
            solar_flux_index: DEFAULT_SOLAR_FLUX_INDEX,
            k_index: DEFAULT_K_INDEX,
            auto_season: true,
            season: Season::Winter,
            update_interval_minutes: DEFAULT_UPDATE_INTERVAL_MINUTES,
            use_external_data: false,
            external_sources: ExternalSourceFlags::default(),
            feed_dir: None,
            worker_threads: 0,
        }
    }
}

impl PropagationSettings {
    /// Out-of-range values are pulled into range, never rejected.
    pub fn clamped(mut self) -> Self {
        self.solar_flux_index = clamp_sfi(self.solar_flux_index);
        self.k_index = clamp_k(self.k_index);
        self.update_interval_minutes = self.update_interval_minutes.max(1);
        self
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_minutes.max(1) * 60)
    }

    /// Initial ionospheric state. With auto-season on, the season here is a
    /// placeholder until the model reads the clock.
    pub fn initial_state(&self) -> IonosphericState {
        IonosphericState {
            solar_flux_index: clamp_sfi(self.solar_flux_index),
            k_index: clamp_k(self.k_index),
            season: self.season,
            auto_time_enabled: self.auto_season,
            use_external_data: self.use_external_data,
            external_sources: self.external_sources,
        }
    }
}
