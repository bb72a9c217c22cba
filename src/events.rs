// Propagation notifications
//
// The engine only produces these; whoever hosts it decides how to deliver
// them (text messages, logs, metrics). Delivery is a pair of tokio broadcast
// channels, so slow subscribers lag and drop rather than block producers.
// Per-pair measurements (signal strength, MUF) get their own channel: an
// update pass emits one per computed pair and must not crowd out notices.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::propagation::ionosphere::Season;

/// Capacity of the notice channel
const EVENT_CAPACITY: usize = 256;
/// Capacity of the per-pair measurement channel
const MEASUREMENT_CAPACITY: usize = 1024;

/// One listener moving between blocked and audible for one speaker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoutingChange {
    pub speaker: u32,
    pub listener: u32,
    pub quality: f64,
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PropagationEvent {
    /// Solar flux, K-index or season changed
    ConditionsChanged {
        solar_flux_index: i32,
        k_index: i32,
        season: Season,
    },
    /// A pair of locators got a freshly computed quality
    SignalStrengthChanged {
        grid_a: String,
        grid_b: String,
        quality: f64,
    },
    /// Published MUF moved
    MufChanged { muf_mhz: f64 },
    /// Every blocked/audible transition of one update pass
    RoutingChanged {
        generation: u64,
        changes: Vec<RoutingChange>,
    },
    /// An external data feed refresh finished
    ExternalDataUpdated { source: String, success: bool },
}

/// Reminder sent to users who have not set a locator.
pub const GRID_REMINDER: &str =
    "Please set your Maidenhead grid locator in your profile for HF band simulation.";

impl PropagationEvent {
    /// Text shown to connected users, for the events users are told about.
    pub fn user_text(&self) -> Option<String> {
        match self {
            PropagationEvent::ConditionsChanged {
                solar_flux_index,
                k_index,
                season,
            } => Some(format!(
                "Propagation conditions updated: Solar Flux Index: {}, K-Index: {}, Season: {}",
                solar_flux_index, k_index, season
            )),
            PropagationEvent::MufChanged { muf_mhz } => {
                Some(format!("Maximum Usable Frequency changed: {:.1} MHz", muf_mhz))
            }
            PropagationEvent::ExternalDataUpdated { source, success } => Some(format!(
                "External data from {} {}",
                source,
                if *success { "updated successfully" } else { "update failed" }
            )),
            PropagationEvent::SignalStrengthChanged { .. } | PropagationEvent::RoutingChanged { .. } => None,
        }
    }

    /// Emitted once per computed pair rather than once per change of state.
    pub fn is_measurement(&self) -> bool {
        matches!(
            self,
            PropagationEvent::SignalStrengthChanged { .. } | PropagationEvent::MufChanged { .. }
        )
    }
}

/// Cloneable handle used to publish and subscribe to notifications.
#[derive(Debug, Clone)]
pub struct EventBus {
    notices: broadcast::Sender<PropagationEvent>,
    measurements: broadcast::Sender<PropagationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (notices, _rx) = broadcast::channel(EVENT_CAPACITY);
        let (measurements, _rx) = broadcast::channel(MEASUREMENT_CAPACITY);
        EventBus { notices, measurements }
    }

    /// Conditions, routing and external-data notices.
    pub fn subscribe(&self) -> broadcast::Receiver<PropagationEvent> {
        self.notices.subscribe()
    }

    /// Signal-strength and MUF measurements.
    pub fn subscribe_measurements(&self) -> broadcast::Receiver<PropagationEvent> {
        self.measurements.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: PropagationEvent) {
        let tx = if event.is_measurement() {
            &self.measurements
        } else {
            &self.notices
        };
        if tx.send(event).is_err() {
            debug!("Notification dropped, no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.notices.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
