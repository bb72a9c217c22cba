// Coordinator - top level glue between connected users, the propagation
// engine and the published audio routing table
//
// Owns the user registry and the RoutingUpdateLoop. A pass recomputes
// every ordered pair of connected users on the worker pool, then swaps the
// finished table in. Triggers that arrive mid-pass fold into a single
// follow-up pass.
//
// Nothing here waits on a client's outbound queue except routing changes,
// which are handed to a task of their own when the queue is full.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::PropagationSettings;
use crate::error::LocatorError;
use crate::events::{EventBus, PropagationEvent, RoutingChange, GRID_REMINDER};
use crate::external::{feeds_for, refresh_feeds};
use crate::net::messages::ServerMessage;
use crate::pool::WorkerPool;
use crate::propagation::bands::{band_recommendation_message, band_to_channel, open_bands, Band};
use crate::propagation::clock::{Clock, SystemClock};
use crate::propagation::effects::{AudioEffects, RoutingDecision};
use crate::propagation::ionosphere::IonosphericModel;
use crate::propagation::locator::GridLocator;
use crate::propagation::quality::SignalQualityEngine;
use crate::propagation::random::{RandomSource, ThreadRandom};
use crate::propagation::solar::is_daytime;
use crate::routing::{AudioReceiverBuffer, PairRoutingState, RoutingTable, UserId};

/// Minimum spacing between MUF notices sent to users.
const MUF_NOTICE_INTERVAL: Duration = Duration::from_secs(60);

/// Queue a message for one client without waiting. A full queue means the
/// client is not keeping up, and the message is dropped like a lost packet.
fn offer(user_id: UserId, tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) {
    if let Err(TrySendError::Full(_)) = tx.try_send(msg) {
        debug!(user_id, "Client queue full, message dropped");
    }
}

/// When the next timed pass is due. The deadline is always derived from the
/// last run and the interval in force now, so an interval change applies
/// immediately.
#[derive(Debug)]
struct UpdateSchedule {
    last_run: Option<Instant>,
    interval: Duration,
}

impl UpdateSchedule {
    fn new(interval: Duration) -> Self {
        UpdateSchedule {
            last_run: None,
            interval,
        }
    }

    /// True (and the run recorded) when a pass is due at `now`.
    fn poll(&mut self, now: Instant, interval: Duration) -> bool {
        if interval != self.interval {
            info!(minutes = interval.as_secs() / 60, "Update interval changed");
            self.interval = interval;
        }
        let due = self.last_run.map_or(true, |last| now >= last + self.interval);
        if due {
            self.last_run = Some(now);
        }
        due
    }
}

/// A connected user as the coordinator sees it.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub id: UserId,
    pub name: String,
    pub grid: Option<GridLocator>,
    pub preferred_band: Option<Band>,
    /// Channel the user currently sits in (band channels are numbered by wavelength)
    pub channel: Option<u32>,
    pub connection_info: String,
    pub connected_at: DateTime<Utc>,
}

/// Coordinator for the HF voice server
pub struct Coordinator {
    users: Arc<RwLock<HashMap<UserId, UserSession>>>,
    /// Map username -> user id so we enforce one connection per user
    usernames: Arc<RwLock<HashMap<String, UserId>>>,
    next_user_id: Arc<RwLock<UserId>>,
    client_channels: Arc<RwLock<HashMap<UserId, mpsc::Sender<ServerMessage>>>>,

    ionosphere: Arc<IonosphericModel>,
    engine: Arc<SignalQualityEngine>,
    audio: Arc<AudioReceiverBuffer>,
    effects: AudioEffects,
    pool: Arc<WorkerPool>,
    events: EventBus,
    settings: parking_lot::RwLock<PropagationSettings>,

    /// Held for the duration of a pass
    pass_lock: tokio::sync::Mutex<()>,
    update_pending: AtomicBool,
    generation: AtomicU64,
    passes_completed: AtomicU64,

    /// Work directory for state files (conditions.json, routing.json). Empty = no file writes.
    work_dir: String,
    /// Status log interval in seconds. <= 0 = disabled.
    status_interval_secs: i32,
}

impl Coordinator {
    /// Coordinator on the system clock and thread-local randomness.
    pub fn new(
        settings: PropagationSettings,
        work_dir: String,
        status_interval: i32,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        Self::with_sources(
            settings,
            Arc::new(SystemClock),
            Arc::new(ThreadRandom),
            work_dir,
            status_interval,
        )
    }

    /// Coordinator with an injected clock and random source (tests, replays).
    pub fn with_sources(
        settings: PropagationSettings,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        work_dir: String,
        status_interval: i32,
    ) -> Result<Self, rayon::ThreadPoolBuildError> {
        let settings = settings.clamped();
        let events = EventBus::new();
        let ionosphere = Arc::new(IonosphericModel::with_state(
            settings.initial_state(),
            clock.clone(),
            events.clone(),
        ));
        ionosphere.update_season();
        let engine = Arc::new(SignalQualityEngine::new(
            ionosphere.clone(),
            random.clone(),
            clock,
            events.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(settings.worker_threads)?);

        info!(
            sfi = ionosphere.solar_flux_index(),
            k_index = ionosphere.k_index(),
            season = %ionosphere.season(),
            workers = pool.threads(),
            "Propagation engine initialized"
        );

        Ok(Coordinator {
            users: Arc::new(RwLock::new(HashMap::new())),
            usernames: Arc::new(RwLock::new(HashMap::new())),
            next_user_id: Arc::new(RwLock::new(1)),
            client_channels: Arc::new(RwLock::new(HashMap::new())),
            ionosphere,
            engine,
            audio: Arc::new(AudioReceiverBuffer::new()),
            effects: AudioEffects::new(random),
            pool,
            events,
            settings: parking_lot::RwLock::new(settings),
            pass_lock: tokio::sync::Mutex::new(()),
            update_pending: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            passes_completed: AtomicU64::new(0),
            work_dir,
            status_interval_secs: status_interval,
        })
    }

    pub fn ionosphere(&self) -> &Arc<IonosphericModel> {
        &self.ionosphere
    }

    pub fn engine(&self) -> &Arc<SignalQualityEngine> {
        &self.engine
    }

    pub fn audio(&self) -> &Arc<AudioReceiverBuffer> {
        &self.audio
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> PropagationSettings {
        self.settings.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.read().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.write().enabled = enabled;
        info!(enabled, "Propagation simulation toggled");
    }

    pub fn set_update_interval_minutes(&self, minutes: u64) {
        self.settings.write().update_interval_minutes = minutes.max(1);
    }

    /// Number of update passes that have run to completion.
    pub fn passes_completed(&self) -> u64 {
        self.passes_completed.load(Ordering::SeqCst)
    }

    /// Register a client's message channel
    pub async fn register_client(&self, user_id: UserId, tx: mpsc::Sender<ServerMessage>) {
        self.client_channels.write().await.insert(user_id, tx);
    }

    /// Unregister a client's message channel
    pub async fn unregister_client(&self, user_id: UserId) {
        self.client_channels.write().await.remove(&user_id);
    }

    /// Create work_dir and initial state files. Call once at startup.
    pub async fn init_work_dir(&self) {
        if self.work_dir.is_empty() {
            return;
        }
        let dir = Path::new(&self.work_dir);
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("Failed to create work_dir {}: {}", self.work_dir, e);
            return;
        }
        for name in &["conditions.json", "routing.json"] {
            let p = dir.join(name);
            if let Err(e) = std::fs::write(&p, "{}") {
                error!("Failed to write {}: {}", p.display(), e);
            }
        }
    }

    /// Register a new user from a handshake.
    ///
    /// Returns the session id, or Err if this username is already connected.
    pub async fn new_user(&self, name: String, connection_info: String) -> Result<UserId, String> {
        if self.usernames.read().await.contains_key(&name) {
            return Err(format!("User {} is already connected", name));
        }

        let mut next_id = self.next_user_id.write().await;
        let user_id = *next_id;
        *next_id += 1;
        drop(next_id);

        let session = UserSession {
            id: user_id,
            name: name.clone(),
            grid: None,
            preferred_band: None,
            channel: None,
            connection_info,
            connected_at: Utc::now(),
        };

        info!(user_id, user = %name, "User connected");
        self.users.write().await.insert(user_id, session);
        self.usernames.write().await.insert(name, user_id);
        Ok(user_id)
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn get_user(&self, user_id: UserId) -> Option<UserSession> {
        self.users.read().await.get(&user_id).cloned()
    }

    /// The user's locator, if set.
    pub async fn grid_locator(&self, user_id: UserId) -> Option<GridLocator> {
        self.users.read().await.get(&user_id).and_then(|u| u.grid.clone())
    }

    pub async fn preferred_band(&self, user_id: UserId) -> Option<Band> {
        self.users.read().await.get(&user_id).and_then(|u| u.preferred_band)
    }

    /// Notes that the given user has disconnected and drops every pair
    /// that involves them.
    pub async fn user_disconnect(&self, user_id: UserId) {
        let removed = {
            let mut users = self.users.write().await;
            self.audio.remove_user(user_id);
            users.remove(&user_id)
        };
        if let Some(session) = removed {
            self.usernames.write().await.remove(&session.name);
            info!(user_id, user = %session.name, "User disconnected");
        }
    }

    /// Validate and store a user's locator.
    ///
    /// An invalid locator leaves the previous one in place and sends the
    /// user a correction hint. An empty locator clears it and sends the
    /// reminder. A valid one gets a band recommendation and triggers an
    /// update pass.
    pub async fn set_grid_locator(
        self: &Arc<Self>,
        user_id: UserId,
        text: &str,
    ) -> Result<Option<GridLocator>, LocatorError> {
        let text = text.trim();
        if text.is_empty() {
            if let Some(u) = self.users.write().await.get_mut(&user_id) {
                u.grid = None;
            }
            self.send_text(user_id, GRID_REMINDER.to_string()).await;
            self.trigger_update();
            return Ok(None);
        }

        let grid = match GridLocator::parse(text) {
            Ok(g) => g,
            Err(e) => {
                warn!(user_id, grid = text, "Rejected grid locator: {}", e);
                self.send_text(user_id, e.correction_hint(text)).await;
                return Err(e);
            }
        };

        let changed = match self.users.write().await.get_mut(&user_id) {
            Some(u) => {
                let changed = u.grid.as_ref() != Some(&grid);
                u.grid = Some(grid.clone());
                changed
            }
            None => return Ok(None),
        };
        info!(user_id, grid = %grid, changed, "Grid locator set");

        self.send_band_recommendations(user_id, &grid).await;
        if changed {
            self.trigger_update();
        }
        Ok(Some(grid))
    }

    /// Record a preferred band and move the user to its channel. Anything
    /// other than one of the nine band channels is ignored.
    pub async fn set_preferred_band(&self, user_id: UserId, meters: u32) -> Option<Band> {
        let band = match Band::from_meters(meters) {
            Some(b) => b,
            None => {
                warn!(user_id, meters, "Ignoring preferred band that is not a band channel");
                return None;
            }
        };
        let mut users = self.users.write().await;
        let user = users.get_mut(&user_id)?;
        user.preferred_band = Some(band);
        user.channel = Some(band_to_channel(band));
        info!(user_id, user = %user.name, band = %band, "Moved user to preferred band channel");
        Some(band)
    }

    /// Listener-side volume for one speaker. Patched into the published
    /// pair right away; quality and the cycle's draws are left alone.
    pub fn set_volume(&self, listener: UserId, speaker: UserId, factor: f32) -> f32 {
        let factor = self.audio.apply_volume_factor(speaker, listener, factor);
        debug!(listener, speaker, factor, "Volume factor set");
        factor
    }

    async fn send_band_recommendations(&self, user_id: UserId, grid: &GridLocator) {
        let state = self.ionosphere.state();
        let daytime = is_daytime(grid, self.engine.clock().now());
        let message =
            band_recommendation_message(grid.as_str(), daytime, state.solar_flux_index, state.k_index);
        self.send_text(user_id, message).await;
    }

    async fn send_text(&self, user_id: UserId, message: String) {
        self.send_to(user_id, ServerMessage::Text { message }).await;
    }

    async fn send_to(&self, user_id: UserId, msg: ServerMessage) {
        if let Some(tx) = self.client_channels.read().await.get(&user_id) {
            offer(user_id, tx, msg);
        }
    }

    async fn broadcast_text(&self, message: String) {
        let channels = self.client_channels.read().await;
        for (user_id, tx) in channels.iter() {
            offer(*user_id, tx, ServerMessage::Text { message: message.clone() });
        }
    }

    /// Hand each listener its routing changes in order. These are never
    /// dropped: when a queue is full the remainder waits on a task of its
    /// own so the pass is not held up by a slow client.
    async fn deliver_routing_changes(&self, changes: &[RoutingChange]) {
        let mut by_listener: HashMap<UserId, Vec<ServerMessage>> = HashMap::new();
        for change in changes {
            by_listener.entry(change.listener).or_default().push(ServerMessage::Routing {
                speaker: change.speaker,
                quality: change.quality,
                blocked: change.blocked,
            });
        }

        let channels = self.client_channels.read().await;
        for (listener, messages) in by_listener {
            let Some(tx) = channels.get(&listener).cloned() else {
                continue;
            };
            let mut pending = messages.into_iter();
            while let Some(msg) = pending.next() {
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(TrySendError::Closed(_)) => break,
                    Err(TrySendError::Full(msg)) => {
                        let rest: Vec<ServerMessage> = std::iter::once(msg).chain(pending).collect();
                        debug!(listener, queued = rest.len(), "Client queue full, routing changes deferred");
                        tokio::spawn(async move {
                            for msg in rest {
                                if tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                        });
                        break;
                    }
                }
            }
        }
    }

    /// Forward one voice frame from `speaker` to every listener the current
    /// routing table lets hear it, degraded per pair.
    pub async fn handle_voice(&self, speaker: UserId, seq: u64, samples: Vec<f32>) {
        let channels: Vec<(UserId, mpsc::Sender<ServerMessage>)> = self
            .client_channels
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != speaker)
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        if !self.is_enabled() {
            for (listener, tx) in channels {
                offer(listener, &tx, ServerMessage::Voice { speaker, seq, samples: samples.clone() });
            }
            return;
        }

        let table = self.audio.table();
        let volume = self.audio.volume_adjustment(speaker);
        let channels: HashMap<UserId, mpsc::Sender<ServerMessage>> = channels.into_iter().collect();
        for (listener, state) in table.receivers_of(speaker) {
            if !state.audible() {
                trace!(speaker, listener, blocked = state.blocked, "Voice frame not delivered");
                continue;
            }
            let tx = match channels.get(&listener) {
                Some(tx) => tx.clone(),
                None => continue,
            };

            let mut frame: Vec<f32> = samples
                .iter()
                .map(|&s| volume.adjust_sample(s, state.volume_factor))
                .collect();
            self.effects.process_frame(&mut frame, state.quality, state.apply_noise);
            let msg = ServerMessage::Voice { speaker, seq, samples: frame };

            if state.apply_jitter {
                let delay = self.effects.jitter_delay(state.jitter);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    offer(listener, &tx, msg);
                });
            } else {
                offer(listener, &tx, msg);
            }
        }
    }

    /// Schedule an update pass without waiting for it.
    pub fn trigger_update(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.update_propagation().await;
        });
    }

    /// Run an update pass, or fold into one that is queued. Returns once a
    /// pass that started after this call has finished. Returns true if this
    /// call ran the pass itself.
    pub async fn update_propagation(&self) -> bool {
        self.update_pending.store(true, Ordering::SeqCst);
        let _pass = self.pass_lock.lock().await;
        if !self.update_pending.swap(false, Ordering::SeqCst) {
            debug!("Update trigger coalesced into a completed pass");
            return false;
        }
        self.run_pass().await;
        true
    }

    async fn run_pass(&self) {
        if !self.is_enabled() {
            debug!("Propagation disabled, skipping update pass");
            return;
        }

        self.ionosphere.update_season();
        self.engine.invalidate_cache();

        let (ids, grids): (Vec<UserId>, HashMap<UserId, GridLocator>) = {
            let users = self.users.read().await;
            let mut ids: Vec<UserId> = users.keys().copied().collect();
            ids.sort_unstable();
            let grids = users
                .values()
                .filter_map(|u| u.grid.clone().map(|g| (u.id, g)))
                .collect();
            (ids, grids)
        };

        let pairs: Vec<(UserId, UserId)> = ids
            .iter()
            .flat_map(|&s| ids.iter().filter(move |&&l| l != s).map(move |&l| (s, l)))
            .collect();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let engine = self.engine.clone();
        let audio = self.audio.clone();
        let pool = self.pool.clone();

        let computed = tokio::task::spawn_blocking(move || {
            let rows = pool.map_join(&pairs, |&(speaker, listener)| {
                let quality = engine.signal_quality_for(grids.get(&speaker), grids.get(&listener));
                let decision = RoutingDecision::evaluate(quality, engine.random().as_ref());
                let state = PairRoutingState::new(quality, &decision, audio.volume_factor(speaker, listener));
                debug!(
                    speaker,
                    listener,
                    quality,
                    packet_loss = state.packet_loss,
                    jitter = state.jitter,
                    noise = state.noise,
                    blocked = state.blocked,
                    dropped = state.dropped,
                    "Pair routing computed"
                );
                (speaker, listener, state)
            });
            let mut table = RoutingTable::new(generation);
            for (speaker, listener, state) in rows {
                table.insert(speaker, listener, state);
            }
            table
        })
        .await;

        let mut table = match computed {
            Ok(t) => t,
            Err(e) => {
                error!("Routing update pass failed: {}", e);
                return;
            }
        };

        // Users who left mid-pass must not reappear in the published table
        let previous = {
            let users = self.users.read().await;
            table.retain(|speaker, listener| users.contains_key(&speaker) && users.contains_key(&listener));
            self.audio.publish(table)
        };
        let current = self.audio.table();
        let pair_count = current.len();
        let changes: Vec<RoutingChange> = current
            .blocked_transitions(&previous)
            .into_iter()
            .map(|((speaker, listener), state)| {
                debug!(speaker, listener, quality = state.quality, blocked = state.blocked, "Routing changed");
                RoutingChange {
                    speaker,
                    listener,
                    quality: state.quality,
                    blocked: state.blocked,
                }
            })
            .collect();
        if !changes.is_empty() {
            self.deliver_routing_changes(&changes).await;
            self.events.publish(PropagationEvent::RoutingChanged { generation, changes });
        }

        self.passes_completed.fetch_add(1, Ordering::SeqCst);
        info!(generation, users = ids.len(), pairs = pair_count, "Routing update pass complete");
    }

    /// Fetch external feeds in the background; a successful refresh
    /// triggers a pass of its own.
    pub fn refresh_external_data(self: &Arc<Self>) {
        let state = self.ionosphere.state();
        if !state.use_external_data {
            return;
        }
        let feed_dir = self.settings.read().feed_dir.clone();
        let feeds = feeds_for(state.external_sources, feed_dir.as_deref());
        if feeds.is_empty() {
            debug!("External data enabled but no source selected");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if refresh_feeds(&feeds, &this.ionosphere, &this.events).await {
                this.update_propagation().await;
            }
        });
    }

    /// Turn engine notifications into messages for connected users.
    pub fn spawn_notifier(self: &Arc<Self>) -> JoinHandle<()> {
        let mut notices = self.events.subscribe();
        let mut measurements = self.events.subscribe_measurements();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_muf_notice: Option<Instant> = None;
            loop {
                let event = tokio::select! {
                    received = notices.recv() => match received {
                        Ok(e) => e,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Notification subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                    received = measurements.recv() => match received {
                        Ok(e) => e,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Measurement subscriber lagged");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };

                match &event {
                    PropagationEvent::ConditionsChanged { solar_flux_index, k_index, .. } => {
                        let bands: Vec<String> =
                            open_bands(*solar_flux_index, *k_index).iter().map(|b| b.to_string()).collect();
                        info!(open_bands = %bands.join(", "), "Open bands based on propagation");
                        if let Some(text) = event.user_text() {
                            this.broadcast_text(text).await;
                        }
                        this.trigger_update();
                    }
                    PropagationEvent::MufChanged { muf_mhz } => {
                        let due = last_muf_notice.map_or(true, |t| t.elapsed() >= MUF_NOTICE_INTERVAL);
                        if due {
                            last_muf_notice = Some(Instant::now());
                            if let Some(text) = event.user_text() {
                                this.broadcast_text(text).await;
                            }
                        } else {
                            trace!(muf_mhz, "MUF notice suppressed");
                        }
                    }
                    PropagationEvent::ExternalDataUpdated { .. } => {
                        if let Some(text) = event.user_text() {
                            this.broadcast_text(text).await;
                        }
                    }
                    PropagationEvent::RoutingChanged { generation, changes } => {
                        // Listeners were told by the pass itself
                        debug!(generation, changes = changes.len(), "Routing changes published");
                    }
                    PropagationEvent::SignalStrengthChanged { .. } => {}
                }
            }
        })
    }

    /// Write conditions.json and routing.json to work_dir.
    async fn write_state(&self) {
        if self.work_dir.is_empty() {
            return;
        }
        let dir = Path::new(&self.work_dir);

        let snapshot = self.ionosphere.snapshot();
        let state = snapshot.state;
        let conditions = json!({
            "solar_flux_index": state.solar_flux_index,
            "k_index": state.k_index,
            "season": state.season,
            "auto_time_enabled": state.auto_time_enabled,
            "use_external_data": state.use_external_data,
            "critical_frequency_mhz": state.critical_frequency(),
            "f_layer_height_km": state.f_layer_height(),
            "last_muf_mhz": self.engine.last_muf(),
            "open_bands": open_bands(state.solar_flux_index, state.k_index),
            "version": snapshot.version,
            "enabled": self.is_enabled(),
        });

        let routing = {
            let users = self.users.read().await;
            let table = self.audio.table();
            let mut pairs = serde_json::Map::new();
            for ((speaker, listener), pair) in table.iter() {
                let value = serde_json::to_value(pair).unwrap_or(serde_json::Value::Null);
                pairs.insert(format!("{}->{}", speaker, listener), value);
            }
            let user_list: serde_json::Map<String, serde_json::Value> = users
                .values()
                .map(|u| {
                    (
                        u.id.to_string(),
                        json!({
                            "user": u.name,
                            "grid": u.grid,
                            "preferred_band": u.preferred_band,
                            "channel": u.channel,
                            "connection": u.connection_info,
                            "connected_at": u.connected_at.to_rfc3339(),
                        }),
                    )
                })
                .collect();
            json!({
                "generation": table.generation(),
                "users": user_list,
                "pairs": pairs,
            })
        };

        debug!("write_state -> {}", self.work_dir);

        for (name, value) in [("conditions.json", conditions), ("routing.json", routing)] {
            let tmp = dir.join(format!("{}.tmp", name));
            let path = dir.join(name);
            if let Ok(s) = serde_json::to_string(&value) {
                if let Err(e) = std::fs::write(&tmp, s) {
                    warn!("write_state: failed to write {}: {}", tmp.display(), e);
                } else if let Err(e) = std::fs::rename(&tmp, &path) {
                    let _ = std::fs::remove_file(&tmp);
                    warn!("write_state: failed to rename {} -> {}: {}", tmp.display(), path.display(), e);
                }
            }
        }
    }

    /// Log status line
    async fn log_status(&self) {
        let (num_users, located) = {
            let users = self.users.read().await;
            (users.len(), users.values().filter(|u| u.grid.is_some()).count())
        };
        let table = self.audio.table();
        let audible = table.iter().filter(|(_, s)| s.audible()).count();
        let state = self.ionosphere.state();
        info!(
            "Status: ({} users {} located) ({} pairs {} audible) (SFI {} K {} {})",
            num_users,
            located,
            table.len(),
            audible,
            state.solar_flux_index,
            state.k_index,
            state.season
        );
    }

    /// Run periodic tasks: timed update passes with external refresh,
    /// status log, and write_state when enabled.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let status_secs = self.status_interval_secs;
        let mut next_status = if status_secs > 0 {
            Some(Instant::now() + Duration::from_secs(status_secs as u64))
        } else {
            None
        };
        // Write state: first time after 2s (let clients connect), then every 5s
        let write_interval_secs = 5u64;
        let mut next_write_state = if !self.work_dir.is_empty() {
            Some(Instant::now() + Duration::from_secs(2))
        } else {
            None
        };
        // First pass runs right away so the external refresh happens at startup
        let mut schedule = UpdateSchedule::new(self.settings.read().update_interval());

        loop {
            ticker.tick().await;
            let now = Instant::now();

            let interval = self.settings.read().update_interval();
            if schedule.poll(now, interval) {
                self.refresh_external_data();
                self.update_propagation().await;
            }
            if let Some(ref mut next) = next_status {
                if now >= *next {
                    *next += Duration::from_secs(status_secs as u64);
                    self.log_status().await;
                }
            }
            if let Some(ref mut next) = next_write_state {
                if now >= *next {
                    *next += Duration::from_secs(write_interval_secs);
                    self.write_state().await;
                }
            }
        }
    }
}
