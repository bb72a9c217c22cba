// Published per-pair routing state
//
// The update pass builds a complete RoutingTable off to the side and swaps
// it in with one pointer store. Voice forwarding only ever clones the
// current Arc, so it never waits on a pass in progress.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::propagation::effects::{RoutingDecision, VolumeAdjustment};

/// Session id of a connected user.
pub type UserId = u32;

/// Ordered (speaker, listener) pair.
pub type PairKey = (UserId, UserId);

/// What the audio path needs to know about one ordered pair for the
/// current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairRoutingState {
    pub quality: f64,
    pub volume_factor: f32,
    pub packet_loss: f64,
    pub jitter: f64,
    pub noise: f64,
    pub blocked: bool,
    /// This cycle's packet-loss draw came up
    pub dropped: bool,
    pub apply_noise: bool,
    pub apply_jitter: bool,
}

impl PairRoutingState {
    pub fn new(quality: f64, decision: &RoutingDecision, volume_factor: f32) -> Self {
        PairRoutingState {
            quality,
            volume_factor,
            packet_loss: decision.effects.packet_loss,
            jitter: decision.effects.jitter,
            noise: decision.effects.noise,
            blocked: decision.blocked,
            dropped: decision.dropped,
            apply_noise: decision.apply_noise,
            apply_jitter: decision.apply_jitter,
        }
    }

    /// Voice should be delivered this cycle.
    pub fn audible(&self) -> bool {
        !self.blocked && !self.dropped
    }
}

/// Immutable snapshot of every ordered pair's state, keyed by speaker so a
/// voice frame only visits that speaker's listeners.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    speakers: HashMap<UserId, HashMap<UserId, PairRoutingState>>,
    len: usize,
    generation: u64,
}

impl RoutingTable {
    pub fn new(generation: u64) -> Self {
        RoutingTable {
            speakers: HashMap::new(),
            len: 0,
            generation,
        }
    }

    pub fn insert(&mut self, speaker: UserId, listener: UserId, state: PairRoutingState) {
        if self.speakers.entry(speaker).or_default().insert(listener, state).is_none() {
            self.len += 1;
        }
    }

    pub fn get(&self, speaker: UserId, listener: UserId) -> Option<&PairRoutingState> {
        self.speakers.get(&speaker)?.get(&listener)
    }

    fn get_mut(&mut self, speaker: UserId, listener: UserId) -> Option<&mut PairRoutingState> {
        self.speakers.get_mut(&speaker)?.get_mut(&listener)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn iter(&self) -> impl Iterator<Item = (PairKey, &PairRoutingState)> {
        self.speakers
            .iter()
            .flat_map(|(s, listeners)| listeners.iter().map(move |(l, state)| ((*s, *l), state)))
    }

    /// Listeners of `speaker` with their state.
    pub fn receivers_of(&self, speaker: UserId) -> impl Iterator<Item = (UserId, &PairRoutingState)> {
        self.speakers
            .get(&speaker)
            .into_iter()
            .flat_map(|listeners| listeners.iter().map(|(l, state)| (*l, state)))
    }

    /// Pairs whose blocked flag differs between `previous` and `self`. A pair
    /// missing from `previous` counts as having been blocked.
    pub fn blocked_transitions(&self, previous: &RoutingTable) -> Vec<(PairKey, PairRoutingState)> {
        let mut changed: Vec<_> = self
            .iter()
            .filter(|((s, l), state)| {
                let was_blocked = previous.get(*s, *l).map_or(true, |p| p.blocked);
                was_blocked != state.blocked
            })
            .map(|(key, state)| (key, *state))
            .collect();
        changed.sort_by_key(|(key, _)| *key);
        changed
    }

    /// Keep only the pairs `keep` accepts.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(UserId, UserId) -> bool,
    {
        for (s, listeners) in self.speakers.iter_mut() {
            listeners.retain(|l, _| keep(*s, *l));
        }
        self.speakers.retain(|_, listeners| !listeners.is_empty());
        self.len = self.speakers.values().map(HashMap::len).sum();
    }

    fn without_user(&self, user: UserId) -> RoutingTable {
        let mut table = self.clone();
        table.retain(|s, l| s != user && l != user);
        table
    }
}

/// Owner of the published routing table and the per-speaker volume
/// adjustments.
pub struct AudioReceiverBuffer {
    published: RwLock<Arc<RoutingTable>>,
    volumes: RwLock<HashMap<UserId, VolumeAdjustment>>,
}

impl AudioReceiverBuffer {
    pub fn new() -> Self {
        AudioReceiverBuffer {
            published: RwLock::new(Arc::new(RoutingTable::default())),
            volumes: RwLock::new(HashMap::new()),
        }
    }

    /// Current table. Cheap: one read lock and an Arc clone.
    pub fn table(&self) -> Arc<RoutingTable> {
        self.published.read().clone()
    }

    pub fn get_pair_state(&self, speaker: UserId, listener: UserId) -> Option<PairRoutingState> {
        self.table().get(speaker, listener).copied()
    }

    pub fn is_receiving(&self, speaker: UserId, listener: UserId) -> bool {
        self.get_pair_state(speaker, listener)
            .is_some_and(|s| s.audible())
    }

    /// Swap in a new table, returning the one it replaced.
    pub fn publish(&self, table: RoutingTable) -> Arc<RoutingTable> {
        let table = Arc::new(table);
        let previous = std::mem::replace(&mut *self.published.write(), table.clone());
        debug!(
            pairs = table.len(),
            generation = table.generation(),
            "Routing table published"
        );
        previous
    }

    /// Forget every pair involving `user` and its volume settings.
    pub fn remove_user(&self, user: UserId) {
        {
            let mut published = self.published.write();
            let trimmed = published.without_user(user);
            *published = Arc::new(trimmed);
        }
        let mut volumes = self.volumes.write();
        volumes.remove(&user);
        for adjustment in volumes.values_mut() {
            adjustment.clear_factor_for(user);
        }
    }

    /// Volume adjustment for `speaker` (default when none was set).
    pub fn volume_adjustment(&self, speaker: UserId) -> VolumeAdjustment {
        self.volumes.read().get(&speaker).cloned().unwrap_or_default()
    }

    /// Current factor for one direction. Takes effect in the table on the
    /// next update pass.
    pub fn volume_factor(&self, speaker: UserId, listener: UserId) -> f32 {
        self.volumes
            .read()
            .get(&speaker)
            .map_or_else(|| VolumeAdjustment::default().factor_for(listener), |v| v.factor_for(listener))
    }

    pub fn set_volume_factor(&self, speaker: UserId, listener: UserId, factor: f32) {
        self.volumes
            .write()
            .entry(speaker)
            .or_default()
            .set_factor_for(listener, factor);
    }

    /// Store a factor and copy it straight into the published pair, leaving
    /// every other pair and the table generation as they are. Returns the
    /// clamped factor now in effect.
    pub fn apply_volume_factor(&self, speaker: UserId, listener: UserId, factor: f32) -> f32 {
        self.set_volume_factor(speaker, listener, factor);
        let factor = self.volume_factor(speaker, listener);

        let mut published = self.published.write();
        if published.get(speaker, listener).is_some_and(|s| s.volume_factor != factor) {
            let mut table = (**published).clone();
            if let Some(state) = table.get_mut(speaker, listener) {
                state.volume_factor = factor;
            }
            *published = Arc::new(table);
        }
        factor
    }

    pub fn set_default_volume(&self, speaker: UserId, factor: f32) {
        self.volumes
            .write()
            .entry(speaker)
            .or_default()
            .set_default_factor(factor);
    }

    pub fn clear(&self) {
        *self.published.write() = Arc::new(RoutingTable::default());
        self.volumes.write().clear();
    }
}

impl Default for AudioReceiverBuffer {
    fn default() -> Self {
        Self::new()
    }
}
