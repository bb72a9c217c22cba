// Signal quality engine
//
// Combines distance, day/night, solar activity, geomagnetic activity,
// season and a random fading term into a quality value in [0, 1] for a pair
// of locators. Results are cached per unordered pair and stamped with the
// ionospheric version they were computed under.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::constants::MIN_COMMUNICATION_QUALITY;
use crate::events::{EventBus, PropagationEvent};
use crate::geodesy::distance_km;
use crate::propagation::clock::Clock;
use crate::propagation::ionosphere::{IonosphericModel, IonosphericSnapshot};
use crate::propagation::locator::GridLocator;
use crate::propagation::random::RandomSource;
use crate::propagation::solar::is_daytime;

/// Unordered pair key: the smaller locator always comes first.
type PairKey = (GridLocator, GridLocator);

fn pair_key(a: &GridLocator, b: &GridLocator) -> PairKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Individual multiplicative terms of a quality computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityFactors {
    pub distance: f64,
    pub time_of_day: f64,
    pub solar_activity: f64,
    pub geomagnetic: f64,
    pub season: f64,
    pub random: f64,
}

impl QualityFactors {
    pub fn new(
        snapshot: &IonosphericSnapshot,
        distance_km: f64,
        day_a: bool,
        day_b: bool,
        random: f64,
    ) -> Self {
        let state = &snapshot.state;
        let time_of_day = match (day_a, day_b) {
            (true, true) => 1.0,
            (false, false) => 0.8,
            _ => 0.5,
        };
        QualityFactors {
            distance: 1.0 / (1.0 + distance_km / 1000.0),
            time_of_day,
            solar_activity: (state.solar_flux_index as f64 / 200.0).clamp(0.1, 1.0),
            geomagnetic: (1.0 - state.k_index as f64 / 9.0).clamp(0.1, 1.0),
            season: state.season.quality_factor(),
            random,
        }
    }

    pub fn quality(&self) -> f64 {
        let q = self.distance
            * self.time_of_day
            * self.solar_activity
            * self.geomagnetic
            * self.season
            * self.random;
        q.clamp(0.0, 1.0)
    }
}

/// Cached result for one unordered pair.
#[derive(Debug, Clone, Copy, PartialEq)]
struct CachedPair {
    quality: f64,
    muf_mhz: f64,
}

#[derive(Default)]
struct QualityCache {
    version: u64,
    entries: HashMap<PairKey, CachedPair>,
}

/// Pairwise quality lookups with a coarse, version-stamped cache.
pub struct SignalQualityEngine {
    ionosphere: Arc<IonosphericModel>,
    cache: RwLock<QualityCache>,
    last_muf: Mutex<Option<f64>>,
    random: Arc<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl SignalQualityEngine {
    pub fn new(
        ionosphere: Arc<IonosphericModel>,
        random: Arc<dyn RandomSource>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let version = ionosphere.version();
        SignalQualityEngine {
            ionosphere,
            cache: RwLock::new(QualityCache {
                version,
                entries: HashMap::new(),
            }),
            last_muf: Mutex::new(None),
            random,
            clock,
            events,
        }
    }

    pub fn ionosphere(&self) -> &Arc<IonosphericModel> {
        &self.ionosphere
    }

    pub fn random(&self) -> &Arc<dyn RandomSource> {
        &self.random
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Quality in [0, 1] for a pair of locators. Both orderings resolve to
    /// the same cache entry, so the random term is drawn once per pair.
    pub fn signal_quality(&self, a: &GridLocator, b: &GridLocator) -> f64 {
        let snapshot = self.ionosphere.snapshot();
        let key = pair_key(a, b);

        {
            let cache = self.cache.read();
            if cache.version == snapshot.version {
                if let Some(hit) = cache.entries.get(&key) {
                    trace!(grid_a = %key.0, grid_b = %key.1, quality = hit.quality, "Quality cache hit");
                    return hit.quality;
                }
            }
        }

        let distance = distance_km(&key.0, &key.1);
        let now = self.clock.now();
        let factors = QualityFactors::new(
            &snapshot,
            distance,
            is_daytime(&key.0, now),
            is_daytime(&key.1, now),
            self.random.range(0.8, 1.0),
        );
        let computed = CachedPair {
            quality: factors.quality(),
            muf_mhz: snapshot.state.maximum_usable_frequency(distance),
        };

        let entry = {
            let mut cache = self.cache.write();
            if cache.version < snapshot.version {
                cache.entries.clear();
                cache.version = snapshot.version;
            }
            if cache.version == snapshot.version {
                // A concurrent miss on the same pair may have landed first
                *cache.entries.entry(key.clone()).or_insert(computed)
            } else {
                // Parameters moved on while computing; the value is still
                // consistent with the snapshot it came from but is not kept
                computed
            }
        };

        let quality = entry.quality;
        debug!(
            grid_a = %key.0,
            grid_b = %key.1,
            distance_km = distance,
            quality,
            muf_mhz = entry.muf_mhz,
            version = snapshot.version,
            "Signal quality computed"
        );
        self.events.publish(PropagationEvent::SignalStrengthChanged {
            grid_a: key.0.to_string(),
            grid_b: key.1.to_string(),
            quality,
        });

        self.publish_muf(entry.muf_mhz);
        quality
    }

    /// Missing locators mean no propagation at all.
    pub fn signal_quality_for(&self, a: Option<&GridLocator>, b: Option<&GridLocator>) -> f64 {
        match (a, b) {
            (Some(a), Some(b)) => self.signal_quality(a, b),
            _ => 0.0,
        }
    }

    pub fn can_communicate(&self, a: &GridLocator, b: &GridLocator) -> bool {
        self.signal_quality(a, b) >= MIN_COMMUNICATION_QUALITY
    }

    /// Drop every cached pair.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.write();
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.version = cache.version.max(self.ionosphere.version());
        debug!(dropped, "Signal quality cache cleared");
    }

    pub fn cached_len(&self) -> usize {
        let version = self.ionosphere.version();
        let cache = self.cache.read();
        if cache.version == version {
            cache.entries.len()
        } else {
            0
        }
    }

    /// MUF stored with the cached quality of a pair, if that pair is cached
    /// under the current ionospheric version.
    pub fn cached_muf(&self, a: &GridLocator, b: &GridLocator) -> Option<f64> {
        let version = self.ionosphere.version();
        let cache = self.cache.read();
        if cache.version != version {
            return None;
        }
        cache.entries.get(&pair_key(a, b)).map(|entry| entry.muf_mhz)
    }

    pub fn muf_for_distance(&self, distance_km: f64) -> f64 {
        self.ionosphere.maximum_usable_frequency(distance_km)
    }

    /// Last MUF announced through the event bus.
    pub fn last_muf(&self) -> Option<f64> {
        *self.last_muf.lock()
    }

    fn publish_muf(&self, muf: f64) {
        let mut last = self.last_muf.lock();
        if *last == Some(muf) {
            return;
        }
        *last = Some(muf);
        drop(last);

        debug!(muf_mhz = muf, "MUF changed");
        self.events.publish(PropagationEvent::MufChanged { muf_mhz: muf });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::clock::FixedClock;
    use crate::propagation::ionosphere::{IonosphericState, Season};
    use crate::propagation::random::{FixedRandom, SeededRandom};
    use chrono::{TimeZone, Utc};

    fn grid(s: &str) -> GridLocator {
        GridLocator::parse(s).unwrap()
    }

    /// Summer, SFI 120, K 3, 17:00 UTC (local noon at FN20), random factor 0.9
    fn engine_with(random: Arc<dyn RandomSource>) -> SignalQualityEngine {
        let clock: Arc<dyn Clock> =
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 17, 0, 0).unwrap()));
        let state = IonosphericState {
            season: Season::Summer,
            auto_time_enabled: false,
            ..IonosphericState::default()
        };
        let events = EventBus::new();
        let model = Arc::new(IonosphericModel::with_state(state, clock.clone(), events.clone()));
        SignalQualityEngine::new(model, random, clock, events)
    }

    fn engine() -> SignalQualityEngine {
        engine_with(Arc::new(FixedRandom(0.5)))
    }

    #[test]
    fn test_identical_grids_daytime_summer() {
        let e = engine();
        let q = e.signal_quality(&grid("FN20"), &grid("FN20"));
        let expected = 1.0 * 1.0 * 0.6 * (1.0 - 3.0 / 9.0) * 1.0 * 0.9;
        assert!((q - expected).abs() < 1e-9, "quality {} expected {}", q, expected);
        assert!((q - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_symmetric_and_cached() {
        let e = engine_with(Arc::new(SeededRandom::new(7)));
        let ab = e.signal_quality(&grid("FN20"), &grid("JO62qm"));
        let ba = e.signal_quality(&grid("JO62qm"), &grid("FN20"));
        assert_eq!(ab, ba);
        assert_eq!(e.cached_len(), 1);
    }

    #[test]
    fn test_k_index_change_invalidates() {
        let e = engine();
        let a = grid("FN20");
        let b = grid("FN31");
        let before = e.signal_quality(&a, &b);
        assert!(e.ionosphere().set_k_index(8));
        assert_eq!(e.cached_len(), 0);
        let after = e.signal_quality(&a, &b);
        assert!(after < before);
        // Only the geomagnetic term moved (0.667 -> clamp(0.111, 0.1, 1))
        let ratio = after / before;
        let expected = (1.0 - 8.0 / 9.0) / (1.0 - 3.0 / 9.0);
        assert!((ratio - expected).abs() < 1e-9, "ratio {} expected {}", ratio, expected);
    }

    #[test]
    fn test_sfi_and_season_change_invalidate() {
        let e = engine();
        let a = grid("FN20");
        let before = e.signal_quality(&a, &a);
        e.ionosphere().set_solar_flux_index(200);
        let after_sfi = e.signal_quality(&a, &a);
        assert!((after_sfi / before - 1.0 / 0.6).abs() < 1e-9);
        e.ionosphere().set_season(Season::Winter);
        let after_season = e.signal_quality(&a, &a);
        assert!((after_season / after_sfi - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_missing_locator_is_zero() {
        let e = engine();
        let a = grid("FN20");
        assert_eq!(e.signal_quality_for(Some(&a), None), 0.0);
        assert_eq!(e.signal_quality_for(None, Some(&a)), 0.0);
        assert_eq!(e.signal_quality_for(None, None), 0.0);
        assert_eq!(e.cached_len(), 0);
    }

    #[test]
    fn test_bounds_and_threshold() {
        let e = engine_with(Arc::new(SeededRandom::new(99)));
        let grids = ["AA00", "RR99xx", "FN20", "JO62qm", "PM95", "QF56", "IO91wm", "KP20"];
        for a in grids {
            for b in grids {
                let (a, b) = (grid(a), grid(b));
                let q = e.signal_quality(&a, &b);
                assert!((0.0..=1.0).contains(&q));
                assert_eq!(e.can_communicate(&a, &b), q >= MIN_COMMUNICATION_QUALITY);
            }
        }
    }

    #[test]
    fn test_day_night_factor() {
        let state = IonosphericState {
            season: Season::Summer,
            ..IonosphericState::default()
        };
        let snap = IonosphericSnapshot { state, version: 0 };
        assert_eq!(QualityFactors::new(&snap, 0.0, true, true, 1.0).time_of_day, 1.0);
        assert_eq!(QualityFactors::new(&snap, 0.0, false, false, 1.0).time_of_day, 0.8);
        assert_eq!(QualityFactors::new(&snap, 0.0, true, false, 1.0).time_of_day, 0.5);
        assert_eq!(QualityFactors::new(&snap, 1000.0, true, true, 1.0).distance, 0.5);
    }

    #[test]
    fn test_factor_clamps() {
        let state = IonosphericState {
            solar_flux_index: 50,
            k_index: 9,
            season: Season::Summer,
            ..IonosphericState::default()
        };
        let f = QualityFactors::new(&IonosphericSnapshot { state, version: 0 }, 0.0, true, true, 1.0);
        assert_eq!(f.solar_activity, 0.25);
        assert_eq!(f.geomagnetic, 0.1);
    }

    #[tokio::test]
    async fn test_muf_published_on_first_computation() {
        let e = engine();
        let mut rx = e.events.subscribe_measurements();
        e.signal_quality(&grid("FN20"), &grid("IO91"));
        assert!(e.last_muf().is_some());

        let mut saw_muf = false;
        let mut saw_strength = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                PropagationEvent::MufChanged { .. } => saw_muf = true,
                PropagationEvent::SignalStrengthChanged { .. } => saw_strength = true,
                _ => {}
            }
        }
        assert!(saw_muf && saw_strength);

        // Cache hit publishes nothing
        e.signal_quality(&grid("IO91"), &grid("FN20"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_concurrent_lookups_agree() {
        let e = Arc::new(engine_with(Arc::new(SeededRandom::new(3))));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let e = e.clone();
                std::thread::spawn(move || {
                    let (a, b) = if i % 2 == 0 { ("FN20", "KP20") } else { ("KP20", "FN20") };
                    e.signal_quality(&grid(a), &grid(b))
                })
            })
            .collect();
        let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let cached = e.signal_quality(&grid("FN20"), &grid("KP20"));
        // Every thread either stored or read the one retained entry, except
        // losers of the insert race which return the retained value too
        for q in results {
            assert_eq!(q, cached);
        }
    }

    #[test]
    fn test_muf_for_distance_tracks_model() {
        let e = engine();
        let muf = e.muf_for_distance(3000.0);
        assert_eq!(muf, e.ionosphere().maximum_usable_frequency(3000.0));
        assert!(muf > 5.5 && muf < 7.0, "muf {}", muf);
        e.ionosphere().set_solar_flux_index(200);
        assert!(e.muf_for_distance(3000.0) > muf);
    }

    #[test]
    fn test_muf_cached_per_pair() {
        let e = engine();
        let (a, b, c) = (grid("FN20"), grid("IO91"), grid("JO62"));
        assert_eq!(e.cached_muf(&a, &b), None);

        e.signal_quality(&a, &b);
        e.signal_quality(&a, &c);
        let ab = e.cached_muf(&b, &a).unwrap();
        let ac = e.cached_muf(&a, &c).unwrap();
        assert_eq!(ab, e.muf_for_distance(distance_km(&a, &b)));
        assert_eq!(ac, e.muf_for_distance(distance_km(&a, &c)));
        // The last published MUF belongs to the later lookup only
        assert_ne!(ab, ac);
        assert_eq!(e.last_muf(), Some(ac));

        e.ionosphere().set_k_index(6);
        assert_eq!(e.cached_muf(&a, &b), None);
    }
}
