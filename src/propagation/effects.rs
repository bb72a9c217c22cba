// Audio degradation derived from signal quality
//
// fading_effects() maps quality to packet loss, jitter and noise. The
// AudioEffects processor applies fading and static per sample, and
// VolumeAdjustment carries the per-listener gain factors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ADJUSTMENT_FACTOR, JITTER_THRESHOLD, MAX_ADJUSTMENT_FACTOR, MIN_ADJUSTMENT_FACTOR,
    MIN_COMMUNICATION_QUALITY, NOISE_THRESHOLD,
};
use crate::propagation::random::RandomSource;

/// Longest extra delay added to a voice frame at full jitter
pub const MAX_JITTER_DELAY_MS: f64 = 120.0;

/// Degradation parameters for one pair, all in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FadingEffects {
    pub packet_loss: f64,
    pub jitter: f64,
    pub noise: f64,
}

/// All three terms are the linear complement of quality.
pub fn fading_effects(quality: f64) -> FadingEffects {
    let degradation = (1.0 - quality).clamp(0.0, 1.0);
    FadingEffects {
        packet_loss: degradation,
        jitter: degradation,
        noise: degradation,
    }
}

/// Per-cycle routing verdict for one ordered (speaker, listener) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingDecision {
    pub effects: FadingEffects,
    /// Below the communication floor; nothing is delivered
    pub blocked: bool,
    /// Lost to this cycle's packet-loss draw
    pub dropped: bool,
    pub apply_noise: bool,
    pub apply_jitter: bool,
}

impl RoutingDecision {
    /// Evaluate once per update cycle; a single draw gates the whole cycle.
    pub fn evaluate(quality: f64, random: &dyn RandomSource) -> Self {
        let effects = fading_effects(quality);
        let blocked = quality < MIN_COMMUNICATION_QUALITY;
        let dropped = !blocked && random.unit() < effects.packet_loss;
        RoutingDecision {
            effects,
            blocked,
            dropped,
            apply_noise: !blocked && effects.noise > NOISE_THRESHOLD,
            apply_jitter: !blocked && effects.jitter > JITTER_THRESHOLD,
        }
    }

    pub fn audible(&self) -> bool {
        !self.blocked && !self.dropped
    }
}

/// Sample-level fading and static.
#[derive(Clone)]
pub struct AudioEffects {
    random: Arc<dyn RandomSource>,
}

impl AudioEffects {
    pub fn new(random: Arc<dyn RandomSource>) -> Self {
        AudioEffects { random }
    }

    /// Blend in uniform noise. `quality_percent` is 0..=100; at 95 and up
    /// the sample passes through untouched.
    pub fn apply_static(&self, sample: f32, quality_percent: i32) -> f32 {
        if quality_percent >= 95 {
            return sample;
        }
        let intensity = (1.0 - quality_percent.clamp(0, 100) as f32 / 100.0).powi(2);
        let noise = self.random.range(-1.0, 1.0) as f32;
        sample * (1.0 - intensity) + noise * intensity * 0.3
    }

    /// Random amplitude dip of up to half of `fade_level`.
    pub fn apply_fading(&self, sample: f32, fade_level: f32) -> f32 {
        if fade_level < 0.05 {
            return sample;
        }
        let modulation = 1.0 - fade_level * 0.5 * self.random.unit() as f32;
        sample * modulation
    }

    /// Fading at `1 - quality`, then static at the rounded percentage.
    pub fn apply_propagation_effects(&self, sample: f32, quality: f64) -> f32 {
        let quality = quality.clamp(0.0, 1.0);
        let faded = self.apply_fading(sample, (1.0 - quality) as f32);
        self.apply_static(faded, (quality * 100.0).round() as i32)
    }

    /// Degrade a whole frame in place according to a routing decision.
    pub fn process_frame(&self, samples: &mut [f32], quality: f64, noise: bool) {
        let quality = quality.clamp(0.0, 1.0);
        let fade_level = (1.0 - quality) as f32;
        let percent = (quality * 100.0).round() as i32;
        for s in samples.iter_mut() {
            *s = self.apply_fading(*s, fade_level);
            if noise {
                *s = self.apply_static(*s, percent);
            }
        }
    }

    /// Extra delivery delay for a frame on a jittery path.
    pub fn jitter_delay(&self, jitter: f64) -> Duration {
        let ms = jitter.clamp(0.0, 1.0) * MAX_JITTER_DELAY_MS * self.random.unit();
        Duration::from_micros((ms * 1000.0) as u64)
    }
}

/// How a factor is applied to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdjustmentKind {
    #[default]
    Normal,
    Multiplicative,
    Logarithmic,
    UserSpecific,
}

/// Gain applied to a speaker's audio, with optional per-listener overrides.
/// Factors are clamped to 0..=10 whenever they are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAdjustment {
    kind: AdjustmentKind,
    default_factor: f32,
    per_listener: HashMap<u32, f32>,
}

impl Default for VolumeAdjustment {
    fn default() -> Self {
        VolumeAdjustment::new(AdjustmentKind::Normal)
    }
}

impl VolumeAdjustment {
    pub fn new(kind: AdjustmentKind) -> Self {
        VolumeAdjustment {
            kind,
            default_factor: DEFAULT_ADJUSTMENT_FACTOR,
            per_listener: HashMap::new(),
        }
    }

    pub fn kind(&self) -> AdjustmentKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: AdjustmentKind) {
        self.kind = kind;
    }

    pub fn adjust_sample(&self, sample: f32, factor: f32) -> f32 {
        match self.kind {
            AdjustmentKind::Logarithmic => sample * 2f32.powf(factor),
            AdjustmentKind::Normal | AdjustmentKind::Multiplicative | AdjustmentKind::UserSpecific => {
                sample * factor
            }
        }
    }

    pub fn default_factor(&self) -> f32 {
        self.default_factor
    }

    pub fn set_default_factor(&mut self, factor: f32) {
        self.default_factor = clamp_factor(factor);
    }

    /// Override for `listener`, falling back to the default factor.
    pub fn factor_for(&self, listener: u32) -> f32 {
        self.per_listener
            .get(&listener)
            .copied()
            .unwrap_or(self.default_factor)
    }

    pub fn set_factor_for(&mut self, listener: u32, factor: f32) {
        self.per_listener.insert(listener, clamp_factor(factor));
    }

    pub fn clear_factor_for(&mut self, listener: u32) {
        self.per_listener.remove(&listener);
    }

    pub fn adjust_for(&self, sample: f32, listener: u32) -> f32 {
        self.adjust_sample(sample, self.factor_for(listener))
    }
}

/// NaN is treated as the default factor.
fn clamp_factor(factor: f32) -> f32 {
    if factor.is_nan() {
        return DEFAULT_ADJUSTMENT_FACTOR;
    }
    factor.clamp(MIN_ADJUSTMENT_FACTOR, MAX_ADJUSTMENT_FACTOR)
}

pub fn db_to_factor(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Negative infinity for non-positive factors.
pub fn factor_to_db(factor: f32) -> f32 {
    if factor <= 0.0 {
        return f32::NEG_INFINITY;
    }
    20.0 * factor.log10()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propagation::random::FixedRandom;

    fn effects(value: f64) -> AudioEffects {
        AudioEffects::new(Arc::new(FixedRandom(value)))
    }

    #[test]
    fn test_fading_effects_linear() {
        let e = fading_effects(0.8);
        assert!((e.packet_loss - 0.2).abs() < 1e-12);
        assert_eq!(e.packet_loss, e.jitter);
        assert_eq!(e.jitter, e.noise);

        assert_eq!(fading_effects(1.5).noise, 0.0);
        assert_eq!(fading_effects(-0.5).noise, 1.0);
    }

    #[test]
    fn test_static_passthrough_for_strong_signal() {
        let fx = effects(0.9);
        assert_eq!(fx.apply_static(0.5, 95), 0.5);
        assert_eq!(fx.apply_static(0.5, 100), 0.5);
    }

    #[test]
    fn test_static_blend() {
        // u = 0.5 -> noise sample 0
        let fx = effects(0.5);
        let out = fx.apply_static(0.8, 50);
        assert!((out - 0.8 * 0.75).abs() < 1e-6);

        // u = 0 -> noise sample -1
        let fx = effects(0.0);
        let out = fx.apply_static(0.0, 0);
        assert!((out + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_fading() {
        assert_eq!(effects(1.0).apply_fading(0.6, 0.04), 0.6);
        assert_eq!(effects(0.0).apply_fading(0.6, 0.9), 0.6);
        let out = effects(1.0).apply_fading(1.0, 0.8);
        assert!((out - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_propagation_effects_order() {
        // fade 0.5 with u=0.5 -> x0.875, then static at 50% with zero noise -> x0.75
        let out = effects(0.5).apply_propagation_effects(1.0, 0.5);
        assert!((out - 0.875 * 0.75).abs() < 1e-6);
        assert_eq!(effects(0.5).apply_propagation_effects(0.3, 1.0), 0.3);
    }

    #[test]
    fn test_routing_decision() {
        let never = FixedRandom(0.99);
        let blocked = RoutingDecision::evaluate(0.04, &never);
        assert!(blocked.blocked && !blocked.audible());
        assert!(!blocked.apply_noise && !blocked.apply_jitter);

        let clear = RoutingDecision::evaluate(0.95, &never);
        assert!(clear.audible());
        assert!(!clear.apply_noise && !clear.apply_jitter);

        let noisy = RoutingDecision::evaluate(0.85, &never);
        assert!(noisy.apply_noise && !noisy.apply_jitter);

        let poor = RoutingDecision::evaluate(0.3, &FixedRandom(0.1));
        assert!(poor.dropped && !poor.blocked);
        assert!(poor.apply_noise && poor.apply_jitter);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let d = RoutingDecision::evaluate(MIN_COMMUNICATION_QUALITY, &FixedRandom(0.99));
        assert!(!d.blocked);
    }

    #[test]
    fn test_volume_factor_clamped_on_write() {
        let mut v = VolumeAdjustment::default();
        assert_eq!(v.default_factor(), 1.0);
        v.set_default_factor(42.0);
        assert_eq!(v.default_factor(), 10.0);
        v.set_default_factor(-3.0);
        assert_eq!(v.default_factor(), 0.0);
        v.set_factor_for(7, f32::INFINITY);
        assert_eq!(v.factor_for(7), 10.0);
        v.set_factor_for(8, f32::NAN);
        assert_eq!(v.factor_for(8), 1.0);
        assert_eq!(v.factor_for(9), 0.0);
        v.clear_factor_for(7);
        assert_eq!(v.factor_for(7), 0.0);
    }

    #[test]
    fn test_adjust_sample_kinds() {
        let mut v = VolumeAdjustment::new(AdjustmentKind::Multiplicative);
        assert_eq!(v.adjust_sample(0.25, 2.0), 0.5);
        v.set_kind(AdjustmentKind::Logarithmic);
        assert_eq!(v.adjust_sample(0.25, 2.0), 1.0);
        v.set_kind(AdjustmentKind::UserSpecific);
        v.set_factor_for(3, 0.5);
        assert_eq!(v.adjust_for(0.5, 3), 0.25);
        assert_eq!(v.adjust_for(0.5, 4), 0.5);
    }

    #[test]
    fn test_db_conversions() {
        assert!((db_to_factor(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_factor(20.0) - 10.0).abs() < 1e-4);
        assert!((factor_to_db(10.0) - 20.0).abs() < 1e-4);
        assert_eq!(factor_to_db(0.0), f32::NEG_INFINITY);
        assert_eq!(factor_to_db(-1.0), f32::NEG_INFINITY);
    }

    #[test]
    fn test_jitter_delay_bounds() {
        assert_eq!(effects(0.0).jitter_delay(1.0), Duration::ZERO);
        let d = effects(0.5).jitter_delay(1.0);
        assert_eq!(d, Duration::from_millis(60));
    }
}
