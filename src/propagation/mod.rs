// HF propagation engine
//
// Locators, ionospheric state, pairwise signal quality, band advice and the
// audio degradation that follows from quality.

pub mod bands;
pub mod clock;
pub mod effects;
pub mod ionosphere;
pub mod locator;
pub mod quality;
pub mod random;
pub mod solar;

pub use bands::{recommend_band, Band};
pub use clock::{Clock, FixedClock, SystemClock};
pub use effects::{fading_effects, AudioEffects, FadingEffects, RoutingDecision, VolumeAdjustment};
pub use ionosphere::{IonosphericModel, IonosphericSnapshot, IonosphericState, Season};
pub use locator::{Coordinate, GridLocator};
pub use quality::SignalQualityEngine;
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
