//! Deterministic randomness for probabilistic tagging.
//!
//! Every random decision in the pipeline flows through this module. Streams are
//! PCG32 generators seeded from BLAKE3-derived seeds, so a run is reproducible
//! from the request seed alone and parallel units of work never share state.

use crate::chart::AdvancedNote;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

/// Creates a PCG32 RNG from a 64-bit seed
pub fn create_rng(seed: u64) -> Pcg32 {
    Pcg32::seed_from_u64(seed)
}

/// Derives an independent seed for a named component of a run
pub fn derive_seed(base_seed: u64, key: &str) -> u64 {
    let mut input = Vec::with_capacity(8 + key.len());
    input.extend_from_slice(&base_seed.to_le_bytes());
    input.extend_from_slice(key.as_bytes());

    let hash = blake3::hash(&input);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Uniform draw in [0,1) fixed by `(seed, key, index)` alone.
///
/// Used where tiers must make nested decisions: the same event gets the same
/// draw at every difficulty, so a lower keep-probability selects a subset.
pub fn keyed_unit(seed: u64, key: &str, index: u64) -> f64 {
    let mut input = Vec::with_capacity(16 + key.len());
    input.extend_from_slice(&seed.to_le_bytes());
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(&index.to_le_bytes());

    let hash = blake3::hash(&input);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    // 53 high bits give an exactly representable f64 in [0,1)
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

/// Probabilistic decision the feature passes can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    HammerPull,
    Slide,
    Ghost,
    Accent,
    Tremolo,
    Vibrato,
    Bend,
    SoloBoost,
    StarPower,
    Hold,
    Enrich,
}

/// Pluggable decision strategy behind every "should this note get feature X" call.
///
/// The default is a seeded probability table; a learned scorer can replace it
/// without touching the passes.
pub trait FeatureOracle {
    /// Decide whether `note` receives `feature`, given the configured probability
    fn decide(&mut self, feature: Feature, probability: f64, note: &AdvancedNote) -> bool;

    /// Continuous parameter for a feature (vibrato rate, bend sign, ...) in [lo, hi)
    fn parameter(&mut self, feature: Feature, lo: f64, hi: f64) -> f64;
}

/// Uniform draws from a PCG32 stream
#[derive(Debug, Clone)]
pub struct SeededOracle {
    rng: Pcg32,
}

impl SeededOracle {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: create_rng(seed),
        }
    }
}

impl FeatureOracle for SeededOracle {
    fn decide(&mut self, _feature: Feature, probability: f64, _note: &AdvancedNote) -> bool {
        let draw: f64 = self.rng.gen();
        draw < probability.clamp(0.0, 1.0)
    }

    fn parameter(&mut self, _feature: Feature, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..hi)
    }
}

/// Oracle that always answers yes or always no; handy for fixtures
#[derive(Debug, Clone, Copy)]
pub struct FixedOracle(pub bool);

impl FeatureOracle for FixedOracle {
    fn decide(&mut self, _feature: Feature, probability: f64, _note: &AdvancedNote) -> bool {
        self.0 && probability > 0.0
    }

    fn parameter(&mut self, _feature: Feature, lo: f64, hi: f64) -> f64 {
        (lo + hi) / 2.0
    }
}
