//! Difficulty profiles and adaptive-difficulty settings

use crate::analysis::SongComplexityAnalysis;
use crate::chart::Difficulty;
use crate::config::ScalingConfig;
use serde::{Deserialize, Serialize};

/// Per-feature probabilities, each 0..1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeights {
    pub hold: f64,
    pub slide: f64,
    pub hammer_pull: f64,
    pub chord: f64,
    pub ghost: f64,
    pub accent: f64,
    pub tremolo: f64,
}

impl FeatureWeights {
    fn map(self, f: impl Fn(f64) -> f64) -> Self {
        FeatureWeights {
            hold: f(self.hold),
            slide: f(self.slide),
            hammer_pull: f(self.hammer_pull),
            chord: f(self.chord),
            ghost: f(self.ghost),
            accent: f(self.accent),
            tremolo: f(self.tremolo),
        }
    }

    pub fn values(&self) -> [f64; 7] {
        [
            self.hold,
            self.slide,
            self.hammer_pull,
            self.chord,
            self.ghost,
            self.accent,
            self.tremolo,
        ]
    }
}

/// Generation parameters of one difficulty tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DifficultyProfile {
    pub difficulty: Difficulty,
    pub density_multiplier: f64,
    pub complexity_threshold: f64,
    pub advanced_feature_chance: f64,
    pub timing_window_modifier: f64,
    /// Probability of each lane, sums to 1
    pub lane_usage_pattern: [f64; 4],
    pub max_simultaneous_notes: usize,
    pub feature_weights: FeatureWeights,
}

impl DifficultyProfile {
    /// Named preset for a tier
    pub fn preset(difficulty: Difficulty) -> Self {
        match difficulty {
            Difficulty::Easy => DifficultyProfile {
                difficulty,
                density_multiplier: 0.5,
                complexity_threshold: 0.3,
                advanced_feature_chance: 0.1,
                timing_window_modifier: 1.3,
                lane_usage_pattern: [0.4, 0.3, 0.2, 0.1],
                max_simultaneous_notes: 2,
                feature_weights: FeatureWeights {
                    hold: 0.3,
                    slide: 0.05,
                    hammer_pull: 0.05,
                    chord: 0.0,
                    ghost: 0.1,
                    accent: 0.1,
                    tremolo: 0.0,
                },
            },
            Difficulty::Medium => DifficultyProfile {
                difficulty,
                density_multiplier: 0.7,
                complexity_threshold: 0.5,
                advanced_feature_chance: 0.25,
                timing_window_modifier: 1.1,
                lane_usage_pattern: [0.3, 0.3, 0.25, 0.15],
                max_simultaneous_notes: 3,
                feature_weights: FeatureWeights {
                    hold: 0.35,
                    slide: 0.1,
                    hammer_pull: 0.15,
                    chord: 0.05,
                    ghost: 0.2,
                    accent: 0.2,
                    tremolo: 0.0,
                },
            },
            Difficulty::Hard => DifficultyProfile {
                difficulty,
                density_multiplier: 0.85,
                complexity_threshold: 0.7,
                advanced_feature_chance: 0.45,
                timing_window_modifier: 1.0,
                lane_usage_pattern: [0.25, 0.25, 0.25, 0.25],
                max_simultaneous_notes: 3,
                feature_weights: FeatureWeights {
                    hold: 0.4,
                    slide: 0.2,
                    hammer_pull: 0.25,
                    chord: 0.15,
                    ghost: 0.3,
                    accent: 0.3,
                    tremolo: 0.05,
                },
            },
            Difficulty::Expert => DifficultyProfile {
                difficulty,
                density_multiplier: 1.0,
                complexity_threshold: 0.85,
                advanced_feature_chance: 0.65,
                timing_window_modifier: 0.85,
                lane_usage_pattern: [0.25, 0.25, 0.25, 0.25],
                max_simultaneous_notes: 4,
                feature_weights: FeatureWeights {
                    hold: 0.45,
                    slide: 0.3,
                    hammer_pull: 0.4,
                    chord: 0.3,
                    ghost: 0.35,
                    accent: 0.4,
                    tremolo: 0.1,
                },
            },
        }
    }

    /// Copy of this profile scaled to a song's complexity; the preset itself is untouched
    pub fn adapted(
        &self,
        complexity: &SongComplexityAnalysis,
        adaptation_strength: f64,
        config: &ScalingConfig,
    ) -> Self {
        let pressure = (adaptation_strength * complexity.overall_complexity).clamp(0.0, 1.0);
        let factor = 1.0 + pressure;

        let mut profile = *self;
        profile.density_multiplier =
            (self.density_multiplier * factor).clamp(0.0, config.density_ceiling);
        profile.advanced_feature_chance =
            (self.advanced_feature_chance * factor).clamp(0.0, config.feature_chance_ceiling);
        profile.feature_weights = self
            .feature_weights
            .map(|w| (w * factor).clamp(0.0, config.feature_weight_ceiling));
        profile.timing_window_modifier = (self.timing_window_modifier
            * (1.0 - config.timing_window_tightening * pressure))
            .max(config.timing_window_floor);
        profile
    }

    /// Lane for a uniform draw `u` in [0,1)
    pub fn lane_for_draw(&self, u: f64) -> u8 {
        let mut acc = 0.0;
        for (lane, p) in self.lane_usage_pattern.iter().enumerate() {
            acc += p;
            if u < acc {
                return lane as u8;
            }
        }
        3
    }
}

/// How the scaler adapts a chart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveDifficultySettings {
    pub base_difficulty: Difficulty,
    /// 0..1, how strongly song complexity pushes the profile
    pub adaptation_strength: f64,
    pub real_time_adjustment: bool,
    pub section_based_scaling: bool,
    pub lane_redistribution: bool,
}

impl AdaptiveDifficultySettings {
    pub fn new(base_difficulty: Difficulty, config: &ScalingConfig) -> Self {
        AdaptiveDifficultySettings {
            base_difficulty,
            adaptation_strength: config.adaptation_strength,
            real_time_adjustment: false,
            section_based_scaling: config.section_based_scaling,
            lane_redistribution: config.lane_redistribution,
        }
    }
}

/// Live player statistics fed back by the game client
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// 0..1
    pub accuracy: f64,
    pub combo: u32,
    pub missed_notes: u32,
    pub perfect_hits: u32,
}

impl PerformanceMetrics {
    /// 0.4 accuracy + 0.3 combo + 0.2 misses + 0.1 perfects, each saturated
    pub fn score(&self) -> f64 {
        let accuracy = self.accuracy.clamp(0.0, 1.0);
        let combo = (self.combo as f64 / 50.0).min(1.0);
        let misses = (1.0 - self.missed_notes as f64 / 20.0).max(0.0);
        let perfects = (self.perfect_hits as f64 / 30.0).min(1.0);
        0.4 * accuracy + 0.3 * combo + 0.2 * misses + 0.1 * perfects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid_distributions() {
        for difficulty in Difficulty::ALL {
            let profile = DifficultyProfile::preset(difficulty);
            let sum: f64 = profile.lane_usage_pattern.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "{:?}", difficulty);
            assert!(profile.feature_weights.values().iter().all(|w| (0.0..=1.0).contains(w)));
        }
    }

    #[test]
    fn test_adaptation_respects_ceilings() {
        let config = ScalingConfig::default();
        let complexity = SongComplexityAnalysis::from_components(1.0, 1.0, 1.0, 1.0);
        let preset = DifficultyProfile::preset(Difficulty::Expert);
        let adapted = preset.adapted(&complexity, 1.0, &config);
        assert!(adapted.density_multiplier <= 1.0);
        assert!(adapted.advanced_feature_chance <= 0.8);
        assert!(adapted.timing_window_modifier < preset.timing_window_modifier);
        assert!(adapted.feature_weights.values().iter().all(|w| (0.0..=1.0).contains(w)));
        // the preset is a value, never mutated
        assert_eq!(preset, DifficultyProfile::preset(Difficulty::Expert));
    }

    #[test]
    fn test_lane_for_draw() {
        let profile = DifficultyProfile::preset(Difficulty::Easy);
        assert_eq!(profile.lane_for_draw(0.0), 0);
        assert_eq!(profile.lane_for_draw(0.45), 1);
        assert_eq!(profile.lane_for_draw(0.95), 3);
    }

    #[test]
    fn test_performance_score() {
        let perfect = PerformanceMetrics {
            accuracy: 1.0,
            combo: 100,
            missed_notes: 0,
            perfect_hits: 40,
        };
        assert!((perfect.score() - 1.0).abs() < 1e-9);
        let poor = PerformanceMetrics {
            accuracy: 0.2,
            combo: 0,
            missed_notes: 30,
            perfect_hits: 0,
        };
        assert!((poor.score() - 0.08).abs() < 1e-9);
    }
}
