//! Configuration system for the chart generation pipeline

use crate::chart::{Difficulty, Instrument, SongSection};
use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: String,
    pub onset: OnsetConfig,
    pub tempo: TempoConfig,
    pub groove: GrooveConfig,
    pub stems: StemConfig,
    pub generation: GenerationConfig,
    pub features: FeatureConfig,
    pub scaling: ScalingConfig,
    pub harmony: HarmonyConfig,
    pub sections: SectionConfig,
    pub quality: QualityConfig,
    pub export: ExportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            onset: OnsetConfig::default(),
            tempo: TempoConfig::default(),
            groove: GrooveConfig::default(),
            stems: StemConfig::default(),
            generation: GenerationConfig::default(),
            features: FeatureConfig::default(),
            scaling: ScalingConfig::default(),
            harmony: HarmonyConfig::default(),
            sections: SectionConfig::default(),
            quality: QualityConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

/// Spectral-flux onset detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnsetConfig {
    pub window_size: usize,
    pub hop_length: usize,
    /// Adaptive threshold half-window in frames
    pub threshold_window_frames: usize,
    /// Standard deviations above the local mean
    pub threshold_k: f64,
    /// Peaks below this fraction of the strongest flux are ignored
    pub min_relative_strength: f64,
    pub relevance_weights: RelevanceWeights,
    /// Ratio by which HFC or complex-domain must dominate to classify
    pub class_margin: f64,
}

impl Default for OnsetConfig {
    fn default() -> Self {
        Self {
            window_size: 2048,
            hop_length: 512,
            threshold_window_frames: 10,
            threshold_k: 2.0,
            min_relative_strength: 0.01,
            relevance_weights: RelevanceWeights::default(),
            class_margin: 1.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevanceWeights {
    pub flux: f64,
    pub hfc: f64,
    pub complex: f64,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            flux: 0.4,
            hfc: 0.3,
            complex: 0.3,
        }
    }
}

/// Tempo estimation and beat tracking
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempoConfig {
    pub min_bpm: f64,
    pub max_bpm: f64,
    pub onset_function_resolution_ms: f64,
    /// Gaussian smoothing of the onset-strength function, in bins
    pub smoothing_sigma_bins: f64,
    pub fallback_bpm: f64,
    pub fallback_confidence: f64,
    /// A lag at a half or third of the strongest one wins when its
    /// autocorrelation reaches this fraction of the strongest
    pub subdivision_ratio: f64,
    /// Beat search radius as a fraction of the beat period
    pub beat_search_tolerance: f64,
    pub tempo_change_window_sec: f64,
    pub tempo_change_hop_sec: f64,
    pub tempo_change_threshold_bpm: f64,
    /// Below this confidence a low-confidence warning is recorded
    pub low_confidence_threshold: f64,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            min_bpm: 60.0,
            max_bpm: 200.0,
            onset_function_resolution_ms: 10.0,
            smoothing_sigma_bins: 2.0,
            fallback_bpm: 120.0,
            fallback_confidence: 0.5,
            subdivision_ratio: 0.6,
            beat_search_tolerance: 0.15,
            tempo_change_window_sec: 8.0,
            tempo_change_hop_sec: 4.0,
            tempo_change_threshold_bpm: 10.0,
            low_confidence_threshold: 0.3,
        }
    }
}

/// Groove classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrooveConfig {
    pub variance_scale: f64,
    pub complex_threshold: f64,
    pub swing_threshold: f64,
}

impl Default for GrooveConfig {
    fn default() -> Self {
        Self {
            variance_scale: 10.0,
            complex_threshold: 0.7,
            swing_threshold: 0.1,
        }
    }
}

/// Stem feature extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StemConfig {
    pub analysis_window: usize,
    pub dominant_frequency_count: usize,
    pub envelope_frame_ms: f64,
    /// Peak amplitude under which a stem counts as empty
    pub silence_threshold: f64,
}

impl Default for StemConfig {
    fn default() -> Self {
        Self {
            analysis_window: 2048,
            dominant_frequency_count: 3,
            envelope_frame_ms: 10.0,
            silence_threshold: 1e-4,
        }
    }
}

/// Value per difficulty tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierTable<T> {
    pub easy: T,
    pub medium: T,
    pub hard: T,
    pub expert: T,
}

impl<T: Copy> TierTable<T> {
    pub fn get(&self, difficulty: Difficulty) -> T {
        match difficulty {
            Difficulty::Easy => self.easy,
            Difficulty::Medium => self.medium,
            Difficulty::Hard => self.hard,
            Difficulty::Expert => self.expert,
        }
    }

    fn all(&self) -> [T; 4] {
        [self.easy, self.medium, self.hard, self.expert]
    }
}

/// Base chart generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Fraction of eligible events kept
    pub density: TierTable<f64>,
    /// Same-lane minimum spacing
    pub min_spacing_ms: TierTable<u32>,
    pub hammer_pull_candidate: TierTable<f64>,
    pub slide_candidate: TierTable<f64>,
    pub chord_candidate: TierTable<f64>,
    /// Upper bound on the gap between a melody note and its hammer/pull grace note
    pub grace_max_offset_ms: u32,
    /// Events quieter than this are not charted
    pub min_velocity: f64,
    pub hat_velocity_scale: f64,
    pub bass_hold_chance: f64,
    /// Events at least this long may become holds on sustaining instruments
    pub hold_min_duration_ms: u32,
    pub vocal_phrases: usize,
    pub quantize_to_sixteenths: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            density: TierTable {
                easy: 0.3,
                medium: 0.5,
                hard: 0.75,
                expert: 0.9,
            },
            min_spacing_ms: TierTable {
                easy: 260,
                medium: 160,
                hard: 120,
                expert: 80,
            },
            hammer_pull_candidate: TierTable {
                easy: 0.0,
                medium: 0.0,
                hard: 0.2,
                expert: 0.3,
            },
            slide_candidate: TierTable {
                easy: 0.0,
                medium: 0.0,
                hard: 0.15,
                expert: 0.25,
            },
            chord_candidate: TierTable {
                easy: 0.0,
                medium: 0.0,
                hard: 0.0,
                expert: 0.2,
            },
            grace_max_offset_ms: 120,
            min_velocity: 0.05,
            hat_velocity_scale: 0.6,
            bass_hold_chance: 0.3,
            hold_min_duration_ms: 350,
            vocal_phrases: 8,
            quantize_to_sixteenths: true,
        }
    }
}

/// Probability of each probabilistic re-tag at one tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityTable {
    pub hammer_pull: f64,
    pub slide: f64,
    pub ghost: f64,
    pub accent: f64,
    pub tremolo: f64,
    pub vibrato: f64,
    pub bend: f64,
    pub solo_boost: f64,
    pub chorus_star_power: f64,
}

impl ProbabilityTable {
    fn values(&self) -> [f64; 9] {
        [
            self.hammer_pull,
            self.slide,
            self.ghost,
            self.accent,
            self.tremolo,
            self.vibrato,
            self.bend,
            self.solo_boost,
            self.chorus_star_power,
        ]
    }
}

fn probability_table(hammer_pull: f64, slide: f64, tremolo: f64) -> ProbabilityTable {
    ProbabilityTable {
        hammer_pull,
        slide,
        ghost: 0.3,
        accent: 0.4,
        tremolo,
        vibrato: 0.4,
        bend: 0.3,
        solo_boost: 0.3,
        chorus_star_power: 0.2,
    }
}

/// Advanced feature processing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub hammer_pull_window_ms: u32,
    pub slide_min_gap_ms: u32,
    pub slide_max_gap_ms: u32,
    pub slide_min_distance: u8,
    pub chord_tolerance_ms: u32,
    pub ghost_velocity_max: f64,
    pub accent_velocity_min: f64,
    pub tremolo_duration_ms: u32,
    pub vibrato_min_hold_ms: u32,
    pub vibrato_rate_hz: [f64; 2],
    pub vibrato_depth_semitones: f64,
    pub bend_semitones: f64,
    pub solo_velocity_scale: f64,
    pub solo_glow_scale: f64,
    pub bridge_velocity_scale: f64,
    pub star_power_interval_ms: u32,
    pub overdrive_velocity_min: f64,
    pub hammer_pull_bonus: f64,
    pub slide_bonus: f64,
    pub probabilities: TierTable<ProbabilityTable>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            hammer_pull_window_ms: 150,
            slide_min_gap_ms: 200,
            slide_max_gap_ms: 800,
            slide_min_distance: 2,
            chord_tolerance_ms: 50,
            ghost_velocity_max: 0.4,
            accent_velocity_min: 0.8,
            tremolo_duration_ms: 500,
            vibrato_min_hold_ms: 1000,
            vibrato_rate_hz: [4.0, 7.0],
            vibrato_depth_semitones: 0.5,
            bend_semitones: 1.0,
            solo_velocity_scale: 1.2,
            solo_glow_scale: 1.5,
            bridge_velocity_scale: 0.8,
            star_power_interval_ms: 8000,
            overdrive_velocity_min: 0.9,
            hammer_pull_bonus: 1.5,
            slide_bonus: 1.3,
            probabilities: TierTable {
                easy: probability_table(0.05, 0.05, 0.0),
                medium: probability_table(0.15, 0.075, 0.0),
                hard: probability_table(0.25, 0.10, 0.0),
                expert: probability_table(0.40, 0.15, 0.1),
            },
        }
    }
}

/// Dynamic difficulty scaling and live adaptation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub adaptation_strength: f64,
    pub density_ceiling: f64,
    pub feature_chance_ceiling: f64,
    pub feature_weight_ceiling: f64,
    /// Fraction by which the timing window shrinks at full pressure
    pub timing_window_tightening: f64,
    pub timing_window_floor: f64,
    pub section_based_scaling: bool,
    pub lane_redistribution: bool,
    pub section_curve: Vec<f64>,
    /// Minimum gap to the next note before a tap may become a hold
    pub hold_min_gap_ms: u32,
    pub live_lookahead_ms: u32,
    pub live_simplify_below: f64,
    pub live_enrich_above: f64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            adaptation_strength: 0.5,
            density_ceiling: 1.0,
            feature_chance_ceiling: 0.8,
            feature_weight_ceiling: 1.0,
            timing_window_tightening: 0.3,
            timing_window_floor: 0.5,
            section_based_scaling: true,
            lane_redistribution: true,
            section_curve: vec![0.8, 1.0, 1.2, 1.0],
            hold_min_gap_ms: 500,
            live_lookahead_ms: 10_000,
            live_simplify_below: 0.4,
            live_enrich_above: 0.6,
        }
    }
}

/// How harmonic context shapes melody charts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonyConfig {
    /// Chords last this many bars when laid over the beat grid
    pub bars_per_chord: usize,
    pub chord_change_window_ms: u32,
    pub chord_change_velocity_boost: f64,
    /// Notes under chords tenser than this get an overdrive effect
    pub overdrive_tension: f64,
}

impl Default for HarmonyConfig {
    fn default() -> Self {
        Self {
            bars_per_chord: 1,
            chord_change_window_ms: 50,
            chord_change_velocity_boost: 1.1,
            overdrive_tension: 0.7,
        }
    }
}

/// Energy-based sectioning used when the caller supplies no sections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionConfig {
    pub bars_per_section: usize,
    /// Blocks at least this fraction of the loudest block are choruses
    pub chorus_energy_ratio: f64,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            bars_per_section: 8,
            chorus_energy_ratio: 0.75,
        }
    }
}

/// Quality metrics and recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub beat_alignment_window_ms: f64,
    pub balance_window_notes: usize,
    pub min_musical_accuracy: f64,
    pub min_harmonic_alignment: f64,
    pub min_rhythmic_coherence: f64,
    pub min_difficulty_balance: f64,
    pub min_tempo_confidence: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            beat_alignment_window_ms: 200.0,
            balance_window_notes: 10,
            min_musical_accuracy: 0.7,
            min_harmonic_alignment: 0.6,
            min_rhythmic_coherence: 0.6,
            min_difficulty_balance: 0.7,
            min_tempo_confidence: 0.5,
        }
    }
}

/// Chart export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub schema_version: u32,
    pub pretty: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            pretty: true,
        }
    }
}

/// Per-call generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartGenerationConfig {
    pub difficulties: Vec<Difficulty>,
    pub instruments: Vec<Instrument>,
    pub seed: u64,
    pub harmonic_analysis: bool,
    pub structural_analysis: bool,
    pub dynamic_difficulty: bool,
    pub real_time_adaptation: bool,
    /// Overrides the assumed 4/4
    pub time_signature: Option<(u8, u8)>,
    /// Caller-supplied sections; inferred from energy when absent
    pub sections: Option<Vec<SongSection>>,
    /// Chord symbols handed to the harmonic collaborator
    pub chord_symbols: Vec<String>,
    pub song: SongInfo,
}

impl Default for ChartGenerationConfig {
    fn default() -> Self {
        Self {
            difficulties: Difficulty::ALL.to_vec(),
            instruments: Instrument::ALL.to_vec(),
            seed: 0,
            harmonic_analysis: true,
            structural_analysis: true,
            dynamic_difficulty: true,
            real_time_adaptation: false,
            time_signature: None,
            sections: None,
            chord_symbols: Vec::new(),
            song: SongInfo::default(),
        }
    }
}

/// Song metadata carried into the export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SongInfo {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub audio_offset_ms: i32,
}

fn check_probability(name: &str, value: f64) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("{} must be within [0, 1], got {}", name, value);
    }
    Ok(())
}

/// Validate configuration parameters
pub fn validate_config(config: &Config) -> anyhow::Result<()> {
    if config.onset.window_size < 2 || config.onset.hop_length == 0 {
        anyhow::bail!("onset window_size must be >= 2 and hop_length > 0");
    }
    if config.onset.hop_length > config.onset.window_size {
        anyhow::bail!("onset hop_length must not exceed window_size");
    }
    if config.tempo.min_bpm <= 0.0 || config.tempo.min_bpm >= config.tempo.max_bpm {
        anyhow::bail!("tempo min_bpm must be > 0 and < max_bpm");
    }
    if config.tempo.onset_function_resolution_ms <= 0.0 {
        anyhow::bail!("onset_function_resolution_ms must be > 0");
    }
    if !(config.tempo.min_bpm..=config.tempo.max_bpm).contains(&config.tempo.fallback_bpm) {
        anyhow::bail!("fallback_bpm must lie within the tempo band");
    }
    check_probability("fallback_confidence", config.tempo.fallback_confidence)?;
    check_probability("beat_search_tolerance", config.tempo.beat_search_tolerance)?;
    check_probability("subdivision_ratio", config.tempo.subdivision_ratio)?;

    let densities = config.generation.density.all();
    for density in densities {
        check_probability("generation.density", density)?;
    }
    if densities.windows(2).any(|w| w[0] > w[1]) {
        anyhow::bail!("generation.density must not decrease with difficulty");
    }
    for table in [
        &config.generation.hammer_pull_candidate,
        &config.generation.slide_candidate,
        &config.generation.chord_candidate,
    ] {
        for p in table.all() {
            check_probability("generation candidate probability", p)?;
        }
    }
    if config.generation.grace_max_offset_ms == 0
        || config.generation.grace_max_offset_ms > config.features.hammer_pull_window_ms
    {
        anyhow::bail!("generation.grace_max_offset_ms must be > 0 and within features.hammer_pull_window_ms");
    }
    if config.generation.vocal_phrases == 0 {
        anyhow::bail!("generation.vocal_phrases must be > 0");
    }

    for table in config.features.probabilities.all() {
        for p in table.values() {
            check_probability("features.probabilities", p)?;
        }
    }
    if config.features.slide_min_gap_ms > config.features.slide_max_gap_ms {
        anyhow::bail!("slide_min_gap_ms must not exceed slide_max_gap_ms");
    }

    check_probability("scaling.adaptation_strength", config.scaling.adaptation_strength)?;
    check_probability("scaling.density_ceiling", config.scaling.density_ceiling)?;
    check_probability("scaling.feature_chance_ceiling", config.scaling.feature_chance_ceiling)?;
    check_probability("scaling.feature_weight_ceiling", config.scaling.feature_weight_ceiling)?;
    if config.scaling.section_curve.is_empty() {
        anyhow::bail!("scaling.section_curve must not be empty");
    }
    if config.scaling.live_simplify_below > config.scaling.live_enrich_above {
        anyhow::bail!("live_simplify_below must not exceed live_enrich_above");
    }
    if config.harmony.bars_per_chord == 0 {
        anyhow::bail!("harmony.bars_per_chord must be > 0");
    }
    check_probability("harmony.overdrive_tension", config.harmony.overdrive_tension)?;
    if config.sections.bars_per_section == 0 {
        anyhow::bail!("sections.bars_per_section must be > 0");
    }
    check_probability("sections.chorus_energy_ratio", config.sections.chorus_energy_ratio)?;
    if config.quality.balance_window_notes == 0 {
        anyhow::bail!("quality.balance_window_notes must be > 0");
    }

    Ok(())
}

/// Load configuration from JSON file
pub fn load_config<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Save configuration to JSON file
pub fn save_config<P: AsRef<std::path::Path>>(config: &Config, path: P) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
