//! Rhythm-Game Chart Generation
//!
//! Turns a song mix and its instrument stems into lane-based note charts for
//! every requested instrument and difficulty. Analysis and generation are
//! deterministic for a given seed.

pub mod analysis;
pub mod audio;
pub mod chart;
pub mod config;
pub mod difficulty;
pub mod error;
pub mod export;
pub mod midi;
pub mod passes;
pub mod qa;
pub mod rng;
pub mod sections;
pub mod spectral;
pub mod theory;

pub use audio::AudioSignal;
pub use chart::{AdvancedNote, Difficulty, Instrument, MusicalChart};
pub use config::{ChartGenerationConfig, Config};
pub use error::{ChartError, PipelineWarning, Result};

use analysis::{BeatAnalysisResult, NoteEvent, SongComplexityAnalysis, StemAnalysis};
use chart::{InstrumentChart, MusicalContext, SongSection};
use difficulty::{AdaptiveDifficultySettings, PerformanceMetrics};
use passes::pass_4::EnhancedChart;
use qa::QualityMetrics;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use theory::{
    AudioFeatureHints, HarmonicAnalyzer, HarmonicContext, HarmonicInput, MusicalKey,
    SymbolicHarmony,
};
use tracing::{info, warn};

/// Cooperative cancellation shared between a caller and a running generation
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(CancellationRequested)` once cancelled
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ChartError::CancellationRequested)
        } else {
            Ok(())
        }
    }
}

/// Where an instrument's notes come from
#[derive(Debug, Clone)]
pub enum StemSource<'a> {
    /// Isolated stem audio
    Audio(AudioSignal<'a>),
    /// Pre-transcribed notes, e.g. imported from MIDI
    Events(Vec<NoteEvent>),
}

/// Intermediate results threaded through the passes of one generation
#[derive(Debug)]
pub struct SongState<'a> {
    pub song: AudioSignal<'a>,
    pub stems: Vec<(Instrument, StemSource<'a>)>,
    pub request: ChartGenerationConfig,
    pub cancel: CancellationToken,
    pub audio_hints: Option<AudioFeatureHints>,

    pub beat_analysis: Option<BeatAnalysisResult>,
    pub stem_analyses: Vec<StemAnalysis>,
    pub base_charts: Vec<InstrumentChart>,
    pub sections: Option<Vec<SongSection>>,
    pub harmony: Option<HarmonicContext>,
    pub enhanced: Vec<EnhancedChart>,
    pub complexity: Option<SongComplexityAnalysis>,
    pub warnings: Vec<PipelineWarning>,
}

impl<'a> SongState<'a> {
    pub fn new(
        song: AudioSignal<'a>,
        stems: Vec<(Instrument, StemSource<'a>)>,
        request: ChartGenerationConfig,
    ) -> Self {
        Self {
            song,
            stems,
            request,
            cancel: CancellationToken::new(),
            audio_hints: None,
            beat_analysis: None,
            stem_analyses: Vec::new(),
            base_charts: Vec::new(),
            sections: None,
            harmony: None,
            enhanced: Vec::new(),
            complexity: None,
            warnings: Vec::new(),
        }
    }
}

/// Everything one `generate_charts` call produces
#[derive(Debug, Clone)]
pub struct ChartGenerationResult {
    pub beat_analysis: BeatAnalysisResult,
    pub stem_analyses: Vec<StemAnalysis>,
    pub sections: Vec<SongSection>,
    pub key: Option<MusicalKey>,
    pub complexity: SongComplexityAnalysis,
    pub charts: Vec<MusicalChart>,
    pub quality_metrics: QualityMetrics,
    pub recommendations: Vec<String>,
    pub warnings: Vec<PipelineWarning>,
}

impl ChartGenerationResult {
    pub fn chart(&self, instrument: Instrument, difficulty: Difficulty) -> Option<&MusicalChart> {
        self.charts
            .iter()
            .find(|c| c.instrument == instrument && c.difficulty == difficulty)
    }
}

/// Map stem names (`drums`, `bass`, `other`/`melody`, `vocals`) to instruments
pub fn stems_from_named<'a>(
    named: &[(&str, AudioSignal<'a>)],
) -> Result<Vec<(Instrument, StemSource<'a>)>> {
    named
        .iter()
        .map(|(name, signal)| Ok((Instrument::from_stem_name(name)?, StemSource::Audio(*signal))))
        .collect()
}

/// Reject inputs no pass can work with, before any analysis runs
pub fn validate_request(
    song: &AudioSignal,
    stems: &[(Instrument, StemSource)],
    request: &ChartGenerationConfig,
    config: &Config,
) -> Result<()> {
    song.validate()?;
    config::validate_config(config)?;

    if request.instruments.is_empty() {
        return Err(ChartError::InvalidInput("no instruments requested".to_string()));
    }
    if request.difficulties.is_empty() {
        return Err(ChartError::InvalidInput("no difficulties requested".to_string()));
    }
    let unique: HashSet<Instrument> = request.instruments.iter().copied().collect();
    if unique.len() != request.instruments.len() {
        return Err(ChartError::InvalidInput("instrument requested twice".to_string()));
    }
    let unique: HashSet<Difficulty> = request.difficulties.iter().copied().collect();
    if unique.len() != request.difficulties.len() {
        return Err(ChartError::InvalidInput("difficulty requested twice".to_string()));
    }
    if let Some((num, den)) = request.time_signature {
        if num == 0 || den == 0 || !den.is_power_of_two() {
            return Err(ChartError::InvalidInput(format!(
                "invalid time signature {}/{}",
                num, den
            )));
        }
    }

    let mut seen = HashSet::new();
    for (instrument, source) in stems {
        if !seen.insert(*instrument) {
            return Err(ChartError::InvalidInput(format!(
                "more than one stem for {}",
                instrument.name()
            )));
        }
        if let StemSource::Audio(signal) = source {
            // an empty stem is tolerated and yields an empty chart
            if signal.sample_rate == 0 || signal.channels == 0 {
                return Err(ChartError::InvalidInput(format!(
                    "{} stem has no sample rate or channels",
                    instrument.name()
                )));
            }
        }
    }

    if let Some(given) = &request.sections {
        sections::validate_sections(given)?;
    }
    Ok(())
}

/// Chart generation pipeline
pub struct ChartPipeline {
    config: Config,
    analyzer: Box<dyn HarmonicAnalyzer>,
    hints: Option<AudioFeatureHints>,
    cancel: CancellationToken,
}

impl ChartPipeline {
    /// Create a pipeline with the built-in harmonic analyzer
    pub fn new(config: Config) -> Self {
        Self {
            config,
            analyzer: Box::new(SymbolicHarmony::default()),
            hints: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Substitute an external music-theory engine
    pub fn with_harmonic_analyzer(mut self, analyzer: Box<dyn HarmonicAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Coarse estimates from an audio-feature service
    pub fn with_hints(mut self, hints: AudioFeatureHints) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Generate charts for every requested instrument and difficulty
    pub fn generate_charts(
        &self,
        song: &AudioSignal,
        stems: &[(Instrument, StemSource)],
        request: &ChartGenerationConfig,
    ) -> Result<ChartGenerationResult> {
        validate_request(song, stems, request, &self.config)?;
        self.cancel.check()?;

        info!(
            "Generating charts: {} instruments x {} difficulties, seed {}",
            request.instruments.len(),
            request.difficulties.len(),
            request.seed
        );

        let mut state = SongState::new(*song, stems.to_vec(), request.clone());
        state.cancel = self.cancel.clone();
        state.audio_hints = self.hints.clone();

        self.run_pipeline(&mut state)?;
        self.assemble(state)
    }

    /// Execute the passes in order, folding in structure and harmony between them
    fn run_pipeline(&self, state: &mut SongState) -> Result<()> {
        // Pass 1: Onset & Beat Analysis
        passes::pass_1::run(state, &self.config)?;
        state.cancel.check()?;

        // Pass 2: Stem Feature Extraction
        passes::pass_2::run(state, &self.config)?;
        state.cancel.check()?;

        self.resolve_sections(state);
        self.resolve_harmony(state)?;
        state.cancel.check()?;

        // Pass 3: Instrument Chart Generation
        passes::pass_3::run(state, &self.config)?;

        // Pass 4: Advanced Feature Processing
        passes::pass_4::run(state, &self.config)?;

        if let Some(beats) = &state.beat_analysis {
            state.complexity = Some(passes::pass_5::song_complexity(
                beats,
                state.harmony.as_ref(),
                state.sections.as_deref(),
            ));
        }

        // Pass 5: Dynamic Difficulty Scaling
        if state.request.dynamic_difficulty {
            passes::pass_5::run(state, &self.config)?;
        } else if state.request.real_time_adaptation {
            for chart in &mut state.enhanced {
                let mut settings =
                    AdaptiveDifficultySettings::new(chart.difficulty, &self.config.scaling);
                settings.real_time_adjustment = true;
                chart.adaptive_settings = Some(settings);
            }
        }
        state.cancel.check()?;

        Ok(())
    }

    /// Caller sections win; otherwise infer them when structural analysis is on
    fn resolve_sections(&self, state: &mut SongState) {
        if state.request.sections.is_some() {
            state.sections = state.request.sections.clone();
        } else if state.request.structural_analysis {
            if let Some(beats) = &state.beat_analysis {
                let inferred = sections::infer_sections(beats, &self.config.sections);
                info!("  Inferred {} song sections", inferred.len());
                state.sections = Some(inferred);
            }
        }
    }

    /// Ask the harmonic collaborator for a key and progression and lay the
    /// chords over the beat grid
    fn resolve_harmony(&self, state: &mut SongState) -> Result<()> {
        if !state.request.harmonic_analysis {
            return Ok(());
        }
        let Some(beats) = &state.beat_analysis else {
            return Ok(());
        };

        let symbols = &state.request.chord_symbols;
        let input = if symbols.is_empty() {
            HarmonicInput::Audio(state.song)
        } else {
            HarmonicInput::ChordSymbols(symbols)
        };
        let mut key = self.analyzer.analyze_key(&input)?;
        if key.is_none() {
            let hinted = state.audio_hints.as_ref().and_then(|h| h.key.as_deref());
            if let Some(text) = hinted {
                match MusicalKey::parse(text) {
                    Ok(parsed) => key = Some(parsed),
                    Err(e) => warn!("  Ignoring key hint '{}': {}", text, e),
                }
            }
        }
        let progression = self.analyzer.analyze_progression(symbols, key.as_ref())?;

        if key.is_none() && progression.chords.is_empty() {
            return Ok(());
        }
        let numerator = beats.time_signature.0.max(1) as f64;
        let chord_duration_sec =
            self.config.harmony.bars_per_chord.max(1) as f64 * numerator * beats.beat_period();

        info!(
            "  Harmony: key {}, {} chords (complexity {:.2})",
            key.as_ref().map_or("unknown", |k| k.name.as_str()),
            progression.chords.len(),
            progression.complexity
        );
        state.harmony = Some(HarmonicContext {
            key,
            progression,
            chord_duration_sec,
        });
        Ok(())
    }

    /// Attach musical context and quality insights to the scaled charts
    fn assemble(&self, state: SongState) -> Result<ChartGenerationResult> {
        let beat_analysis = state.beat_analysis.ok_or_else(|| {
            ChartError::InvalidInput("beat analysis did not run".to_string())
        })?;
        let sections = state.sections.unwrap_or_default();
        let key = state.harmony.as_ref().and_then(|h| h.key.clone());
        let complexity = state.complexity.unwrap_or_else(|| {
            passes::pass_5::song_complexity(&beat_analysis, state.harmony.as_ref(), None)
        });

        let charts: Vec<MusicalChart> = state
            .enhanced
            .into_iter()
            .map(|chart| {
                let ai_insights = qa::chart_insights(
                    &chart.notes,
                    &chart.base_metadata,
                    &beat_analysis,
                    state.harmony.as_ref(),
                    &self.config.quality,
                );
                MusicalChart {
                    instrument: chart.instrument,
                    difficulty: chart.difficulty,
                    notes: chart.notes,
                    combo_chains: chart.combo_chains,
                    musical_context: MusicalContext {
                        bpm: beat_analysis.bpm,
                        time_signature: beat_analysis.time_signature,
                        key: key.clone(),
                        sections: sections.clone(),
                        complexity: Some(complexity),
                        adapted_profile: chart.adapted_profile,
                    },
                    ai_insights,
                    adaptive_settings: chart.adaptive_settings,
                }
            })
            .collect();

        let quality_metrics = qa::aggregate(&charts, &beat_analysis);
        let recommendations =
            qa::recommendations(&charts, &quality_metrics, &beat_analysis, &self.config.quality);

        info!(
            "Generated {} charts, {} notes (quality {:.2})",
            charts.len(),
            quality_metrics.total_notes,
            quality_metrics.overall
        );
        for rec in &recommendations {
            info!("  Recommendation: {}", rec);
        }

        Ok(ChartGenerationResult {
            beat_analysis,
            stem_analyses: state.stem_analyses,
            sections,
            key,
            complexity,
            charts,
            quality_metrics,
            recommendations,
            warnings: state.warnings,
        })
    }

    /// Re-shape the notes the player has not reached yet from live performance.
    ///
    /// Only charts generated with real-time adaptation can adapt; others come
    /// back unchanged.
    pub fn adapt_to_performance(
        &self,
        chart: &MusicalChart,
        metrics: &PerformanceMetrics,
        presented_until_ms: u32,
    ) -> MusicalChart {
        let mut adapted = chart.clone();
        if chart.adaptive_settings.map_or(false, |s| s.real_time_adjustment) {
            adapted.notes = passes::pass_5::adapt_to_performance(
                &chart.notes,
                metrics,
                presented_until_ms,
                &self.config.scaling,
            );
            adapted.combo_chains =
                passes::pass_4::build_combo_chains(&adapted.notes, &self.config.features);
        }
        adapted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(ChartError::CancellationRequested)));
    }

    #[test]
    fn test_stems_from_named() {
        let samples = vec![0.0f32; 16];
        let signal = AudioSignal::mono(&samples, 44100);
        let stems = stems_from_named(&[("drums", signal), ("other", signal)]).unwrap();
        assert_eq!(stems[0].0, Instrument::Drums);
        assert_eq!(stems[1].0, Instrument::Melody);
        assert!(matches!(
            stems_from_named(&[("kazoo", signal)]),
            Err(ChartError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn test_validate_request() {
        let samples = vec![0.0f32; 44100];
        let song = AudioSignal::mono(&samples, 44100);
        let config = Config::default();
        let request = ChartGenerationConfig::default();
        assert!(validate_request(&song, &[], &request, &config).is_ok());

        let empty = AudioSignal::mono(&[], 44100);
        assert!(matches!(
            validate_request(&empty, &[], &request, &config),
            Err(ChartError::InvalidInput(_))
        ));

        let mut twice = request.clone();
        twice.instruments = vec![Instrument::Bass, Instrument::Bass];
        assert!(validate_request(&song, &[], &twice, &config).is_err());

        let mut bad_meter = request.clone();
        bad_meter.time_signature = Some((7, 6));
        assert!(validate_request(&song, &[], &bad_meter, &config).is_err());
    }
}
