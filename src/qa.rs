//! Chart quality metrics and recommendations

use crate::analysis::BeatAnalysisResult;
use crate::audio::{finite_or, mean, std_dev};
use crate::chart::{AdvancedNote, AiInsights, ChartMetadata, MusicalChart};
use crate::config::QualityConfig;
use crate::passes::pass_4::complexity_score;
use crate::theory::HarmonicContext;
use serde::{Deserialize, Serialize};

/// Harmonic alignment reported when no harmonic context was available
pub const NEUTRAL_HARMONIC_ALIGNMENT: f64 = 0.5;

/// How close notes sit to tracked beats: 1 on the beat, falling linearly to 0
/// at `window_ms` away
pub fn musical_accuracy(notes: &[AdvancedNote], beats: &BeatAnalysisResult, window_ms: f64) -> f64 {
    if notes.is_empty() || window_ms <= 0.0 {
        return 0.0;
    }
    let window = window_ms / 1000.0;
    let scores: Vec<f64> = notes
        .iter()
        .map(|n| match beats.distance_to_nearest_beat(n.time_ms as f64 / 1000.0) {
            Some(d) => (1.0 - d / window).max(0.0),
            None => 0.0,
        })
        .collect();
    finite_or(mean(&scores), 0.0)
}

/// Share of pitched notes that agree with the harmony: chord tones score 1,
/// other in-key notes 0.5.
///
/// Charts without pitched notes are trivially aligned.
pub fn harmonic_alignment(notes: &[AdvancedNote], harmony: Option<&HarmonicContext>) -> f64 {
    let pitched: Vec<(f64, u8)> = notes
        .iter()
        .filter(|n| n.instrument.is_pitched())
        .filter_map(|n| n.pitch.map(|p| (n.time_ms as f64 / 1000.0, p)))
        .collect();
    if pitched.is_empty() {
        return 1.0;
    }
    let Some(context) = harmony else {
        return NEUTRAL_HARMONIC_ALIGNMENT;
    };
    if context.key.is_none() && context.progression.chords.is_empty() {
        return NEUTRAL_HARMONIC_ALIGNMENT;
    }

    let scores: Vec<f64> = pitched
        .iter()
        .map(|&(t, pitch)| {
            if let Some((_, chord)) = context.chord_at(t) {
                if chord.contains_pitch(pitch) {
                    return 1.0;
                }
            }
            match &context.key {
                Some(key) if key.contains(pitch % 12) => 0.5,
                // no key, no chord: nothing to disagree with
                None if context.progression.chords.is_empty() => 1.0,
                _ => 0.0,
            }
        })
        .collect();
    finite_or(mean(&scores), NEUTRAL_HARMONIC_ALIGNMENT)
}

/// How well notes fit the sixteenth-note grid of the tracked beats
pub fn rhythmic_coherence(notes: &[AdvancedNote], beats: &BeatAnalysisResult) -> f64 {
    if notes.is_empty() {
        return 0.0;
    }
    let Some(&origin) = beats.beats.first() else {
        return 0.0;
    };
    let step = beats.beat_period() / 4.0;
    if step <= 0.0 {
        return 0.0;
    }
    let offsets: Vec<f64> = notes
        .iter()
        .map(|n| {
            let phase = (n.time_ms as f64 / 1000.0 - origin) / step;
            (phase - phase.round()).abs()
        })
        .collect();
    finite_or(1.0 - 2.0 * mean(&offsets), 0.0).clamp(0.0, 1.0)
}

/// One minus the spread of complexity across consecutive windows of notes
pub fn difficulty_balance(notes: &[AdvancedNote], window_notes: usize) -> f64 {
    let windows: Vec<f64> = notes
        .chunks(window_notes.max(1))
        .map(complexity_score)
        .collect();
    if windows.len() < 2 {
        return 1.0;
    }
    finite_or(1.0 - std_dev(&windows), 0.0).clamp(0.0, 1.0)
}

/// Per-chart insight scores.
///
/// The complexity score blends the base chart's density and lane movement
/// with the technique load of the final notes.
pub fn chart_insights(
    notes: &[AdvancedNote],
    base: &ChartMetadata,
    beats: &BeatAnalysisResult,
    harmony: Option<&HarmonicContext>,
    config: &QualityConfig,
) -> AiInsights {
    if notes.is_empty() {
        return AiInsights::default();
    }
    let technique = ((complexity_score(notes) - 1.0) / 1.5).clamp(0.0, 1.0);
    AiInsights {
        complexity_score: (0.5 * base.complexity_score + 0.5 * technique).clamp(0.0, 1.0),
        musical_accuracy: musical_accuracy(notes, beats, config.beat_alignment_window_ms),
        harmonic_alignment: harmonic_alignment(notes, harmony),
        rhythmic_coherence: rhythmic_coherence(notes, beats),
        difficulty_balance: difficulty_balance(notes, config.balance_window_notes),
    }
}

/// Metrics aggregated over every non-empty chart of a generation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub chart_count: usize,
    pub empty_charts: usize,
    pub total_notes: usize,
    pub tempo_confidence: f64,
    pub musical_accuracy: f64,
    pub harmonic_alignment: f64,
    pub rhythmic_coherence: f64,
    pub difficulty_balance: f64,
    /// Mean of the four scores above
    pub overall: f64,
}

pub fn aggregate(charts: &[MusicalChart], beats: &BeatAnalysisResult) -> QualityMetrics {
    let scored: Vec<&AiInsights> = charts
        .iter()
        .filter(|c| !c.notes.is_empty())
        .map(|c| &c.ai_insights)
        .collect();
    let avg = |f: fn(&AiInsights) -> f64| -> f64 {
        let values: Vec<f64> = scored.iter().map(|i| f(i)).collect();
        finite_or(mean(&values), 0.0)
    };

    let musical_accuracy = avg(|i| i.musical_accuracy);
    let harmonic_alignment = avg(|i| i.harmonic_alignment);
    let rhythmic_coherence = avg(|i| i.rhythmic_coherence);
    let difficulty_balance = avg(|i| i.difficulty_balance);

    QualityMetrics {
        chart_count: charts.len(),
        empty_charts: charts.len() - scored.len(),
        total_notes: charts.iter().map(|c| c.notes.len()).sum(),
        tempo_confidence: beats.confidence,
        musical_accuracy,
        harmonic_alignment,
        rhythmic_coherence,
        difficulty_balance,
        overall: (musical_accuracy + harmonic_alignment + rhythmic_coherence + difficulty_balance)
            / 4.0,
    }
}

/// Human-readable suggestions from threshold checks
pub fn recommendations(
    charts: &[MusicalChart],
    metrics: &QualityMetrics,
    beats: &BeatAnalysisResult,
    config: &QualityConfig,
) -> Vec<String> {
    let mut out = Vec::new();

    if beats.used_fallback_tempo || beats.confidence < config.min_tempo_confidence {
        out.push(format!(
            "Tempo detection is unreliable (confidence {:.2}); supply a tempo hint or a cleaner mix",
            beats.confidence
        ));
    }

    for chart in charts {
        let label = format!("{} {}", chart.instrument.name(), chart.difficulty.name());
        if chart.notes.is_empty() {
            out.push(format!("{}: no notes generated; supply a stem for this instrument", label));
            continue;
        }
        let insights = &chart.ai_insights;
        if insights.musical_accuracy < config.min_musical_accuracy {
            out.push(format!(
                "{}: improve beat alignment (musical accuracy {:.2})",
                label, insights.musical_accuracy
            ));
        }
        if insights.harmonic_alignment < config.min_harmonic_alignment {
            out.push(format!(
                "{}: align pitched notes with the chord progression (harmonic alignment {:.2})",
                label, insights.harmonic_alignment
            ));
        }
        if insights.rhythmic_coherence < config.min_rhythmic_coherence {
            out.push(format!(
                "{}: quantize notes more tightly to the beat grid (rhythmic coherence {:.2})",
                label, insights.rhythmic_coherence
            ));
        }
        if insights.difficulty_balance < config.min_difficulty_balance {
            out.push(format!(
                "{}: smooth out difficulty spikes (balance {:.2})",
                label, insights.difficulty_balance
            ));
        }
    }

    if metrics.chart_count > 0 && metrics.empty_charts == metrics.chart_count {
        out.push("No chart contains notes; check the stem inputs".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::GrooveTemplate;
    use crate::chart::{Instrument, Note, NoteId, NoteType, TechniqueFlags};
    use crate::theory::{Chord, ChordProgression, MusicalKey, Mode};

    fn grid(bpm: f64, n: usize) -> BeatAnalysisResult {
        let period = 60.0 / bpm;
        let beats: Vec<f64> = (0..n).map(|i| i as f64 * period).collect();
        BeatAnalysisResult {
            bpm,
            confidence: 0.9,
            downbeats: beats.iter().step_by(4).copied().collect(),
            beats,
            time_signature: (4, 4),
            tempo_changes: Vec::new(),
            rhythmic_complexity: 0.2,
            swing_factor: 0.0,
            groove_template: GrooveTemplate::Straight,
            used_fallback_tempo: false,
            onsets: Vec::new(),
            duration_sec: n as f64 * period,
        }
    }

    fn note(id: u32, time_ms: u32, instrument: Instrument, pitch: Option<u8>) -> AdvancedNote {
        AdvancedNote::from(&Note {
            id: NoteId(id),
            time_ms,
            lane: 0,
            note_type: NoteType::Tap,
            duration_ms: None,
            velocity: 0.8,
            instrument,
            pitch,
            candidates: TechniqueFlags::default(),
        })
    }

    #[test]
    fn test_musical_accuracy() {
        let beats = grid(120.0, 16);
        let on_beat: Vec<AdvancedNote> = (0..4)
            .map(|i| note(i, i * 500, Instrument::Drums, None))
            .collect();
        assert!((musical_accuracy(&on_beat, &beats, 200.0) - 1.0).abs() < 1e-9);

        // 100 ms late scores half
        let late = vec![note(0, 600, Instrument::Drums, None)];
        assert!((musical_accuracy(&late, &beats, 200.0) - 0.5).abs() < 1e-9);
        assert_eq!(musical_accuracy(&[], &beats, 200.0), 0.0);
    }

    #[test]
    fn test_rhythmic_coherence() {
        let beats = grid(120.0, 16);
        // sixteenths at 120 BPM are 125 ms apart
        let tight: Vec<AdvancedNote> = (0..8)
            .map(|i| note(i, i * 125, Instrument::Drums, None))
            .collect();
        assert!((rhythmic_coherence(&tight, &beats) - 1.0).abs() < 1e-9);

        let loose = vec![note(0, 62, Instrument::Drums, None)];
        assert!(rhythmic_coherence(&loose, &beats) < 0.05);
    }

    #[test]
    fn test_harmonic_alignment() {
        let notes = vec![
            note(0, 0, Instrument::Melody, Some(64)),   // E: chord tone of C
            note(1, 100, Instrument::Melody, Some(62)), // D: in C major only
            note(2, 200, Instrument::Melody, Some(61)), // C#: outside
        ];
        let context = HarmonicContext {
            key: Some(MusicalKey::new(0, Mode::Major)),
            progression: ChordProgression::from_chords(vec![Chord::parse("C").unwrap()], None),
            chord_duration_sec: 2.0,
        };
        let score = harmonic_alignment(&notes, Some(&context));
        assert!((score - 0.5).abs() < 1e-9);
        assert_eq!(harmonic_alignment(&notes, None), NEUTRAL_HARMONIC_ALIGNMENT);

        let drums = vec![note(0, 0, Instrument::Drums, None)];
        assert_eq!(harmonic_alignment(&drums, Some(&context)), 1.0);
    }

    #[test]
    fn test_difficulty_balance() {
        let flat: Vec<AdvancedNote> = (0..30)
            .map(|i| note(i, i * 100, Instrument::Drums, None))
            .collect();
        assert_eq!(difficulty_balance(&flat, 10), 1.0);

        let mut spiky = flat.clone();
        for n in spiky.iter_mut().skip(10).take(10) {
            n.note_type = NoteType::Chord;
        }
        assert!(difficulty_balance(&spiky, 10) < 0.5);
        assert_eq!(difficulty_balance(&flat[..5], 10), 1.0);
    }

    #[test]
    fn test_recommendations_flag_low_scores() {
        let beats = grid(120.0, 16);
        let chart = MusicalChart {
            instrument: Instrument::Drums,
            difficulty: crate::chart::Difficulty::Easy,
            notes: vec![note(0, 250, Instrument::Drums, None)],
            combo_chains: Vec::new(),
            musical_context: crate::chart::MusicalContext {
                bpm: 120.0,
                time_signature: (4, 4),
                key: None,
                sections: Vec::new(),
                complexity: None,
                adapted_profile: None,
            },
            ai_insights: AiInsights {
                complexity_score: 0.1,
                musical_accuracy: 0.0,
                harmonic_alignment: 1.0,
                rhythmic_coherence: 1.0,
                difficulty_balance: 1.0,
            },
            adaptive_settings: None,
        };
        let charts = vec![chart];
        let metrics = aggregate(&charts, &beats);
        assert_eq!(metrics.chart_count, 1);
        assert_eq!(metrics.total_notes, 1);

        let recs = recommendations(&charts, &metrics, &beats, &QualityConfig::default());
        assert_eq!(recs.len(), 1);
        assert!(recs[0].contains("improve beat alignment"));
    }
}
