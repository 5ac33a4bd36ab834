//! Analysis results: onsets, beat grid, stem features, song complexity

use crate::chart::Instrument;
use serde::{Deserialize, Serialize};

/// Onset character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnsetClass {
    Percussive,
    Harmonic,
    Complex,
}

/// Detected moment of musical attack
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Onset {
    /// Seconds
    pub time: f64,
    /// Normalized spectral flux at the peak, 0..1
    pub strength: f64,
    pub class: OnsetClass,
    /// 0.4 flux + 0.3 hfc + 0.3 complex-domain, each normalized
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoChange {
    /// Window start in seconds
    pub time: f64,
    pub bpm: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrooveTemplate {
    Straight,
    Swing,
    Complex,
}

/// Tempo, beat grid and groove of one audio channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatAnalysisResult {
    pub bpm: f64,
    pub confidence: f64,
    /// Strictly increasing, seconds
    pub beats: Vec<f64>,
    /// Subset of `beats`
    pub downbeats: Vec<f64>,
    pub time_signature: (u8, u8),
    pub tempo_changes: Vec<TempoChange>,
    pub rhythmic_complexity: f64,
    pub swing_factor: f64,
    pub groove_template: GrooveTemplate,
    /// True when tempo estimation fell back to the default tempo
    pub used_fallback_tempo: bool,
    pub onsets: Vec<Onset>,
    /// Duration of the analyzed signal in seconds
    pub duration_sec: f64,
}

impl BeatAnalysisResult {
    /// Seconds per beat
    pub fn beat_period(&self) -> f64 {
        if self.bpm > 0.0 {
            60.0 / self.bpm
        } else {
            0.5
        }
    }

    /// Distance in seconds from `time` to the nearest tracked beat
    pub fn distance_to_nearest_beat(&self, time: f64) -> Option<f64> {
        if self.beats.is_empty() {
            return None;
        }
        let idx = self.beats.partition_point(|&b| b < time);
        let mut best = f64::INFINITY;
        if idx < self.beats.len() {
            best = best.min((self.beats[idx] - time).abs());
        }
        if idx > 0 {
            best = best.min((time - self.beats[idx - 1]).abs());
        }
        Some(best)
    }
}

/// Raw per-stem attack event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Seconds
    pub time: f64,
    /// MIDI pitch, 0 when unpitched or silent
    pub pitch: u8,
    /// 0..1
    pub velocity: f64,
    /// Seconds
    pub duration: f64,
    pub confidence: f64,
}

/// Coarse rhythmic descriptors of a stem
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RhythmicPattern {
    /// Envelope attacks per second
    pub onset_density: f64,
    /// Off-beat energy share, 0..1
    pub syncopation: f64,
    /// 1 - coefficient of variation of on-beat energy, 0..1
    pub regularity: f64,
}

/// Features of one instrument stem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemAnalysis {
    pub instrument: Instrument,
    /// Strongest spectral peaks in Hz, strongest first
    pub dominant_frequencies: Vec<f64>,
    pub rhythmic_pattern: RhythmicPattern,
    pub note_events: Vec<NoteEvent>,
}

impl StemAnalysis {
    /// Analysis for a stem with no usable audio
    pub fn empty(instrument: Instrument) -> Self {
        StemAnalysis {
            instrument,
            dominant_frequencies: Vec::new(),
            rhythmic_pattern: RhythmicPattern::default(),
            note_events: Vec::new(),
        }
    }

    /// Build an analysis from externally transcribed note events (e.g. a MIDI stem)
    pub fn from_note_events(instrument: Instrument, mut note_events: Vec<NoteEvent>) -> Self {
        note_events.sort_by(|a, b| a.time.total_cmp(&b.time));
        let span = match (note_events.first(), note_events.last()) {
            (Some(first), Some(last)) => (last.time + last.duration - first.time).max(1e-3),
            _ => 1.0,
        };
        let onset_density = note_events.len() as f64 / span;
        StemAnalysis {
            instrument,
            dominant_frequencies: Vec::new(),
            rhythmic_pattern: RhythmicPattern {
                onset_density,
                syncopation: 0.0,
                regularity: 1.0,
            },
            note_events,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.note_events.is_empty()
    }
}

/// Weighted tempo/rhythmic/harmonic/structural difficulty of a song
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SongComplexityAnalysis {
    pub tempo_complexity: f64,
    pub rhythmic_complexity: f64,
    pub harmonic_complexity: f64,
    pub structural_complexity: f64,
    pub overall_complexity: f64,
}

impl SongComplexityAnalysis {
    /// Combine the four components with weights 0.25/0.35/0.25/0.15
    pub fn from_components(tempo: f64, rhythmic: f64, harmonic: f64, structural: f64) -> Self {
        let tempo = tempo.clamp(0.0, 1.0);
        let rhythmic = rhythmic.clamp(0.0, 1.0);
        let harmonic = harmonic.clamp(0.0, 1.0);
        let structural = structural.clamp(0.0, 1.0);
        let overall = 0.25 * tempo + 0.35 * rhythmic + 0.25 * harmonic + 0.15 * structural;
        SongComplexityAnalysis {
            tempo_complexity: tempo,
            rhythmic_complexity: rhythmic,
            harmonic_complexity: harmonic,
            structural_complexity: structural,
            overall_complexity: overall.clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(beats: Vec<f64>) -> BeatAnalysisResult {
        BeatAnalysisResult {
            bpm: 120.0,
            confidence: 1.0,
            downbeats: Vec::new(),
            beats,
            time_signature: (4, 4),
            tempo_changes: Vec::new(),
            rhythmic_complexity: 0.0,
            swing_factor: 0.0,
            groove_template: GrooveTemplate::Straight,
            used_fallback_tempo: false,
            onsets: Vec::new(),
            duration_sec: 2.0,
        }
    }

    #[test]
    fn test_distance_to_nearest_beat() {
        let result = grid(vec![0.0, 0.5, 1.0]);
        assert!((result.distance_to_nearest_beat(0.6).unwrap() - 0.1).abs() < 1e-9);
        assert!((result.distance_to_nearest_beat(1.7).unwrap() - 0.7).abs() < 1e-9);
        assert!(grid(Vec::new()).distance_to_nearest_beat(0.3).is_none());
    }

    #[test]
    fn test_complexity_weights() {
        let c = SongComplexityAnalysis::from_components(1.0, 0.0, 0.0, 0.0);
        assert!((c.overall_complexity - 0.25).abs() < 1e-9);
        let c = SongComplexityAnalysis::from_components(1.0, 1.0, 1.0, 1.0);
        assert!((c.overall_complexity - 1.0).abs() < 1e-9);
        let c = SongComplexityAnalysis::from_components(2.0, -1.0, 0.5, 0.5);
        assert!(c.overall_complexity >= 0.0 && c.overall_complexity <= 1.0);
    }

    #[test]
    fn test_from_note_events_sorts() {
        let events = vec![
            NoteEvent { time: 1.0, pitch: 60, velocity: 0.5, duration: 0.5, confidence: 1.0 },
            NoteEvent { time: 0.0, pitch: 62, velocity: 0.5, duration: 0.5, confidence: 1.0 },
        ];
        let stem = StemAnalysis::from_note_events(Instrument::Melody, events);
        assert_eq!(stem.note_events[0].pitch, 62);
        assert!(stem.rhythmic_pattern.onset_density > 0.0);
    }
}
