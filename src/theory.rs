//! Harmonic context: keys, chords, progressions and the analyzer seam the
//! orchestrator consults for them.
//!
//! The pipeline only needs a key and a chord sequence. [`SymbolicHarmony`]
//! derives both from chord symbols, MIDI pitches or a chromagram of the mix;
//! a host with a better music-theory engine implements [`HarmonicAnalyzer`]
//! and hands it to [`crate::ChartPipeline::with_harmonic_analyzer`].

use crate::audio::AudioSignal;
use crate::chart::{AdvancedNote, EffectKind, Instrument, NoteId, SpecialEffect, LANE_COUNT};
use crate::config::HarmonyConfig;
use crate::error::{ChartError, Result};
use crate::spectral::{self, FrameTransform};
use crate::CancellationToken;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

// Krumhansl-Kessler key profiles
const MAJOR_PROFILE: [f64; 12] = [
    6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88,
];
const MINOR_PROFILE: [f64; 12] = [
    6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17,
];

const MAJOR_SCALE: [u8; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_SCALE: [u8; 7] = [0, 2, 3, 5, 7, 8, 10];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Major,
    Minor,
}

/// Parse a note letter with optional accidental, returning the pitch class and
/// the unparsed remainder
fn parse_pitch_class(text: &str) -> Option<(u8, &str)> {
    let mut chars = text.chars();
    let base = match chars.next()?.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => return None,
    };
    let rest = chars.as_str();
    let (shift, rest): (i32, &str) = match rest.chars().next() {
        Some('#') | Some('♯') => (1, &rest[rest.chars().next().map_or(0, char::len_utf8)..]),
        Some('b') | Some('♭') => (-1, &rest[rest.chars().next().map_or(0, char::len_utf8)..]),
        _ => (0, rest),
    };
    Some((((base + shift).rem_euclid(12)) as u8, rest))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalKey {
    /// Pitch class of the tonic, 0 = C
    pub tonic: u8,
    pub mode: Mode,
    /// e.g. "A minor"
    pub name: String,
}

impl MusicalKey {
    pub fn new(tonic: u8, mode: Mode) -> Self {
        let tonic = tonic % 12;
        let mode_name = match mode {
            Mode::Major => "major",
            Mode::Minor => "minor",
        };
        MusicalKey {
            tonic,
            mode,
            name: format!("{} {}", NOTE_NAMES[tonic as usize], mode_name),
        }
    }

    /// Accepts "C major", "A minor", "F#m", "Bb"
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let (tonic, rest) = parse_pitch_class(trimmed)
            .ok_or_else(|| ChartError::InvalidInput(format!("unrecognized key '{}'", text)))?;
        let rest = rest.trim().to_lowercase();
        let mode = match rest.as_str() {
            "" | "maj" | "major" => Mode::Major,
            "m" | "min" | "minor" => Mode::Minor,
            _ => {
                return Err(ChartError::InvalidInput(format!(
                    "unrecognized key mode in '{}'",
                    text
                )))
            }
        };
        Ok(MusicalKey::new(tonic, mode))
    }

    /// Pitch classes of the key's scale (natural minor for minor keys)
    pub fn scale(&self) -> [u8; 7] {
        let steps = match self.mode {
            Mode::Major => MAJOR_SCALE,
            Mode::Minor => MINOR_SCALE,
        };
        steps.map(|s| (self.tonic + s) % 12)
    }

    pub fn contains(&self, pitch_class: u8) -> bool {
        self.scale().contains(&(pitch_class % 12))
    }
}

/// A chord symbol resolved to pitch classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chord {
    pub symbol: String,
    pub root: u8,
    /// Pitch classes, root first
    pub tones: Vec<u8>,
    /// 0 (consonant) .. 1 (unstable)
    pub tension: f64,
}

impl Chord {
    /// Parse symbols such as `C`, `Am`, `G7`, `Fmaj7`, `Bdim`, `Dsus4`, `C/E`
    pub fn parse(symbol: &str) -> Result<Self> {
        let trimmed = symbol.trim();
        // slash bass notes do not change the chord's function here
        let head = trimmed.split('/').next().unwrap_or(trimmed);
        let (root, quality) = parse_pitch_class(head)
            .ok_or_else(|| ChartError::InvalidInput(format!("unrecognized chord '{}'", symbol)))?;

        let (intervals, tension): (&[u8], f64) = match quality {
            "" | "maj" | "M" => (&[0, 4, 7], 0.1),
            "m" | "min" | "-" => (&[0, 3, 7], 0.2),
            "7" | "dom7" => (&[0, 4, 7, 10], 0.6),
            "maj7" | "M7" => (&[0, 4, 7, 11], 0.4),
            "m7" | "min7" | "-7" => (&[0, 3, 7, 10], 0.45),
            "m7b5" | "ø" => (&[0, 3, 6, 10], 0.75),
            "dim" | "°" => (&[0, 3, 6], 0.8),
            "dim7" | "°7" => (&[0, 3, 6, 9], 0.85),
            "aug" | "+" => (&[0, 4, 8], 0.75),
            "sus2" => (&[0, 2, 7], 0.35),
            "sus4" | "sus" => (&[0, 5, 7], 0.4),
            "5" => (&[0, 7], 0.05),
            "9" => (&[0, 4, 7, 10, 2], 0.65),
            "6" => (&[0, 4, 7, 9], 0.3),
            "m6" => (&[0, 3, 7, 9], 0.35),
            other => {
                return Err(ChartError::InvalidInput(format!(
                    "unrecognized chord quality '{}' in '{}'",
                    other, symbol
                )))
            }
        };

        Ok(Chord {
            symbol: trimmed.to_string(),
            root,
            tones: intervals.iter().map(|i| (root + i) % 12).collect(),
            tension,
        })
    }

    pub fn contains_pitch(&self, midi_pitch: u8) -> bool {
        self.tones.contains(&(midi_pitch % 12))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChordProgression {
    pub chords: Vec<Chord>,
    /// 0..1, feeds the harmonic component of song complexity
    pub complexity: f64,
}

impl ChordProgression {
    /// Build a progression and score it against an optional key
    pub fn from_chords(chords: Vec<Chord>, key: Option<&MusicalKey>) -> Self {
        if chords.is_empty() {
            return ChordProgression::default();
        }
        let n = chords.len() as f64;
        let mean_tension = chords.iter().map(|c| c.tension).sum::<f64>() / n;

        let mut distinct: Vec<&str> = chords.iter().map(|c| c.symbol.as_str()).collect();
        distinct.sort_unstable();
        distinct.dedup();
        let variety = (distinct.len() as f64 / 8.0).min(1.0);

        let chromatic = key.map_or(0.0, |k| {
            chords.iter().filter(|c| !k.contains(c.root)).count() as f64 / n
        });

        let complexity = (0.5 * mean_tension + 0.3 * variety + 0.2 * chromatic).clamp(0.0, 1.0);
        ChordProgression { chords, complexity }
    }
}

/// What the harmonic collaborator is asked to analyze
#[derive(Debug, Clone, Copy)]
pub enum HarmonicInput<'a> {
    ChordSymbols(&'a [String]),
    /// MIDI pitches
    Notes(&'a [u8]),
    Audio(AudioSignal<'a>),
}

/// Music-theory collaborator. Results are consumed read-only.
pub trait HarmonicAnalyzer: Send + Sync {
    /// `None` when the input carries no tonal evidence
    fn analyze_key(&self, input: &HarmonicInput) -> Result<Option<MusicalKey>>;

    fn analyze_progression(
        &self,
        chords: &[String],
        key: Option<&MusicalKey>,
    ) -> Result<ChordProgression>;
}

/// Key of a pitch-class histogram by profile correlation; ties go to the lower key index
pub fn key_from_chroma(chroma: &[f64; 12]) -> Option<MusicalKey> {
    if chroma.iter().all(|&c| c <= 0.0) {
        return None;
    }
    let score = |profile: &[f64; 12], shift: usize| -> f64 {
        profile
            .iter()
            .enumerate()
            .map(|(i, p)| chroma[(i + shift) % 12] * p)
            .sum()
    };

    let mut best: Option<(f64, MusicalKey)> = None;
    for shift in 0..12 {
        for (mode, profile) in [(Mode::Major, &MAJOR_PROFILE), (Mode::Minor, &MINOR_PROFILE)] {
            let s = score(profile, shift);
            if best.as_ref().map_or(true, |(b, _)| s > *b) {
                best = Some((s, MusicalKey::new(shift as u8, mode)));
            }
        }
    }
    best.map(|(_, key)| key)
}

/// Pitch-class energy of a mix, from a handful of spread-out frames
pub fn chromagram(signal: &AudioSignal, n_fft: usize, cancel: &CancellationToken) -> Result<[f64; 12]> {
    let mut chroma = [0.0; 12];
    if signal.is_empty() || signal.sample_rate == 0 {
        return Ok(chroma);
    }
    let mono = signal.mono_samples();
    let mut transform = FrameTransform::new(n_fft);
    let bin_hz = signal.sample_rate as f64 / n_fft as f64;
    let hop = (mono.len() / 64).max(n_fft);

    let mut start = 0;
    while start < mono.len() {
        cancel.check()?;
        let end = (start + n_fft).min(mono.len());
        let mag = transform.magnitude(&mono[start..end]);
        for (k, &m) in mag.iter().enumerate().skip(1) {
            let hz = k as f64 * bin_hz;
            // roughly C1..C8
            if (30.0..4200.0).contains(&hz) {
                chroma[(spectral::hz_to_midi(hz) % 12) as usize] += m;
            }
        }
        start += hop;
    }
    Ok(chroma)
}

/// Default analyzer: rules over chord symbols, profile correlation for notes and audio
#[derive(Debug, Clone, Copy)]
pub struct SymbolicHarmony {
    pub n_fft: usize,
}

impl Default for SymbolicHarmony {
    fn default() -> Self {
        Self { n_fft: 4096 }
    }
}

impl HarmonicAnalyzer for SymbolicHarmony {
    fn analyze_key(&self, input: &HarmonicInput) -> Result<Option<MusicalKey>> {
        let mut chroma = [0.0; 12];
        match input {
            HarmonicInput::ChordSymbols(symbols) => {
                let chords: Vec<Chord> = symbols.iter().map(|s| Chord::parse(s)).collect::<Result<_>>()?;
                for chord in &chords {
                    for &tone in &chord.tones {
                        chroma[tone as usize] += 1.0;
                    }
                    // the root carries the function
                    chroma[chord.root as usize] += 1.0;
                }
                // songs tend to open on the tonic
                if let Some(first) = chords.first() {
                    chroma[first.root as usize] += 1.0;
                }
            }
            HarmonicInput::Notes(pitches) => {
                for &p in pitches.iter() {
                    chroma[(p % 12) as usize] += 1.0;
                }
            }
            HarmonicInput::Audio(signal) => {
                chroma = chromagram(signal, self.n_fft, &CancellationToken::new())?;
            }
        }
        Ok(key_from_chroma(&chroma))
    }

    fn analyze_progression(
        &self,
        chords: &[String],
        key: Option<&MusicalKey>,
    ) -> Result<ChordProgression> {
        let parsed = chords.iter().map(|s| Chord::parse(s)).collect::<Result<Vec<_>>>()?;
        Ok(ChordProgression::from_chords(parsed, key))
    }
}

/// Pre-computed results supplied by the host
#[derive(Debug, Clone, Default)]
pub struct FixedHarmony {
    pub key: Option<MusicalKey>,
    pub progression: ChordProgression,
}

impl HarmonicAnalyzer for FixedHarmony {
    fn analyze_key(&self, _input: &HarmonicInput) -> Result<Option<MusicalKey>> {
        Ok(self.key.clone())
    }

    fn analyze_progression(
        &self,
        _chords: &[String],
        _key: Option<&MusicalKey>,
    ) -> Result<ChordProgression> {
        Ok(self.progression.clone())
    }
}

/// Coarse song-level estimates from an outside audio-feature service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatureHints {
    pub tempo_bpm: Option<f64>,
    pub key: Option<String>,
    pub energy: Option<f64>,
    pub valence: Option<f64>,
    pub danceability: Option<f64>,
}

/// Key and chords laid over the beat grid
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicContext {
    pub key: Option<MusicalKey>,
    pub progression: ChordProgression,
    /// How long each chord lasts before the next one starts
    pub chord_duration_sec: f64,
}

impl HarmonicContext {
    /// Index and chord sounding at `time_sec`; the progression repeats
    pub fn chord_at(&self, time_sec: f64) -> Option<(usize, &Chord)> {
        let n = self.progression.chords.len();
        if n == 0 || self.chord_duration_sec <= 0.0 || time_sec < 0.0 {
            return None;
        }
        let slot = (time_sec / self.chord_duration_sec).floor() as usize;
        let idx = slot % n;
        Some((slot, &self.progression.chords[idx]))
    }

    /// Whether a chord change falls within `window_sec` of `time_sec`
    pub fn near_chord_change(&self, time_sec: f64, window_sec: f64) -> bool {
        if self.progression.chords.len() < 2 || self.chord_duration_sec <= 0.0 {
            return false;
        }
        let nearest = (time_sec / self.chord_duration_sec).round() * self.chord_duration_sec;
        nearest > 0.0 && (time_sec - nearest).abs() <= window_sec
    }
}

/// Shape melody notes to the harmony: lanes follow chord tones, chord changes
/// are accented, tense chords light up overdrive.
///
/// Runs before feature enrichment, so the accent is folded into `base_velocity`
/// and survives section shaping.
pub fn apply_harmonic_context(
    notes: &[AdvancedNote],
    context: &HarmonicContext,
    config: &HarmonyConfig,
) -> Vec<AdvancedNote> {
    let window_sec = config.chord_change_window_ms as f64 / 1000.0;
    let mut occupied: HashSet<(u32, u8)> = notes.iter().map(|n| (n.time_ms, n.lane)).collect();

    // hammer/pull grace notes and the notes they lean on keep their lane step
    let mut order: Vec<&AdvancedNote> = notes.iter().collect();
    order.sort_by_key(|n| (n.time_ms, n.lane));
    let anchored: HashSet<NoteId> = order
        .windows(2)
        .filter(|pair| pair[1].candidates.hammer_pull)
        .flat_map(|pair| [pair[0].id, pair[1].id])
        .collect();

    notes
        .iter()
        .map(|note| {
            let mut note = note.clone();
            if note.instrument != Instrument::Melody {
                return note;
            }
            let time_sec = note.time_ms as f64 / 1000.0;
            let Some((_, chord)) = context.chord_at(time_sec) else {
                return note;
            };

            // plain notes move to the lane of their chord tone when it is free
            let movable = note.note_type.is_base()
                && !anchored.contains(&note.id)
                && note.hammer_pull_chain.is_empty()
                && note.chord_notes.is_empty();
            if let (true, Some(pitch)) = (movable, note.pitch) {
                if let Some(pos) = chord.tones.iter().position(|&t| t == pitch % 12) {
                    let lane = (pos as u8).min(LANE_COUNT - 1);
                    if lane != note.lane && occupied.insert((note.time_ms, lane)) {
                        occupied.remove(&(note.time_ms, note.lane));
                        note.lane = lane;
                    }
                }
            }

            if context.near_chord_change(time_sec, window_sec) {
                let boost = config.chord_change_velocity_boost;
                note.base_velocity = (note.base_velocity * boost).min(1.0);
                note.velocity = (note.velocity * boost).min(1.0);
            }
            if chord.tension > config.overdrive_tension {
                note.add_effect(SpecialEffect {
                    kind: EffectKind::Overdrive,
                    intensity: chord.tension,
                    duration_ms: None,
                });
            }
            note
        })
        .collect()
}
