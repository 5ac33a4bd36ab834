//! Chart data model: instruments, notes, combo chains, sections and finished charts

use crate::analysis::SongComplexityAnalysis;
use crate::difficulty::{AdaptiveDifficultySettings, DifficultyProfile};
use crate::error::{ChartError, Result};
use crate::theory::MusicalKey;
use serde::{Deserialize, Serialize};

/// Number of horizontal lanes on the highway
pub const LANE_COUNT: u8 = 4;

/// Instrument a chart is played on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Drums,
    Bass,
    Melody,
    Vocals,
}

impl Instrument {
    pub const ALL: [Instrument; 4] = [
        Instrument::Drums,
        Instrument::Bass,
        Instrument::Melody,
        Instrument::Vocals,
    ];

    /// Map a stem name to its instrument (`other` and `guitar` are the melody stem)
    pub fn from_stem_name(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "drums" => Ok(Instrument::Drums),
            "bass" => Ok(Instrument::Bass),
            "other" | "melody" | "guitar" => Ok(Instrument::Melody),
            "vocals" => Ok(Instrument::Vocals),
            other => Err(ChartError::UnknownInstrument(other.to_string())),
        }
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            Instrument::Drums => "drums",
            Instrument::Bass => "bass",
            Instrument::Melody => "melody",
            Instrument::Vocals => "vocals",
        }
    }

    /// Pitched instruments can carry chords, holds and bends
    pub fn is_pitched(&self) -> bool {
        !matches!(self, Instrument::Drums)
    }
}

/// Difficulty tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Expert,
}

impl Difficulty {
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::Expert,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Expert => "expert",
        }
    }

    /// Position in the tier ordering, 0 for easy
    pub fn rank(&self) -> usize {
        *self as usize
    }
}

impl std::str::FromStr for Difficulty {
    type Err = ChartError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" | "normal" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            "expert" => Ok(Difficulty::Expert),
            other => Err(ChartError::InvalidInput(format!(
                "unknown difficulty '{}'",
                other
            ))),
        }
    }
}

/// Index of a note inside one chart's note arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(pub u32);

/// Note type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Tap,
    Hold,
    Slide,
    Hammer,
    Pull,
    Chord,
    Tremolo,
    Ghost,
    Accent,
    Vibrato,
    Bend,
}

impl NoteType {
    /// Tap and hold are the only types chart generation emits; everything else is a re-tag
    pub fn is_base(&self) -> bool {
        matches!(self, NoteType::Tap | NoteType::Hold)
    }

    pub fn is_hammer_pull(&self) -> bool {
        matches!(self, NoteType::Hammer | NoteType::Pull)
    }

    /// Added to a note's complexity on top of the base 1.0
    pub fn complexity_bonus(&self) -> f64 {
        match self {
            NoteType::Tap => 0.0,
            NoteType::Ghost => 0.2,
            NoteType::Accent => 0.3,
            NoteType::Hold => 0.5,
            NoteType::Vibrato | NoteType::Bend => 0.7,
            NoteType::Hammer | NoteType::Pull => 0.8,
            NoteType::Slide => 1.0,
            NoteType::Tremolo => 1.2,
            NoteType::Chord => 1.5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NoteType::Tap => "tap",
            NoteType::Hold => "hold",
            NoteType::Slide => "slide",
            NoteType::Hammer => "hammer",
            NoteType::Pull => "pull",
            NoteType::Chord => "chord",
            NoteType::Tremolo => "tremolo",
            NoteType::Ghost => "ghost",
            NoteType::Accent => "accent",
            NoteType::Vibrato => "vibrato",
            NoteType::Bend => "bend",
        }
    }
}

/// Technique candidates raised during chart generation and resolved by the feature pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechniqueFlags {
    pub hammer_pull: bool,
    pub slide: bool,
}

/// Base chart note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub time_ms: u32,
    pub lane: u8,
    pub note_type: NoteType,
    pub duration_ms: Option<u32>,
    /// 0..1
    pub velocity: f64,
    pub instrument: Instrument,
    /// MIDI pitch of the source event, when the stem is pitched
    pub pitch: Option<u8>,
    pub candidates: TechniqueFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlideDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlideInfo {
    pub direction: SlideDirection,
    /// Lanes travelled
    pub distance: u8,
    pub duration_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BendInfo {
    pub semitones: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VibratoInfo {
    pub rate_hz: f64,
    pub depth_semitones: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleHint {
    Sparks,
    Burst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    StarPower,
    Overdrive,
    SoloBoost,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpecialEffect {
    pub kind: EffectKind,
    pub intensity: f64,
    pub duration_ms: Option<u32>,
}

/// Note after feature enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedNote {
    pub id: NoteId,
    pub time_ms: u32,
    pub lane: u8,
    pub note_type: NoteType,
    pub duration_ms: Option<u32>,
    pub velocity: f64,
    /// Velocity before section shaping
    pub base_velocity: f64,
    pub instrument: Instrument,
    pub pitch: Option<u8>,
    pub candidates: TechniqueFlags,
    pub slide: Option<SlideInfo>,
    /// Lanes of the notes this chord absorbed
    pub chord_notes: Vec<u8>,
    /// Earlier notes of the hammer-on/pull-off run, oldest first
    pub hammer_pull_chain: Vec<NoteId>,
    pub bend: Option<BendInfo>,
    pub vibrato: Option<VibratoInfo>,
    pub glow_intensity: f64,
    pub base_glow: f64,
    pub particle: Option<ParticleHint>,
    pub special_effects: Vec<SpecialEffect>,
}

impl From<&Note> for AdvancedNote {
    fn from(note: &Note) -> Self {
        AdvancedNote {
            id: note.id,
            time_ms: note.time_ms,
            lane: note.lane,
            note_type: note.note_type,
            duration_ms: note.duration_ms,
            velocity: note.velocity,
            base_velocity: note.velocity,
            instrument: note.instrument,
            pitch: note.pitch,
            candidates: note.candidates,
            slide: None,
            chord_notes: Vec::new(),
            hammer_pull_chain: Vec::new(),
            bend: None,
            vibrato: None,
            glow_intensity: note.velocity,
            base_glow: note.velocity,
            particle: None,
            special_effects: Vec::new(),
        }
    }
}

impl AdvancedNote {
    pub fn has_effect(&self, kind: EffectKind) -> bool {
        self.special_effects.iter().any(|e| e.kind == kind)
    }

    /// Add an effect unless one of the same kind is already attached
    pub fn add_effect(&mut self, effect: SpecialEffect) {
        if !self.has_effect(effect.kind) {
            self.special_effects.push(effect);
        }
    }

    /// Lanes occupied at this note's time
    pub fn simultaneous_count(&self) -> usize {
        1 + self.chord_notes.len()
    }

    pub fn end_ms(&self) -> u32 {
        self.time_ms + self.duration_ms.unwrap_or(0)
    }

    /// Drop every technique annotation and return to a plain tap
    pub fn reset_to_tap(&mut self) {
        self.note_type = NoteType::Tap;
        self.duration_ms = None;
        self.slide = None;
        self.chord_notes.clear();
        self.hammer_pull_chain.clear();
        self.bend = None;
        self.vibrato = None;
        self.particle = None;
    }
}

/// Sort key used by every pass: time, then lane, then id
pub fn sort_notes(notes: &mut [AdvancedNote]) {
    notes.sort_by_key(|n| (n.time_ms, n.lane, n.id));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    HammerPull,
    Slide,
}

/// Run of notes whose consecutive hits award a multiplied bonus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboChain {
    pub notes: Vec<NoteId>,
    pub bonus_multiplier: f64,
    pub chain_type: ChainType,
    pub timing_window_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Intro,
    Verse,
    Chorus,
    Bridge,
    Solo,
    Outro,
}

/// Song section; a song's sections tile it without gaps or overlaps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongSection {
    pub name: String,
    /// Seconds
    pub start_time: f64,
    pub end_time: f64,
    pub section_type: SectionType,
    pub key: Option<String>,
    pub chord_progression: Vec<String>,
    pub energy_level: f64,
    pub complexity_modifier: f64,
}

impl SongSection {
    pub fn contains(&self, time_sec: f64) -> bool {
        time_sec >= self.start_time && time_sec < self.end_time
    }

    pub fn length(&self) -> f64 {
        self.end_time - self.start_time
    }
}

/// Metadata computed for a base chart
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChartMetadata {
    pub complexity_score: f64,
    /// Notes per tracked beat
    pub note_density: f64,
    /// Distinct note types / 6
    pub technique_variety: f64,
    pub musical_accuracy: f64,
}

/// Base chart for one (instrument, difficulty) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentChart {
    pub instrument: Instrument,
    pub difficulty: Difficulty,
    pub notes: Vec<Note>,
    pub metadata: ChartMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AiInsights {
    pub complexity_score: f64,
    pub musical_accuracy: f64,
    pub harmonic_alignment: f64,
    pub rhythmic_coherence: f64,
    pub difficulty_balance: f64,
}

/// Musical facts the chart was generated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalContext {
    pub bpm: f64,
    pub time_signature: (u8, u8),
    pub key: Option<MusicalKey>,
    pub sections: Vec<SongSection>,
    pub complexity: Option<SongComplexityAnalysis>,
    pub adapted_profile: Option<DifficultyProfile>,
}

/// Final chart emitted by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicalChart {
    pub instrument: Instrument,
    pub difficulty: Difficulty,
    pub notes: Vec<AdvancedNote>,
    pub combo_chains: Vec<ComboChain>,
    pub musical_context: MusicalContext,
    pub ai_insights: AiInsights,
    /// Present when real-time adaptation was requested
    pub adaptive_settings: Option<AdaptiveDifficultySettings>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stem_name_mapping() {
        assert_eq!(Instrument::from_stem_name("other").unwrap(), Instrument::Melody);
        assert_eq!(Instrument::from_stem_name("Drums").unwrap(), Instrument::Drums);
        assert!(matches!(
            Instrument::from_stem_name("kazoo"),
            Err(ChartError::UnknownInstrument(_))
        ));
    }

    #[test]
    fn test_difficulty_ordering() {
        assert!(Difficulty::Easy < Difficulty::Medium);
        assert!(Difficulty::Hard < Difficulty::Expert);
        assert_eq!("normal".parse::<Difficulty>().unwrap(), Difficulty::Medium);
    }

    #[test]
    fn test_add_effect_deduplicates() {
        let note = Note {
            id: NoteId(0),
            time_ms: 0,
            lane: 0,
            note_type: NoteType::Tap,
            duration_ms: None,
            velocity: 0.5,
            instrument: Instrument::Melody,
            pitch: None,
            candidates: TechniqueFlags::default(),
        };
        let mut advanced = AdvancedNote::from(&note);
        let effect = SpecialEffect {
            kind: EffectKind::StarPower,
            intensity: 1.0,
            duration_ms: None,
        };
        advanced.add_effect(effect);
        advanced.add_effect(effect);
        assert_eq!(advanced.special_effects.len(), 1);
    }
}
