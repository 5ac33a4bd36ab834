//! Pass 4: Advanced Feature Processing
//!
//! Rewrites base notes into technique notes, derives combo chains and applies
//! section modifiers. Each rule only re-tags notes still carrying a type it may
//! rewrite, so running the pass over its own output changes nothing that an
//! earlier run already decided.

use crate::chart::{
    sort_notes, AdvancedNote, BendInfo, ChainType, ChartMetadata, ComboChain, Difficulty,
    EffectKind, Instrument, Note, NoteId, NoteType, ParticleHint, SectionType, SlideDirection,
    SlideInfo, SongSection, SpecialEffect, VibratoInfo,
};
use crate::config::{Config, FeatureConfig, ProbabilityTable};
use crate::difficulty::{AdaptiveDifficultySettings, DifficultyProfile};
use crate::error::{ChartError, Result};
use crate::rng::{derive_seed, Feature, FeatureOracle, SeededOracle};
use crate::sections::section_at;
use crate::theory::apply_harmonic_context;
use crate::SongState;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// A chart after feature enrichment, carried through difficulty scaling
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancedChart {
    pub instrument: Instrument,
    pub difficulty: Difficulty,
    pub notes: Vec<AdvancedNote>,
    pub combo_chains: Vec<ComboChain>,
    pub base_metadata: ChartMetadata,
    /// Set by the difficulty scaler
    pub adapted_profile: Option<DifficultyProfile>,
    pub adaptive_settings: Option<AdaptiveDifficultySettings>,
}

/// Enrich a base chart's notes
pub fn enhance(
    notes: &[Note],
    instrument: Instrument,
    difficulty: Difficulty,
    sections: Option<&[SongSection]>,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) -> Vec<AdvancedNote> {
    let advanced: Vec<AdvancedNote> = notes.iter().map(AdvancedNote::from).collect();
    enhance_advanced(&advanced, instrument, difficulty, sections, config, oracle)
}

/// Enrich notes that may already carry technique tags
pub fn enhance_advanced(
    notes: &[AdvancedNote],
    instrument: Instrument,
    difficulty: Difficulty,
    sections: Option<&[SongSection]>,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) -> Vec<AdvancedNote> {
    let probs = config.probabilities.get(difficulty);
    let mut notes = notes.to_vec();
    sort_notes(&mut notes);

    if instrument == Instrument::Melody {
        tag_hammer_pulls(&mut notes, &probs, config, oracle);
    }
    if instrument.is_pitched() {
        tag_slides(&mut notes, &probs, config, oracle);
    }
    if difficulty == Difficulty::Expert && instrument.is_pitched() {
        notes = group_chords(notes, config);
    }
    match instrument {
        Instrument::Drums => decorate_drums(&mut notes, difficulty, &probs, config, oracle),
        Instrument::Vocals => decorate_vocals(&mut notes, &probs, config, oracle),
        _ => {}
    }
    if let Some(sections) = sections {
        apply_sections(&mut notes, sections, &probs, config, oracle);
    }
    apply_global_effects(&mut notes, config);
    notes
}

/// Adjacent notes one lane apart inside the window become hammer-ons (up) or pull-offs (down)
fn tag_hammer_pulls(
    notes: &mut [AdvancedNote],
    probs: &ProbabilityTable,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) {
    for i in 1..notes.len() {
        let (before, rest) = notes.split_at_mut(i);
        let prev = &before[i - 1];
        let note = &mut rest[0];

        let dt = note.time_ms.saturating_sub(prev.time_ms);
        if note.note_type != NoteType::Tap
            || dt == 0
            || dt > config.hammer_pull_window_ms
            || prev.lane.abs_diff(note.lane) != 1
        {
            continue;
        }
        if !(note.candidates.hammer_pull
            || oracle.decide(Feature::HammerPull, probs.hammer_pull, note))
        {
            continue;
        }

        note.note_type = if note.lane > prev.lane {
            NoteType::Hammer
        } else {
            NoteType::Pull
        };
        note.hammer_pull_chain = if prev.note_type.is_hammer_pull() {
            prev.hammer_pull_chain.clone()
        } else {
            Vec::new()
        };
        note.hammer_pull_chain.push(prev.id);
    }
}

/// The first note of a wide, unhurried lane jump slides into the second
fn tag_slides(
    notes: &mut [AdvancedNote],
    probs: &ProbabilityTable,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) {
    for i in 0..notes.len().saturating_sub(1) {
        let (head, tail) = notes.split_at_mut(i + 1);
        let note = &mut head[i];
        let next = &tail[0];

        let gap = next.time_ms.saturating_sub(note.time_ms);
        let distance = note.lane.abs_diff(next.lane);
        if !note.note_type.is_base()
            || gap < config.slide_min_gap_ms
            || gap > config.slide_max_gap_ms
            || distance < config.slide_min_distance
        {
            continue;
        }
        if !(note.candidates.slide || oracle.decide(Feature::Slide, probs.slide, note)) {
            continue;
        }

        note.note_type = NoteType::Slide;
        note.duration_ms = Some(gap);
        note.slide = Some(SlideInfo {
            direction: if next.lane > note.lane {
                SlideDirection::Up
            } else {
                SlideDirection::Down
            },
            distance,
            duration_ms: gap,
        });
    }
}

/// Collapse notes within the tolerance window into one chord on the earliest note.
///
/// Absorbed notes are dropped and every chain reference to them is redirected
/// to the chord that now represents them.
fn group_chords(notes: Vec<AdvancedNote>, config: &FeatureConfig) -> Vec<AdvancedNote> {
    let mut kept: Vec<AdvancedNote> = Vec::with_capacity(notes.len());
    let mut absorbed: HashMap<NoteId, NoteId> = HashMap::new();
    let mut iter = notes.into_iter().peekable();

    while let Some(mut keeper) = iter.next() {
        let mut members = Vec::new();
        while let Some(next) = iter.next_if(|n| {
            n.time_ms.saturating_sub(keeper.time_ms) <= config.chord_tolerance_ms
        }) {
            members.push(next);
        }

        if !members.is_empty() {
            for member in &members {
                absorbed.insert(member.id, keeper.id);
                let lanes = std::iter::once(member.lane).chain(member.chord_notes.iter().copied());
                for lane in lanes {
                    if lane != keeper.lane && !keeper.chord_notes.contains(&lane) {
                        keeper.chord_notes.push(lane);
                    }
                }
            }
            keeper.chord_notes.sort_unstable();
            if keeper.note_type.is_base() {
                keeper.note_type = NoteType::Chord;
            }
        }
        kept.push(keeper);
    }

    if !absorbed.is_empty() {
        for note in &mut kept {
            let own = note.id;
            let mut seen = HashSet::new();
            note.hammer_pull_chain = note
                .hammer_pull_chain
                .iter()
                .map(|id| absorbed.get(id).copied().unwrap_or(*id))
                .filter(|&id| id != own && seen.insert(id))
                .collect();
        }
    }
    kept
}

fn decorate_drums(
    notes: &mut [AdvancedNote],
    difficulty: Difficulty,
    probs: &ProbabilityTable,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) {
    for note in notes.iter_mut().filter(|n| n.note_type == NoteType::Tap) {
        if note.velocity < config.ghost_velocity_max {
            if oracle.decide(Feature::Ghost, probs.ghost, note) {
                note.note_type = NoteType::Ghost;
            }
        } else if note.velocity > config.accent_velocity_min
            && oracle.decide(Feature::Accent, probs.accent, note)
        {
            note.note_type = NoteType::Accent;
            note.particle = Some(ParticleHint::Sparks);
        }

        if difficulty == Difficulty::Expert
            && note.lane == 1
            && note.note_type == NoteType::Tap
            && oracle.decide(Feature::Tremolo, probs.tremolo, note)
        {
            note.note_type = NoteType::Tremolo;
            note.duration_ms = Some(config.tremolo_duration_ms);
        }
    }
}

fn decorate_vocals(
    notes: &mut [AdvancedNote],
    probs: &ProbabilityTable,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) {
    let long_holds = notes.iter_mut().filter(|n| {
        n.note_type == NoteType::Hold && n.duration_ms.unwrap_or(0) > config.vibrato_min_hold_ms
    });
    for note in long_holds {
        if oracle.decide(Feature::Vibrato, probs.vibrato, note) {
            let [lo, hi] = config.vibrato_rate_hz;
            note.note_type = NoteType::Vibrato;
            note.vibrato = Some(VibratoInfo {
                rate_hz: oracle.parameter(Feature::Vibrato, lo, hi),
                depth_semitones: config.vibrato_depth_semitones,
            });
        } else if oracle.decide(Feature::Bend, probs.bend, note) {
            let sign = oracle.parameter(Feature::Bend, -1.0, 1.0);
            note.note_type = NoteType::Bend;
            note.bend = Some(BendInfo {
                semitones: if sign < 0.0 {
                    -config.bend_semitones
                } else {
                    config.bend_semitones
                },
            });
        }
    }
}

/// Velocity and glow follow the section type; scaling starts from the base
/// values so repeated runs do not compound
fn apply_sections(
    notes: &mut [AdvancedNote],
    sections: &[SongSection],
    probs: &ProbabilityTable,
    config: &FeatureConfig,
    oracle: &mut dyn FeatureOracle,
) {
    for note in notes.iter_mut() {
        let time_sec = note.time_ms as f64 / 1000.0;
        let Some((_, section)) = section_at(sections, time_sec) else {
            continue;
        };

        let (velocity_scale, glow_scale) = match section.section_type {
            SectionType::Solo => (config.solo_velocity_scale, config.solo_glow_scale),
            SectionType::Bridge => (config.bridge_velocity_scale, 1.0),
            _ => (1.0, 1.0),
        };
        note.velocity = (note.base_velocity * velocity_scale).clamp(0.0, 1.0);
        note.glow_intensity = note.base_glow * glow_scale;

        let remaining_ms = ((section.end_time - time_sec).max(0.0) * 1000.0).round() as u32;
        match section.section_type {
            SectionType::Solo if oracle.decide(Feature::SoloBoost, probs.solo_boost, note) => {
                note.add_effect(SpecialEffect {
                    kind: EffectKind::SoloBoost,
                    intensity: glow_scale,
                    duration_ms: Some(remaining_ms),
                });
            }
            SectionType::Chorus
                if oracle.decide(Feature::StarPower, probs.chorus_star_power, note) =>
            {
                note.add_effect(SpecialEffect {
                    kind: EffectKind::StarPower,
                    intensity: 1.0,
                    duration_ms: None,
                });
            }
            _ => {}
        }
    }
}

/// Star power roughly every interval of song time, overdrive on the loudest notes
fn apply_global_effects(notes: &mut [AdvancedNote], config: &FeatureConfig) {
    let mut last_marker = 0u32;
    for note in notes.iter_mut() {
        if note.time_ms >= last_marker + config.star_power_interval_ms {
            note.add_effect(SpecialEffect {
                kind: EffectKind::StarPower,
                intensity: 1.0,
                duration_ms: None,
            });
            last_marker = note.time_ms;
        }
        if note.velocity > config.overdrive_velocity_min {
            note.add_effect(SpecialEffect {
                kind: EffectKind::Overdrive,
                intensity: note.velocity,
                duration_ms: None,
            });
        }
    }
}

/// Hammer/pull runs and slides as scoring chains
pub fn build_combo_chains(notes: &[AdvancedNote], config: &FeatureConfig) -> Vec<ComboChain> {
    let mut chains = Vec::new();
    let mut run: Vec<NoteId> = Vec::new();

    let flush = |run: &mut Vec<NoteId>, chains: &mut Vec<ComboChain>| {
        if !run.is_empty() {
            chains.push(ComboChain {
                notes: std::mem::take(run),
                bonus_multiplier: config.hammer_pull_bonus,
                chain_type: ChainType::HammerPull,
                timing_window_ms: config.hammer_pull_window_ms as f64,
            });
        }
    };

    for note in notes {
        if note.note_type.is_hammer_pull() {
            if run.is_empty() {
                // the picked note that starts the run
                if let Some(&origin) = note.hammer_pull_chain.last() {
                    run.push(origin);
                }
            }
            run.push(note.id);
            continue;
        }
        flush(&mut run, &mut chains);

        if note.note_type == NoteType::Slide {
            let window = note
                .slide
                .map(|s| s.duration_ms)
                .or(note.duration_ms)
                .unwrap_or(0);
            chains.push(ComboChain {
                notes: vec![note.id],
                bonus_multiplier: config.slide_bonus,
                chain_type: ChainType::Slide,
                timing_window_ms: window as f64,
            });
        }
    }
    flush(&mut run, &mut chains);
    chains
}

/// Mean of `1 + type bonus + 0.3 per special effect`, 0 for an empty chart
pub fn complexity_score(notes: &[AdvancedNote]) -> f64 {
    if notes.is_empty() {
        return 0.0;
    }
    let total: f64 = notes
        .iter()
        .map(|n| 1.0 + n.note_type.complexity_bonus() + 0.3 * n.special_effects.len() as f64)
        .sum();
    total / notes.len() as f64
}

pub fn run(state: &mut SongState, config: &Config) -> Result<()> {
    info!("Pass 4: Advanced Feature Processing");

    if state.beat_analysis.is_none() {
        return Err(ChartError::InvalidInput(
            "Pass 1 must be run before Pass 4".to_string(),
        ));
    }
    let sections = state.sections.as_deref();
    let harmony = state.harmony.as_ref();
    let cancel = &state.cancel;
    let seed = state.request.seed;

    let enhanced: Vec<EnhancedChart> = state
        .base_charts
        .par_iter()
        .map(|chart| {
            cancel.check()?;
            let key = format!(
                "features/{}/{}",
                chart.instrument.name(),
                chart.difficulty.name()
            );
            let mut oracle = SeededOracle::new(derive_seed(seed, &key));

            let mut notes: Vec<AdvancedNote> = chart.notes.iter().map(AdvancedNote::from).collect();
            if let Some(context) = harmony {
                notes = apply_harmonic_context(&notes, context, &config.harmony);
            }
            let notes = enhance_advanced(
                &notes,
                chart.instrument,
                chart.difficulty,
                sections,
                &config.features,
                &mut oracle,
            );
            let combo_chains = build_combo_chains(&notes, &config.features);

            debug!(
                "  {}/{}: {} notes, {} chains, complexity {:.2}",
                chart.instrument.name(),
                chart.difficulty.name(),
                notes.len(),
                combo_chains.len(),
                complexity_score(&notes)
            );

            Ok(EnhancedChart {
                instrument: chart.instrument,
                difficulty: chart.difficulty,
                notes,
                combo_chains,
                base_metadata: chart.metadata,
                adapted_profile: None,
                adaptive_settings: None,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let techniques = enhanced
        .iter()
        .flat_map(|c| &c.notes)
        .filter(|n| !n.note_type.is_base())
        .count();
    info!(
        "  Enhanced {} charts ({} technique notes)",
        enhanced.len(),
        techniques
    );

    state.enhanced = enhanced;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::TechniqueFlags;
    use crate::rng::FixedOracle;

    fn note(id: u32, time_ms: u32, lane: u8, instrument: Instrument) -> AdvancedNote {
        AdvancedNote::from(&Note {
            id: NoteId(id),
            time_ms,
            lane,
            note_type: NoteType::Tap,
            duration_ms: None,
            velocity: 0.5,
            instrument,
            pitch: None,
            candidates: TechniqueFlags::default(),
        })
    }

    fn probs() -> ProbabilityTable {
        FeatureConfig::default().probabilities.expert
    }

    #[test]
    fn test_hammer_pull_direction_and_chain() {
        let mut notes = vec![
            note(0, 0, 1, Instrument::Melody),
            note(1, 100, 2, Instrument::Melody),
            note(2, 200, 1, Instrument::Melody),
            note(3, 600, 2, Instrument::Melody),
        ];
        tag_hammer_pulls(&mut notes, &probs(), &FeatureConfig::default(), &mut FixedOracle(true));
        assert_eq!(notes[0].note_type, NoteType::Tap);
        assert_eq!(notes[1].note_type, NoteType::Hammer);
        assert_eq!(notes[2].note_type, NoteType::Pull);
        assert_eq!(notes[2].hammer_pull_chain, vec![NoteId(0), NoteId(1)]);
        // too far from its neighbour
        assert_eq!(notes[3].note_type, NoteType::Tap);
    }

    #[test]
    fn test_candidate_flag_skips_roll() {
        let mut notes = vec![note(0, 0, 0, Instrument::Melody), note(1, 100, 1, Instrument::Melody)];
        notes[1].candidates.hammer_pull = true;
        tag_hammer_pulls(&mut notes, &probs(), &FeatureConfig::default(), &mut FixedOracle(false));
        assert_eq!(notes[1].note_type, NoteType::Hammer);
    }

    #[test]
    fn test_slide_tags_first_note() {
        let mut notes = vec![note(0, 0, 0, Instrument::Bass), note(1, 400, 3, Instrument::Bass)];
        tag_slides(&mut notes, &probs(), &FeatureConfig::default(), &mut FixedOracle(true));
        assert_eq!(notes[0].note_type, NoteType::Slide);
        let slide = notes[0].slide.unwrap();
        assert_eq!(slide.direction, SlideDirection::Up);
        assert_eq!(slide.distance, 3);
        assert_eq!(slide.duration_ms, 400);
        assert_eq!(notes[1].note_type, NoteType::Tap);
    }

    #[test]
    fn test_chord_absorbs_cluster_and_remaps_chains() {
        let mut notes = vec![
            note(0, 0, 0, Instrument::Melody),
            note(1, 20, 1, Instrument::Melody),
            note(2, 40, 3, Instrument::Melody),
            note(3, 120, 2, Instrument::Melody),
        ];
        notes[3].note_type = NoteType::Hammer;
        notes[3].hammer_pull_chain = vec![NoteId(2)];

        let grouped = group_chords(notes, &FeatureConfig::default());
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].note_type, NoteType::Chord);
        assert_eq!(grouped[0].chord_notes, vec![1, 3]);
        assert_eq!(grouped[1].hammer_pull_chain, vec![NoteId(0)]);
    }

    #[test]
    fn test_lone_note_is_never_a_chord() {
        let notes = vec![note(0, 0, 1, Instrument::Melody), note(1, 500, 2, Instrument::Melody)];
        let grouped = group_chords(notes, &FeatureConfig::default());
        assert_eq!(grouped.len(), 2);
        assert!(grouped.iter().all(|n| n.note_type == NoteType::Tap && n.chord_notes.is_empty()));
    }

    #[test]
    fn test_drum_decorations() {
        let mut notes = vec![
            note(0, 0, 0, Instrument::Drums),
            note(1, 500, 1, Instrument::Drums),
            note(2, 1000, 1, Instrument::Drums),
        ];
        notes[0].velocity = 0.2;
        notes[1].velocity = 0.95;
        decorate_drums(
            &mut notes,
            Difficulty::Expert,
            &probs(),
            &FeatureConfig::default(),
            &mut FixedOracle(true),
        );
        assert_eq!(notes[0].note_type, NoteType::Ghost);
        assert_eq!(notes[1].note_type, NoteType::Accent);
        assert_eq!(notes[1].particle, Some(ParticleHint::Sparks));
        assert_eq!(notes[2].note_type, NoteType::Tremolo);
        assert_eq!(notes[2].duration_ms, Some(500));
    }

    #[test]
    fn test_vocal_vibrato_on_long_holds() {
        let mut notes = vec![note(0, 0, 1, Instrument::Vocals), note(1, 3000, 2, Instrument::Vocals)];
        notes[0].note_type = NoteType::Hold;
        notes[0].duration_ms = Some(1500);
        notes[1].note_type = NoteType::Hold;
        notes[1].duration_ms = Some(800);
        decorate_vocals(&mut notes, &probs(), &FeatureConfig::default(), &mut FixedOracle(true));
        assert_eq!(notes[0].note_type, NoteType::Vibrato);
        assert!((notes[0].vibrato.unwrap().rate_hz - 5.5).abs() < 1e-9);
        assert_eq!(notes[1].note_type, NoteType::Hold);
    }

    #[test]
    fn test_section_modifiers_start_from_base() {
        let sections = vec![SongSection {
            name: "Solo".to_string(),
            start_time: 0.0,
            end_time: 10.0,
            section_type: SectionType::Solo,
            key: None,
            chord_progression: Vec::new(),
            energy_level: 1.0,
            complexity_modifier: 1.2,
        }];
        let mut notes = vec![note(0, 1000, 0, Instrument::Melody)];
        for _ in 0..2 {
            apply_sections(&mut notes, &sections, &probs(), &FeatureConfig::default(), &mut FixedOracle(true));
        }
        assert!((notes[0].velocity - 0.6).abs() < 1e-9);
        assert!((notes[0].glow_intensity - 0.75).abs() < 1e-9);
        assert_eq!(notes[0].special_effects.len(), 1);
        assert!(notes[0].has_effect(EffectKind::SoloBoost));
    }

    #[test]
    fn test_star_power_interval() {
        let mut notes: Vec<AdvancedNote> = (0..20)
            .map(|i| note(i, i * 1000, 0, Instrument::Bass))
            .collect();
        apply_global_effects(&mut notes, &FeatureConfig::default());
        let marked: Vec<u32> = notes
            .iter()
            .filter(|n| n.has_effect(EffectKind::StarPower))
            .map(|n| n.time_ms)
            .collect();
        assert_eq!(marked, vec![8000, 16000]);
    }

    #[test]
    fn test_combo_chains() {
        let mut notes = vec![
            note(0, 0, 0, Instrument::Melody),
            note(1, 100, 1, Instrument::Melody),
            note(2, 200, 2, Instrument::Melody),
            note(3, 600, 0, Instrument::Melody),
        ];
        notes[1].note_type = NoteType::Hammer;
        notes[1].hammer_pull_chain = vec![NoteId(0)];
        notes[2].note_type = NoteType::Hammer;
        notes[2].hammer_pull_chain = vec![NoteId(0), NoteId(1)];
        notes[3].note_type = NoteType::Slide;
        notes[3].slide = Some(SlideInfo {
            direction: SlideDirection::Up,
            distance: 2,
            duration_ms: 300,
        });

        let chains = build_combo_chains(&notes, &FeatureConfig::default());
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].notes, vec![NoteId(0), NoteId(1), NoteId(2)]);
        assert_eq!(chains[0].bonus_multiplier, 1.5);
        assert_eq!(chains[1].chain_type, ChainType::Slide);
        assert_eq!(chains[1].timing_window_ms, 300.0);
    }

    #[test]
    fn test_complexity_score() {
        let mut notes = vec![note(0, 0, 0, Instrument::Melody), note(1, 100, 1, Instrument::Melody)];
        assert_eq!(complexity_score(&notes), 1.0);
        notes[1].note_type = NoteType::Chord;
        notes[1].special_effects.push(SpecialEffect {
            kind: EffectKind::Overdrive,
            intensity: 1.0,
            duration_ms: None,
        });
        assert!((complexity_score(&notes) - 1.9).abs() < 1e-9);
        assert_eq!(complexity_score(&[]), 0.0);
    }
}
