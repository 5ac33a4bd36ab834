//! Pass 5: Dynamic Difficulty Scaling

use crate::analysis::{BeatAnalysisResult, SongComplexityAnalysis};
use crate::chart::{
    sort_notes, AdvancedNote, Instrument, NoteId, NoteType, ParticleHint, SlideDirection,
    SlideInfo, SongSection,
};
use crate::config::{Config, ScalingConfig};
use crate::difficulty::{AdaptiveDifficultySettings, DifficultyProfile, PerformanceMetrics};
use crate::error::{ChartError, Result};
use crate::passes::pass_4::build_combo_chains;
use crate::rng::{derive_seed, keyed_unit, Feature, FeatureOracle, SeededOracle};
use crate::sections::section_at;
use crate::theory::HarmonicContext;
use crate::SongState;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Harmonic complexity assumed when no harmonic context is available
pub const DEFAULT_HARMONIC_COMPLEXITY: f64 = 0.5;

fn tempo_complexity(beats: &BeatAnalysisResult) -> f64 {
    let mut score = 0.0;
    if !(80.0..=180.0).contains(&beats.bpm) {
        score += 0.3;
    }
    if !(60.0..=200.0).contains(&beats.bpm) {
        score += 0.5;
    }
    score += (0.1 * beats.tempo_changes.len() as f64).min(0.4);
    score += 0.3 * beats.swing_factor;
    score.clamp(0.0, 1.0)
}

fn structural_complexity(sections: &[SongSection]) -> f64 {
    if sections.is_empty() {
        return 0.0;
    }
    let types: HashSet<_> = sections.iter().map(|s| s.section_type).collect();
    let average_len = sections.iter().map(SongSection::length).sum::<f64>() / sections.len() as f64;

    let mut score = (0.05 * sections.len() as f64).min(0.4) + (0.1 * types.len() as f64).min(0.3);
    if average_len < 30.0 {
        score += 0.3;
    }
    score.clamp(0.0, 1.0)
}

/// Weighted tempo, rhythmic, harmonic and structural difficulty of a song
pub fn analyze_complexity(
    beats: &BeatAnalysisResult,
    harmonic_complexity_hint: Option<f64>,
    sections: Option<&[SongSection]>,
) -> SongComplexityAnalysis {
    SongComplexityAnalysis::from_components(
        tempo_complexity(beats),
        beats.rhythmic_complexity,
        harmonic_complexity_hint
            .filter(|h| h.is_finite())
            .unwrap_or(DEFAULT_HARMONIC_COMPLEXITY),
        sections.map_or(0.0, structural_complexity),
    )
}

/// Song complexity from the analysis gathered so far; an empty progression
/// says nothing about harmony
pub fn song_complexity(
    beats: &BeatAnalysisResult,
    harmony: Option<&HarmonicContext>,
    sections: Option<&[SongSection]>,
) -> SongComplexityAnalysis {
    let hint = harmony
        .filter(|h| !h.progression.chords.is_empty())
        .map(|h| h.progression.complexity);
    analyze_complexity(beats, hint, sections)
}

/// The tier preset pushed toward the song's complexity
pub fn adapted_profile(
    complexity: &SongComplexityAnalysis,
    settings: &AdaptiveDifficultySettings,
    config: &ScalingConfig,
) -> DifficultyProfile {
    DifficultyProfile::preset(settings.base_difficulty).adapted(
        complexity,
        settings.adaptation_strength,
        config,
    )
}

/// Song-level facts the scaler needs beyond the notes themselves
#[derive(Debug, Clone, Copy)]
pub struct ScalingContext<'a> {
    pub sections: Option<&'a [SongSection]>,
    pub duration_sec: f64,
    pub seed: u64,
}

/// Identity of a note that stays stable across tiers
fn note_key(note: &AdvancedNote) -> u64 {
    ((note.time_ms as u64) << 8) | note.lane as u64
}

/// Keep each note with the profile's density; never adds notes
fn thin_to_density(notes: Vec<AdvancedNote>, density: f64, seed: u64) -> Vec<AdvancedNote> {
    if density >= 1.0 {
        return notes;
    }
    notes
        .into_iter()
        .filter(|n| {
            let key = format!("{}/scale", n.instrument.name());
            keyed_unit(seed, &key, note_key(n)) < density
        })
        .collect()
}

/// At most `max` lanes sound at once; quieter notes go first, chords shed lanes
fn limit_simultaneous(notes: Vec<AdvancedNote>, max: usize) -> Vec<AdvancedNote> {
    let max = max.max(1);
    let mut by_time: BTreeMap<u32, Vec<AdvancedNote>> = BTreeMap::new();
    for note in notes {
        by_time.entry(note.time_ms).or_default().push(note);
    }

    let mut out = Vec::new();
    for (_, mut group) in by_time {
        let total: usize = group.iter().map(AdvancedNote::simultaneous_count).sum();
        if total <= max {
            out.extend(group);
            continue;
        }
        group.sort_by(|a, b| b.velocity.total_cmp(&a.velocity).then(a.lane.cmp(&b.lane)));
        let mut used = 0;
        for mut note in group {
            if used >= max {
                break;
            }
            let room = max - used;
            if note.simultaneous_count() > room {
                note.chord_notes.truncate(room - 1);
                if note.chord_notes.is_empty() && note.note_type == NoteType::Chord {
                    note.note_type = NoteType::Tap;
                }
            }
            used += note.simultaneous_count();
            out.push(note);
        }
    }
    out
}

/// Hammer/pull notes whose origin was removed revert to taps; other chain
/// entries that no longer exist are dropped
fn repair_chains(notes: &mut [AdvancedNote]) {
    let alive: HashSet<NoteId> = notes.iter().map(|n| n.id).collect();
    for note in notes.iter_mut() {
        if note.hammer_pull_chain.is_empty() {
            continue;
        }
        let origin_alive = note
            .hammer_pull_chain
            .last()
            .is_some_and(|id| alive.contains(id));
        if note.note_type.is_hammer_pull() && !origin_alive {
            note.reset_to_tap();
        } else {
            note.hammer_pull_chain.retain(|id| alive.contains(id));
        }
    }
}

/// Redraw lanes from the profile's lane distribution where nothing depends on them
fn redistribute_lanes(notes: &mut [AdvancedNote], profile: &DifficultyProfile, seed: u64) {
    let referenced: HashSet<NoteId> = notes
        .iter()
        .flat_map(|n| n.hammer_pull_chain.iter().copied())
        .collect();
    let mut occupied: HashSet<(u32, u8)> = notes.iter().map(|n| (n.time_ms, n.lane)).collect();

    for i in 0..notes.len() {
        let after_slide = i > 0 && notes[i - 1].note_type == NoteType::Slide;
        let note = &notes[i];
        if note.instrument == Instrument::Drums
            || !note.note_type.is_base()
            || !note.chord_notes.is_empty()
            || referenced.contains(&note.id)
            || after_slide
        {
            continue;
        }

        let key = format!("{}/lane", note.instrument.name());
        let lane = profile.lane_for_draw(keyed_unit(seed, &key, note.id.0 as u64));
        if lane != note.lane && occupied.insert((note.time_ms, lane)) {
            occupied.remove(&(note.time_ms, note.lane));
            notes[i].lane = lane;
        }
    }
}

/// Re-apply technique tagging with the adapted weights
fn inject_features(
    notes: &mut [AdvancedNote],
    profile: &DifficultyProfile,
    config: &Config,
    oracle: &mut dyn FeatureOracle,
) {
    let chance = profile.advanced_feature_chance;
    let weights = profile.feature_weights;
    let features = &config.features;

    for i in 0..notes.len() {
        if notes[i].note_type != NoteType::Tap && notes[i].note_type != NoteType::Hold {
            continue;
        }
        let prev = i.checked_sub(1).map(|p| notes[p].clone());
        let next_gap = notes
            .get(i + 1)
            .map(|n| (n.time_ms.saturating_sub(notes[i].time_ms), n.lane));
        let note = &mut notes[i];

        if note.instrument == Instrument::Drums {
            if note.note_type != NoteType::Tap {
                continue;
            }
            if note.velocity < features.ghost_velocity_max {
                if oracle.decide(Feature::Ghost, weights.ghost * chance, note) {
                    note.note_type = NoteType::Ghost;
                }
            } else if note.velocity > features.accent_velocity_min {
                if oracle.decide(Feature::Accent, weights.accent * chance, note) {
                    note.note_type = NoteType::Accent;
                    note.particle = Some(ParticleHint::Sparks);
                }
            } else if note.lane == 1 && oracle.decide(Feature::Tremolo, weights.tremolo * chance, note) {
                note.note_type = NoteType::Tremolo;
                note.duration_ms = Some(features.tremolo_duration_ms);
            }
            continue;
        }

        if note.instrument == Instrument::Melody && note.note_type == NoteType::Tap {
            if let Some(prev) = prev.as_ref().filter(|p| {
                let dt = note.time_ms.saturating_sub(p.time_ms);
                dt > 0 && dt <= features.hammer_pull_window_ms && p.lane.abs_diff(note.lane) == 1
            }) {
                if oracle.decide(Feature::HammerPull, weights.hammer_pull * chance, note) {
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
                    continue;
                }
            }
        }

        let Some((gap, next_lane)) = next_gap else {
            continue;
        };
        let distance = note.lane.abs_diff(next_lane);
        if (features.slide_min_gap_ms..=features.slide_max_gap_ms).contains(&gap)
            && distance >= features.slide_min_distance
            && oracle.decide(Feature::Slide, weights.slide * chance, note)
        {
            note.note_type = NoteType::Slide;
            note.duration_ms = Some(gap);
            note.slide = Some(SlideInfo {
                direction: if next_lane > note.lane {
                    SlideDirection::Up
                } else {
                    SlideDirection::Down
                },
                distance,
                duration_ms: gap,
            });
        } else if note.note_type == NoteType::Tap
            && gap >= config.scaling.hold_min_gap_ms
            && oracle.decide(Feature::Hold, weights.hold * chance, note)
        {
            note.note_type = NoteType::Hold;
            note.duration_ms = Some(gap / 2);
        }
    }
}

/// Section index of a note; without sections the song is cut into `parts` equal spans
fn section_index(time_sec: f64, ctx: &ScalingContext, parts: usize) -> Option<usize> {
    match ctx.sections {
        Some(sections) if !sections.is_empty() => section_at(sections, time_sec).map(|(i, _)| i),
        _ if ctx.duration_sec > 0.0 => {
            let span = ctx.duration_sec / parts as f64;
            Some(((time_sec / span).floor() as usize).min(parts - 1))
        }
        _ => None,
    }
}

/// Adapt an enriched chart to a song's complexity.
///
/// Steps run in order: density thinning, simultaneous-note limit, chain
/// repair, lane redistribution, feature injection, section velocity curve.
pub fn adapt(
    notes: &[AdvancedNote],
    complexity: &SongComplexityAnalysis,
    settings: &AdaptiveDifficultySettings,
    ctx: &ScalingContext,
    oracle: &mut dyn FeatureOracle,
    config: &Config,
) -> Vec<AdvancedNote> {
    let profile = adapted_profile(complexity, settings, &config.scaling);

    let mut notes = thin_to_density(notes.to_vec(), profile.density_multiplier, ctx.seed);
    notes = limit_simultaneous(notes, profile.max_simultaneous_notes);
    sort_notes(&mut notes);
    repair_chains(&mut notes);

    if settings.lane_redistribution {
        redistribute_lanes(&mut notes, &profile, ctx.seed);
        sort_notes(&mut notes);
    }
    inject_features(&mut notes, &profile, config, oracle);

    let curve = &config.scaling.section_curve;
    if settings.section_based_scaling && !curve.is_empty() {
        for note in notes.iter_mut() {
            if let Some(idx) = section_index(note.time_ms as f64 / 1000.0, ctx, curve.len()) {
                note.velocity = (note.velocity * curve[idx % curve.len()]).clamp(0.0, 1.0);
            }
        }
    }
    notes
}

/// Reshape the upcoming stretch of a chart to the player's recent performance.
///
/// Only notes after `presented_until_ms` and inside the lookahead window are
/// touched; anything already shown to the player is returned unchanged.
pub fn adapt_to_performance(
    notes: &[AdvancedNote],
    metrics: &PerformanceMetrics,
    presented_until_ms: u32,
    config: &ScalingConfig,
) -> Vec<AdvancedNote> {
    let score = metrics.score();
    let window_end = presented_until_ms.saturating_add(config.live_lookahead_ms);
    let in_window = |n: &AdvancedNote| n.time_ms > presented_until_ms && n.time_ms <= window_end;

    let mut out = notes.to_vec();
    sort_notes(&mut out);

    if score < config.live_simplify_below {
        for note in out.iter_mut().filter(|n| in_window(n)) {
            if note.note_type != NoteType::Tap {
                note.reset_to_tap();
            }
        }
    } else if score > config.live_enrich_above {
        for i in 0..out.len() {
            let next_time = out.get(i + 1).map(|n| n.time_ms);
            let note = &mut out[i];
            if !in_window(note) || note.note_type != NoteType::Tap || !note.instrument.is_pitched() {
                continue;
            }
            if let Some(gap) = next_time.map(|t| t.saturating_sub(note.time_ms)) {
                if gap >= config.hold_min_gap_ms {
                    note.note_type = NoteType::Hold;
                    note.duration_ms = Some(gap / 2);
                }
            }
        }
    }
    out
}

pub fn run(state: &mut SongState, config: &Config) -> Result<()> {
    info!("Pass 5: Dynamic Difficulty Scaling");

    let beats = state.beat_analysis.as_ref().ok_or_else(|| {
        ChartError::InvalidInput("Pass 1 must be run before Pass 5".to_string())
    })?;
    let complexity = state
        .complexity
        .unwrap_or_else(|| song_complexity(beats, state.harmony.as_ref(), state.sections.as_deref()));
    info!(
        "  Song complexity {:.2} (tempo {:.2}, rhythm {:.2}, harmony {:.2}, structure {:.2})",
        complexity.overall_complexity,
        complexity.tempo_complexity,
        complexity.rhythmic_complexity,
        complexity.harmonic_complexity,
        complexity.structural_complexity
    );

    let ctx_sections = state.sections.as_deref();
    let duration_sec = beats.duration_sec;
    let seed = state.request.seed;
    let real_time = state.request.real_time_adaptation;
    let cancel = &state.cancel;

    state
        .enhanced
        .par_iter_mut()
        .map(|chart| {
            cancel.check()?;
            let mut settings = AdaptiveDifficultySettings::new(chart.difficulty, &config.scaling);
            settings.real_time_adjustment = real_time;

            let key = format!(
                "scaling/{}/{}",
                chart.instrument.name(),
                chart.difficulty.name()
            );
            let mut oracle = SeededOracle::new(derive_seed(seed, &key));
            let ctx = ScalingContext {
                sections: ctx_sections,
                duration_sec,
                seed,
            };

            let before = chart.notes.len();
            chart.notes = adapt(&chart.notes, &complexity, &settings, &ctx, &mut oracle, config);
            chart.combo_chains = build_combo_chains(&chart.notes, &config.features);
            chart.adapted_profile = Some(adapted_profile(&complexity, &settings, &config.scaling));
            chart.adaptive_settings = real_time.then_some(settings);

            debug!(
                "  {}/{}: {} -> {} notes",
                chart.instrument.name(),
                chart.difficulty.name(),
                before,
                chart.notes.len()
            );
            Ok(())
        })
        .collect::<Result<Vec<()>>>()?;

    state.complexity = Some(complexity);
    info!("  Scaled {} charts", state.enhanced.len());
    Ok(())
}
