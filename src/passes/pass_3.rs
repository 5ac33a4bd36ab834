//! Pass 3: Instrument Chart Generation

use crate::analysis::{BeatAnalysisResult, NoteEvent, StemAnalysis};
use crate::chart::{
    ChartMetadata, Difficulty, Instrument, InstrumentChart, Note, NoteId, NoteType,
    TechniqueFlags, LANE_COUNT,
};
use crate::config::{Config, GenerationConfig};
use crate::error::{ChartError, Result};
use crate::rng::keyed_unit;
use crate::SongState;
use std::collections::HashSet;
use tracing::{debug, info};

/// Map a MIDI pitch onto a lane: low register left, high register right
pub fn pitch_to_lane(pitch: u8) -> u8 {
    match pitch {
        0..=49 => 0,
        50..=59 => 1,
        60..=71 => 2,
        _ => 3,
    }
}

fn bass_pattern(difficulty: Difficulty) -> &'static [u8] {
    match difficulty {
        Difficulty::Easy => &[0],
        Difficulty::Medium => &[0, 0, 2, 2],
        Difficulty::Hard => &[0, 1, 2, 1],
        Difficulty::Expert => &[0, 2, 1, 3],
    }
}

fn melody_pattern(difficulty: Difficulty) -> &'static [u8] {
    match difficulty {
        Difficulty::Easy => &[0, 1, 2, 1],
        Difficulty::Medium => &[0, 1, 2, 3, 2, 1],
        Difficulty::Hard => &[0, 2, 1, 3, 2, 1, 0],
        Difficulty::Expert => &[0, 2, 1, 3, 2, 0, 3, 1],
    }
}

/// Note before quantization and id assignment
#[derive(Debug, Clone, PartialEq)]
struct Placement {
    time: f64,
    lane: u8,
    note_type: NoteType,
    duration_ms: Option<u32>,
    velocity: f64,
    pitch: Option<u8>,
    candidates: TechniqueFlags,
    /// Sits this many seconds after the preceding placement instead of on the grid
    grace_offset: Option<f64>,
}

impl Placement {
    fn tap(time: f64, lane: u8, velocity: f64) -> Self {
        Placement {
            time,
            lane,
            note_type: NoteType::Tap,
            duration_ms: None,
            velocity: velocity.clamp(0.0, 1.0),
            pitch: None,
            candidates: TechniqueFlags::default(),
            grace_offset: None,
        }
    }
}

fn to_ms(seconds: f64) -> u32 {
    (seconds.max(0.0) * 1000.0).round() as u32
}

/// Off-downbeat events survive with the tier's density; draws are keyed per event
/// so an easier tier keeps a subset of a harder one
fn keeps_event(seed: u64, instrument: Instrument, index: usize, density: f64) -> bool {
    index % 4 == 0 || keyed_unit(seed, &format!("{}/density", instrument.name()), index as u64) < density
}

fn place_drums(events: &[NoteEvent], difficulty: Difficulty, config: &GenerationConfig) -> Vec<Placement> {
    let above_easy = difficulty > Difficulty::Easy;
    let hard_plus = difficulty >= Difficulty::Hard;
    let mut placements = Vec::new();

    for (i, event) in events.iter().enumerate() {
        if event.velocity < config.min_velocity {
            continue;
        }
        if i % 4 == 0 || (above_easy && i % 2 == 0) {
            placements.push(Placement::tap(event.time, 0, event.velocity));
        }
        if i % 4 == 2 || (difficulty == Difficulty::Expert && i % 4 == 1) {
            placements.push(Placement::tap(event.time, 1, event.velocity));
        }
        let hat = match difficulty {
            Difficulty::Easy => false,
            Difficulty::Medium => i % 4 != 3,
            Difficulty::Hard | Difficulty::Expert => i % 16 != 0,
        };
        if hat {
            placements.push(Placement::tap(
                event.time,
                2,
                event.velocity * config.hat_velocity_scale,
            ));
        }
        if hard_plus && i % 16 == 0 {
            placements.push(Placement::tap(event.time, 3, event.velocity));
        }
    }
    placements
}

fn place_bass(
    events: &[NoteEvent],
    difficulty: Difficulty,
    config: &GenerationConfig,
    seed: u64,
) -> Vec<Placement> {
    let pattern = bass_pattern(difficulty);
    let density = config.density.get(difficulty);
    let mut placements = Vec::new();

    for (i, event) in events.iter().enumerate() {
        if event.velocity < config.min_velocity
            || !keeps_event(seed, Instrument::Bass, i, density)
        {
            continue;
        }
        let mut note = Placement::tap(event.time, pattern[i % pattern.len()], event.velocity);
        note.pitch = (event.pitch > 0).then_some(event.pitch);

        let duration_ms = to_ms(event.duration);
        if difficulty == Difficulty::Expert
            && i % 4 == 0
            && duration_ms >= config.hold_min_duration_ms
            && keyed_unit(seed, "bass/hold", i as u64) < config.bass_hold_chance
        {
            note.note_type = NoteType::Hold;
            note.duration_ms = Some(duration_ms);
        }
        placements.push(note);
    }
    placements
}

fn place_melody(
    events: &[NoteEvent],
    difficulty: Difficulty,
    config: &GenerationConfig,
    beat_period: f64,
    seed: u64,
) -> Vec<Placement> {
    let pattern = melody_pattern(difficulty);
    let density = config.density.get(difficulty);
    let hammer_chance = config.hammer_pull_candidate.get(difficulty);
    let slide_chance = config.slide_candidate.get(difficulty);
    let chord_chance = config.chord_candidate.get(difficulty);
    let grace_offset = (beat_period / 4.0).min(config.grace_max_offset_ms as f64 / 1000.0);
    let mut placements = Vec::new();

    for (i, event) in events.iter().enumerate() {
        if event.velocity < config.min_velocity
            || !keeps_event(seed, Instrument::Melody, i, density)
        {
            continue;
        }
        let index = i as u64;
        let lane = pattern[i % pattern.len()];
        let mut note = Placement::tap(event.time, lane, event.velocity);
        note.pitch = (event.pitch > 0).then_some(event.pitch);
        note.candidates.slide = keyed_unit(seed, "melody/slide", index) < slide_chance;

        let grace = (keyed_unit(seed, "melody/hammer", index) < hammer_chance).then(|| {
            let grace_lane = if lane + 1 < LANE_COUNT { lane + 1 } else { lane - 1 };
            let mut grace = Placement::tap(event.time + grace_offset, grace_lane, event.velocity * 0.8);
            grace.pitch = note.pitch;
            grace.candidates.hammer_pull = true;
            grace.grace_offset = Some(grace_offset);
            grace
        });
        // a chord candidate brings the fifth above on a second lane for the feature pass to group
        let partner = (grace.is_none() && keyed_unit(seed, "melody/chord", index) < chord_chance).then(|| {
            let mut partner = Placement::tap(event.time, (lane + 2) % LANE_COUNT, event.velocity * 0.9);
            partner.pitch = note.pitch.map(|p| p.saturating_add(7).min(127));
            partner
        });

        placements.push(note);
        placements.extend(partner);
        placements.extend(grace);
    }
    placements
}

fn place_vocals(
    events: &[NoteEvent],
    config: &GenerationConfig,
    song_duration: f64,
) -> Vec<Placement> {
    let phrases = config.vocal_phrases.max(1);
    let song_end = events
        .iter()
        .map(|e| e.time + e.duration)
        .fold(song_duration, f64::max);
    if song_end <= 0.0 {
        return Vec::new();
    }
    let phrase_len = song_end / phrases as f64;
    let mut placements = Vec::new();

    for p in 0..phrases {
        let start = p as f64 * phrase_len;
        let end = start + phrase_len;
        let voiced: Vec<&NoteEvent> = events
            .iter()
            .filter(|e| e.time >= start && e.time < end && e.velocity >= config.min_velocity)
            .collect();
        let (Some(first), Some(last)) = (voiced.first(), voiced.last()) else {
            continue;
        };

        let pitched: Vec<f64> = voiced.iter().filter(|e| e.pitch > 0).map(|e| e.pitch as f64).collect();
        let pitch = (!pitched.is_empty())
            .then(|| (pitched.iter().sum::<f64>() / pitched.len() as f64).round() as u8);
        let velocity = voiced.iter().map(|e| e.velocity).sum::<f64>() / voiced.len() as f64;

        let mut note = Placement::tap(first.time, pitch.map_or(1, pitch_to_lane), velocity);
        note.pitch = pitch;
        let hold_ms = to_ms((last.time + last.duration).min(end) - first.time);
        if hold_ms >= config.hold_min_duration_ms {
            note.note_type = NoteType::Hold;
            note.duration_ms = Some(hold_ms);
        }
        placements.push(note);
    }
    placements
}

/// Snap a time onto the 16th-note grid of the surrounding beat interval
pub fn snap_to_sixteenth(time: f64, beats: &[f64], period: f64) -> f64 {
    let (anchor, span) = match beats.len() {
        0 => (0.0, period),
        1 => (beats[0], period),
        n => {
            let idx = beats.partition_point(|&b| b <= time);
            if idx == 0 {
                (beats[0], beats[1] - beats[0])
            } else if idx >= n {
                (beats[n - 1], beats[n - 1] - beats[n - 2])
            } else {
                (beats[idx - 1], beats[idx] - beats[idx - 1])
            }
        }
    };
    let grid = span / 4.0;
    if grid <= 0.0 || !grid.is_finite() {
        return time.max(0.0);
    }
    (anchor + ((time - anchor) / grid).round() * grid).max(0.0)
}

/// Drop same-lane notes closer than `spacing_ms` or starting inside a hold
fn thin_lanes(notes: Vec<Note>, spacing_ms: u32) -> Vec<Note> {
    let mut free_at: [Option<u32>; LANE_COUNT as usize] = [None; LANE_COUNT as usize];
    notes
        .into_iter()
        .filter(|note| {
            let slot = &mut free_at[note.lane as usize];
            if slot.is_some_and(|free| note.time_ms < free) {
                return false;
            }
            let end = note.time_ms + note.duration_ms.unwrap_or(0);
            *slot = Some((note.time_ms + spacing_ms).max(end));
            true
        })
        .collect()
}

fn chart_metadata(notes: &[Note], beats: &BeatAnalysisResult) -> ChartMetadata {
    let n = notes.len();
    let nps = if beats.duration_sec > 0.0 {
        n as f64 / beats.duration_sec
    } else {
        0.0
    };
    let lane_jumps = notes.windows(2).filter(|w| w[0].lane != w[1].lane).count();
    let jump_rate = if n > 1 {
        lane_jumps as f64 / (n - 1) as f64
    } else {
        0.0
    };
    let types: HashSet<NoteType> = notes.iter().map(|note| note.note_type).collect();

    ChartMetadata {
        complexity_score: (0.5 * (nps / 8.0).min(1.0) + 0.5 * jump_rate).clamp(0.0, 1.0),
        note_density: if beats.beats.is_empty() {
            0.0
        } else {
            n as f64 / beats.beats.len() as f64
        },
        technique_variety: types.len() as f64 / 6.0,
        musical_accuracy: beats.confidence,
    }
}

/// Build the base chart for one stem at one difficulty
pub fn generate_chart(
    stem: &StemAnalysis,
    beats: &BeatAnalysisResult,
    difficulty: Difficulty,
    config: &GenerationConfig,
    seed: u64,
) -> InstrumentChart {
    let events = &stem.note_events;
    let placements = match stem.instrument {
        Instrument::Drums => place_drums(events, difficulty, config),
        Instrument::Bass => place_bass(events, difficulty, config, seed),
        Instrument::Melody => place_melody(events, difficulty, config, beats.beat_period(), seed),
        Instrument::Vocals => place_vocals(events, config, beats.duration_sec),
    };

    let mut previous = 0.0;
    let mut notes: Vec<Note> = placements
        .into_iter()
        .map(|p| {
            let time = match p.grace_offset {
                Some(offset) => previous + offset,
                None if config.quantize_to_sixteenths => {
                    snap_to_sixteenth(p.time, &beats.beats, beats.beat_period())
                }
                None => p.time,
            };
            previous = time;
            Note {
                id: NoteId(0),
                time_ms: to_ms(time),
                lane: p.lane.min(LANE_COUNT - 1),
                note_type: p.note_type,
                duration_ms: p.duration_ms,
                velocity: p.velocity,
                instrument: stem.instrument,
                pitch: p.pitch,
                candidates: p.candidates,
            }
        })
        .collect();

    // loudest note wins a shared (time, lane) slot
    notes.sort_by(|a, b| {
        (a.time_ms, a.lane)
            .cmp(&(b.time_ms, b.lane))
            .then(b.velocity.total_cmp(&a.velocity))
    });
    notes.dedup_by_key(|n| (n.time_ms, n.lane));

    let mut notes = thin_lanes(notes, config.min_spacing_ms.get(difficulty));
    for (i, note) in notes.iter_mut().enumerate() {
        note.id = NoteId(i as u32);
    }

    let metadata = chart_metadata(&notes, beats);
    InstrumentChart {
        instrument: stem.instrument,
        difficulty,
        notes,
        metadata,
    }
}

/// One chart per (stem, difficulty) pair
pub fn generate(
    stem_analyses: &[StemAnalysis],
    beats: &BeatAnalysisResult,
    difficulties: &[Difficulty],
    config: &GenerationConfig,
    seed: u64,
) -> Vec<InstrumentChart> {
    stem_analyses
        .iter()
        .flat_map(|stem| {
            difficulties
                .iter()
                .map(move |&difficulty| generate_chart(stem, beats, difficulty, config, seed))
        })
        .collect()
}

pub fn run(state: &mut SongState, config: &Config) -> Result<()> {
    info!("Pass 3: Instrument Chart Generation");
    state.cancel.check()?;

    let beats = state.beat_analysis.as_ref().ok_or_else(|| {
        ChartError::InvalidInput("Pass 1 must be run before Pass 3".to_string())
    })?;

    let charts = generate(
        &state.stem_analyses,
        beats,
        &state.request.difficulties,
        &config.generation,
        state.request.seed,
    );

    for chart in &charts {
        debug!(
            "  {}/{}: {} notes (density {:.2}/beat, complexity {:.2})",
            chart.instrument.name(),
            chart.difficulty.name(),
            chart.notes.len(),
            chart.metadata.note_density,
            chart.metadata.complexity_score
        );
    }
    info!("  Generated {} base charts", charts.len());

    state.base_charts = charts;
    Ok(())
}
