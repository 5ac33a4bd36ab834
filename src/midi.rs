//! Standard MIDI File import of stem note events, and chart export to MIDI

use crate::analysis::NoteEvent;
use crate::chart::{AdvancedNote, Instrument};
use crate::error::{ChartError, Result};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use tracing::debug;

const DEFAULT_TEMPO_USPQ: u32 = 500_000;
const EXPORT_PPQ: u16 = 960;
/// General MIDI kick, snare, closed hi-hat, crash for drum lanes 0-3
const DRUM_LANE_KEYS: [u8; 4] = [36, 38, 42, 49];
const DEFAULT_NOTE_MS: u32 = 100;

/// Tick to seconds conversion honouring every tempo change in the file
struct TempoMap {
    ppq: f64,
    /// (tick, seconds at tick, microseconds per quarter)
    segments: Vec<(u64, f64, u32)>,
    /// Seconds per tick for SMPTE timing
    fixed_rate: Option<f64>,
}

impl TempoMap {
    fn new(smf: &Smf) -> Self {
        let (ppq, fixed_rate) = match smf.header.timing {
            Timing::Metrical(ticks) => (ticks.as_int().max(1) as f64, None),
            Timing::Timecode(fps, subframes) => {
                let rate = fps.as_f32() as f64 * subframes.max(1) as f64;
                (1.0, Some(1.0 / rate))
            }
        };

        let mut changes: Vec<(u64, u32)> = Vec::new();
        for track in &smf.tracks {
            let mut tick = 0u64;
            for event in track {
                tick += event.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(uspq)) = event.kind {
                    changes.push((tick, uspq.as_int()));
                }
            }
        }
        changes.sort_by_key(|&(tick, _)| tick);

        let mut segments = vec![(0u64, 0.0f64, DEFAULT_TEMPO_USPQ)];
        for (tick, uspq) in changes {
            let Some(&(last_tick, last_sec, last_uspq)) = segments.last() else {
                continue;
            };
            let sec = last_sec + (tick - last_tick) as f64 * last_uspq as f64 / 1e6 / ppq;
            if tick == last_tick {
                segments.pop();
            }
            segments.push((tick, sec, uspq));
        }

        Self {
            ppq,
            segments,
            fixed_rate,
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        if let Some(rate) = self.fixed_rate {
            return tick as f64 * rate;
        }
        let idx = self.segments.partition_point(|&(t, _, _)| t <= tick).saturating_sub(1);
        let (seg_tick, seg_sec, uspq) = self.segments[idx];
        seg_sec + (tick - seg_tick) as f64 * uspq as f64 / 1e6 / self.ppq
    }
}

/// Flatten every track of a Standard MIDI File into note events.
///
/// Notes left sounding at the end of their track end there.
pub fn read_note_events(bytes: &[u8]) -> Result<Vec<NoteEvent>> {
    let smf = Smf::parse(bytes).map_err(|e| ChartError::MidiImportError(e.to_string()))?;
    let tempo = TempoMap::new(&smf);

    let mut events = Vec::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        // (channel, key) -> stack of (start tick, velocity)
        let mut active: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();

        let mut finish = |start: u64, end: u64, key: u8, vel: u8| {
            let time = tempo.seconds(start);
            events.push(NoteEvent {
                time,
                pitch: key,
                velocity: vel as f64 / 127.0,
                duration: (tempo.seconds(end) - time).max(0.0),
                confidence: 1.0,
            });
        };

        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let ch = channel.as_int();
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    active
                        .entry((ch, key.as_int()))
                        .or_default()
                        .push((tick, vel.as_int()));
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    let started = active.get_mut(&(ch, key.as_int())).and_then(|s| s.pop());
                    if let Some((start, vel)) = started {
                        finish(start, tick, key.as_int(), vel);
                    }
                }
                _ => {}
            }
        }

        for ((_, key), starts) in active {
            for (start, vel) in starts {
                finish(start, tick, key, vel);
            }
        }
    }

    events.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.pitch.cmp(&b.pitch)));
    debug!("Imported {} note events from {} tracks", events.len(), smf.tracks.len());
    Ok(events)
}

fn export_key(note: &AdvancedNote) -> u8 {
    match (note.instrument, note.pitch) {
        (Instrument::Drums, _) => DRUM_LANE_KEYS[note.lane.min(3) as usize],
        (_, Some(pitch)) => pitch.min(127),
        // unpitched notes climb from middle C by lane
        (_, None) => 60 + note.lane * 2,
    }
}

/// Render one chart as a single-track MIDI file at a constant tempo
pub fn chart_to_midi(notes: &[AdvancedNote], bpm: f64, time_signature: (u8, u8)) -> Result<Vec<u8>> {
    let bpm = if bpm.is_finite() && bpm > 0.0 { bpm } else { 120.0 };
    let ticks_per_ms = EXPORT_PPQ as f64 * bpm / 60_000.0;
    let to_tick = |ms: u32| (ms as f64 * ticks_per_ms).round() as u32;

    // (tick, is_on, channel, key, velocity); offs sort before ons at the same tick
    let mut timeline: Vec<(u32, bool, u8, u8, u8)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let channel = if note.instrument == Instrument::Drums { 9 } else { 0 };
        let key = export_key(note);
        let vel = (note.velocity * 127.0).round().clamp(1.0, 127.0) as u8;
        let start = to_tick(note.time_ms);
        let end = to_tick(note.time_ms + note.duration_ms.unwrap_or(DEFAULT_NOTE_MS)).max(start + 1);
        timeline.push((start, true, channel, key, vel));
        timeline.push((end, false, channel, key, 0));
    }
    timeline.sort_by_key(|&(tick, is_on, channel, key, _)| (tick, is_on, channel, key));

    let uspq = (60_000_000.0 / bpm).round() as u32;
    let (numerator, denominator) = time_signature;
    let mut track = vec![
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(uspq))),
        },
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(
                numerator,
                denominator.max(1).trailing_zeros() as u8,
                24,
                8,
            )),
        },
    ];

    let mut current = 0u32;
    for (tick, is_on, channel, key, vel) in timeline {
        let message = if is_on {
            MidiMessage::NoteOn {
                key: u7::from(key),
                vel: u7::from(vel),
            }
        } else {
            MidiMessage::NoteOff {
                key: u7::from(key),
                vel: u7::from(0),
            }
        };
        track.push(TrackEvent {
            delta: u28::from(tick - current),
            kind: TrackEventKind::Midi {
                channel: u4::from(channel),
                message,
            },
        });
        current = tick;
    }
    track.push(TrackEvent {
        delta: u28::from(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });

    let smf = Smf {
        header: Header {
            format: Format::SingleTrack,
            timing: Timing::Metrical(u15::from(EXPORT_PPQ)),
        },
        tracks: vec![track],
    };
    let mut bytes = Vec::new();
    smf.write(&mut bytes)
        .map_err(|e| ChartError::ExportError(format!("Failed to write MIDI data: {}", e)))?;
    Ok(bytes)
}
