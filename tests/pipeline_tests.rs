//! End-to-end validation of the chart generation pipeline

use chartforge::analysis::NoteEvent;
use chartforge::chart::{NoteId, NoteType, SectionType, SongSection, LANE_COUNT};
use chartforge::config::SongInfo;
use chartforge::difficulty::PerformanceMetrics;
use chartforge::error::PipelineWarning;
use chartforge::{
    export, midi, AudioSignal, CancellationToken, ChartError, ChartGenerationConfig,
    ChartPipeline, Config, Difficulty, Instrument, StemSource,
};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::collections::HashMap;
use std::f32::consts::PI;

const SR: u32 = 22050;

/// Noise-burst hits on every beat
fn generate_click_track(bpm: f64, n_beats: usize, first_hit: f64, seed: u64) -> Vec<f32> {
    let period = 60.0 / bpm;
    let total = ((first_hit + n_beats as f64 * period) * SR as f64) as usize;
    let mut audio = vec![0.0f32; total];
    let mut rng = Pcg32::seed_from_u64(seed);
    let hit_len = (0.06 * SR as f64) as usize;

    for b in 0..n_beats {
        let start = ((first_hit + b as f64 * period) * SR as f64).round() as usize;
        for i in 0..hit_len.min(total.saturating_sub(start)) {
            let t = i as f32 / SR as f32;
            let envelope = (-t * 50.0).exp();
            let noise = rng.gen_range(-1.0f32..1.0);
            let body = (2.0 * PI * 150.0 * t).sin();
            audio[start + i] += (0.6 * noise + 0.4 * body) * envelope * 0.5;
        }
    }
    audio
}

/// A walking tone line, one pitch per beat
fn generate_tone_line(bpm: f64, n_beats: usize, first_hit: f64, freqs: &[f32]) -> Vec<f32> {
    let period = 60.0 / bpm;
    let total = ((first_hit + n_beats as f64 * period) * SR as f64) as usize;
    let mut audio = vec![0.0f32; total];
    let per_beat = (period * SR as f64) as usize;

    for b in 0..n_beats {
        let start = ((first_hit + b as f64 * period) * SR as f64).round() as usize;
        let freq = freqs[b % freqs.len()];
        for i in 0..per_beat.min(total.saturating_sub(start)) {
            let t = i as f32 / SR as f32;
            audio[start + i] = 0.4 * (-t * 3.0).exp() * (2.0 * PI * freq * t).sin();
        }
    }
    audio
}

fn mix(parts: &[&[f32]]) -> Vec<f32> {
    let len = parts.iter().map(|p| p.len()).max().unwrap_or(0);
    let mut out = vec![0.0f32; len];
    for part in parts {
        for (o, s) in out.iter_mut().zip(part.iter()) {
            *o += s;
        }
    }
    out
}

fn request(instruments: Vec<Instrument>, difficulties: Vec<Difficulty>) -> ChartGenerationConfig {
    ChartGenerationConfig {
        instruments,
        difficulties,
        seed: 42,
        ..ChartGenerationConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_song_rejected() {
        let pipeline = ChartPipeline::new(Config::default());
        let result = pipeline.generate_charts(
            &AudioSignal::mono(&[], SR),
            &[],
            &ChartGenerationConfig::default(),
        );
        assert!(matches!(result, Err(ChartError::InvalidInput(_))));
    }

    #[test]
    fn test_easy_drums_follow_the_beat_grid() {
        let drums = generate_click_track(120.0, 16, 0.25, 1);
        let stems = vec![(Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR)))];
        let mut req = request(vec![Instrument::Drums], vec![Difficulty::Easy]);
        req.dynamic_difficulty = false;
        req.harmonic_analysis = false;
        req.structural_analysis = false;

        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
            .unwrap();

        let beats = &result.beat_analysis.beats;
        assert!((15..=17).contains(&beats.len()), "tracked {} beats", beats.len());

        let chart = result.chart(Instrument::Drums, Difficulty::Easy).unwrap();
        let beat_ms = |i: usize| (beats[i] * 1000.0).round() as u32;
        let kicks: Vec<u32> = chart.notes.iter().filter(|n| n.lane == 0).map(|n| n.time_ms).collect();
        let expected: Vec<u32> = (0..beats.len()).step_by(4).map(beat_ms).collect();
        assert_eq!(kicks, expected);
        assert!(chart.notes.iter().all(|n| n.lane < 2), "no hi-hat or crash at Easy");
    }

    #[test]
    fn test_missing_stem_gives_empty_charts_and_warning() {
        let drums = generate_click_track(120.0, 16, 0.25, 2);
        let stems = vec![(Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR)))];
        let req = request(
            vec![Instrument::Drums, Instrument::Vocals],
            vec![Difficulty::Easy, Difficulty::Expert],
        );

        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
            .unwrap();

        assert_eq!(result.charts.len(), 4);
        for difficulty in [Difficulty::Easy, Difficulty::Expert] {
            assert!(result.chart(Instrument::Vocals, difficulty).unwrap().notes.is_empty());
            assert!(!result.chart(Instrument::Drums, difficulty).unwrap().notes.is_empty());
        }
        assert!(result.warnings.contains(&PipelineWarning::EmptyStem {
            instrument: Instrument::Vocals
        }));
        assert_eq!(result.quality_metrics.empty_charts, 2);
    }

    #[test]
    fn test_same_seed_same_export() {
        let drums = generate_click_track(128.0, 48, 0.1, 3);
        let bass = generate_tone_line(128.0, 48, 0.1, &[55.0, 73.4, 82.4, 98.0]);
        let song = mix(&[&drums, &bass]);
        let stems = vec![
            (Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR))),
            (Instrument::Bass, StemSource::Audio(AudioSignal::mono(&bass, SR))),
        ];
        let req = request(vec![Instrument::Drums, Instrument::Bass], Difficulty::ALL.to_vec());
        let pipeline = ChartPipeline::new(Config::default());

        let render = || {
            let result = pipeline
                .generate_charts(&AudioSignal::mono(&song, SR), &stems, &req)
                .unwrap();
            let set = export::build_export(&result, &req.song, &pipeline.config().export);
            export::to_json(&set, false).unwrap()
        };
        assert_eq!(render(), render());
    }

    #[test]
    fn test_generated_charts_hold_invariants() {
        let drums = generate_click_track(140.0, 64, 0.2, 4);
        let bass = generate_tone_line(140.0, 64, 0.2, &[41.2, 55.0, 61.7, 49.0]);
        let melody = generate_tone_line(140.0, 64, 0.2, &[261.6, 329.6, 392.0, 523.3, 440.0]);
        let song = mix(&[&drums, &bass, &melody]);
        let stems = vec![
            (Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR))),
            (Instrument::Bass, StemSource::Audio(AudioSignal::mono(&bass, SR))),
            (Instrument::Melody, StemSource::Audio(AudioSignal::mono(&melody, SR))),
        ];
        let mut req = request(
            vec![Instrument::Drums, Instrument::Bass, Instrument::Melody],
            Difficulty::ALL.to_vec(),
        );
        req.chord_symbols = ["C", "F", "G", "C"].iter().map(|s| s.to_string()).collect();

        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&song, SR), &stems, &req)
            .unwrap();

        assert_eq!(result.charts.len(), 12);
        assert_eq!(result.key.as_ref().map(|k| k.name.as_str()), Some("C major"));

        for chart in &result.charts {
            let times: HashMap<NoteId, u32> = chart.notes.iter().map(|n| (n.id, n.time_ms)).collect();
            assert_eq!(times.len(), chart.notes.len(), "note ids must be unique");
            for pair in chart.notes.windows(2) {
                assert!(pair[0].time_ms <= pair[1].time_ms);
            }
            for note in &chart.notes {
                assert!(note.lane < LANE_COUNT);
                assert!(note.chord_notes.iter().all(|&l| l < LANE_COUNT));
                assert!((0.0..=1.0).contains(&note.velocity));
                for id in &note.hammer_pull_chain {
                    assert!(times.get(id).is_some_and(|&t| t <= note.time_ms));
                }
                if chart.instrument == Instrument::Drums {
                    assert!(note.chord_notes.is_empty());
                    assert_ne!(note.note_type, NoteType::Slide);
                }
            }
            for combo in &chart.combo_chains {
                assert!(combo.notes.iter().all(|id| times.contains_key(id)));
            }

            let insights = chart.ai_insights;
            for score in [
                insights.complexity_score,
                insights.musical_accuracy,
                insights.harmonic_alignment,
                insights.rhythmic_coherence,
                insights.difficulty_balance,
            ] {
                assert!((0.0..=1.0).contains(&score), "{:?}", insights);
            }
            assert_eq!(chart.musical_context.sections, result.sections);
        }

        let metrics = &result.quality_metrics;
        assert_eq!(metrics.chart_count, 12);
        assert!((0.0..=1.0).contains(&metrics.overall));
        assert!(!result.sections.is_empty());
    }

    #[test]
    fn test_drum_note_count_rises_with_difficulty() {
        let drums = generate_click_track(120.0, 64, 0.25, 5);
        let stems = vec![(Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR)))];
        let req = request(vec![Instrument::Drums], Difficulty::ALL.to_vec());

        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
            .unwrap();

        let counts: Vec<usize> = Difficulty::ALL
            .iter()
            .map(|&d| result.chart(Instrument::Drums, d).unwrap().notes.len())
            .collect();
        for pair in counts.windows(2) {
            assert!(pair[0] <= pair[1], "counts not monotonic: {:?}", counts);
        }
    }

    #[test]
    fn test_cancelled_run_produces_nothing() {
        let drums = generate_click_track(120.0, 16, 0.25, 6);
        let token = CancellationToken::new();
        let pipeline = ChartPipeline::new(Config::default()).with_cancellation(token.clone());
        token.cancel();

        let result = pipeline.generate_charts(
            &AudioSignal::mono(&drums, SR),
            &[],
            &request(vec![Instrument::Drums], vec![Difficulty::Easy]),
        );
        assert!(matches!(result, Err(ChartError::CancellationRequested)));
    }

    #[test]
    fn test_malformed_sections_rejected() {
        let drums = generate_click_track(120.0, 16, 0.25, 7);
        let section = |start: f64, end: f64| SongSection {
            name: "part".to_string(),
            start_time: start,
            end_time: end,
            section_type: SectionType::Verse,
            key: None,
            chord_progression: Vec::new(),
            energy_level: 0.5,
            complexity_modifier: 1.0,
        };
        let mut req = request(vec![Instrument::Drums], vec![Difficulty::Easy]);
        req.sections = Some(vec![section(0.0, 5.0), section(4.0, 8.25)]);

        let result = ChartPipeline::new(Config::default()).generate_charts(
            &AudioSignal::mono(&drums, SR),
            &[],
            &req,
        );
        assert!(matches!(result, Err(ChartError::InvalidInput(_))));

        req.sections = Some(vec![section(0.0, 5.0), section(5.0, 8.25)]);
        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&drums, SR), &[], &req)
            .unwrap();
        assert_eq!(result.sections.len(), 2);
    }

    #[test]
    fn test_chord_symbols_keep_expert_hammer_pulls() {
        let drums = generate_click_track(120.0, 64, 0.25, 12);
        let events: Vec<NoteEvent> = (0..64)
            .map(|i| NoteEvent {
                time: 0.25 + i as f64 * 0.5,
                pitch: [60, 64, 67, 72, 67, 64][i % 6],
                velocity: 0.8,
                duration: 0.45,
                confidence: 1.0,
            })
            .collect();
        let stems = vec![
            (Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR))),
            (Instrument::Melody, StemSource::Events(events)),
        ];

        let hammer_pulls = |chord_symbols: Vec<String>| {
            let mut req = request(vec![Instrument::Drums, Instrument::Melody], vec![Difficulty::Expert]);
            req.dynamic_difficulty = false;
            req.chord_symbols = chord_symbols;
            let result = ChartPipeline::new(Config::default())
                .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
                .unwrap();
            let melody = result.chart(Instrument::Melody, Difficulty::Expert).unwrap();
            let lanes: HashMap<NoteId, u8> = melody.notes.iter().map(|n| (n.id, n.lane)).collect();
            for note in melody.notes.iter().filter(|n| n.note_type.is_hammer_pull()) {
                let origin = note.hammer_pull_chain.last().and_then(|id| lanes.get(id));
                assert!(origin.is_some_and(|&lane| lane.abs_diff(note.lane) == 1));
            }
            melody.notes.iter().filter(|n| n.note_type.is_hammer_pull()).count()
        };

        assert!(hammer_pulls(Vec::new()) > 0);
        assert!(hammer_pulls(vec!["C".to_string()]) > 0);
    }

    #[test]
    fn test_transcribed_midi_stem() {
        let drums = generate_click_track(120.0, 32, 0.25, 8);
        let events: Vec<NoteEvent> = (0..32)
            .map(|i| NoteEvent {
                time: 0.25 + i as f64 * 0.5,
                pitch: [40, 43, 45, 47][i % 4],
                velocity: 0.8,
                duration: 0.4,
                confidence: 1.0,
            })
            .collect();
        let stems = vec![
            (Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR))),
            (Instrument::Bass, StemSource::Events(events)),
        ];
        let req = request(vec![Instrument::Drums, Instrument::Bass], vec![Difficulty::Hard]);

        let result = ChartPipeline::new(Config::default())
            .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
            .unwrap();

        let bass = result.chart(Instrument::Bass, Difficulty::Hard).unwrap();
        assert!(!bass.notes.is_empty());
        assert!(bass.notes.iter().all(|n| n.pitch.is_some()));
        assert!(result.warnings.iter().all(|w| !matches!(w, PipelineWarning::EmptyStem { .. })));

        // the chart itself survives a MIDI round trip
        let bytes = midi::chart_to_midi(&bass.notes, bass.musical_context.bpm, (4, 4)).unwrap();
        let back = midi::read_note_events(&bytes).unwrap();
        assert_eq!(back.len(), bass.notes.len());
    }

    #[test]
    fn test_live_adaptation_only_with_real_time_settings() {
        let melody = generate_tone_line(120.0, 48, 0.25, &[261.6, 293.7, 329.6, 349.2]);
        let stems = vec![(Instrument::Melody, StemSource::Audio(AudioSignal::mono(&melody, SR)))];
        let mut req = request(vec![Instrument::Melody], vec![Difficulty::Expert]);
        let pipeline = ChartPipeline::new(Config::default());
        let struggling = PerformanceMetrics {
            accuracy: 0.1,
            combo: 0,
            missed_notes: 40,
            perfect_hits: 0,
        };

        let fixed = pipeline
            .generate_charts(&AudioSignal::mono(&melody, SR), &stems, &req)
            .unwrap();
        let chart = fixed.chart(Instrument::Melody, Difficulty::Expert).unwrap();
        assert!(chart.adaptive_settings.is_none());
        assert_eq!(&pipeline.adapt_to_performance(chart, &struggling, 5_000), chart);

        req.real_time_adaptation = true;
        let live = pipeline
            .generate_charts(&AudioSignal::mono(&melody, SR), &stems, &req)
            .unwrap();
        let chart = live.chart(Instrument::Melody, Difficulty::Expert).unwrap();
        assert!(chart.adaptive_settings.is_some_and(|s| s.real_time_adjustment));

        let adapted = pipeline.adapt_to_performance(chart, &struggling, 5_000);
        assert_eq!(adapted.notes.len(), chart.notes.len());
        let before: HashMap<NoteId, _> = chart.notes.iter().map(|n| (n.id, n)).collect();
        for note in &adapted.notes {
            if note.time_ms <= 5_000 {
                assert_eq!(Some(&note), before.get(&note.id));
            } else {
                assert!(note.note_type == NoteType::Tap || note.time_ms > 15_000);
            }
        }
    }

    #[test]
    fn test_export_written_and_read_back() {
        let drums = generate_click_track(120.0, 16, 0.25, 9);
        let stems = vec![(Instrument::Drums, StemSource::Audio(AudioSignal::mono(&drums, SR)))];
        let mut req = request(vec![Instrument::Drums], vec![Difficulty::Medium, Difficulty::Hard]);
        req.song = SongInfo {
            track_id: "t-001".to_string(),
            title: "Click Study".to_string(),
            artist: "Metronome".to_string(),
            audio_offset_ms: -20,
        };
        let pipeline = ChartPipeline::new(Config::default());
        let result = pipeline
            .generate_charts(&AudioSignal::mono(&drums, SR), &stems, &req)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("charts.json");
        let set = export::build_export(&result, &req.song, &pipeline.config().export);
        export::write_chart_set(&set, &path, &pipeline.config().export).unwrap();

        let back = export::read_chart_set(&path).unwrap();
        assert_eq!(back.schema_version, export::SCHEMA_VERSION);
        assert_eq!(back.song, req.song);
        assert_eq!(back.charts.len(), 2);
        for (read, written) in back.charts.iter().zip(&set.charts) {
            assert_eq!(read.instrument, written.instrument);
            assert_eq!(read.difficulty, written.difficulty);
            let ids = |c: &export::ChartExport| -> Vec<(u32, u32, u8, NoteType)> {
                c.notes.iter().map(|n| (n.id, n.time_ms, n.lane, n.note_type)).collect()
            };
            assert_eq!(ids(read), ids(written));
        }
    }
}
