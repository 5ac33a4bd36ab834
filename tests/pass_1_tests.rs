//! Comprehensive validation tests for Pass 1: Onset & Beat Analysis

use chartforge::config::Config;
use chartforge::passes::pass_1::{self, BeatHints};
use chartforge::{AudioSignal, CancellationToken, ChartError};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::f32::consts::PI;

/// Percussive hits on a steady grid: a short noise burst over a low body
fn generate_click_track(sr: u32, bpm: f64, duration_sec: f64, first_hit: f64, seed: u64) -> Vec<f32> {
    let n_samples = (duration_sec * sr as f64) as usize;
    let mut audio = vec![0.0f32; n_samples];
    let mut rng = Pcg32::seed_from_u64(seed);
    let period = 60.0 / bpm;
    let hit_len = (0.06 * sr as f64) as usize;

    let mut t0 = first_hit;
    while t0 < duration_sec {
        let start = (t0 * sr as f64).round() as usize;
        for i in 0..hit_len.min(n_samples.saturating_sub(start)) {
            let t = i as f32 / sr as f32;
            let envelope = (-t * 50.0).exp();
            let noise = rng.gen_range(-1.0f32..1.0);
            let body = (2.0 * PI * 150.0 * t).sin();
            audio[start + i] += (0.6 * noise + 0.4 * body) * envelope * 0.5;
        }
        t0 += period;
    }
    audio
}

/// Kick drum on every beat: a low sine body with a short bright click on top
fn generate_kick_track(sr: u32, bpm: f64, duration_sec: f64, first_hit: f64) -> Vec<f32> {
    let n_samples = (duration_sec * sr as f64) as usize;
    let mut audio = vec![0.0f32; n_samples];
    let period = 60.0 / bpm;
    let hit_len = (0.15 * sr as f64) as usize;

    let mut t0 = first_hit;
    while t0 < duration_sec {
        let start = (t0 * sr as f64).round() as usize;
        for i in 0..hit_len.min(n_samples.saturating_sub(start)) {
            let t = i as f32 / sr as f32;
            let body = (2.0 * PI * 80.0 * t).sin() * (-t * 25.0).exp();
            let click = (2.0 * PI * 3000.0 * t).sin() * (-t * 300.0).exp();
            audio[start + i] += 0.7 * body + 0.3 * click;
        }
        t0 += period;
    }
    audio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_128_bpm_over_three_minutes() {
        let sr = 22050;
        let samples = generate_click_track(sr, 128.0, 180.0, 0.1, 7);
        let signal = AudioSignal::mono(&samples, sr);

        let result = pass_1::analyze(&signal, &Config::default(), &CancellationToken::new()).unwrap();

        assert!(
            (result.bpm - 128.0).abs() <= 2.0,
            "Expected ~128 BPM, got {:.2}",
            result.bpm
        );
        let expected = (180.0f64 / (60.0 / 128.0)).floor() as i64;
        let found = result.beats.len() as i64;
        assert!(
            (found - expected).abs() <= 2,
            "Expected {} +/- 2 beats, got {}",
            expected,
            found
        );
        assert!(!result.used_fallback_tempo);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
        assert!((result.duration_sec - 180.0).abs() < 1e-6);
    }

    #[test]
    fn test_steady_kicks_across_rates_tempos_and_lead_ins() {
        let config = Config::default();
        let cancel = CancellationToken::new();
        let duration = 30.0;

        for sr in [22050u32, 44100] {
            for bpm in [100.0, 120.0, 128.0, 140.0] {
                for first in [0.0, 0.05, 0.1] {
                    let samples = generate_kick_track(sr, bpm, duration, first);
                    let result = pass_1::analyze(&AudioSignal::mono(&samples, sr), &config, &cancel).unwrap();

                    assert!(
                        (result.bpm - bpm).abs() <= 2.0,
                        "sr={} bpm={} first={}: estimated {:.2}",
                        sr,
                        bpm,
                        first,
                        result.bpm
                    );
                    let expected = ((duration - first) / (60.0 / bpm)).ceil() as i64;
                    let found = result.beats.len() as i64;
                    assert!(
                        (found - expected).abs() <= 2,
                        "sr={} bpm={} first={}: expected {} +/- 2 beats, got {}",
                        sr,
                        bpm,
                        first,
                        expected,
                        found
                    );
                }
            }
        }
    }

    #[test]
    fn test_beats_strictly_increasing_and_downbeats_subset() {
        let sr = 22050;
        let samples = generate_click_track(sr, 110.0, 20.0, 0.2, 11);
        let signal = AudioSignal::mono(&samples, sr);

        let result = pass_1::analyze(&signal, &Config::default(), &CancellationToken::new()).unwrap();

        assert!(result.beats.len() > 8);
        for pair in result.beats.windows(2) {
            assert!(pair[1] > pair[0], "beats not increasing: {:?}", pair);
        }
        for downbeat in &result.downbeats {
            assert!(result.beats.contains(downbeat));
        }
        // 4/4: every fourth beat starting with the first
        assert_eq!(result.downbeats.len(), result.beats.len().div_ceil(4));
        assert_eq!(result.downbeats[0], result.beats[0]);
    }

    #[test]
    fn test_silence_falls_back_to_default_tempo() {
        let samples = vec![0.0f32; 44100];
        let signal = AudioSignal::mono(&samples, 44100);

        let result = pass_1::analyze(&signal, &Config::default(), &CancellationToken::new()).unwrap();

        assert_eq!(result.bpm, 120.0);
        assert_eq!(result.confidence, 0.5);
        assert!(result.used_fallback_tempo);
        assert!(result.onsets.is_empty());
        // the predicted grid still covers the clip
        assert!(!result.beats.is_empty());
        assert!(result.beats.iter().all(|&b| (0.0..1.0).contains(&b)));
        assert!(result.tempo_changes.is_empty());
    }

    #[test]
    fn test_tempo_hint_only_applies_on_fallback() {
        let config = Config::default();
        let hints = BeatHints {
            time_signature: None,
            tempo_bpm: Some(90.0),
        };

        let silence = vec![0.0f32; 44100 * 2];
        let result = pass_1::analyze_with_hints(
            &AudioSignal::mono(&silence, 44100),
            &config,
            &hints,
            &CancellationToken::new(),
        )
        .unwrap();
        assert_eq!(result.bpm, 90.0);

        let sr = 22050;
        let clicks = generate_click_track(sr, 140.0, 15.0, 0.1, 3);
        let result = pass_1::analyze_with_hints(
            &AudioSignal::mono(&clicks, sr),
            &config,
            &hints,
            &CancellationToken::new(),
        )
        .unwrap();
        assert!((result.bpm - 140.0).abs() <= 2.0, "got {:.2}", result.bpm);
    }

    #[test]
    fn test_time_signature_hint_sets_downbeat_spacing() {
        let sr = 22050;
        let samples = generate_click_track(sr, 120.0, 12.0, 0.25, 5);
        let hints = BeatHints {
            time_signature: Some((3, 4)),
            tempo_bpm: None,
        };

        let result = pass_1::analyze_with_hints(
            &AudioSignal::mono(&samples, sr),
            &Config::default(),
            &hints,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(result.time_signature, (3, 4));
        let expected: Vec<f64> = result.beats.iter().step_by(3).copied().collect();
        assert_eq!(result.downbeats, expected);
    }

    #[test]
    fn test_stereo_matches_mono() {
        let sr = 22050;
        let mono = generate_click_track(sr, 100.0, 10.0, 0.3, 9);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        let config = Config::default();
        let cancel = CancellationToken::new();

        let a = pass_1::analyze(&AudioSignal::mono(&mono, sr), &config, &cancel).unwrap();
        let b = pass_1::analyze(&AudioSignal::new(&stereo, sr, 2), &config, &cancel).unwrap();

        assert_eq!(a.beats.len(), b.beats.len());
        assert!((a.bpm - b.bpm).abs() < 1e-6);
    }

    #[test]
    fn test_percussive_hits_detected_as_onsets() {
        let sr = 22050;
        let samples = generate_click_track(sr, 120.0, 8.25, 0.25, 13);
        let result = pass_1::analyze(
            &AudioSignal::mono(&samples, sr),
            &Config::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        // every hit yields an onset close to it
        for k in 0..16 {
            let hit = 0.25 + k as f64 * 0.5;
            let nearest = result
                .onsets
                .iter()
                .map(|o| (o.time - hit).abs())
                .fold(f64::INFINITY, f64::min);
            assert!(nearest < 0.06, "hit at {:.2}s missed (nearest {:.3}s)", hit, nearest);
        }
        for onset in &result.onsets {
            assert!((0.0..=1.0).contains(&onset.strength));
        }
    }

    #[test]
    fn test_empty_and_malformed_audio_rejected() {
        let config = Config::default();
        let cancel = CancellationToken::new();

        let empty = AudioSignal::mono(&[], 44100);
        assert!(matches!(
            pass_1::analyze(&empty, &config, &cancel),
            Err(ChartError::InvalidInput(_))
        ));

        let samples = vec![0.1f32; 1024];
        let no_rate = AudioSignal::mono(&samples, 0);
        assert!(matches!(
            pass_1::analyze(&no_rate, &config, &cancel),
            Err(ChartError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cancelled_analysis_stops() {
        let sr = 22050;
        let samples = generate_click_track(sr, 120.0, 5.0, 0.25, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = pass_1::analyze(&AudioSignal::mono(&samples, sr), &Config::default(), &cancel);
        assert!(matches!(result, Err(ChartError::CancellationRequested)));
    }
}
