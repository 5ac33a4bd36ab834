//! Pass 2: Stem Feature Extraction

use crate::analysis::{BeatAnalysisResult, NoteEvent, RhythmicPattern, StemAnalysis};
use crate::audio::{self, AudioSignal};
use crate::chart::Instrument;
use crate::config::{Config, StemConfig};
use crate::error::{ChartError, PipelineWarning, Result};
use crate::spectral::{self, FrameTransform};
use crate::{CancellationToken, SongState, StemSource};
use ndarray::Array1;
use rayon::prelude::*;
use tracing::{debug, info, warn};

/// RMS envelope in fixed frames
fn rms_envelope(samples: &[f32], frame_len: usize) -> Vec<f64> {
    if frame_len == 0 {
        return Vec::new();
    }
    samples.chunks(frame_len).map(audio::rms).collect()
}

/// Onset density, syncopation and regularity from the stem envelope
fn rhythmic_pattern(
    envelope: &[f64],
    frame_sec: f64,
    beats: &[f64],
    duration_sec: f64,
) -> RhythmicPattern {
    if envelope.is_empty() || duration_sec <= 0.0 {
        return RhythmicPattern::default();
    }

    let peak = envelope.iter().cloned().fold(0.0f64, f64::max);
    let floor = 0.1 * peak;
    let attacks = (1..envelope.len())
        .filter(|&i| {
            let next = envelope.get(i + 1).copied().unwrap_or(0.0);
            envelope[i] > floor
                && envelope[i] > 1.5 * envelope[i - 1]
                && envelope[i] >= next
        })
        .count();

    let energy_at = |t: f64| {
        let idx = (t / frame_sec).floor() as usize;
        envelope.get(idx).copied().unwrap_or(0.0)
    };
    let on_beat: Vec<f64> = beats.iter().map(|&b| energy_at(b)).collect();
    let off_beat: Vec<f64> = beats
        .windows(2)
        .map(|w| energy_at((w[0] + w[1]) / 2.0))
        .collect();

    let on_sum: f64 = on_beat.iter().sum();
    let off_sum: f64 = off_beat.iter().sum();
    let syncopation = if on_sum + off_sum > 0.0 {
        off_sum / (on_sum + off_sum)
    } else {
        0.0
    };

    let on_mean = audio::mean(&on_beat);
    let regularity = if on_mean > 0.0 {
        1.0 - audio::std_dev(&on_beat) / on_mean
    } else {
        0.0
    };

    RhythmicPattern {
        onset_density: audio::finite_or(attacks as f64 / duration_sec, 0.0),
        syncopation: audio::finite_or(syncopation, 0.0).clamp(0.0, 1.0),
        regularity: audio::finite_or(regularity, 0.0).clamp(0.0, 1.0),
    }
}

/// Strongest non-DC bin of a magnitude spectrum, in Hz
fn peak_frequency(mag: &Array1<f64>, sample_rate: u32, n_fft: usize) -> Option<f64> {
    let (bin, value) = mag
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))?;
    (*value > 0.0).then(|| bin as f64 * sample_rate as f64 / n_fft as f64)
}

/// Extract dominant frequencies, rhythm descriptors and one note event per beat.
///
/// A stem that is empty or silent yields [`StemAnalysis::empty`].
pub fn extract(
    stem: &AudioSignal,
    beat_grid: &BeatAnalysisResult,
    instrument: Instrument,
    config: &StemConfig,
    cancel: &CancellationToken,
) -> Result<StemAnalysis> {
    if stem.sample_rate == 0 || stem.is_empty() || (stem.peak() as f64) <= config.silence_threshold {
        return Ok(StemAnalysis::empty(instrument));
    }

    let mono = stem.mono_samples();
    let sr = stem.sample_rate;
    let n_fft = config.analysis_window.max(2);
    let mut transform = FrameTransform::new(n_fft);
    let mut spectrum_sum: Array1<f64> = Array1::zeros(n_fft / 2 + 1);

    let period = beat_grid.beat_period();
    let mut raw = Vec::with_capacity(beat_grid.beats.len());
    for (i, &beat) in beat_grid.beats.iter().enumerate() {
        cancel.check()?;

        let start = ((beat * sr as f64).round() as usize).min(mono.len());
        let end = (start + n_fft).min(mono.len());
        let window = &mono[start..end];

        let mag = transform.magnitude(window);
        spectrum_sum += &mag;

        let pitch = if instrument.is_pitched() {
            peak_frequency(&mag, sr, n_fft).map_or(0, spectral::hz_to_midi)
        } else {
            0
        };
        let duration = beat_grid
            .beats
            .get(i + 1)
            .map_or(period, |&next| next - beat);

        raw.push((beat, pitch, audio::rms(window), duration));
    }

    let max_rms = raw.iter().map(|r| r.2).fold(0.0f64, f64::max);
    let note_events = raw
        .into_iter()
        .map(|(time, pitch, energy, duration)| NoteEvent {
            time,
            pitch,
            velocity: if max_rms > 0.0 {
                (energy / max_rms).clamp(0.0, 1.0)
            } else {
                0.0
            },
            duration: duration.max(0.0),
            confidence: beat_grid.confidence,
        })
        .collect();

    let frame_len = ((config.envelope_frame_ms / 1000.0) * sr as f64).round().max(1.0) as usize;
    let envelope = rms_envelope(&mono, frame_len);
    let pattern = rhythmic_pattern(
        &envelope,
        frame_len as f64 / sr as f64,
        &beat_grid.beats,
        stem.duration_sec(),
    );

    Ok(StemAnalysis {
        instrument,
        dominant_frequencies: spectral::dominant_frequencies(
            &spectrum_sum,
            sr,
            n_fft,
            config.dominant_frequency_count,
        ),
        rhythmic_pattern: pattern,
        note_events,
    })
}

pub fn run(state: &mut SongState, config: &Config) -> Result<()> {
    info!("Pass 2: Stem Feature Extraction");

    let beat_grid = state.beat_analysis.as_ref().ok_or_else(|| {
        ChartError::InvalidInput("Pass 1 must be run before Pass 2".to_string())
    })?;
    let cancel = &state.cancel;

    let analyses: Vec<StemAnalysis> = state
        .request
        .instruments
        .par_iter()
        .map(|&instrument| {
            let source = state
                .stems
                .iter()
                .find(|(inst, _)| *inst == instrument)
                .map(|(_, source)| source);
            match source {
                Some(StemSource::Audio(signal)) => {
                    extract(signal, beat_grid, instrument, &config.stems, cancel)
                }
                Some(StemSource::Events(events)) => {
                    Ok(StemAnalysis::from_note_events(instrument, events.clone()))
                }
                None => Ok(StemAnalysis::empty(instrument)),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    for analysis in &analyses {
        if analysis.is_empty() {
            let warning = PipelineWarning::EmptyStem {
                instrument: analysis.instrument,
            };
            warn!("  {}", warning);
            state.warnings.push(warning);
        } else {
            debug!(
                "  {}: {} events, dominant {:?}",
                analysis.instrument.name(),
                analysis.note_events.len(),
                analysis.dominant_frequencies
            );
        }
    }

    info!("  Analyzed {} stems", analyses.len());
    state.stem_analyses = analyses;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_envelope() {
        let samples = [1.0f32, 1.0, 0.0, 0.0, 0.5];
        let env = rms_envelope(&samples, 2);
        assert_eq!(env.len(), 3);
        assert!((env[0] - 1.0).abs() < 1e-9);
        assert_eq!(env[1], 0.0);
    }

    #[test]
    fn test_syncopation_of_off_beat_energy() {
        // frames of 0.1 s; energy only on off-beats (0.25, 0.75, ...)
        let mut envelope = vec![0.0; 40];
        for i in 0..4 {
            envelope[2 + 5 * i] = 1.0;
        }
        let beats: Vec<f64> = (0..5).map(|i| i as f64 * 0.5).collect();
        let pattern = rhythmic_pattern(&envelope, 0.1, &beats, 4.0);
        assert!((pattern.syncopation - 1.0).abs() < 1e-9);
        assert!(pattern.onset_density > 0.0);
    }

    #[test]
    fn test_peak_frequency_skips_dc() {
        let mag = Array1::from(vec![10.0, 1.0, 3.0, 2.0]);
        assert_eq!(peak_frequency(&mag, 8, 8), Some(2.0));
        assert_eq!(peak_frequency(&Array1::zeros(4), 8, 8), None);
    }
}
