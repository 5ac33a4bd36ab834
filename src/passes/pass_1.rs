//! Pass 1: Onset & Beat Analysis

use crate::analysis::{BeatAnalysisResult, GrooveTemplate, Onset, OnsetClass, TempoChange};
use crate::audio::{self, AudioSignal};
use crate::config::{Config, GrooveConfig, OnsetConfig, TempoConfig};
use crate::error::{PipelineWarning, Result};
use crate::spectral::{self, OnsetFunctions};
use crate::{CancellationToken, SongState};
use tracing::{debug, info, warn};

/// Optional outside knowledge the analyzer may lean on
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BeatHints {
    /// Overrides the assumed 4/4
    pub time_signature: Option<(u8, u8)>,
    /// Used only when tempo estimation has to fall back
    pub tempo_bpm: Option<f64>,
}

/// Tempo estimate with its provenance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoEstimate {
    pub bpm: f64,
    pub confidence: f64,
    pub used_fallback: bool,
}

impl TempoEstimate {
    fn fallback(config: &TempoConfig) -> Self {
        TempoEstimate {
            bpm: config.fallback_bpm,
            confidence: config.fallback_confidence,
            used_fallback: true,
        }
    }
}

/// Compute adaptive threshold using a centred rolling mean and std
fn adaptive_threshold(signal: &[f64], half_window: usize, k: f64) -> Vec<f64> {
    let n = signal.len();
    let mut sum = vec![0.0; n + 1];
    let mut sum_sq = vec![0.0; n + 1];
    for (i, &x) in signal.iter().enumerate() {
        sum[i + 1] = sum[i] + x;
        sum_sq[i + 1] = sum_sq[i] + x * x;
    }

    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half_window);
            let hi = (i + half_window + 1).min(n);
            let count = (hi - lo) as f64;
            let mean = (sum[hi] - sum[lo]) / count;
            let var = ((sum_sq[hi] - sum_sq[lo]) / count - mean * mean).max(0.0);
            mean + k * var.sqrt()
        })
        .collect()
}

/// Frames where the flux clears its threshold and beats both neighbours
fn pick_peaks(flux: &[f64], thresholds: &[f64], min_strength: f64) -> Vec<usize> {
    let mut peaks = Vec::new();
    for i in 1..flux.len() {
        let next = flux.get(i + 1).copied().unwrap_or(f64::NEG_INFINITY);
        if flux[i] > thresholds[i]
            && flux[i] > flux[i - 1]
            && flux[i] >= next
            && flux[i] > 0.0
            && flux[i] >= min_strength
        {
            peaks.push(i);
        }
    }
    peaks
}

/// Vertex offset of the parabola through three equally spaced points, in [-0.5, 0.5]
fn parabolic_offset(prev: f64, center: f64, next: f64) -> f64 {
    let denom = prev - 2.0 * center + next;
    if denom.abs() < 1e-12 {
        return 0.0;
    }
    audio::finite_or(0.5 * (prev - next) / denom, 0.0).clamp(-0.5, 0.5)
}

fn classify(hfc: f64, complex_domain: f64, margin: f64) -> OnsetClass {
    if hfc > margin * complex_domain {
        OnsetClass::Percussive
    } else if complex_domain > margin * hfc {
        OnsetClass::Harmonic
    } else {
        OnsetClass::Complex
    }
}

/// Pick onsets from the detection functions
pub fn detect_onsets(funcs: &OnsetFunctions, config: &OnsetConfig) -> Vec<Onset> {
    if funcs.is_empty() {
        return Vec::new();
    }

    let thresholds = adaptive_threshold(
        &funcs.flux,
        config.threshold_window_frames,
        config.threshold_k,
    );
    let max_flux = funcs.flux.iter().cloned().fold(0.0f64, f64::max);
    let peaks = pick_peaks(
        &funcs.flux,
        &thresholds,
        config.min_relative_strength * max_flux,
    );

    let flux = spectral::normalize_max(&funcs.flux);
    let hfc = spectral::normalize_max(&funcs.hfc);
    let complex_domain = spectral::normalize_max(&funcs.complex_domain);
    let weights = &config.relevance_weights;

    peaks
        .into_iter()
        .map(|i| {
            let next = funcs.flux.get(i + 1).copied().unwrap_or(funcs.flux[i]);
            let offset = parabolic_offset(funcs.flux[i - 1], funcs.flux[i], next);
            Onset {
                time: (funcs.frame_times[i] + offset * funcs.hop_sec).max(0.0),
                strength: flux[i],
                class: classify(hfc[i], complex_domain[i], config.class_margin),
                relevance: weights.flux * flux[i]
                    + weights.hfc * hfc[i]
                    + weights.complex * complex_domain[i],
            }
        })
        .collect()
}

fn gaussian_smooth(signal: &[f64], sigma: f64) -> Vec<f64> {
    if sigma <= 0.0 || signal.is_empty() {
        return signal.to_vec();
    }
    let radius = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let norm: f64 = kernel.iter().sum();

    let n = signal.len() as isize;
    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            for (j, w) in kernel.iter().enumerate() {
                let idx = i + j as isize - radius;
                if (0..n).contains(&idx) {
                    acc += w * signal[idx as usize];
                }
            }
            acc / norm
        })
        .collect()
}

fn autocorrelation(signal: &[f64], max_lag: usize, cancel: &CancellationToken) -> Result<Vec<f64>> {
    let mut ac = Vec::with_capacity(max_lag + 1);
    for lag in 0..=max_lag {
        cancel.check()?;
        let value = if lag < signal.len() {
            signal[..signal.len() - lag]
                .iter()
                .zip(&signal[lag..])
                .map(|(a, b)| a * b)
                .sum()
        } else {
            0.0
        };
        ac.push(value);
    }
    Ok(ac)
}

/// Walk down from the strongest lag to the shortest sub-multiple that is nearly as strong.
///
/// Uneven hit strengths make every second beat line up better with itself than
/// with its neighbour, so the raw maximum tends to sit on a multiple of the beat.
fn shortest_period(peaks: &[usize], ac: &[f64], best: usize, ratio: f64) -> usize {
    let floor = ac[best] * ratio;
    let mut lag = best;
    loop {
        let shorter = [3usize, 2].into_iter().find_map(|divisor| {
            let target = lag as f64 / divisor as f64;
            let radius = (target * 0.05).max(2.0);
            peaks
                .iter()
                .copied()
                .filter(|&p| p < lag && (p as f64 - target).abs() <= radius)
                .filter(|&p| ac[p] >= floor)
                .max_by(|&a, &b| ac[a].total_cmp(&ac[b]))
        });
        match shorter {
            Some(next) => lag = next,
            None => return lag,
        }
    }
}

/// Estimate tempo by autocorrelating a smoothed onset-strength function
pub fn estimate_tempo(
    onsets: &[Onset],
    duration_sec: f64,
    config: &TempoConfig,
    cancel: &CancellationToken,
) -> Result<TempoEstimate> {
    if onsets.len() < 2 {
        return Ok(TempoEstimate::fallback(config));
    }

    let resolution = config.onset_function_resolution_ms / 1000.0;
    let last_onset = onsets.iter().map(|o| o.time).fold(0.0f64, f64::max);
    let n_bins = (duration_sec.max(last_onset) / resolution).ceil() as usize + 1;

    let mut function = vec![0.0f64; n_bins];
    for onset in onsets {
        let bin = ((onset.time / resolution).round() as usize).min(n_bins - 1);
        function[bin] = function[bin].max(onset.strength);
    }
    let function = gaussian_smooth(&function, config.smoothing_sigma_bins);

    let lag_min = ((60.0 / config.max_bpm / resolution).floor() as usize).max(1);
    let lag_max = (60.0 / config.min_bpm / resolution).ceil() as usize;
    let ac = autocorrelation(&function, lag_max + 1, cancel)?;
    if ac[0] <= 0.0 {
        return Ok(TempoEstimate::fallback(config));
    }

    let lag_to_bpm = |lag: f64| 60.0 / (lag * resolution);
    let band = config.min_bpm..=config.max_bpm;

    let peaks: Vec<usize> = (lag_min..=lag_max)
        .filter(|&l| l >= 1 && l + 1 < ac.len())
        .filter(|&l| ac[l] > ac[l - 1] && ac[l] >= ac[l + 1] && ac[l] > 0.0)
        .filter(|&l| band.contains(&lag_to_bpm(l as f64)))
        .collect();
    let best = peaks
        .iter()
        .copied()
        .max_by(|&a, &b| ac[a].total_cmp(&ac[b]).then(b.cmp(&a)));

    let Some(best) = best else {
        return Ok(TempoEstimate::fallback(config));
    };
    let lag = shortest_period(&peaks, &ac, best, config.subdivision_ratio);

    let refined = lag as f64 + parabolic_offset(ac[lag - 1], ac[lag], ac[lag + 1]);
    let bpm = audio::finite_or(lag_to_bpm(refined), config.fallback_bpm)
        .clamp(config.min_bpm, config.max_bpm);
    let confidence = audio::finite_or(ac[lag] / ac[0], 0.0).clamp(0.0, 1.0);

    Ok(TempoEstimate {
        bpm,
        confidence,
        used_fallback: false,
    })
}

/// Onset nearest to `expected` within `tolerance`, strictly after `after`
fn nearest_onset(times: &[f64], expected: f64, tolerance: f64, after: Option<f64>) -> Option<f64> {
    let idx = times.partition_point(|&t| t < expected);
    [idx.checked_sub(1), Some(idx)]
        .into_iter()
        .flatten()
        .filter_map(|i| times.get(i).copied())
        .filter(|&t| (t - expected).abs() <= tolerance)
        .filter(|&t| after.map_or(true, |a| t > a))
        .min_by(|a, b| (a - expected).abs().total_cmp(&(b - expected).abs()))
}

/// Greedy beat tracking against detected onsets.
///
/// Each step looks for an onset within `tolerance * period` of the expected
/// beat; a hit snaps the beat to the onset, a miss emits the predicted time.
/// With fewer than two onsets the predicted grid covers the whole signal.
pub fn track_beats(onsets: &[Onset], bpm: f64, duration_sec: f64, tolerance: f64) -> Vec<f64> {
    let period = 60.0 / bpm.max(1.0);
    let mut times: Vec<f64> = onsets.iter().map(|o| o.time).collect();
    times.sort_by(|a, b| a.total_cmp(b));

    if times.len() < 2 {
        let n = (duration_sec / period).ceil().max(1.0) as usize;
        return (0..n)
            .map(|i| i as f64 * period)
            .filter(|&t| t < duration_sec || t == 0.0)
            .collect();
    }

    let tol = tolerance * period;
    let first = times[0];
    let last = times[times.len() - 1];

    // phase of the grid at t=0
    let mut expected = first - (first / period).round() * period;
    if expected < 0.0 {
        expected = if -expected <= tol { 0.0 } else { expected + period };
    }

    let mut beats: Vec<f64> = Vec::new();
    while expected <= last + tol {
        let prev = beats.last().copied();
        let beat = nearest_onset(&times, expected, tol, prev).unwrap_or(expected);
        if prev.is_some_and(|p| beat <= p) {
            expected += period;
            continue;
        }
        beats.push(beat);
        expected = beat + period;
    }
    beats
}

/// Rhythmic complexity, swing factor and groove class from beat intervals
pub fn analyze_groove(beats: &[f64], config: &GrooveConfig) -> (f64, f64, GrooveTemplate) {
    let intervals: Vec<f64> = beats.windows(2).map(|w| w[1] - w[0]).collect();
    if intervals.len() < 2 {
        return (0.0, 0.0, GrooveTemplate::Straight);
    }

    let complexity =
        audio::finite_or(audio::variance(&intervals) * config.variance_scale, 0.0).min(1.0);

    let even: Vec<f64> = intervals.iter().step_by(2).copied().collect();
    let odd: Vec<f64> = intervals.iter().skip(1).step_by(2).copied().collect();
    let (e, o) = (audio::mean(&even), audio::mean(&odd));
    let swing = if e + o > 0.0 {
        audio::finite_or((e - o).abs() / (e + o), 0.0).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let template = if complexity > config.complex_threshold {
        GrooveTemplate::Complex
    } else if swing > config.swing_threshold {
        GrooveTemplate::Swing
    } else {
        GrooveTemplate::Straight
    };
    (complexity, swing, template)
}

/// Octave of `bpm` inside the tempo band that lies closest to `reference`
fn fold_to_band(bpm: f64, reference: f64, config: &TempoConfig) -> Option<f64> {
    let mut candidates = Vec::new();
    let mut x = bpm;
    while x > config.min_bpm / 2.0 {
        x /= 2.0;
    }
    for _ in 0..16 {
        if x > config.max_bpm {
            break;
        }
        if x >= config.min_bpm {
            candidates.push(x);
        }
        x *= 2.0;
    }
    candidates
        .into_iter()
        .min_by(|a, b| (a - reference).abs().total_cmp(&(b - reference).abs()))
}

/// Local tempo over sliding windows; windows deviating from `global_bpm` are reported
pub fn detect_tempo_changes(
    onsets: &[Onset],
    global_bpm: f64,
    duration_sec: f64,
    config: &TempoConfig,
) -> Vec<TempoChange> {
    let mut changes: Vec<TempoChange> = Vec::new();
    if config.tempo_change_hop_sec <= 0.0 || config.tempo_change_window_sec <= 0.0 {
        return changes;
    }

    let mut start = 0.0;
    while start < duration_sec {
        let end = start + config.tempo_change_window_sec;
        let times: Vec<f64> = onsets
            .iter()
            .map(|o| o.time)
            .filter(|&t| t >= start && t < end)
            .collect();

        if times.len() >= 4 {
            let iois: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).filter(|&d| d > 0.0).collect();
            let median = audio::percentile(&iois, 50.0);
            if median > 0.0 {
                if let Some(local) = fold_to_band(60.0 / median, global_bpm, config) {
                    let steady = iois
                        .iter()
                        .filter(|&&d| (d - median).abs() <= 0.1 * median)
                        .count();
                    let confidence = steady as f64 / iois.len() as f64;
                    let deviates = (local - global_bpm).abs() > config.tempo_change_threshold_bpm;
                    let repeats = changes
                        .last()
                        .is_some_and(|c| (c.bpm - local).abs() <= config.tempo_change_threshold_bpm);
                    if deviates && !repeats {
                        changes.push(TempoChange {
                            time: start,
                            bpm: local,
                            confidence,
                        });
                    }
                }
            }
        }
        start += config.tempo_change_hop_sec;
    }
    changes
}

/// Run the full onset, tempo, beat and groove analysis on one signal
pub fn analyze(
    signal: &AudioSignal,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<BeatAnalysisResult> {
    analyze_with_hints(signal, config, &BeatHints::default(), cancel)
}

pub fn analyze_with_hints(
    signal: &AudioSignal,
    config: &Config,
    hints: &BeatHints,
    cancel: &CancellationToken,
) -> Result<BeatAnalysisResult> {
    signal.validate()?;
    let duration_sec = signal.duration_sec();
    let mono = signal.mono_samples();

    let funcs = spectral::onset_functions(
        &mono,
        signal.sample_rate,
        config.onset.window_size,
        config.onset.hop_length,
        cancel,
    )?;
    let onsets = detect_onsets(&funcs, &config.onset);
    debug!("  Detected {} onsets over {} frames", onsets.len(), funcs.len());

    let mut tempo = estimate_tempo(&onsets, duration_sec, &config.tempo, cancel)?;
    if tempo.used_fallback {
        if let Some(hint) = hints
            .tempo_bpm
            .filter(|b| (config.tempo.min_bpm..=config.tempo.max_bpm).contains(b))
        {
            debug!("  Using hinted tempo {:.1} BPM", hint);
            tempo.bpm = hint;
        }
    }

    let beats = track_beats(
        &onsets,
        tempo.bpm,
        duration_sec,
        config.tempo.beat_search_tolerance,
    );

    let time_signature = hints.time_signature.unwrap_or((4, 4));
    let downbeats: Vec<f64> = beats
        .iter()
        .step_by(time_signature.0.max(1) as usize)
        .copied()
        .collect();

    let (rhythmic_complexity, swing_factor, groove_template) =
        analyze_groove(&beats, &config.groove);

    let tempo_changes = if tempo.used_fallback {
        Vec::new()
    } else {
        detect_tempo_changes(&onsets, tempo.bpm, duration_sec, &config.tempo)
    };

    Ok(BeatAnalysisResult {
        bpm: tempo.bpm,
        confidence: tempo.confidence,
        beats,
        downbeats,
        time_signature,
        tempo_changes,
        rhythmic_complexity,
        swing_factor,
        groove_template,
        used_fallback_tempo: tempo.used_fallback,
        onsets,
        duration_sec,
    })
}

pub fn run(state: &mut SongState, config: &Config) -> Result<()> {
    info!("Pass 1: Onset & Beat Analysis");

    let hints = BeatHints {
        time_signature: state.request.time_signature,
        tempo_bpm: state.audio_hints.as_ref().and_then(|h| h.tempo_bpm),
    };
    let result = analyze_with_hints(&state.song, config, &hints, &state.cancel)?;

    info!(
        "  Estimated tempo: {:.1} BPM (confidence: {:.2})",
        result.bpm, result.confidence
    );
    info!(
        "  Tracked {} beats, {} downbeats, groove {:?} (swing {:.2})",
        result.beats.len(),
        result.downbeats.len(),
        result.groove_template,
        result.swing_factor
    );

    if result.used_fallback_tempo || result.confidence < config.tempo.low_confidence_threshold {
        let warning = PipelineWarning::AnalysisLowConfidence {
            stage: "tempo".to_string(),
            confidence: result.confidence,
        };
        warn!("  {}", warning);
        state.warnings.push(warning);
    }
    if !result.tempo_changes.is_empty() {
        debug!("  {} tempo changes detected", result.tempo_changes.len());
    }

    state.beat_analysis = Some(result);
    Ok(())
}
