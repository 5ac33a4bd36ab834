//! Spectral processing utilities (windowed FFT, onset detection functions, peaks)

use crate::error::Result;
use crate::CancellationToken;
use ndarray::{Array1, Zip};
use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use std::sync::Arc;

/// Generate a Hann window
pub fn hann_window(size: usize) -> Vec<f64> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / (size - 1) as f64).cos()))
        .collect()
}

/// Windowed forward FFT over fixed-size frames
pub struct FrameTransform {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex64>,
}

impl FrameTransform {
    pub fn new(n_fft: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(n_fft),
            window: hann_window(n_fft),
            buffer: vec![Complex64::new(0.0, 0.0); n_fft],
        }
    }

    pub fn n_fft(&self) -> usize {
        self.window.len()
    }

    /// Positive-frequency spectrum of `frame`; short frames are zero-padded
    pub fn spectrum(&mut self, frame: &[f32]) -> Vec<Complex64> {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = frame.get(i).copied().unwrap_or(0.0) as f64;
            *slot = Complex64::new(sample * self.window[i], 0.0);
        }
        self.transform()
    }

    /// Spectrum of the frame centred on `center`, zero outside the signal
    pub fn spectrum_centered(&mut self, samples: &[f32], center: usize) -> Vec<Complex64> {
        let half = self.n_fft() / 2;
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = (center + i)
                .checked_sub(half)
                .and_then(|idx| samples.get(idx))
                .copied()
                .unwrap_or(0.0) as f64;
            *slot = Complex64::new(sample * self.window[i], 0.0);
        }
        self.transform()
    }

    fn transform(&mut self) -> Vec<Complex64> {
        self.fft.process(&mut self.buffer);
        self.buffer[..self.n_fft() / 2 + 1].to_vec()
    }

    pub fn magnitude(&mut self, frame: &[f32]) -> Array1<f64> {
        self.spectrum(frame).iter().map(|c| c.norm()).collect()
    }
}

/// Frame-wise onset detection functions of one channel
#[derive(Debug, Clone, Default)]
pub struct OnsetFunctions {
    /// Half-wave rectified spectral flux
    pub flux: Vec<f64>,
    /// High-frequency content (bin-weighted magnitude)
    pub hfc: Vec<f64>,
    /// Complex-domain deviation from the phase-predicted spectrum
    pub complex_domain: Vec<f64>,
    /// Frame centre times in seconds
    pub frame_times: Vec<f64>,
    /// Seconds between frames
    pub hop_sec: f64,
}

impl OnsetFunctions {
    pub fn len(&self) -> usize {
        self.flux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flux.is_empty()
    }
}

/// Number of centred frames for a signal (frame `k` is centred on sample `k * hop`)
pub fn frame_count(n_samples: usize, hop: usize) -> usize {
    if n_samples == 0 || hop == 0 {
        return 0;
    }
    n_samples / hop + 1
}

/// Compute spectral flux, HFC and complex-domain functions in one streaming pass.
///
/// Only the two previous spectra are kept, so memory stays flat for long songs.
pub fn onset_functions(
    samples: &[f32],
    sample_rate: u32,
    n_fft: usize,
    hop: usize,
    cancel: &CancellationToken,
) -> Result<OnsetFunctions> {
    let n_frames = frame_count(samples.len(), hop);
    let mut transform = FrameTransform::new(n_fft);
    let n_bins = n_fft / 2 + 1;

    let mut out = OnsetFunctions {
        flux: Vec::with_capacity(n_frames),
        hfc: Vec::with_capacity(n_frames),
        complex_domain: Vec::with_capacity(n_frames),
        frame_times: Vec::with_capacity(n_frames),
        hop_sec: hop as f64 / sample_rate.max(1) as f64,
    };

    let bin_weights: Array1<f64> = (0..n_bins).map(|k| k as f64).collect();
    let mut prev_mag: Option<Array1<f64>> = None;
    let mut prev_spec: Option<Vec<Complex64>> = None;
    let mut prev_prev_spec: Option<Vec<Complex64>> = None;

    for frame_idx in 0..n_frames {
        cancel.check()?;

        let center = frame_idx * hop;
        let spec = transform.spectrum_centered(samples, center);
        let mag: Array1<f64> = spec.iter().map(|c| c.norm()).collect();

        let flux = match &prev_mag {
            Some(prev) => {
                let mut acc = 0.0;
                Zip::from(&mag).and(prev).for_each(|&m, &p| {
                    let diff = m - p;
                    if diff > 0.0 {
                        acc += diff;
                    }
                });
                acc
            }
            None => 0.0,
        };

        let hfc = mag.dot(&bin_weights) / n_bins as f64;

        let complex_domain = match (&prev_spec, &prev_prev_spec) {
            (Some(p1), Some(p2)) => spec
                .iter()
                .zip(p1.iter().zip(p2.iter()))
                .map(|(x, (x1, x2))| {
                    let predicted_phase = 2.0 * x1.arg() - x2.arg();
                    let predicted = Complex64::from_polar(x1.norm(), predicted_phase);
                    (x - predicted).norm()
                })
                .sum(),
            (Some(p1), None) => spec.iter().zip(p1.iter()).map(|(x, x1)| (x - x1).norm()).sum(),
            _ => 0.0,
        };

        out.flux.push(flux);
        out.hfc.push(hfc);
        out.complex_domain.push(complex_domain);
        out.frame_times.push(center as f64 / sample_rate.max(1) as f64);

        prev_mag = Some(mag);
        prev_prev_spec = prev_spec.take();
        prev_spec = Some(spec);
    }

    Ok(out)
}

/// Divide by the maximum so the largest value is 1; all-zero input stays zero
pub fn normalize_max(signal: &[f64]) -> Vec<f64> {
    let max = signal.iter().cloned().fold(0.0f64, f64::max);
    if max <= 0.0 || !max.is_finite() {
        return vec![0.0; signal.len()];
    }
    signal.iter().map(|&x| x / max).collect()
}

/// Frequencies of the `count` strongest local maxima of a magnitude spectrum
pub fn dominant_frequencies(
    spectrum: &Array1<f64>,
    sample_rate: u32,
    n_fft: usize,
    count: usize,
) -> Vec<f64> {
    let bin_hz = sample_rate as f64 / n_fft as f64;
    let mut peaks: Vec<(usize, f64)> = (1..spectrum.len().saturating_sub(1))
        .filter(|&k| {
            spectrum[k] > 0.0 && spectrum[k] > spectrum[k - 1] && spectrum[k] >= spectrum[k + 1]
        })
        .map(|k| (k, spectrum[k]))
        .collect();

    peaks.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    peaks
        .into_iter()
        .take(count)
        .map(|(k, _)| k as f64 * bin_hz)
        .collect()
}

/// Convert a frequency to the nearest MIDI note, clamped to 0..=127
pub fn hz_to_midi(freq_hz: f64) -> u8 {
    if freq_hz <= 0.0 || !freq_hz.is_finite() {
        return 0;
    }
    let midi = 69.0 + 12.0 * (freq_hz / 440.0).log2();
    midi.round().clamp(0.0, 127.0) as u8
}
