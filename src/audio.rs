//! Audio input views, WAV loading and basic statistics

use crate::error::{ChartError, Result};
use hound::WavReader;
use std::borrow::Cow;
use std::path::Path;

/// Immutable view over interleaved sample data owned by the caller
#[derive(Debug, Clone, Copy)]
pub struct AudioSignal<'a> {
    /// Interleaved samples in [-1, 1]
    pub samples: &'a [f32],
    /// Sample rate in Hz
    pub sample_rate: u32,
    pub channels: u16,
}

impl<'a> AudioSignal<'a> {
    pub fn new(samples: &'a [f32], sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    pub fn mono(samples: &'a [f32], sample_rate: u32) -> Self {
        Self::new(samples, sample_rate, 1)
    }

    /// Number of sample frames (one sample per channel)
    pub fn n_frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Get audio duration in seconds
    pub fn duration_sec(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.n_frames() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.n_frames() == 0
    }

    /// Reject buffers no stage can analyze
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(ChartError::InvalidInput("sample rate must be > 0".to_string()));
        }
        if self.channels == 0 {
            return Err(ChartError::InvalidInput("channel count must be > 0".to_string()));
        }
        if self.is_empty() {
            return Err(ChartError::InvalidInput("audio buffer is empty".to_string()));
        }
        Ok(())
    }

    /// Single channel view; multi-channel input is averaged into a new buffer
    pub fn mono_samples(&self) -> Cow<'a, [f32]> {
        if self.channels <= 1 {
            return Cow::Borrowed(self.samples);
        }
        let channels = self.channels as usize;
        Cow::Owned(
            self.samples
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect(),
        )
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |acc, &x| acc.max(x.abs()))
    }
}

/// Audio buffer owned by the host (CLI, tests)
#[derive(Debug, Clone, PartialEq)]
pub struct OwnedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl OwnedAudio {
    pub fn as_signal(&self) -> AudioSignal<'_> {
        AudioSignal::new(&self.samples, self.sample_rate, self.channels)
    }
}

/// Load a WAV file into interleaved f32 samples
pub fn load_wav<P: AsRef<Path>>(path: P) -> Result<OwnedAudio> {
    let path = path.as_ref();
    let mut reader = WavReader::open(path)?;
    let spec = reader.spec();

    if spec.bits_per_sample > 32 {
        return Err(ChartError::AudioFileError(format!(
            "Unsupported bit depth: {}",
            spec.bits_per_sample
        )));
    }

    let mut samples: Vec<f32> = Vec::with_capacity(reader.len() as usize);
    match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            for sample in reader.samples::<i32>() {
                samples.push(sample? as f32 / max_value);
            }
        }
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                samples.push(sample?);
            }
        }
    }

    tracing::debug!(
        "Loaded {} ({} Hz, {} channels, {} samples)",
        path.display(),
        spec.sample_rate,
        spec.channels,
        samples.len()
    );

    Ok(OwnedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Replace NaN/Inf with `default`
pub fn finite_or(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

/// Arithmetic mean, 0 for empty input
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance
pub fn variance(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|&x| (x - m).powi(2)).sum::<f64>() / data.len() as f64
}

/// Population standard deviation
pub fn std_dev(data: &[f64]) -> f64 {
    variance(data).sqrt()
}

/// Compute the p-th percentile of a dataset with linear interpolation
pub fn percentile(data: &[f64], p: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let fraction = rank - lo as f64;
    sorted[lo] + fraction * (sorted[hi] - sorted[lo])
}

/// Root-mean-square of a sample slice
pub fn rms(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_downmix() {
        let stereo = [1.0f32, 0.0, 0.5, 0.5];
        let signal = AudioSignal::new(&stereo, 10, 2);
        assert_eq!(signal.n_frames(), 2);
        assert_eq!(signal.mono_samples().as_ref(), &[0.5, 0.5]);

        let mono = [0.1f32, 0.2];
        assert!(matches!(AudioSignal::mono(&mono, 10).mono_samples(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_validate_rejects_empty() {
        let empty: [f32; 0] = [];
        assert!(matches!(
            AudioSignal::mono(&empty, 44100).validate(),
            Err(ChartError::InvalidInput(_))
        ));
        let one = [0.0f32];
        assert!(AudioSignal::mono(&one, 0).validate().is_err());
        assert!(AudioSignal::mono(&one, 44100).validate().is_ok());
    }

    #[test]
    fn test_percentile() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];

        assert!((percentile(&data, 0.0) - 1.0).abs() < 1e-9);
        assert!((percentile(&data, 50.0) - 3.0).abs() < 1e-9);
        assert!((percentile(&data, 100.0) - 5.0).abs() < 1e-9);

        let p25 = percentile(&data, 25.0);
        assert!((p25 - 2.0).abs() < 1e-9);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_variance_and_std_dev() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((variance(&data) - 2.0).abs() < 1e-9);
        assert!((std_dev(&data) - 2.0f64.sqrt()).abs() < 1e-9);
        assert_eq!(variance(&[]), 0.0);
        assert_eq!(variance(&[1.0]), 0.0);
    }

    #[test]
    fn test_finite_or() {
        assert_eq!(finite_or(f64::NAN, 0.5), 0.5);
        assert_eq!(finite_or(f64::INFINITY, 0.5), 0.5);
        assert_eq!(finite_or(0.25, 0.5), 0.25);
    }

    #[test]
    fn test_wav_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..800 {
            let s = ((i as f32 * 0.1).sin() * 16000.0) as i16;
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let audio = load_wav(&path).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples.len(), 800);
        assert!(audio.samples.iter().all(|s| s.abs() <= 1.0));
    }
}
