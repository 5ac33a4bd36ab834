//! Error types for the chart generation pipeline

use crate::chart::Instrument;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors: the call that raised one produces no output
#[derive(Debug, Error)]
pub enum ChartError {
    /// E001: Empty or malformed input (zero-length audio, unsorted sections, ...)
    #[error("E001: Invalid input - {0}")]
    InvalidInput(String),
    /// E002: Stem or instrument name with no known mapping
    #[error("E002: Unknown instrument tag '{0}'")]
    UnknownInstrument(String),
    /// E003: The caller cancelled the run
    #[error("E003: Cancellation requested")]
    CancellationRequested,
    /// E004: Configuration validation failed
    #[error("E004: Configuration validation failed - {0}")]
    ConfigValidationFailed(String),
    /// E005: Audio file I/O error
    #[error("E005: Audio file I/O error - {0}")]
    AudioFileError(String),
    /// E006: MIDI import error
    #[error("E006: MIDI import error - {0}")]
    MidiImportError(String),
    /// E007: Chart export error
    #[error("E007: Chart export error - {0}")]
    ExportError(String),
}

impl From<std::io::Error> for ChartError {
    fn from(err: std::io::Error) -> Self {
        ChartError::AudioFileError(format!("File I/O error: {}", err))
    }
}

impl From<hound::Error> for ChartError {
    fn from(err: hound::Error) -> Self {
        ChartError::AudioFileError(err.to_string())
    }
}

impl From<serde_json::Error> for ChartError {
    fn from(err: serde_json::Error) -> Self {
        ChartError::ExportError(format!("JSON serialization error: {}", err))
    }
}

impl From<anyhow::Error> for ChartError {
    fn from(err: anyhow::Error) -> Self {
        ChartError::ConfigValidationFailed(err.to_string())
    }
}

/// Non-fatal conditions recorded on the result while processing continues
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineWarning {
    /// Tempo or onset detection fell back to a default value
    AnalysisLowConfidence { stage: String, confidence: f64 },
    /// A requested instrument had no usable stem; its charts are empty
    EmptyStem { instrument: Instrument },
}

impl std::fmt::Display for PipelineWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineWarning::AnalysisLowConfidence { stage, confidence } => {
                write!(f, "W001: Low confidence in {} ({:.2})", stage, confidence)
            }
            PipelineWarning::EmptyStem { instrument } => {
                write!(f, "W002: Empty stem for {}", instrument.name())
            }
        }
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ChartError>;
