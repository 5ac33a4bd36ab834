//! Versioned chart-set export consumed by game clients

use crate::chart::{
    AdvancedNote, AiInsights, BendInfo, ChainType, Difficulty, Instrument, MusicalChart, NoteType,
    ParticleHint, SlideInfo, SpecialEffect, VibratoInfo,
};
use crate::config::{ExportConfig, SongInfo};
use crate::error::{ChartError, Result};
use crate::qa::QualityMetrics;
use crate::ChartGenerationResult;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Highest schema version this build reads and the one it writes by default
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSetExport {
    pub schema_version: u32,
    pub generator: String,
    pub song: SongInfo,
    pub quality: QualityMetrics,
    pub charts: Vec<ChartExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartExport {
    pub instrument: Instrument,
    pub difficulty: Difficulty,
    pub metadata: ChartExportMetadata,
    pub notes: Vec<NoteExport>,
    pub combo_chains: Vec<ComboChainExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartExportMetadata {
    pub bpm: f64,
    pub time_signature: [u8; 2],
    pub key: Option<String>,
    /// Overall song complexity when it was analyzed
    pub song_complexity: Option<f64>,
    pub quality: AiInsights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteExport {
    pub id: u32,
    pub time_ms: u32,
    pub lane: u8,
    #[serde(rename = "type")]
    pub note_type: NoteType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,
    pub velocity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide: Option<SlideInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chord_lanes: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hammer_pull_chain: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bend: Option<BendInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibrato: Option<VibratoInfo>,
    pub glow_intensity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub particle: Option<ParticleHint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub effects: Vec<SpecialEffect>,
}

impl From<&AdvancedNote> for NoteExport {
    fn from(note: &AdvancedNote) -> Self {
        NoteExport {
            id: note.id.0,
            time_ms: note.time_ms,
            lane: note.lane,
            note_type: note.note_type,
            duration_ms: note.duration_ms,
            velocity: note.velocity,
            slide: note.slide,
            chord_lanes: note.chord_notes.clone(),
            hammer_pull_chain: note.hammer_pull_chain.iter().map(|id| id.0).collect(),
            bend: note.bend,
            vibrato: note.vibrato,
            glow_intensity: note.glow_intensity,
            particle: note.particle,
            effects: note.special_effects.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComboChainExport {
    pub notes: Vec<u32>,
    pub chain_type: ChainType,
    pub bonus_multiplier: f64,
    pub timing_window_ms: f64,
}

fn chart_export(chart: &MusicalChart) -> ChartExport {
    let context = &chart.musical_context;
    ChartExport {
        instrument: chart.instrument,
        difficulty: chart.difficulty,
        metadata: ChartExportMetadata {
            bpm: context.bpm,
            time_signature: [context.time_signature.0, context.time_signature.1],
            key: context.key.as_ref().map(|k| k.name.clone()),
            song_complexity: context.complexity.map(|c| c.overall_complexity),
            quality: chart.ai_insights,
        },
        notes: chart.notes.iter().map(NoteExport::from).collect(),
        combo_chains: chart
            .combo_chains
            .iter()
            .map(|c| ComboChainExport {
                notes: c.notes.iter().map(|id| id.0).collect(),
                chain_type: c.chain_type,
                bonus_multiplier: c.bonus_multiplier,
                timing_window_ms: c.timing_window_ms,
            })
            .collect(),
    }
}

pub fn build_export(
    result: &ChartGenerationResult,
    song: &SongInfo,
    config: &ExportConfig,
) -> ChartSetExport {
    ChartSetExport {
        schema_version: config.schema_version,
        generator: format!("chartforge {}", env!("CARGO_PKG_VERSION")),
        song: song.clone(),
        quality: result.quality_metrics.clone(),
        charts: result.charts.iter().map(chart_export).collect(),
    }
}

pub fn to_json(export: &ChartSetExport, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(export)?
    } else {
        serde_json::to_string(export)?
    };
    Ok(json)
}

/// Write a chart set as JSON, creating parent directories as needed
pub fn write_chart_set<P: AsRef<Path>>(
    export: &ChartSetExport,
    path: P,
    config: &ExportConfig,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| ChartError::ExportError(format!("{}: {}", parent.display(), e)))?;
    }
    let json = to_json(export, config.pretty)?;
    fs::write(path, json)
        .map_err(|e| ChartError::ExportError(format!("{}: {}", path.display(), e)))?;

    info!(
        "Exported {} charts to {}",
        export.charts.len(),
        path.display()
    );
    Ok(())
}

/// Read a chart set, rejecting schema versions newer than this build understands
pub fn read_chart_set<P: AsRef<Path>>(path: P) -> Result<ChartSetExport> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| ChartError::ExportError(format!("{}: {}", path.display(), e)))?;
    let export: ChartSetExport = serde_json::from_str(&content)?;
    if export.schema_version > SCHEMA_VERSION {
        return Err(ChartError::ExportError(format!(
            "schema version {} is newer than supported version {}",
            export.schema_version, SCHEMA_VERSION
        )));
    }
    Ok(export)
}
