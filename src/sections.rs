//! Song sections: validation of caller-supplied tilings and energy-based inference

use crate::analysis::BeatAnalysisResult;
use crate::chart::{SectionType, SongSection};
use crate::config::SectionConfig;
use crate::error::{ChartError, Result};

const CONTIGUITY_EPS: f64 = 1e-6;

/// Sections must be finite, non-empty, sorted and contiguous from the start of the song
pub fn validate_sections(sections: &[SongSection]) -> Result<()> {
    if let Some(first) = sections.first() {
        if first.start_time > CONTIGUITY_EPS {
            return Err(ChartError::InvalidInput(format!(
                "first section ('{}') starts at {:.3}s instead of 0",
                first.name, first.start_time
            )));
        }
    }
    for (i, section) in sections.iter().enumerate() {
        if !section.start_time.is_finite() || !section.end_time.is_finite() {
            return Err(ChartError::InvalidInput(format!(
                "section {} ('{}') has a non-finite boundary",
                i, section.name
            )));
        }
        if section.start_time < 0.0 || section.end_time <= section.start_time {
            return Err(ChartError::InvalidInput(format!(
                "section {} ('{}') spans {:.3}..{:.3}",
                i, section.name, section.start_time, section.end_time
            )));
        }
    }
    for (i, pair) in sections.windows(2).enumerate() {
        let gap = pair[1].start_time - pair[0].end_time;
        if gap.abs() > CONTIGUITY_EPS {
            let what = if gap > 0.0 { "gap" } else { "overlap" };
            return Err(ChartError::InvalidInput(format!(
                "{} of {:.3}s between sections {} and {}",
                what,
                gap.abs(),
                i,
                i + 1
            )));
        }
    }
    Ok(())
}

/// Index and section containing `time_sec`; the end of the last section belongs to it
pub fn section_at(sections: &[SongSection], time_sec: f64) -> Option<(usize, &SongSection)> {
    let idx = sections.partition_point(|s| s.end_time <= time_sec);
    match sections.get(idx) {
        Some(section) if section.contains(time_sec) => Some((idx, section)),
        None => sections
            .last()
            .filter(|last| (time_sec - last.end_time).abs() <= CONTIGUITY_EPS)
            .map(|last| (sections.len() - 1, last)),
        _ => None,
    }
}

fn complexity_modifier(section_type: SectionType) -> f64 {
    match section_type {
        SectionType::Intro | SectionType::Outro => 0.8,
        SectionType::Verse => 1.0,
        SectionType::Chorus => 1.1,
        SectionType::Bridge => 0.9,
        SectionType::Solo => 1.2,
    }
}

fn type_name(section_type: SectionType) -> &'static str {
    match section_type {
        SectionType::Intro => "Intro",
        SectionType::Verse => "Verse",
        SectionType::Chorus => "Chorus",
        SectionType::Bridge => "Bridge",
        SectionType::Solo => "Solo",
        SectionType::Outro => "Outro",
    }
}

/// Split the song into blocks of whole bars and label them by onset energy.
///
/// The first and last blocks of a song with three or more blocks are the intro
/// and outro; in between, blocks near the loudest one are choruses and the rest
/// verses. The result always tiles `0..duration_sec`.
pub fn infer_sections(beats: &BeatAnalysisResult, config: &SectionConfig) -> Vec<SongSection> {
    let duration = beats.duration_sec;
    if duration <= 0.0 || !duration.is_finite() {
        return Vec::new();
    }

    let mut bounds: Vec<f64> = beats
        .downbeats
        .iter()
        .step_by(config.bars_per_section.max(1))
        .copied()
        .filter(|&t| t > 0.0 && t < duration)
        .collect();
    bounds.insert(0, 0.0);
    bounds.push(duration);

    let energies: Vec<f64> = bounds
        .windows(2)
        .map(|w| {
            let strength: f64 = beats
                .onsets
                .iter()
                .filter(|o| o.time >= w[0] && o.time < w[1])
                .map(|o| o.strength)
                .sum();
            strength / (w[1] - w[0])
        })
        .collect();
    let max_energy = energies.iter().cloned().fold(0.0f64, f64::max);
    let n = energies.len();

    let mut counts = [0usize; 6];
    bounds
        .windows(2)
        .zip(&energies)
        .enumerate()
        .map(|(i, (w, &energy))| {
            let energy_level = if max_energy > 0.0 { energy / max_energy } else { 0.0 };
            let section_type = if n >= 3 && i == 0 {
                SectionType::Intro
            } else if n >= 3 && i == n - 1 {
                SectionType::Outro
            } else if max_energy > 0.0 && energy_level >= config.chorus_energy_ratio {
                SectionType::Chorus
            } else {
                SectionType::Verse
            };
            counts[section_type as usize] += 1;
            let name = match section_type {
                SectionType::Verse | SectionType::Chorus => {
                    format!("{} {}", type_name(section_type), counts[section_type as usize])
                }
                _ => type_name(section_type).to_string(),
            };
            SongSection {
                name,
                start_time: w[0],
                end_time: w[1],
                section_type,
                key: None,
                chord_progression: Vec::new(),
                energy_level,
                complexity_modifier: complexity_modifier(section_type),
            }
        })
        .collect()
}
