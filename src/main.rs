use anyhow::Context;
use chartforge::audio::{load_wav, OwnedAudio};
use chartforge::config::{load_config, SongInfo};
use chartforge::theory::AudioFeatureHints;
use chartforge::{
    export, midi, ChartGenerationConfig, ChartPipeline, Config, Difficulty, Instrument, StemSource,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rhythm-game chart generator
#[derive(Parser)]
#[command(name = "chartforge")]
#[command(about = "Generate lane-based rhythm-game charts from a song and its stems")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a chart set from a mix and its stems
    Generate {
        /// Full mix (WAV)
        mix: PathBuf,

        /// Audio stem as NAME=PATH (drums, bass, other, vocals)
        #[arg(long = "stem", value_parser = parse_stem)]
        stems: Vec<(String, PathBuf)>,

        /// Transcribed stem as NAME=PATH to a Standard MIDI File
        #[arg(long = "midi-stem", value_parser = parse_stem)]
        midi_stems: Vec<(String, PathBuf)>,

        /// Output chart set (JSON)
        #[arg(short, long, default_value = "./charts.json")]
        output: PathBuf,

        /// Also write one MIDI file per chart into this directory
        #[arg(long)]
        midi_out: Option<PathBuf>,

        /// Custom configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Difficulties to generate (default: all)
        #[arg(long = "difficulty", value_delimiter = ',')]
        difficulties: Vec<Difficulty>,

        /// Instruments to chart (default: those with stems)
        #[arg(long = "instrument", value_delimiter = ',', value_parser = parse_instrument)]
        instruments: Vec<Instrument>,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Chord symbols, e.g. "C,G,Am,F"
        #[arg(long, value_delimiter = ',')]
        chords: Vec<String>,

        /// Tempo used if detection falls back
        #[arg(long)]
        tempo_hint: Option<f64>,

        /// Key used if harmonic analysis finds none, e.g. "A minor"
        #[arg(long)]
        key_hint: Option<String>,

        /// Time signature, e.g. "3/4"
        #[arg(long, value_parser = parse_meter)]
        meter: Option<(u8, u8)>,

        #[arg(long)]
        no_harmony: bool,

        #[arg(long)]
        no_structure: bool,

        #[arg(long)]
        no_dynamic_difficulty: bool,

        /// Attach live-adaptation settings to each chart
        #[arg(long)]
        real_time: bool,

        #[arg(long, default_value = "")]
        track_id: String,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        artist: String,

        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        offset_ms: i32,
    },
    /// Print the beat analysis of a mix
    Analyze {
        /// Audio file (WAV)
        input: PathBuf,

        /// Custom configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Validate configuration file
    ValidateConfig {
        /// Configuration file to validate
        config: PathBuf,
    },
    /// Show default configuration
    ShowConfig,
}

fn parse_stem(arg: &str) -> Result<(String, PathBuf), String> {
    let (name, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=PATH, got '{}'", arg))?;
    Instrument::from_stem_name(name).map_err(|e| e.to_string())?;
    Ok((name.to_string(), PathBuf::from(path)))
}

fn parse_instrument(arg: &str) -> Result<Instrument, String> {
    Instrument::from_stem_name(arg).map_err(|e| e.to_string())
}

fn parse_meter(arg: &str) -> Result<(u8, u8), String> {
    let (num, den) = arg
        .split_once('/')
        .ok_or_else(|| format!("expected N/D, got '{}'", arg))?;
    let num = num.trim().parse::<u8>().map_err(|e| e.to_string())?;
    let den = den.trim().parse::<u8>().map_err(|e| e.to_string())?;
    Ok((num, den))
}

fn init_logging(verbose: bool, quiet: bool) -> anyhow::Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else if quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };
    let filter = if verbose || quiet {
        EnvFilter::builder().with_default_directive(level.into()).parse_lossy("")
    } else {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .with_env_var("LOG_LEVEL")
            .from_env_lossy()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(filter)
        .try_init()
        .context("failed to install the log subscriber")
}

fn load_or_default(path: Option<PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_config(path)
        }
        None => Ok(Config::default()),
    }
}

fn read_wav(path: &Path) -> anyhow::Result<OwnedAudio> {
    load_wav(path).with_context(|| format!("failed to load {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.verbose && cli.quiet {
        anyhow::bail!("Cannot specify both --verbose and --quiet");
    }
    init_logging(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Generate {
            mix,
            stems,
            midi_stems,
            output,
            midi_out,
            config,
            difficulties,
            instruments,
            seed,
            chords,
            tempo_hint,
            key_hint,
            meter,
            no_harmony,
            no_structure,
            no_dynamic_difficulty,
            real_time,
            track_id,
            title,
            artist,
            offset_ms,
        } => {
            let config = load_or_default(config)?;
            let mix_audio = read_wav(&mix)?;

            let mut stem_audio: Vec<(Instrument, OwnedAudio)> = Vec::new();
            for (name, path) in &stems {
                stem_audio.push((Instrument::from_stem_name(name)?, read_wav(path)?));
            }
            let mut stem_sources: Vec<(Instrument, StemSource)> = stem_audio
                .iter()
                .map(|(inst, audio)| (*inst, StemSource::Audio(audio.as_signal())))
                .collect();
            for (name, path) in &midi_stems {
                let bytes = std::fs::read(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let events = midi::read_note_events(&bytes)?;
                info!("Imported {} notes for {} from {}", events.len(), name, path.display());
                stem_sources.push((Instrument::from_stem_name(name)?, StemSource::Events(events)));
            }

            let instruments = if !instruments.is_empty() {
                instruments
            } else if !stem_sources.is_empty() {
                stem_sources.iter().map(|(inst, _)| *inst).collect()
            } else {
                Instrument::ALL.to_vec()
            };
            let request = ChartGenerationConfig {
                difficulties: if difficulties.is_empty() {
                    Difficulty::ALL.to_vec()
                } else {
                    difficulties
                },
                instruments,
                seed,
                harmonic_analysis: !no_harmony,
                structural_analysis: !no_structure,
                dynamic_difficulty: !no_dynamic_difficulty,
                real_time_adaptation: real_time,
                time_signature: meter,
                sections: None,
                chord_symbols: chords,
                song: SongInfo {
                    track_id,
                    title,
                    artist,
                    audio_offset_ms: offset_ms,
                },
            };

            let hints = AudioFeatureHints {
                tempo_bpm: tempo_hint,
                key: key_hint,
                ..AudioFeatureHints::default()
            };
            let pipeline = ChartPipeline::new(config).with_hints(hints);
            let result =
                pipeline.generate_charts(&mix_audio.as_signal(), &stem_sources, &request)?;

            let chart_set = export::build_export(&result, &request.song, &pipeline.config().export);
            export::write_chart_set(&chart_set, &output, &pipeline.config().export)?;

            if let Some(dir) = midi_out {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                for chart in &result.charts {
                    let bytes = midi::chart_to_midi(
                        &chart.notes,
                        chart.musical_context.bpm,
                        chart.musical_context.time_signature,
                    )?;
                    let path = dir.join(format!(
                        "{}_{}.mid",
                        chart.instrument.name(),
                        chart.difficulty.name()
                    ));
                    std::fs::write(&path, bytes)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
                info!("Wrote {} MIDI files to {}", result.charts.len(), dir.display());
            }

            for warning in &result.warnings {
                eprintln!("warning: {}", warning);
            }
            println!(
                "{} charts ({} notes) written to {}",
                result.charts.len(),
                result.quality_metrics.total_notes,
                output.display()
            );
        }
        Commands::Analyze { input, config } => {
            let config = load_or_default(config)?;
            let audio = read_wav(&input)?;
            let analysis = chartforge::passes::pass_1::analyze(
                &audio.as_signal(),
                &config,
                &chartforge::CancellationToken::new(),
            )?;
            let summary = serde_json::json!({
                "bpm": analysis.bpm,
                "confidence": analysis.confidence,
                "time_signature": [analysis.time_signature.0, analysis.time_signature.1],
                "beats": analysis.beats.len(),
                "downbeats": analysis.downbeats.len(),
                "onsets": analysis.onsets.len(),
                "swing_factor": analysis.swing_factor,
                "groove": analysis.groove_template,
                "rhythmic_complexity": analysis.rhythmic_complexity,
                "tempo_changes": analysis.tempo_changes,
                "used_fallback_tempo": analysis.used_fallback_tempo,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::ValidateConfig { config } => {
            let config = load_config(config)?;
            println!("Configuration is valid");
            if let Ok(json) = serde_json::to_string_pretty(&config) {
                println!("{}", json);
            }
        }
        Commands::ShowConfig => {
            let config = Config::default();
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
    }

    Ok(())
}
