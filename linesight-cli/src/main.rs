// Linesight operator CLI
// Runs the inspection pipeline, an interactive console and store maintenance

mod console;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use linesight_core::{InspectionConfig, PipelineController, PipelineEvent, PipelineMode, SystemHardware};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Picked up from the working directory when no `--config` is given
const DEFAULT_CONFIG: &str = "config.json";

#[derive(Parser)]
#[command(name = "linesight")]
#[command(about = "Line inspection station: detect, capture, classify and record", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON or TOML)
    #[arg(long, short, env = "LINESIGHT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Use the simulated sensor and camera
    #[arg(long, env = "LINESIGHT_SIMULATE", global = true)]
    simulate: bool,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Print logs and events as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one mode until Ctrl-C (or until a collection session completes)
    Run {
        #[arg(long, short, value_enum, default_value = "collect")]
        mode: RunMode,
    },

    /// Interactive operator console
    Console,

    /// Summarize the results store
    Report,

    /// Validate and print the effective configuration
    CheckConfig,

    /// Write a default configuration file
    InitConfig {
        /// Target path; `.toml` writes TOML, anything else JSON
        #[arg(default_value = DEFAULT_CONFIG)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RunMode {
    Collect,
    Classify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json);

    match cli.command {
        Commands::Run { mode } => {
            let config = load_config(cli.config.as_deref(), cli.simulate)?;
            run(controller(config)?, mode, cli.json).await?;
        }
        Commands::Console => {
            let config = load_config(cli.config.as_deref(), cli.simulate)?;
            console::OperatorConsole::new(controller(config)?, cli.json).run().await?;
        }
        Commands::Report => {
            let config = load_config(cli.config.as_deref(), cli.simulate)?;
            let summary = controller(config)?
                .report()
                .await
                .context("reading results store")?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("{}", summary);
            }
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_deref(), cli.simulate)?;
            config.validate().context("configuration is invalid")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists; pass --force to overwrite it", path.display());
            }
            InspectionConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries events and reports
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn load_config(path: Option<&Path>, simulate: bool) -> Result<InspectionConfig> {
    let fallback = Path::new(DEFAULT_CONFIG);
    let config = match path {
        Some(path) => InspectionConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None if fallback.exists() => InspectionConfig::from_file(fallback)
            .with_context(|| format!("loading configuration from {}", fallback.display()))?,
        None => {
            info!("No configuration file; using defaults");
            InspectionConfig::default()
        }
    };
    Ok(if simulate { config.simulated() } else { config })
}

fn controller(config: InspectionConfig) -> Result<PipelineController> {
    PipelineController::new(config, Arc::new(SystemHardware)).context("configuration is invalid")
}

async fn run(controller: PipelineController, mode: RunMode, json: bool) -> Result<()> {
    let mut events = controller.subscribe();
    match mode {
        RunMode::Collect => controller.start_collecting().await,
        RunMode::Classify => controller.start_classifying().await,
    }
    .context("starting pipeline")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted; stopping pipeline");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    print_event(&event, json)?;
                    // a completed collection session returns to idle on its own
                    if matches!(event, PipelineEvent::ModeChanged { mode: PipelineMode::Idle }) {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} status events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    }

    controller.stop().await?;
    let summary = controller.report().await.context("reading results store")?;
    println!("{}", summary);
    Ok(())
}

pub(crate) fn print_event(event: &PipelineEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!("{}", describe_event(event));
    }
    Ok(())
}

fn describe_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::ModeChanged { mode } => format!("mode: {}", mode),
        PipelineEvent::Detected { sequence, raw_reading } => {
            format!("detected #{} (reading {:.3})", sequence, raw_reading)
        }
        PipelineEvent::EventDropped { sequence, reason } => format!("dropped #{}: {}", sequence, reason),
        PipelineEvent::Recorded(record) => match &record.result {
            Some(result) => format!(
                "record {}: {} {:.1}% [{}] {}",
                record.record_id,
                result.label,
                result.confidence * 100.0,
                record.outcome.to_field(),
                record.image_reference().display()
            ),
            None => format!(
                "record {} [{}]: {}",
                record.record_id,
                record.outcome.to_field(),
                record.image_reference().display()
            ),
        },
        PipelineEvent::Fault { kind, message } => format!("fault [{}]: {}", kind, message),
        PipelineEvent::Report(summary) => format!("report: {}", summary),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linesight_core::FaultKind;

    #[test]
    fn test_cli_parses_run_mode() {
        let cli = Cli::try_parse_from(["linesight", "--simulate", "run", "--mode", "classify"]).unwrap();
        assert!(cli.simulate);
        assert!(matches!(cli.command, Commands::Run { mode: RunMode::Classify }));

        assert!(Cli::try_parse_from(["linesight", "run", "--mode", "sort"]).is_err());
    }

    #[test]
    fn test_describe_fault() {
        let line = describe_event(&PipelineEvent::Fault {
            kind: FaultKind::Capture,
            message: "Camera busy".to_string(),
        });
        assert_eq!(line, "fault [capture]: Camera busy");
    }
}
