//! CLI binary for aibox.

use std::path::PathBuf;
use std::sync::Arc;

use aibox::audio::aec::create_canceller;
use aibox::audio::capture::ArecordSource;
use aibox::audio::playback::AplayLauncher;
use aibox::pipeline::capture::{CaptureStage, Segmenter};
use aibox::vad::create_vad;
use aibox::volume::AmixerVolume;
use aibox::{Assistant, AssistantConfig, OutputDevices};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// aibox: embedded voice assistant.
#[derive(Parser)]
#[command(name = "aibox", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a KEY=VALUE env file overriding the config.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Listen, converse and play music until told to exit.
    Run,

    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "aibox=debug" } else { "aibox=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = AssistantConfig::load(cli.config.as_deref(), cli.env_file.as_deref())
        .context("loading configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: AssistantConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    info!(version = env!("CARGO_PKG_VERSION"), "aibox starting");

    let capture = CaptureStage {
        source: Box::new(ArecordSource::spawn(&config.capture).context("starting capture")?),
        canceller: create_canceller(&config.capture).context("initialising echo canceller")?,
        vad: create_vad(&config.vad).context("initialising VAD")?,
        segmenter: Segmenter::new(config.segmenter.clone(), config.capture.rate),
        channels: usize::from(config.capture.channels),
        reference_channel: usize::from(config.capture.reference_channel),
        sample_rate: config.capture.rate,
    };
    let devices = OutputDevices {
        speech: Arc::new(AplayLauncher::speech(&config.playback, config.cloud.tts_sample_rate)),
        music: Arc::new(AplayLauncher::music(&config.playback, &config.music)),
        volume: Arc::new(AmixerVolume::new(&config.volume)),
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("interrupted, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("cannot listen for Ctrl+C: {e}"),
            }
        });
    }

    let assistant = Arc::new(Assistant::new(config, devices, shutdown));
    assistant.run(capture).await?;
    info!("aibox stopped");
    Ok(())
}
