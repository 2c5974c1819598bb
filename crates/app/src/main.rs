use std::{path::PathBuf, sync::Arc, time::Duration};

use audio_features_core::{
    list_input_devices, AppConfig, AudioFeatures, CaptureController, CpalPlatform, PathKind,
    Status, VizError,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> audio_features_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Live {
            config,
            duration,
            interval_ms,
            fallback,
        } => run_live(config, duration, interval_ms, fallback).await,
        Commands::Devices => run_devices(),
    }
}

async fn run_live(
    config: Option<PathBuf>,
    duration: Option<f64>,
    interval_ms: u64,
    force_fallback: bool,
) -> audio_features_core::Result<()> {
    let mut config = match config.as_deref() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::live_defaults(),
    };
    if force_fallback {
        config.capture.block_processing = false;
    }
    let window = capture_window(duration)?;
    tracing::info!(
        device = config.capture.device.as_deref().unwrap_or("default"),
        block_processing = config.capture.block_processing,
        "starting live capture"
    );

    let platform = CpalPlatform::from_config(&config.capture);
    let controller = CaptureController::new(Arc::new(platform), config.capture);
    controller.start().await?;
    tracing::info!(path = ?controller.active_path(), "capture running");

    let mut ticker = time::interval(Duration::from_millis(interval_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let deadline = window.map(|window| Instant::now() + window);
    let expired = async move {
        match deadline {
            Some(deadline) => time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    let interrupted = tokio::signal::ctrl_c();
    let mut status = controller.watch_status();
    let failed = async move {
        let _ = status.wait_for(|status| *status == Status::Error).await;
    };
    tokio::pin!(expired, interrupted, failed);

    loop {
        tokio::select! {
            _ = ticker.tick() => print_line(&controller)?,
            _ = &mut expired => {
                tracing::info!("capture duration elapsed");
                break;
            }
            _ = &mut interrupted => {
                tracing::info!("interrupted");
                break;
            }
            _ = &mut failed => {
                tracing::error!(error = ?controller.error(), "capture stopped unexpectedly");
                break;
            }
        }
    }

    controller.stop().await;
    print_line(&controller)?;
    Ok(())
}

/// Parses `--duration`, rejecting negative, NaN and unrepresentable values.
fn capture_window(duration: Option<f64>) -> audio_features_core::Result<Option<Duration>> {
    duration
        .map(|secs| {
            Duration::try_from_secs_f64(secs).map_err(|_| {
                VizError::Config(format!(
                    "--duration must be a finite, non-negative number of seconds, got {secs}"
                ))
            })
        })
        .transpose()
}

fn run_devices() -> audio_features_core::Result<()> {
    for device in list_input_devices()? {
        println!("{}", serde_json::to_string(&device)?);
    }
    Ok(())
}

/// One line of live output.
#[derive(Serialize)]
struct FeatureLine {
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathKind>,
    #[serde(flatten)]
    features: AudioFeatures,
}

fn print_line(controller: &CaptureController) -> audio_features_core::Result<()> {
    let line = FeatureLine {
        status: controller.status(),
        path: controller.active_path(),
        features: controller.features(),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live microphone feature extractor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture the microphone and print features as JSON lines.
    Live {
        /// JSON configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration: Option<f64>,
        /// Milliseconds between printed lines.
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
        /// Skip the block-synchronous processor and poll the analyser instead.
        #[arg(long)]
        fallback: bool,
    },
    /// List capture devices on the default host.
    Devices,
}
