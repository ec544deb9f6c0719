//! Measurement runner binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spectrig::config::Settings;
use spectrig::data::backup;
use spectrig::measurement::{Devices, MeasurementRun};

#[derive(Parser, Debug)]
#[command(name = "spectrig", about = "Pulsed-laser fluorescence acquisition")]
struct Cli {
    /// Path to the run settings file.
    #[arg(long, default_value = "settings.toml")]
    settings: PathBuf,

    /// Root directory for run output.
    #[arg(long, default_value = "data")]
    output: PathBuf,
}

fn run_directory(cli: &Cli, settings: &Settings) -> PathBuf {
    let capture = if settings.laser.continuous {
        "continuous"
    } else {
        "pulsed"
    };
    // Some file systems reject colons in names.
    let run_id = if settings.unique {
        chrono::Local::now()
            .format("%Y-%m-%d %H_%M_%S%.6f")
            .to_string()
    } else {
        "overwrite-run".to_string()
    };
    cli.output.join(&settings.run_name).join(capture).join(run_id)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;

    let run_dir = run_directory(&cli, &settings);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("creating run directory {}", run_dir.display()))?;
    settings.save_snapshot(&run_dir.join("settings.json"))?;
    info!(dir = %run_dir.display(), "run output directory prepared");

    let devices = Devices::connect(&settings).context("connecting devices")?;
    let mut run = MeasurementRun::new(settings, devices, run_dir.clone())?;

    let cancel = run.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling run");
            cancel.notify_one();
        }
    });

    let outcome = run.run().await;

    // Whatever was committed before a failure is still worth keeping.
    if let Some(buffer) = run.data() {
        let path = run_dir.join("spectra.csv");
        match backup::write_csv(&buffer, &path) {
            Ok(()) => info!(path = %path.display(), "acquired data written"),
            Err(e) => error!("failed to write acquired data: {e}"),
        }
    }

    outcome?;
    Ok(())
}
