//! CLI Entry Point for it_daq
//!
//! Runs one It measurement from a TOML configuration, or validates a
//! configuration without touching hardware.
//!
//! # Usage
//!
//! ```bash
//! it_daq run --config config/it_daq.toml
//! it_daq run --config config/it_daq.toml --simulate
//! it_daq check-config --config config/it_daq.toml
//! ```
//!
//! Ctrl-C requests an abort; the worker then ramps the bias down to 0 V
//! before the process exits.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use it_daq::adapters::HardwareConnector;
use it_daq::config::{ApplicationConfig, Settings};
use it_daq::environment::{EnvironmentEvent, EnvironmentPoller};
use it_daq::instrument::sim::SimulationHandle;
use it_daq::measurement::{MeasurementWorker, RunOutcome, WorkerEvent};
use it_daq::resource::{Connector, ResourceManager};
use it_daq::sensor::SensorRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "it_daq")]
#[command(about = "Long-term current measurement of silicon sensors", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one measurement
    Run {
        /// Configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,

        /// Use simulated instruments instead of the configured hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Load and validate a configuration, then exit
    CheckConfig {
        /// Configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, simulate } => {
            let settings = load(&config)?;
            init_logging(&settings.application)?;
            run(settings, simulate).await
        }
        Commands::CheckConfig { config } => {
            let settings = load(&config)?;
            println!("{} is valid", config.display());
            println!("  sensors enabled: {}", settings.sensors.iter().filter(|s| s.enabled).count());
            let measurement = serde_json::to_string_pretty(&settings.measurement)
                .context("Failed to render measurement parameters")?;
            println!("{}", measurement);
            Ok(())
        }
    }
}

fn load(path: &Path) -> Result<Settings> {
    Settings::load_from(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// `RUST_LOG` overrides the configured level.
fn init_logging(config: &ApplicationConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("it_daq={}", config.log_level)))
        .context("Invalid log filter")?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

async fn run(settings: Settings, simulate: bool) -> Result<()> {
    let connector: Arc<dyn Connector> = if simulate {
        info!("using simulated instruments");
        Arc::new(SimulationHandle::new().connector(&settings.instruments))
    } else {
        Arc::new(HardwareConnector)
    };
    let resources = ResourceManager::new(settings.resources.clone(), connector);
    let sensors = SensorRegistry::from_config(&settings.sensors);

    let mut poller_stop = None;
    let mut worker = MeasurementWorker::new(settings.clone(), resources.clone(), sensors);
    if settings.environment.enabled {
        let poller = EnvironmentPoller::new(
            resources.clone(),
            &settings.instruments.chamber,
            &settings.environment,
        );
        worker = worker.with_ambient(poller.ambient());
        poller_stop = Some(poller.stop_handle());
        let mut events = poller.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EnvironmentEvent::Failed(err)) => warn!(error = %err, "environment unavailable"),
                    Ok(EnvironmentEvent::Recovered) => info!("environment available again"),
                    Ok(EnvironmentEvent::Reading(_)) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        poller.spawn();
    }

    let abort = worker.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting measurement");
            abort.abort();
        }
    });

    let mut events = worker.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::StageChanged(stage)) => println!("== {}", stage),
                Ok(WorkerEvent::Message(message)) => println!("{}", message),
                Ok(WorkerEvent::Reading(reading)) => {
                    let currents: Vec<String> = reading
                        .channels
                        .iter()
                        .map(|(index, channel)| format!("#{}: {:.3E} A", index, channel.current))
                        .collect();
                    println!("{:>8.1} V  {}", reading.smu_voltage, currents.join("  "));
                }
                Ok(WorkerEvent::Failed(err)) => error!(error = %err, "measurement error"),
                Ok(WorkerEvent::Finished) | Err(RecvError::Closed) => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    });

    let outcome = worker.run().await;
    let _ = reporter.await;
    if let Some(stop) = poller_stop {
        stop.abort();
    }

    match outcome {
        RunOutcome::Completed => {
            println!("Measurement completed");
            Ok(())
        }
        RunOutcome::Aborted => {
            println!("Measurement aborted");
            Ok(())
        }
        RunOutcome::Failed => anyhow::bail!("Measurement failed"),
    }
}
