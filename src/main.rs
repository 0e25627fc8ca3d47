//! CLI entry point for rust-seq
//!
//! - `check-config`: load and validate an instrument configuration
//! - `simulate`: run demo chemistry/imaging cycles on the simulated bench
//! - `inspect`: open every configured port, initialise, and print device state
//!
//! ```bash
//! rust-seq check-config config/instrument.toml
//! rust-seq simulate --cycles 3
//! rust-seq inspect --config config/instrument.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_seq::seq_core::config::InstrumentConfig;
use rust_seq::seq_experiment::StepOutcome;
use rust_seq::{demo, logging, CancellationToken, SequenceReport};
use std::path::{Path, PathBuf};
use tokio::signal;

#[derive(Parser)]
#[command(name = "rust-seq")]
#[command(about = "Dual-flowcell sequencer coordination and TDI imaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and report missing serial ports
    CheckConfig {
        /// Instrument configuration (TOML)
        config: PathBuf,
    },

    /// Run demo cycles against simulated hardware
    Simulate {
        /// Optional configuration; defaults are used otherwise
        #[arg(long)]
        config: Option<PathBuf>,

        /// Chemistry/imaging cycles per flowcell
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Connect to real hardware, initialise, and print device snapshots
    Inspect {
        /// Instrument configuration (TOML)
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { config } => check_config(&config),
        Commands::Simulate { config, cycles } => {
            let config = match config {
                Some(path) => load(&path)?,
                None => InstrumentConfig::default(),
            };
            logging::init_from_config(&config)?;
            simulate(config, cycles).await
        }
        Commands::Inspect { config } => {
            let config = load(&config)?;
            logging::init_from_config(&config)?;
            inspect(config).await
        }
    }
}

fn load(path: &Path) -> Result<InstrumentConfig> {
    InstrumentConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))
}

fn check_config(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!("{}: ok", path.display());
    println!(
        "  trigger source: {}, units per line: {}",
        config.imaging.trigger_source, config.imaging.units_per_line
    );
    let missing = config.missing_ports();
    if missing.is_empty() {
        println!("  all {} serial endpoints configured", config.ports.len());
    } else {
        println!("  missing serial ports: {}", missing.join(", "));
    }
    Ok(())
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
}

async fn simulate(config: InstrumentConfig, cycles: u32) -> Result<()> {
    let token = CancellationToken::new();
    cancel_on_ctrl_c(token.clone());

    let (report, sink) = demo::run_simulated(&config, cycles, &token).await?;
    print_report(&report);
    println!("{} bundle sets captured", sink.len());
    report.into_result()?;
    Ok(())
}

#[cfg(feature = "serial")]
async fn inspect(config: InstrumentConfig) -> Result<()> {
    use rust_seq::Instrument;

    let instrument = Instrument::open(config).await?;
    instrument.initialize().await?;
    let snapshots = instrument.snapshots()?;
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn inspect(_config: InstrumentConfig) -> Result<()> {
    anyhow::bail!("inspect requires the 'serial' feature")
}

fn print_report(report: &SequenceReport) {
    for record in &report.steps {
        let outcome = match &record.outcome {
            StepOutcome::Completed => "completed".to_string(),
            StepOutcome::Skipped => "skipped".to_string(),
            StepOutcome::Failed(err) => format!("FAILED: {}", err),
        };
        println!(
            "[{:>3}] {} {:<40} {}",
            record.index, record.flowcell, record.action, outcome
        );
    }
    if let Some(fatal) = &report.first_fatal {
        println!("aborted: {}", fatal);
    }
}
