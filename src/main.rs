//! CLI entry point for rust-camac
//!
//! Runs the CAMAC driver core against the simulated highway described in the
//! configuration file.
//!
//! # Usage
//!
//! Print the I/O report after crate initialization:
//! ```bash
//! rust-camac report --config config/rust_camac.toml --level 2
//! ```
//!
//! Drive every configured module, then print the slot report:
//! ```bash
//! rust-camac exercise --cycles 10
//! ```

use anyhow::{Context, Result};
use camac_core::ReportLevel;
use clap::{Parser, Subcommand};
use rust_camac::config::{AppConfig, DEFAULT_CONFIG_PATH};
use rust_camac::{logging, simulation};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "rust-camac")]
#[command(about = "ESONE CAMAC driver core on a simulated highway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the highway and print the I/O report
    Report {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Report detail: 0 branches, 1 crates, 2 slots
        #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=2))]
        level: u8,
    },

    /// Run reads and LAM waits on every configured module
    Exercise {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Passes over the module list
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Report { config, level } => run_report(&config, level),
        Commands::Exercise { config, cycles } => run_exercise(&config, cycles),
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid configuration")?;
    logging::init_from_config(&config)
        .map_err(anyhow::Error::msg)
        .context("Failed to initialize logging")?;
    Ok(config)
}

fn run_report(path: &Path, level: u8) -> Result<()> {
    let config = load_config(path)?;
    let driver = simulation::start(&config).context("Failed to start the simulated highway")?;
    print!("{}", simulation::report(&driver, ReportLevel::from(level)));
    Ok(())
}

fn run_exercise(path: &Path, cycles: usize) -> Result<()> {
    let config = load_config(path)?;
    let driver = simulation::start(&config).context("Failed to start the simulated highway")?;
    let summary = simulation::exercise(&driver, &config, cycles).context("Exercise failed")?;
    info!(
        actions = summary.actions,
        failures = summary.failures,
        lams_seen = summary.lams_seen,
        "Exercise complete"
    );
    println!(
        "{} bus operations ({} failed), {} LAMs seen",
        summary.actions, summary.failures, summary.lams_seen
    );
    print!("{}", simulation::report(&driver, ReportLevel::Slots));
    Ok(())
}
