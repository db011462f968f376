//! Capability resolver - Main entry point
//!
//! Loads scenario files and replays them against the resolver with scripted
//! collaborators.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, error, info};

use capability_resolver::cli::{Cli, Commands, OutputFormat};
use capability_resolver::config_file::Scenario;
use capability_resolver::simulation::{run_scenario, SimulationReport};

/// Initialize the tracing subscriber. Logs go to stderr so reports on stdout
/// stay machine-readable.
fn init_logger(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Main application entry point
fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed");

    match cli.command {
        Commands::Validate { scenario } => {
            info!("Validating scenario file: {:?}", scenario);
            match load_validated(&scenario) {
                Ok(loaded) => {
                    println!(
                        "✓ Scenario is valid: {} slot(s), {} candidate(s), {} timeline step(s)",
                        loaded.config.slot_count,
                        loaded.candidates.len(),
                        loaded.timeline.len()
                    );
                }
                Err(e) => {
                    error!("Scenario validation failed: {:#}", e);
                    eprintln!("✗ Scenario validation failed: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Simulate { scenario, output } => {
            let report = simulate(&scenario)?;
            match output {
                OutputFormat::Json => {
                    let json = serde_json::to_string_pretty(&report)
                        .context("Failed to serialize simulation report")?;
                    println!("{}", json);
                }
                OutputFormat::Journal => {
                    for line in &report.journal {
                        println!("{}", line);
                    }
                }
            }
        }
        Commands::Explain { scenario } => {
            let report = simulate(&scenario)?;
            print_explanation(&report);
        }
    }

    Ok(())
}

fn load_validated(path: &Path) -> Result<Scenario> {
    let scenario = Scenario::load_from_file(path)?;
    scenario.validate()?;
    Ok(scenario)
}

fn simulate(path: &Path) -> Result<SimulationReport> {
    let scenario = load_validated(path)?;
    info!("Replaying {} timeline step(s)", scenario.timeline.len());
    run_scenario(&scenario).with_context(|| format!("Failed to replay scenario {:?}", path))
}

fn print_explanation(report: &SimulationReport) {
    println!("Slots: {}", report.slot_count);
    for (slot, subscription) in &report.subscriptions {
        match subscription {
            Some(sub) => println!("  slot {} -> subscription {}", slot, sub),
            None => println!("  slot {} -> no subscription", slot),
        }
    }

    println!();
    println!("{:<6} {:<16} {:<28} {}", "SLOT", "FEATURE", "GOVERNED BY", "OWNED BY");
    for pair in &report.pairs {
        println!(
            "{:<6} {:<16} {:<28} {}",
            pair.slot,
            pair.feature.to_string(),
            pair.governing.as_deref().unwrap_or("-"),
            pair.owner.as_deref().unwrap_or("-")
        );
    }

    println!();
    println!("Packages:");
    for (package, state) in &report.package_states {
        println!("  {:<30} {}", package, state);
    }
}
