//! runctl - Cross-Triggered Run Control
//!
//! CLI entry point for checking run-control configuration and running the
//! validation scenarios against the simulated target.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::info;

use runctl::cli::{Cli, Command, OutputFormat};
use runctl::config::Config;
use runctl::notifier::LogSink;
use runctl::scenario::{self, Scenario};
use runctl::{FallbackPolicy, SimTarget, SmpController};

fn setup_logging(verbose: bool) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runctl")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Write to the log file, keep stdout for command output
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(log_dir.join("runctl.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(
        "runctl loaded config: cores={}, clusters={}, fallback={}",
        config.cores.len(),
        config.clusters.len(),
        config.fallback_policy
    );

    match cli.command {
        Some(Command::Check) | None => cmd_check(&config),
        Some(Command::Status { format }) => cmd_status(&config, format),
        Some(Command::Scenario { names }) => cmd_scenario(&config, names),
    }
}

/// Validate the config and print each cluster's wiring
fn cmd_check(config: &Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    for cluster in &config.clusters {
        println!(
            "{} {} (timeout {} ms, halt {}, restart {}, primary {:?})",
            "cluster".bold(),
            cluster.name.cyan(),
            cluster.timeout_ms,
            cluster.channels.halt,
            cluster.channels.restart,
            cluster.primary
        );
        for member in &cluster.members {
            match config.core(member).and_then(|c| c.binding()) {
                Some(cti) => println!(
                    "  {} {} -> {} @ {:#x} (domain {})",
                    "✓".green(),
                    member,
                    cti.name,
                    cti.base,
                    cti.domain
                ),
                None => {
                    let effect = match config.fallback_policy {
                        FallbackPolicy::FailFast => "group operations will be refused",
                        FallbackPolicy::Sequential => "sequential fallback",
                    };
                    println!("  {} {} has no CTI binding ({})", "✗".yellow(), member, effect);
                }
            }
        }
    }

    println!("{} Configuration OK", "✓".green());
    Ok(())
}

/// Examine every core of the simulated target and print its status
fn cmd_status(config: &Config, format: OutputFormat) -> Result<()> {
    let sim = Arc::new(SimTarget::from_config(config));
    let controller = SmpController::new(config, sim.clone(), sim, Arc::new(LogSink))
        .context("Failed to set up run control")?;

    let mut statuses = Vec::new();
    for (core, result) in controller.examine_all() {
        if let Err(e) = result {
            info!(%core, error = %e, "Examination failed");
        }
        statuses.push(controller.status(&core)?);
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
        OutputFormat::Text => {
            for status in &statuses {
                println!(
                    "{:<16} {:<12} {:<10} {}",
                    status.core,
                    status.run_state.to_string(),
                    status.cluster.as_deref().unwrap_or("-"),
                    if status.examined { "examined" } else { "not examined" }
                );
            }
        }
    }
    Ok(())
}

/// Run the requested scenarios; fails if any scenario fails
fn cmd_scenario(config: &Config, names: Vec<Scenario>) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let scenarios = if names.is_empty() { Scenario::all() } else { names };

    let mut failed = 0;
    for scenario in &scenarios {
        println!("[{}] {}", scenario, scenario.description());
        let outcome = scenario::run(*scenario, config);
        if outcome.passed {
            println!("  {} {}", "PASS".green(), outcome.detail);
        } else {
            failed += 1;
            println!("  {} {}", "FAIL".red(), outcome.detail);
        }
    }

    if failed > 0 {
        return Err(eyre::eyre!("{} of {} scenarios failed", failed, scenarios.len()));
    }
    println!("All {} scenarios passed. Logs are in {}", scenarios.len(), runctl::cli::get_log_path().display());
    Ok(())
}
