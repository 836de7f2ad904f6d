//! testmatrix CLI - expand test matrices and run them with flake retries.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use testmatrix::config::{self, Config};
use testmatrix::executor::Executor;
use testmatrix::flavor::{
    FlavorMatrix, expand_extended_flavors, expand_flavors, validate_extended_flavors,
    validate_flavors,
};
use testmatrix::orchestrator::{Orchestrator, RenameRerenderer, ShellBackend, Testrun};
use testmatrix::report;

#[derive(Parser)]
#[command(name = "testmatrix")]
#[command(about = "Test matrix expansion and flake-retrying execution", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "testmatrix.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate flavors and executor settings
    Validate,

    /// Expand flavors into the test matrix
    Expand {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Expand flavors and run every instance
    Run {
        /// Command executing one testrun (overrides runner.command)
        #[arg(long)]
        command: Option<String>,

        /// Override the number of flake attempts
        #[arg(long)]
        flake_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Validate => validate_config(&cli.config),
        Commands::Expand { format } => expand(&cli.config, &format).await,
        Commands::Run {
            command,
            flake_attempts,
        } => run(&cli.config, command, flake_attempts).await,
    }
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let mut problems = flavor_problems(&config);
    if let Err(e) = Executor::new(config.executor.to_executor_config()) {
        problems.push(format!("executor: {}", e));
    }

    if !problems.is_empty() {
        eprintln!("Configuration has {} problems:", problems.len());
        for problem in &problems {
            eprintln!("  {}", problem);
        }
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Flavors: {}", config.flavors.len());
    println!("  Extended flavors: {}", config.extended_flavors.len());
    println!("  Flake attempts: {}", config.runner.flake_attempts);
    println!("  Run timeout: {}s", config.runner.run_timeout_secs);
    println!(
        "  Mode: {}",
        if config.executor.serial { "serial" } else { "parallel" }
    );
    Ok(())
}

/// Violations of base and extended flavors, in that order.
fn flavor_problems(config: &Config) -> Vec<String> {
    let mut problems = Vec::new();
    if let Err(errors) = validate_flavors(&config.flavors) {
        problems.extend(errors.iter().map(ToString::to_string));
    }
    if let Err(errors) = validate_extended_flavors(&config.extended_flavors) {
        problems.extend(errors.iter().map(ToString::to_string));
    }
    problems
}

async fn expand_all(config: &Config) -> Result<(FlavorMatrix, FlavorMatrix)> {
    let problems = flavor_problems(config);
    if !problems.is_empty() {
        bail!("invalid flavors:\n{}", problems.join("\n"));
    }

    let catalogs = config.catalog_provider();
    let options = config.expansion_options();

    let base = expand_flavors(&config.flavors, &catalogs, &options)
        .await
        .context("Failed to expand flavors")?;
    let extended = expand_extended_flavors(&config.extended_flavors, &catalogs, &options)
        .await
        .context("Failed to expand extended flavors")?;
    Ok((base, extended))
}

async fn expand(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let (base, extended) = expand_all(&config).await?;

    match format {
        "json" => {
            let output = json!({
                "flavors": base,
                "extendedFlavors": extended,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            if !base.is_empty() || extended.is_empty() {
                report::print_matrix(&base);
            }
            if !extended.is_empty() {
                if !base.is_empty() {
                    println!();
                }
                report::print_matrix(&extended);
            }
        }
    }

    Ok(())
}

async fn run(
    config_path: &Path,
    command_override: Option<String>,
    flake_attempts: Option<u32>,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(attempts) = flake_attempts {
        config.runner.flake_attempts = attempts;
    }
    let Some(command) = command_override.or_else(|| config.runner.command.clone()) else {
        bail!("No command configured: set runner.command or pass --command");
    };

    info!("Loaded configuration from {}", config_path.display());

    let executor = Executor::new(config.executor.to_executor_config())
        .context("Invalid executor settings")?;
    let (base, extended) = expand_all(&config).await?;

    let testruns: Vec<Testrun> = base
        .instances
        .into_iter()
        .chain(extended.instances)
        .map(|instance| Testrun::for_instance(instance, &config.runner.testrun_prefix))
        .collect();

    let orchestrator = Orchestrator::new(
        ShellBackend::new(command),
        RenameRerenderer::new(config.runner.testrun_prefix.clone()),
        config.orchestrator_config(),
    );
    let report = orchestrator.run(&executor, testruns).await;

    report::print_summary(&report);
    std::process::exit(report.exit_code());
}
