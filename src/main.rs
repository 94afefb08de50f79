use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::{LevelFilter, info};
use std::fs;
use std::path::{Path, PathBuf};

mod cli;

use cli::Cli;
use cli::commands::Commands;
use ecs_infra::config::Config;
use ecs_infra::scenario::Scenario;
use ecs_infra::template::{App, Environment};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ecs-infra")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("ecs-infra.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Cap the log level from config unless RUST_LOG already decides it
fn apply_log_level(config: &Config) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    match config.log_level.as_deref().map(str::parse::<LevelFilter>) {
        Some(Ok(level)) => log::set_max_level(level),
        Some(Err(_)) => log::warn!("Ignoring unknown log_level {:?}", config.log_level),
        None => log::set_max_level(LevelFilter::Info),
    }
}

fn build_app(scenario: Scenario, config: &Config) -> Result<App> {
    let env = Environment::from_env().or(config.environment.to_environment());
    info!("Environment: {:?}", env);
    scenario
        .build(config, env)
        .context(format!("Failed to build scenario {}", scenario))
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Synth { scenario, output } => handle_synth_command(*scenario, output, cli.is_verbose(), config),
        Commands::List => handle_list_command(config),
        Commands::Exports { scenario } => handle_exports_command(*scenario, config),
    }
}

fn handle_synth_command(scenario: Scenario, output: &Path, verbose: bool, config: &Config) -> Result<()> {
    info!("Synthesizing {} into {}", scenario, output.display());
    let app = build_app(scenario, config)?;
    if verbose {
        for stack in app.stacks() {
            println!("  {} {} ({} resources)", "Built".cyan(), stack.name(), stack.resources().count());
        }
    }

    let report = app
        .synth(output)
        .context(format!("Failed to synthesize {}", scenario))?;

    println!("{} {} -> {}", "Synthesized:".green(), scenario, report.out_dir.display());
    for (position, name) in report.stack_order.iter().enumerate() {
        let stack = app.stack(name);
        let exports = stack.map(|s| s.export_names().len()).unwrap_or_default();
        let assets = stack.map(|s| s.assets().len()).unwrap_or_default();
        println!(
            "  {}. {} ({} exports, {} assets)",
            position + 1,
            name.cyan(),
            exports,
            assets
        );
    }
    if verbose {
        for file in &report.files {
            println!("  {} {}", "Wrote".cyan(), file.display());
        }
    }
    Ok(())
}

fn handle_list_command(config: &Config) -> Result<()> {
    info!("Listing scenarios");
    for scenario in Scenario::all() {
        println!("{} - {}", scenario.name().green(), scenario.description());
        for name in scenario.stack_names(config) {
            println!("  {}", name.cyan());
        }
    }
    Ok(())
}

fn handle_exports_command(scenario: Scenario, config: &Config) -> Result<()> {
    info!("Listing exports of {}", scenario);
    let app = build_app(scenario, config)?;
    let exports = app.exports().context("Conflicting exports")?;
    if exports.is_empty() {
        println!("{}", format!("{} exports nothing", scenario).yellow());
        return Ok(());
    }
    let width = exports.keys().map(String::len).max().unwrap_or_default();
    for (name, stack) in &exports {
        println!("{:width$}  {}", name, stack.cyan(), width = width);
    }
    Ok(())
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    apply_log_level(&config);

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
