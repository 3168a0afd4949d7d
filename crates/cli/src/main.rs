//! Suiterun CLI - Main Entry Point
//!
//! Runs browser test files from the command line, the same way the
//! function handler does for an invocation.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod output;

use commands::{provision, resolve, run};
use suiterun_common::Config;

/// Suiterun - run browser test files in a headless browser
#[derive(Parser)]
#[command(name = "suiterun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (defaults to $SUITERUN_CONFIG)
    #[arg(long, global = true, env = "SUITERUN_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run test files and print the report
    Run(run::RunArgs),

    /// Show how test references resolve
    Resolve(resolve::ResolveArgs),

    /// Provision the headless browser
    Provision(provision::ProvisionArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            let failed = run::execute(args, config, cli.format).await?;
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Resolve(args) => resolve::execute(args, config, cli.format).await?,
        Commands::Provision(args) => provision::execute(args, config, cli.format).await?,
        Commands::Version => {
            println!("suiterun v{}", suiterun_common::VERSION);
        }
    }

    Ok(())
}
