//! labvisor CLI entry point.

use clap::{Parser, Subcommand};
use labvisor::config::LabvisorConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// labvisor - ephemeral training lab orchestrator
#[derive(Parser, Debug)]
#[command(name = "labvisor")]
#[command(about = "Ephemeral training lab orchestrator")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to the user config directory).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API and run the resource monitor.
    Serve(cli::serve::ServeCmd),

    /// Run the resource monitor only.
    Monitor(cli::monitor::MonitorCmd),

    /// Reclaim expired labs now.
    Cleanup(cli::cleanup::CleanupCmd),

    /// List labs.
    #[command(alias = "list")]
    Ls(cli::list::ListCmd),

    /// Tear a lab down.
    Teardown(cli::teardown::TeardownCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_json);

    tracing::debug!(version = labvisor::VERSION, "starting labvisor");

    let config = match LabvisorConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load config");
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(config),
        Commands::Monitor(cmd) => cmd.run(config),
        Commands::Cleanup(cmd) => cmd.run(config),
        Commands::Ls(cmd) => cmd.run(config),
        Commands::Teardown(cmd) => cmd.run(config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("labvisor=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
