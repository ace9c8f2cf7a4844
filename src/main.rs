//! piawg - idempotent PIA WireGuard connection reconciler
//!
//! Designed to run from a systemd timer: each invocation compares the
//! live tunnel against the desired configuration and applies only the
//! delta, renewing the auth token and port-forward lease before expiry.

use clap::{Parser, Subcommand};
use piawg_core::config::{CliOverrides, Config};
use piawg_core::error::PiawgError;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "piawg")]
#[command(about = "Establish and maintain a Private Internet Access WireGuard tunnel")]
struct Cli {
    /// Config file to load
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PIA account username
    #[arg(short, long)]
    username: Option<String>,

    /// ID of the server region to connect to
    #[arg(short, long)]
    region: Option<String>,

    /// Request a forwarded port
    #[arg(short = 'P', long)]
    port_forward: bool,

    /// Command to run when the forwarded port changes
    #[arg(short = 'q', long)]
    port_forward_command: Option<String>,

    /// Log verbosity (critical/error/warning/info/debug)
    #[arg(short = 'L', long)]
    log_level: Option<String>,

    /// Directory for persisted state
    #[arg(long)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print available region IDs and exit
    ListRegions,
    /// Show tunnel and port-forward status
    Status,
}

fn main() {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        config: cli.config.clone(),
        username: cli.username.clone(),
        region: cli.region.clone(),
        port_forward: cli.port_forward,
        port_forward_command: cli.port_forward_command.clone(),
        log_level: cli.log_level.clone(),
        state_dir: cli.state_dir.clone(),
    };

    let config = match Config::resolve(&overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = piawg_core::init_logging(config.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(2);
    }

    let result = match cli.command {
        None => cli::connect::run(&config),
        Some(Commands::ListRegions) => cli::list_regions::run(&config),
        Some(Commands::Status) => cli::status::run(&config),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration and deployment defects (exit code 2)
                PiawgError::Config(_) | PiawgError::Requirement(_) => 2,
                // Runtime failures (exit code 1)
                PiawgError::Api(_)
                | PiawgError::Tunnel(_)
                | PiawgError::Io(_)
                | PiawgError::State(_) => 1,
            };

            eprintln!("{e}");
            std::process::exit(exit_code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
