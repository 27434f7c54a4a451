//! eipc - encrypted internet proxy tunnel client
//!
//! A command-line client that bootstraps provider configuration and
//! drives an encrypted tunnel subprocess through its lifecycle.

use clap::{Parser, Subcommand};
use eipc_core::{error::EipError, init_logging};

mod cli;

#[derive(Parser)]
#[command(name = "eipc")]
#[command(about = "Encrypted internet proxy tunnel client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure a provider
    Setup {
        /// Provider domain, e.g. example.org
        #[arg(long)]
        domain: String,
        /// Comma-separated services to enable (tunnel, mail)
        #[arg(long, default_value = "tunnel")]
        services: String,
    },
    /// Manage the tunnel (on/off/status)
    Tunnel {
        #[command(subcommand)]
        action: TunnelCommands,
    },
    /// Control the autostart flag
    Autostart {
        #[command(subcommand)]
        action: AutostartCommands,
    },
}

#[derive(Subcommand)]
enum TunnelCommands {
    /// Connect the tunnel
    On {
        /// Stay attached and stream lifecycle events until Ctrl+C
        #[arg(long)]
        watch: bool,
        /// Use only the cached provider configuration; no network calls
        #[arg(long)]
        offline: bool,
    },
    /// Disconnect the tunnel
    Off,
    /// Show tunnel status
    Status,
}

#[derive(Subcommand)]
enum AutostartCommands {
    /// Enable tunnel autostart
    On,
    /// Disable tunnel autostart
    Off,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Setup { domain, services } => cli::setup::run_setup(&domain, &services),
        Commands::Tunnel { action } => match action {
            TunnelCommands::On { watch, offline } => cli::tunnel::run_tunnel_on(watch, offline).await,
            TunnelCommands::Off => cli::tunnel::run_tunnel_off().await,
            TunnelCommands::Status => cli::tunnel::run_tunnel_status(),
        },
        Commands::Autostart { action } => match action {
            AutostartCommands::On => cli::setup::run_autostart(true),
            AutostartCommands::Off => cli::setup::run_autostart(false),
        },
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            let exit_code = match e {
                // Configuration errors (exit code 2)
                EipError::Config(_) | EipError::Toml(_) | EipError::TomlSerialize(_) => 2,
                // Runtime errors (exit code 1)
                EipError::Bootstrap(_)
                | EipError::Launch(_)
                | EipError::Connect(_)
                | EipError::Io(_) => 1,
            };

            eprintln!("{}", e);
            std::process::exit(exit_code);
        }
    }
}
