//! Tunnel on/off/status commands

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use eipc_core::config::toml_config::{get_config_dir, load_settings, save_settings};
use eipc_core::error::{ConfigError, EipError, Result};
use eipc_core::vpn::supervisor::{ProcessSupervisor, Supervise, SupervisorConfig};
use eipc_core::vpn::{self, ConductorConfig, ConnectionState, TunnelEvent};
use tokio::sync::broadcast;

/// How long to wait for the tunnel to come up before giving up on it
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Supervisor over the pidfile, for status/off from a fresh process
fn pidfile_supervisor() -> Result<ProcessSupervisor> {
    let config_dir = get_config_dir()?;
    Ok(ProcessSupervisor::new(
        SupervisorConfig {
            pidfile: config_dir.join("tunnel.pid"),
        },
        Arc::new(AtomicBool::new(true)),
    ))
}

fn print_event(event: &TunnelEvent) {
    match event {
        TunnelEvent::StateChanged {
            at,
            old,
            new,
            reason,
        } => {
            println!(
                "{} {} -> {} ({})",
                at.format("%H:%M:%S"),
                old,
                new,
                reason
            );
        }
        TunnelEvent::ProcessExited { at, outcome } => {
            println!("{} tunnel process: {}", at.format("%H:%M:%S"), outcome);
        }
        TunnelEvent::Reachability { at, result } => {
            println!("{} reachability: {:?}", at.format("%H:%M:%S"), result);
        }
        TunnelEvent::BootstrapStage {
            at,
            domain,
            stage,
            ok,
        } => {
            let verdict = if *ok { "ok" } else { "failed" };
            println!("{} bootstrap {}: {} {}", at.format("%H:%M:%S"), domain, stage, verdict);
        }
    }
}

/// Connect the tunnel
pub async fn run_tunnel_on(watch: bool, offline: bool) -> Result<()> {
    let mut config = load_settings()?;

    let domain = config.settings.pick_provider().ok_or_else(|| {
        EipError::Config(ConfigError::ValidationError {
            message: "No provider configured; run `eipc setup` first".to_string(),
        })
    })?;

    if !config.settings.tunnel_enabled(&domain) {
        return Err(EipError::Config(ConfigError::ValidationError {
            message: format!("Tunnel service is not enabled for {}", domain),
        }));
    }

    let mut conductor_config = ConductorConfig::new(domain.clone());
    conductor_config.offline = offline;
    if let Some(retry) = config.retry.clone() {
        conductor_config.retry = retry;
    }
    tracing::debug!(domain = %domain, offline, "Starting tunnel conductor");

    let handle = vpn::start(conductor_config).map_err(|e| {
        EipError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            e.to_string(),
        ))
    })?;

    let mut events = handle.subscribe();
    println!("Connecting to {}...", domain);
    handle.connect().await?;

    config.settings.set_autostart(true);
    save_settings(&config)?;

    let settled = handle
        .wait_for(
            |s| {
                matches!(
                    s,
                    ConnectionState::Connected | ConnectionState::Aborted | ConnectionState::Died
                )
            },
            CONNECT_TIMEOUT,
        )
        .await;

    match settled {
        Some(ConnectionState::Connected) => {
            println!("Tunnel is {}", "connected".green().bold());
        }
        Some(other) => {
            println!("Tunnel failed to come up: {}", other.to_string().red());
        }
        None => {
            println!("{}", "Timed out waiting for the tunnel".red());
        }
    }

    if watch {
        println!("Watching tunnel events; Ctrl+C to disconnect");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!("Disconnecting...");
                    handle.disconnect().await;
                    let _ = handle
                        .wait_for(|s| s == ConnectionState::Disconnected, Duration::from_secs(10))
                        .await;
                    handle.shutdown();
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => print_event(&event),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    Ok(())
}

/// Disconnect the tunnel
pub async fn run_tunnel_off() -> Result<()> {
    let supervisor = pidfile_supervisor()?;

    if supervisor.stop_stale().await {
        println!("Tunnel {}", "disconnected".yellow());
    } else {
        println!("No running tunnel instance");
    }

    let mut config = load_settings()?;
    config.settings.set_autostart(false);
    save_settings(&config)?;

    Ok(())
}

/// Show tunnel status
pub fn run_tunnel_status() -> Result<()> {
    let supervisor = pidfile_supervisor()?;
    let config = load_settings()?;

    match supervisor.running_instance() {
        Some(pid) => println!("Tunnel: {} (pid {})", "connected".green().bold(), pid),
        None => println!("Tunnel: {}", "off".red()),
    }

    if let Some(domain) = config.settings.pick_provider() {
        println!("Provider: {}", domain);
    } else {
        println!("Provider: {}", "not configured".yellow());
    }
    println!(
        "Autostart: {}",
        if config.settings.autostart() { "on" } else { "off" }
    );

    Ok(())
}
