//! Provider setup and autostart commands

use std::collections::HashSet;

use eipc_core::config::toml_config::{load_settings, save_settings};
use eipc_core::config::ProviderEntry;
use eipc_core::error::{ConfigError, EipError, Result};
use eipc_core::provider::Service;

fn parse_services(services: &str) -> Result<HashSet<Service>> {
    let mut parsed = HashSet::new();
    for tag in services.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match tag {
            "tunnel" => parsed.insert(Service::Tunnel),
            "mail" => parsed.insert(Service::Mail),
            other => {
                return Err(EipError::Config(ConfigError::ValidationError {
                    message: format!("Unknown service: {}", other),
                }))
            }
        };
    }
    Ok(parsed)
}

/// Add (or update) a provider entry and make it the default
pub fn run_setup(domain: &str, services: &str) -> Result<()> {
    let services = parse_services(services)?;
    let mut config = load_settings()?;

    match config
        .settings
        .providers
        .iter()
        .position(|p| p.domain == domain)
    {
        Some(idx) => config.settings.providers[idx].services = services,
        None => config.settings.providers.push(ProviderEntry {
            domain: domain.to_string(),
            services,
        }),
    }
    config.settings.default_provider = Some(domain.to_string());

    save_settings(&config)?;
    println!("Provider {} configured", domain);
    Ok(())
}

/// Flip the autostart flag
pub fn run_autostart(enabled: bool) -> Result<()> {
    let mut config = load_settings()?;
    config.settings.set_autostart(enabled);
    save_settings(&config)?;
    println!(
        "Autostart {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}
