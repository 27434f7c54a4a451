//! Configuration module
//!
//! Handles loading and saving client settings from TOML files. Settings
//! cover the externally persisted pieces of state: which providers are
//! configured, which services are enabled per provider, and the tunnel
//! autostart flag. Everything else the core tracks is ephemeral.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::provider::Service;

pub mod toml_config;

/// One configured provider entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Provider domain, e.g. "example.org"
    pub domain: String,

    /// Services the user enabled for this provider
    #[serde(default)]
    pub services: HashSet<Service>,
}

/// Persisted client settings
///
/// This is the "configuration store" collaborators consult: provider
/// domains, enabled services and the autostart flag. Provider capability
/// data itself is not stored here; it comes from the bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Start the tunnel on client startup
    #[serde(default)]
    pub autostart: bool,

    /// Domain used when no provider is named explicitly
    #[serde(default)]
    pub default_provider: Option<String>,

    /// Configured providers
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
}

impl Settings {
    /// All configured provider domains
    pub fn configured_providers(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.domain.clone()).collect()
    }

    /// Services the user enabled for a domain
    ///
    /// Unknown domains yield an empty set rather than an error; callers
    /// treat "nothing enabled" and "not configured" the same way.
    pub fn enabled_services(&self, domain: &str) -> HashSet<Service> {
        self.providers
            .iter()
            .find(|p| p.domain == domain)
            .map(|p| p.services.clone())
            .unwrap_or_default()
    }

    /// Whether the tunnel service is enabled for a domain
    pub fn tunnel_enabled(&self, domain: &str) -> bool {
        self.enabled_services(domain).contains(&Service::Tunnel)
    }

    /// Get the autostart flag
    pub fn autostart(&self) -> bool {
        self.autostart
    }

    /// Set the autostart flag
    pub fn set_autostart(&mut self, autostart: bool) {
        self.autostart = autostart;
    }

    /// The provider to use when none is named: the default if set,
    /// otherwise the first configured one.
    pub fn pick_provider(&self) -> Option<String> {
        self.default_provider
            .clone()
            .or_else(|| self.providers.first().map(|p| p.domain.clone()))
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<(), String> {
        for entry in &self.providers {
            if entry.domain.is_empty() {
                return Err("Provider domain cannot be empty".to_string());
            }

            // Basic hostname validation
            if !entry
                .domain
                .chars()
                .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
            {
                return Err(format!(
                    "Provider domain contains invalid characters: {}",
                    entry.domain
                ));
            }
        }

        if let Some(ref default) = self.default_provider {
            if !self.providers.iter().any(|p| &p.domain == default) {
                return Err(format!(
                    "Default provider {} is not among the configured providers",
                    default
                ));
            }
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            autostart: false,
            default_provider: None,
            providers: Vec::new(),
        }
    }
}
