//! Provider capability model
//!
//! A provider is a domain offering one or more services (the encrypted
//! tunnel, mail). Its capabilities and endpoints are described by a
//! `provider.json` document downloaded during bootstrap; a provisional
//! copy read from disk stands in when the authoritative download is
//! unavailable.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod bootstrap;

pub use bootstrap::{Bootstrap, ProviderBootstrap};

/// API versions this client can talk to
pub const SUPPORTED_API_VERSIONS: &[&str] = &["1"];

/// Service tags a provider may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Encrypted tunnel service
    Tunnel,
    /// Encrypted mail service
    Mail,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Service::Tunnel => write!(f, "tunnel"),
            Service::Mail => write!(f, "mail"),
        }
    }
}

/// On-the-wire provider metadata (`provider.json`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub domain: String,
    pub api_version: String,
    #[serde(default)]
    pub minimum_client_version: Option<String>,
    #[serde(default)]
    pub services: HashSet<Service>,
    #[serde(default)]
    pub gateways: Vec<String>,
}

/// One provider's capabilities and endpoints, as known to this session
///
/// Created unloaded, populated exactly once by a successful bootstrap (or
/// from the on-disk cache for the provisional variant) and immutable
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    domain: String,
    api_version: String,
    services: HashSet<Service>,
    gateways: Vec<String>,
    ca_cert_path: Option<PathBuf>,
    loaded: bool,
}

impl ProviderConfig {
    /// An empty, not-yet-loaded config for a domain
    pub fn unloaded(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            api_version: String::new(),
            services: HashSet::new(),
            gateways: Vec::new(),
            ca_cert_path: None,
            loaded: false,
        }
    }

    /// A loaded config from downloaded (or cached) metadata
    pub fn from_meta(meta: ProviderMeta, ca_cert_path: Option<PathBuf>) -> Self {
        Self {
            domain: meta.domain,
            api_version: meta.api_version,
            services: meta.services,
            gateways: meta.gateways,
            ca_cert_path,
            loaded: true,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    pub fn gateways(&self) -> &[String] {
        &self.gateways
    }

    /// Path of the provider CA certificate, if it has been acquired
    pub fn ca_cert_path(&self) -> Option<&PathBuf> {
        self.ca_cert_path.as_ref()
    }

    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn provides_tunnel(&self) -> bool {
        self.services.contains(&Service::Tunnel)
    }

    pub fn provides_mail(&self) -> bool {
        self.services.contains(&Service::Mail)
    }
}

/// Resolve the best available provider config
///
/// The authoritative (freshly downloaded) config wins when loaded; the
/// provisional (disk-cached) one stands in otherwise. Returns `None` only
/// when neither is loaded.
pub fn best_config<'a>(
    authoritative: Option<&'a ProviderConfig>,
    provisional: Option<&'a ProviderConfig>,
) -> Option<&'a ProviderConfig> {
    match authoritative {
        Some(config) if config.loaded() => Some(config),
        _ => provisional.filter(|c| c.loaded()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(domain: &str, services: &[Service]) -> ProviderConfig {
        ProviderConfig::from_meta(
            ProviderMeta {
                domain: domain.to_string(),
                api_version: "1".to_string(),
                minimum_client_version: None,
                services: services.iter().cloned().collect(),
                gateways: vec!["198.51.100.7:1194".to_string()],
            },
            None,
        )
    }

    #[test]
    fn test_unloaded_config_provides_nothing() {
        let config = ProviderConfig::unloaded("example.org");
        assert!(!config.loaded());
        assert!(!config.provides_tunnel());
        assert!(!config.provides_mail());
    }

    #[test]
    fn test_best_config_prefers_authoritative() {
        let auth = loaded("example.org", &[Service::Tunnel]);
        let prov = loaded("example.org", &[Service::Tunnel, Service::Mail]);

        let best = best_config(Some(&auth), Some(&prov)).unwrap();
        assert!(!best.provides_mail());
    }

    #[test]
    fn test_best_config_falls_back_to_provisional() {
        let auth = ProviderConfig::unloaded("example.org");
        let prov = loaded("example.org", &[Service::Tunnel]);

        let best = best_config(Some(&auth), Some(&prov)).unwrap();
        assert!(best.loaded());
        assert!(best.provides_tunnel());
    }

    #[test]
    fn test_best_config_none_when_nothing_loaded() {
        let auth = ProviderConfig::unloaded("example.org");
        assert!(best_config(Some(&auth), None).is_none());
        assert!(best_config(None, None).is_none());
    }

    #[test]
    fn test_meta_deserializes_service_tags() {
        let meta: ProviderMeta = serde_json::from_str(
            r#"{
                "domain": "example.org",
                "api_version": "1",
                "services": ["tunnel", "mail"],
                "gateways": ["198.51.100.7:1194"]
            }"#,
        )
        .unwrap();

        assert!(meta.services.contains(&Service::Tunnel));
        assert!(meta.services.contains(&Service::Mail));
    }
}
