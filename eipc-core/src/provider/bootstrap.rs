//! Provider configuration bootstrap
//!
//! Runs the staged sequence needed before a tunnel can be configured:
//! name resolution, secure-transport handshake, CA certificate
//! acquisition, provider-metadata download and API-compatibility check.
//! Every stage reports independently so callers can say exactly which one
//! broke. Results are cached per domain; re-invoking for a loaded domain
//! is a no-op until the cache is invalidated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::BootstrapError;
use crate::provider::{ProviderConfig, ProviderMeta, SUPPORTED_API_VERSIONS};
use crate::vpn::events::{Bus, TunnelEvent};

/// This client's version, checked against provider requirements
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// HTTP timeout for each bootstrap request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The individually reported bootstrap stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStage {
    NameResolution,
    TransportHandshake,
    CaCertificate,
    ProviderMetadata,
    ApiCompatibility,
}

impl std::fmt::Display for BootstrapStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootstrapStage::NameResolution => write!(f, "name resolution"),
            BootstrapStage::TransportHandshake => write!(f, "transport handshake"),
            BootstrapStage::CaCertificate => write!(f, "ca certificate"),
            BootstrapStage::ProviderMetadata => write!(f, "provider metadata"),
            BootstrapStage::ApiCompatibility => write!(f, "api compatibility"),
        }
    }
}

/// Seam the conductor drives; the real implementation talks HTTP
#[async_trait]
pub trait Bootstrap: Send + Sync + 'static {
    /// Ensure a loaded config for the domain, downloading if needed
    async fn ensure(&self, domain: &str) -> Result<ProviderConfig, BootstrapError>;

    /// Drop the cached config so the next `ensure` re-fetches
    fn invalidate(&self, domain: &str);

    /// Load the provisional config persisted by an earlier session
    fn load_cached(&self, domain: &str) -> Result<ProviderConfig, BootstrapError>;
}

/// Downloads and caches provider configuration
pub struct ProviderBootstrap {
    client: reqwest::Client,
    cache: Mutex<HashMap<String, ProviderConfig>>,
    config_dir: PathBuf,
    base_url: Option<Url>,
    events: Option<Bus>,
}

impl ProviderBootstrap {
    pub fn new(config_dir: PathBuf) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .use_rustls_tls()
            .build()?;

        Ok(Self {
            client,
            cache: Mutex::new(HashMap::new()),
            config_dir,
            base_url: None,
            events: None,
        })
    }

    /// Override the provider base URL (tests point this at a local server)
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// Publish per-stage progress on the given bus
    pub fn with_events(mut self, bus: Bus) -> Self {
        self.events = Some(bus);
        self
    }

    fn provider_dir(&self, domain: &str) -> PathBuf {
        self.config_dir.join("providers").join(domain)
    }

    fn base(&self, domain: &str) -> Result<Url, BootstrapError> {
        match &self.base_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(&format!("https://{}/", domain)).map_err(|e| {
                BootstrapError::Transport {
                    domain: domain.to_string(),
                    reason: format!("invalid provider URL: {}", e),
                }
            }),
        }
    }

    fn report(&self, domain: &str, stage: BootstrapStage, ok: bool) {
        if ok {
            debug!("Bootstrap stage succeeded for {}: {}", domain, stage);
        } else {
            warn!("Bootstrap stage failed for {}: {}", domain, stage);
        }
        if let Some(bus) = &self.events {
            bus.publish(TunnelEvent::bootstrap_stage(domain, stage, ok));
        }
    }

    async fn check_name_resolution(&self, domain: &str) -> Result<(), BootstrapError> {
        let resolved = match lookup_host((domain, 443)).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    Ok(())
                } else {
                    Err("no addresses returned".to_string())
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match resolved {
            Ok(()) => {
                self.report(domain, BootstrapStage::NameResolution, true);
                Ok(())
            }
            Err(reason) => {
                self.report(domain, BootstrapStage::NameResolution, false);
                Err(BootstrapError::NameResolution {
                    domain: domain.to_string(),
                    reason,
                })
            }
        }
    }

    async fn check_transport(&self, domain: &str, base: &Url) -> Result<(), BootstrapError> {
        // Any HTTP response proves the secure transport works; status
        // codes are judged by the later stages.
        match self.client.get(base.clone()).send().await {
            Ok(_) => {
                self.report(domain, BootstrapStage::TransportHandshake, true);
                Ok(())
            }
            Err(e) => {
                self.report(domain, BootstrapStage::TransportHandshake, false);
                Err(BootstrapError::Transport {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn fetch_ca_cert(&self, domain: &str, base: &Url) -> Result<PathBuf, BootstrapError> {
        let certificate_error = |reason: String| BootstrapError::Certificate {
            domain: domain.to_string(),
            reason,
        };

        let result = async {
            let url = base
                .join("ca.crt")
                .map_err(|e| certificate_error(e.to_string()))?;
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| certificate_error(e.to_string()))?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| certificate_error(e.to_string()))?;

            let dir = self.provider_dir(domain);
            std::fs::create_dir_all(&dir)
                .map_err(|e| certificate_error(format!("cannot store certificate: {}", e)))?;
            let path = dir.join("ca.crt");
            std::fs::write(&path, &bytes)
                .map_err(|e| certificate_error(format!("cannot store certificate: {}", e)))?;
            Ok(path)
        }
        .await;

        self.report(domain, BootstrapStage::CaCertificate, result.is_ok());
        result
    }

    async fn fetch_metadata(&self, domain: &str, base: &Url) -> Result<ProviderMeta, BootstrapError> {
        let transport_error = |reason: String| BootstrapError::Transport {
            domain: domain.to_string(),
            reason,
        };

        let result = async {
            let url = base
                .join("provider.json")
                .map_err(|e| transport_error(e.to_string()))?;
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| transport_error(format!("provider metadata: {}", e)))?;
            response
                .json::<ProviderMeta>()
                .await
                .map_err(|e| transport_error(format!("provider metadata: {}", e)))
        }
        .await;

        self.report(domain, BootstrapStage::ProviderMetadata, result.is_ok());
        result
    }

    fn check_compatibility(&self, domain: &str, meta: &ProviderMeta) -> Result<(), BootstrapError> {
        let result = (|| {
            if !SUPPORTED_API_VERSIONS.contains(&meta.api_version.as_str()) {
                return Err(BootstrapError::UnsupportedApi {
                    domain: domain.to_string(),
                    got: meta.api_version.clone(),
                    supported: SUPPORTED_API_VERSIONS.join(", "),
                });
            }
            if let Some(required) = &meta.minimum_client_version {
                if !version_at_least(CLIENT_VERSION, required) {
                    return Err(BootstrapError::UnsupportedClient {
                        domain: domain.to_string(),
                        required: required.clone(),
                        current: CLIENT_VERSION.to_string(),
                    });
                }
            }
            Ok(())
        })();

        self.report(domain, BootstrapStage::ApiCompatibility, result.is_ok());
        result
    }

    fn persist_metadata(&self, domain: &str, meta: &ProviderMeta) {
        let dir = self.provider_dir(domain);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Cannot persist provider metadata for {}: {}", domain, e);
            return;
        }
        match serde_json::to_string_pretty(meta) {
            Ok(json) => {
                if let Err(e) = std::fs::write(dir.join("provider.json"), json) {
                    warn!("Cannot persist provider metadata for {}: {}", domain, e);
                }
            }
            Err(e) => warn!("Cannot serialize provider metadata for {}: {}", domain, e),
        }
    }
}

#[async_trait]
impl Bootstrap for ProviderBootstrap {
    async fn ensure(&self, domain: &str) -> Result<ProviderConfig, BootstrapError> {
        {
            let cache = self.cache.lock().unwrap();
            if let Some(config) = cache.get(domain) {
                debug!("Provider {} already bootstrapped, using cached config", domain);
                return Ok(config.clone());
            }
        }

        info!("Bootstrapping provider {}", domain);
        let base = self.base(domain)?;

        self.check_name_resolution(domain).await?;
        self.check_transport(domain, &base).await?;
        let ca_cert_path = self.fetch_ca_cert(domain, &base).await?;
        let meta = self.fetch_metadata(domain, &base).await?;
        self.check_compatibility(domain, &meta)?;

        self.persist_metadata(domain, &meta);

        let config = ProviderConfig::from_meta(meta, Some(ca_cert_path));
        {
            let mut cache = self.cache.lock().unwrap();
            cache.insert(domain.to_string(), config.clone());
        }

        info!("Provider {} bootstrapped", domain);
        Ok(config)
    }

    fn invalidate(&self, domain: &str) {
        let mut cache = self.cache.lock().unwrap();
        if cache.remove(domain).is_some() {
            debug!("Invalidated cached config for {}", domain);
        }
    }

    fn load_cached(&self, domain: &str) -> Result<ProviderConfig, BootstrapError> {
        let dir = self.provider_dir(domain);
        let contents = std::fs::read_to_string(dir.join("provider.json")).map_err(|_| {
            BootstrapError::NoCachedConfig {
                domain: domain.to_string(),
            }
        })?;
        let meta: ProviderMeta =
            serde_json::from_str(&contents).map_err(|_| BootstrapError::NoCachedConfig {
                domain: domain.to_string(),
            })?;

        let ca_path = dir.join("ca.crt");
        let ca_cert_path = ca_path.exists().then_some(ca_path);

        debug!("Loaded provisional config for {} from disk", domain);
        Ok(ProviderConfig::from_meta(meta, ca_cert_path))
    }
}

/// Compare dotted numeric versions; non-numeric parts compare as zero
fn version_at_least(current: &str, required: &str) -> bool {
    fn parts(v: &str) -> Vec<u64> {
        v.split('.')
            .map(|p| p.trim().parse().unwrap_or(0))
            .collect()
    }

    let current = parts(current);
    let required = parts(required);
    let len = current.len().max(required.len());
    for i in 0..len {
        let c = current.get(i).copied().unwrap_or(0);
        let r = required.get(i).copied().unwrap_or(0);
        if c != r {
            return c > r;
        }
    }
    true
}
