//! Post-connect reachability verification
//!
//! Resolves the provider domain once the tunnel is up, off the state
//! machine's control path. Purely advisory: the result is published to
//! observers and never causes a state transition.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::vpn::network_monitor::NetworkMonitor;

/// Failure class of an unreachable verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableClass {
    /// The name did not resolve while the network itself looks fine
    TransientDns,
    /// The network itself is down or the resolver timed out
    TransientNetwork,
}

impl std::fmt::Display for UnreachableClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnreachableClass::TransientDns => write!(f, "transient-dns"),
            UnreachableClass::TransientNetwork => write!(f, "transient-network"),
        }
    }
}

/// Verdict of one reachability check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReachabilityResult {
    Reachable { addr: IpAddr },
    Unreachable { class: UnreachableClass, reason: String },
}

impl ReachabilityResult {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ReachabilityResult::Reachable { .. })
    }
}

/// Resolves the tunnel endpoint domain with a bounded timeout
#[derive(Debug, Clone)]
pub struct ReachabilityChecker {
    timeout: Duration,
}

impl ReachabilityChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve the domain; classify failures
    #[tracing::instrument(skip(self), fields(domain = %domain))]
    pub async fn check(&self, domain: &str) -> ReachabilityResult {
        match tokio::time::timeout(self.timeout, lookup_host((domain, 443))).await {
            Ok(Ok(mut addrs)) => match addrs.next() {
                Some(addr) => {
                    debug!("Domain {} resolves to {}", domain, addr.ip());
                    ReachabilityResult::Reachable { addr: addr.ip() }
                }
                None => {
                    warn!("Domain {} resolved to an empty address set", domain);
                    self.classify(format!("{} resolved to no addresses", domain))
                        .await
                }
            },
            Ok(Err(e)) => {
                warn!("Failed to resolve {}: {}", domain, e);
                self.classify(format!("resolution failed: {}", e)).await
            }
            Err(_) => ReachabilityResult::Unreachable {
                class: UnreachableClass::TransientNetwork,
                reason: format!("resolution timed out after {:?}", self.timeout),
            },
        }
    }

    /// A resolution failure while NetworkManager reports the network down
    /// is a network problem, not a DNS one.
    async fn classify(&self, reason: String) -> ReachabilityResult {
        let class = match NetworkMonitor::new().await {
            Ok(monitor) => match monitor.is_network_available().await {
                Ok(false) => UnreachableClass::TransientNetwork,
                _ => UnreachableClass::TransientDns,
            },
            // No NetworkManager to ask; assume the name was the problem
            Err(_) => UnreachableClass::TransientDns,
        };

        ReachabilityResult::Unreachable { class, reason }
    }
}
