//! Network state queries via D-Bus
//!
//! Thin NetworkManager client used to tell "the network is down" apart
//! from "this name does not resolve" when classifying failures.

use zbus::Connection;

/// NetworkManager D-Bus client
pub struct NetworkMonitor {
    connection: Connection,
}

impl NetworkMonitor {
    /// Connect to the system D-Bus and verify NetworkManager is available
    #[tracing::instrument]
    pub async fn new() -> Result<Self, NetworkMonitorError> {
        let connection = Connection::system().await?;

        let proxy = zbus::fdo::DBusProxy::new(&connection).await?;
        let bus_name = zbus::names::BusName::try_from("org.freedesktop.NetworkManager")
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;
        let name_has_owner = proxy
            .name_has_owner(bus_name)
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;

        if !name_has_owner {
            return Err(NetworkMonitorError::NetworkManagerUnavailable);
        }

        Ok(Self { connection })
    }

    /// Check if the network is currently available
    ///
    /// Queries the NetworkManager State property; global connectivity is
    /// NM_STATE_CONNECTED_GLOBAL (70).
    #[tracing::instrument(skip(self))]
    pub async fn is_network_available(&self) -> Result<bool, NetworkMonitorError> {
        let proxy = zbus::Proxy::new(
            &self.connection,
            "org.freedesktop.NetworkManager",
            "/org/freedesktop/NetworkManager",
            "org.freedesktop.NetworkManager",
        )
        .await?;

        let state: u32 = proxy
            .get_property("State")
            .await
            .map_err(|e| NetworkMonitorError::QueryFailed(e.to_string()))?;

        Ok(state == 70)
    }
}

/// Errors that can occur during network state queries
#[derive(Debug, thiserror::Error)]
pub enum NetworkMonitorError {
    #[error("D-Bus connection failed: {0}")]
    DBusConnectionFailed(#[from] zbus::Error),

    #[error("NetworkManager not available")]
    NetworkManagerUnavailable,

    #[error("Failed to query network state: {0}")]
    QueryFailed(String),
}
