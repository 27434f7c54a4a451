//! Tunnel connection state model
//!
//! Defines the states of the tunnel lifecycle. Transitions are owned by
//! the conductor; everything else only ever observes committed states.

use serde::{Deserialize, Serialize};

/// Tunnel connection states
///
/// `Aborted` and `Died` require a fresh `connect` command to leave:
/// `Aborted` means configuration or launch prerequisites could not be
/// satisfied, `Died` means the subprocess exited when nobody asked it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected
    Disconnected,

    /// Bootstrapping configuration or waiting for the subprocess to come up
    Connecting,

    /// Tunnel subprocess is up
    Connected,

    /// User asked to stop; waiting for the subprocess to go away
    Disconnecting,

    /// Connection attempt was aborted (configuration/prerequisite failure)
    Aborted,

    /// Subprocess exited unexpectedly
    Died,
}

impl ConnectionState {
    /// Whether a `connect` command is acceptable from this state
    pub fn accepts_connect(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Aborted | ConnectionState::Died
        )
    }

    /// Whether a connection attempt is live (process running or coming up)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Disconnecting
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Aborted => write!(f, "aborted"),
            ConnectionState::Died => write!(f, "died"),
        }
    }
}
