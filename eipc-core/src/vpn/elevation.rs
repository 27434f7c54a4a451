//! Privilege-elevation probes
//!
//! The tunnel subprocess needs root to configure routing, so it is spawned
//! through an elevation wrapper. These probes run before launch; a missing
//! wrapper or agent is a prerequisite failure, not something to discover
//! via a crashed subprocess.

use std::process::Command;

use serde::{Deserialize, Serialize};

/// How the tunnel subprocess gets its privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationMethod {
    /// pkexec / PolicyKit (requires an authentication agent)
    Pkexec,
    /// Plain sudo
    Sudo,
    /// No wrapper; spawn the binary directly (tests, root sessions)
    Direct,
}

impl ElevationMethod {
    /// The wrapper executable, if any
    pub fn tool(&self) -> Option<&'static str> {
        match self {
            ElevationMethod::Pkexec => Some("pkexec"),
            ElevationMethod::Sudo => Some("sudo"),
            ElevationMethod::Direct => None,
        }
    }

    /// Whether this method depends on a running authentication agent
    pub fn needs_agent(&self) -> bool {
        matches!(self, ElevationMethod::Pkexec)
    }
}

/// Process names of known PolicyKit authentication agents
const AUTH_AGENTS: &[&str] = &[
    "polkit-gnome-authentication-agent-1",
    "polkit-kde-authentication-agent-1",
    "polkit-mate-authentication-agent-1",
    "lxpolkit",
    "lxqt-policykit-agent",
];

/// Check that the elevation wrapper executable exists in PATH
pub fn is_elevation_tool_available(method: ElevationMethod) -> bool {
    match method.tool() {
        Some(tool) => which::which(tool).is_ok(),
        None => true,
    }
}

/// Check that a PolicyKit authentication agent is running
///
/// Scans the process table for the well-known agent names. Methods that
/// do not need an agent always pass.
pub fn is_elevation_agent_running(method: ElevationMethod) -> bool {
    if !method.needs_agent() {
        return true;
    }

    for agent in AUTH_AGENTS {
        let output = Command::new("pgrep").args(["-f", agent]).output();
        if let Ok(out) = output {
            if out.status.success() {
                return true;
            }
        }
    }
    false
}
