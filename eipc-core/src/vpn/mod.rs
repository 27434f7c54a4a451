//! Tunnel lifecycle module
//!
//! Conductor-driven connection state machine plus the pieces it
//! orchestrates: subprocess supervision, restart policy, log watching
//! and reachability verification.

pub mod conductor;
pub mod elevation;
pub mod events;
pub mod log_watch;
pub mod network_monitor;
pub mod reachability;
pub mod retry;
pub mod state;
pub mod supervisor;

// Public re-exports
pub use conductor::{start, Conductor, ConductorConfig, ConductorHandle};
pub use events::{Bus, TunnelEvent};
pub use state::ConnectionState;
pub use supervisor::TerminationOutcome;
