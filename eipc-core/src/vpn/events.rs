//! Observable tunnel lifecycle events
//!
//! One explicit subscription interface owned by the state machine, so
//! delivery order is testable independent of any front end. Observers are
//! notified after a state is committed; nobody sees a half-applied
//! transition.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::provider::bootstrap::BootstrapStage;
use crate::vpn::reachability::ReachabilityResult;
use crate::vpn::state::ConnectionState;
use crate::vpn::supervisor::TerminationOutcome;

/// Events published on the tunnel event bus
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// A committed state transition
    StateChanged {
        at: DateTime<Utc>,
        old: ConnectionState,
        new: ConnectionState,
        reason: String,
    },

    /// The subprocess run ended
    ProcessExited {
        at: DateTime<Utc>,
        outcome: TerminationOutcome,
    },

    /// Advisory reachability verdict for the provider domain
    Reachability {
        at: DateTime<Utc>,
        result: ReachabilityResult,
    },

    /// A bootstrap stage finished
    BootstrapStage {
        at: DateTime<Utc>,
        domain: String,
        stage: BootstrapStage,
        ok: bool,
    },
}

impl TunnelEvent {
    pub fn state_changed(old: ConnectionState, new: ConnectionState, reason: impl Into<String>) -> Self {
        Self::StateChanged {
            at: Utc::now(),
            old,
            new,
            reason: reason.into(),
        }
    }

    pub fn process_exited(outcome: TerminationOutcome) -> Self {
        Self::ProcessExited {
            at: Utc::now(),
            outcome,
        }
    }

    pub fn reachability(result: ReachabilityResult) -> Self {
        Self::Reachability {
            at: Utc::now(),
            result,
        }
    }

    pub fn bootstrap_stage(domain: impl Into<String>, stage: BootstrapStage, ok: bool) -> Self {
        Self::BootstrapStage {
            at: Utc::now(),
            domain: domain.into(),
            stage,
            ok,
        }
    }
}

/// Broadcast channel for tunnel events
///
/// Thin wrapper over [`tokio::sync::broadcast`]. Publishing never blocks;
/// each subscriber gets its own receiver and only sees events sent after
/// it subscribed. Slow receivers observe `RecvError::Lagged` and skip the
/// oldest items.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<TunnelEvent>,
}

impl Bus {
    /// Create a bus with the given ring-buffer capacity (clamped to 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all active subscribers
    ///
    /// Dropped silently when nobody is listening.
    pub fn publish(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    /// Create an independent receiver for subsequent events
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(64)
    }
}
