//! Pattern-based watcher for tunnel subprocess output
//!
//! Extracts the handful of signals the supervisor cares about from the
//! subprocess stdout/stderr. Raw exit codes alone are not enough: some
//! failure classes (unreachable network, missing tun device, a foreign
//! instance holding the port) only show up in the log stream.

use regex::Regex;

/// Signals recognized in subprocess output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSignal {
    /// Tunnel initialization finished; the link is up
    TunnelUp,
    /// Authentication was rejected
    AuthFailure,
    /// The network path to the gateway is gone
    NetworkUnreachable,
    /// The tun/tap device or kernel extension is not available
    KernelExtensionMissing,
    /// Another instance holds the port or management socket
    AlreadyRunning,
}

/// Compiled pattern set over subprocess log lines
pub struct LogWatcher {
    up_pattern: Regex,
    auth_pattern: Regex,
    unreachable_pattern: Regex,
    kext_pattern: Regex,
    in_use_pattern: Regex,
}

impl LogWatcher {
    pub fn new() -> Self {
        Self {
            up_pattern: Regex::new(r"Initialization Sequence Completed")
                .expect("Failed to compile up pattern"),
            auth_pattern: Regex::new(r"AUTH_FAILED|auth-failure|Authentication failed")
                .expect("Failed to compile auth pattern"),
            unreachable_pattern: Regex::new(
                r"(?i)network is unreachable|no route to host|cannot resolve host address",
            )
            .expect("Failed to compile unreachable pattern"),
            kext_pattern: Regex::new(
                r"(?i)cannot open tun/tap dev|tun.*no such device|kernel extension",
            )
            .expect("Failed to compile kext pattern"),
            in_use_pattern: Regex::new(r"(?i)address already in use|socket.*already in use")
                .expect("Failed to compile in_use pattern"),
        }
    }

    /// Classify one log line; most lines carry no signal
    pub fn parse_line(&self, line: &str) -> Option<LogSignal> {
        if self.up_pattern.is_match(line) {
            return Some(LogSignal::TunnelUp);
        }
        if self.auth_pattern.is_match(line) {
            return Some(LogSignal::AuthFailure);
        }
        if self.unreachable_pattern.is_match(line) {
            return Some(LogSignal::NetworkUnreachable);
        }
        if self.kext_pattern.is_match(line) {
            return Some(LogSignal::KernelExtensionMissing);
        }
        if self.in_use_pattern.is_match(line) {
            return Some(LogSignal::AlreadyRunning);
        }
        None
    }
}

impl Default for LogWatcher {
    fn default() -> Self {
        Self::new()
    }
}
