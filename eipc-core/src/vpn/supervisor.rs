//! Tunnel subprocess supervision
//!
//! Spawns the tunnel binary through an elevation wrapper, watches its
//! output, terminates it safely and maps its exit into a structured
//! [`TerminationOutcome`]. The subprocess handle never leaves this module;
//! everything else sees derived [`ProcessEvent`]s only.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::provider::ProviderConfig;
use crate::vpn::elevation::{
    is_elevation_agent_running, is_elevation_tool_available, ElevationMethod,
};
use crate::vpn::log_watch::{LogSignal, LogWatcher};

/// Why a subprocess run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Exit code 0 after a user-requested stop
    Clean,
    /// The elevation wrapper or the gateway rejected authentication
    AuthenticationDenied,
    /// An instance not started by us is in the way
    AlreadyRunningForeign,
    /// A stale instance of our own is still around
    AlreadyRunningOwn,
    /// The tunnel binary is not installed
    BinaryNotFound,
    /// No privilege-elevation agent is running
    NoElevationAgent,
    /// The privilege-elevation tool is not installed
    NoElevationTool,
    /// The tun/tap kernel extension is missing
    KernelExtensionMissing,
    /// The network path to the gateway went away
    NetworkUnreachable,
    /// Any other exit; `-1` stands for killed-by-signal
    UnexpectedExit(i32),
}

impl std::fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationOutcome::Clean => write!(f, "clean exit"),
            TerminationOutcome::AuthenticationDenied => write!(f, "authentication denied"),
            TerminationOutcome::AlreadyRunningForeign => {
                write!(f, "foreign tunnel instance already running")
            }
            TerminationOutcome::AlreadyRunningOwn => {
                write!(f, "stale own tunnel instance already running")
            }
            TerminationOutcome::BinaryNotFound => write!(f, "tunnel binary not found"),
            TerminationOutcome::NoElevationAgent => write!(f, "no elevation agent running"),
            TerminationOutcome::NoElevationTool => write!(f, "elevation tool not installed"),
            TerminationOutcome::KernelExtensionMissing => {
                write!(f, "tun/tap kernel extension missing")
            }
            TerminationOutcome::NetworkUnreachable => write!(f, "network unreachable"),
            TerminationOutcome::UnexpectedExit(code) => {
                write!(f, "unexpected exit (code {})", code)
            }
        }
    }
}

impl TerminationOutcome {
    /// The outcome a pre-flight launch failure stands for
    pub fn from_launch_error(err: &LaunchError) -> Self {
        match err {
            LaunchError::BinaryNotFound { .. } => TerminationOutcome::BinaryNotFound,
            LaunchError::ElevationToolMissing { .. } => TerminationOutcome::NoElevationTool,
            LaunchError::ElevationAgentMissing => TerminationOutcome::NoElevationAgent,
            LaunchError::AlreadyRunning { foreign: true, .. } => {
                TerminationOutcome::AlreadyRunningForeign
            }
            LaunchError::AlreadyRunning { foreign: false, .. } => {
                TerminationOutcome::AlreadyRunningOwn
            }
            LaunchError::Spawn { .. } => TerminationOutcome::UnexpectedExit(-1),
        }
    }
}

/// Map a raw exit into a structured outcome
///
/// Captured log signals take precedence over the exit code: elevation
/// wrappers are known to swallow the real code, while the log stream
/// names the actual failure. Codes 126/127 are the wrapper refusing or
/// failing authentication. Code 0 without user intent is suspicious for
/// the same wrapper reason and is kept as an unexpected exit.
pub fn map_exit(
    code: Option<i32>,
    user_stopped: bool,
    signal: Option<LogSignal>,
) -> TerminationOutcome {
    if !user_stopped {
        match signal {
            Some(LogSignal::AuthFailure) => return TerminationOutcome::AuthenticationDenied,
            Some(LogSignal::NetworkUnreachable) => return TerminationOutcome::NetworkUnreachable,
            Some(LogSignal::KernelExtensionMissing) => {
                return TerminationOutcome::KernelExtensionMissing
            }
            Some(LogSignal::AlreadyRunning) => return TerminationOutcome::AlreadyRunningForeign,
            _ => {}
        }
    }

    match code {
        Some(126) | Some(127) => TerminationOutcome::AuthenticationDenied,
        Some(0) if user_stopped => TerminationOutcome::Clean,
        Some(0) => {
            warn!("Tunnel process exited 0 without a stop request; the elevation wrapper may have swallowed the real code");
            TerminationOutcome::UnexpectedExit(0)
        }
        Some(other) => TerminationOutcome::UnexpectedExit(other),
        None if user_stopped => TerminationOutcome::Clean,
        None => TerminationOutcome::UnexpectedExit(-1),
    }
}

/// What to launch and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Tunnel binary name or path
    pub binary: String,
    /// Arguments passed to the binary
    pub args: Vec<String>,
    /// Privilege wrapper
    pub elevation: ElevationMethod,
}

impl LaunchSpec {
    /// Build the launch arguments for a provider's first gateway
    pub fn for_provider(
        provider: &ProviderConfig,
        binary: impl Into<String>,
        elevation: ElevationMethod,
    ) -> Option<Self> {
        let gateway = provider.gateways().first()?;
        let (host, port) = match gateway.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.to_string()),
            None => (gateway.clone(), "1194".to_string()),
        };

        let mut args = vec![
            "--client".to_string(),
            "--dev".to_string(),
            "tun".to_string(),
            "--persist-tun".to_string(),
            "--proto".to_string(),
            "udp".to_string(),
            "--tls-client".to_string(),
            "--remote-cert-tls".to_string(),
            "server".to_string(),
            "--nobind".to_string(),
            "--remote".to_string(),
            host,
            port,
        ];
        if let Some(ca) = provider.ca_cert_path() {
            args.push("--ca".to_string());
            args.push(ca.to_string_lossy().to_string());
        }

        Some(Self {
            binary: binary.into(),
            args,
            elevation,
        })
    }
}

/// The live (or last) tunnel subprocess
///
/// Owned exclusively by the supervisor; other components observe derived
/// events only.
#[derive(Debug, Clone)]
pub struct SubprocessHandle {
    pub pid: u32,
    pub command: Vec<String>,
    pub elevation: ElevationMethod,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Events a running subprocess produces, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    /// The tunnel reported successful initialization
    Up,
    /// The subprocess exited
    Exited(TerminationOutcome),
}

/// Result of a successful launch: the pid plus the ordered event stream
#[derive(Debug)]
pub struct Launched {
    pub pid: u32,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

/// Launch/terminate seam the conductor drives
#[async_trait]
pub trait Supervise: Send + Sync + 'static {
    /// Pre-flight checks, then spawn; the returned stream delivers
    /// `Up` and exactly one terminal `Exited`.
    async fn launch(&self, spec: LaunchSpec) -> Result<Launched, LaunchError>;

    /// Graceful stop with bounded wait, escalating to SIGKILL. On return
    /// the process is gone (or a forced-kill failure has been logged).
    async fn terminate(&self, timeout: Duration);

    /// Try to remove a stale instance of our own (from a previous run).
    /// Returns true if one was stopped.
    async fn stop_stale(&self) -> bool;
}

/// Supervisor tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Where the pid of our launched instance is recorded
    pub pidfile: PathBuf,
}

/// Real subprocess supervisor
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    watcher: Arc<LogWatcher>,
    user_stopped: Arc<AtomicBool>,
    current: Arc<Mutex<Option<SubprocessHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, user_stopped: Arc<AtomicBool>) -> Self {
        Self {
            config,
            watcher: Arc::new(LogWatcher::new()),
            user_stopped,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Pid of a tunnel instance we launched that is still alive
    ///
    /// Consults the pidfile, not in-memory state, so it also works from a
    /// fresh process looking at an instance a previous run left behind.
    pub fn running_instance(&self) -> Option<u32> {
        let pid = self.recorded_pid()?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None)
            .is_ok()
            .then_some(pid)
    }

    /// Pid recorded by a previous (possibly dead) run
    fn recorded_pid(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(&self.config.pidfile).ok()?;
        contents.trim().parse().ok()
    }

    fn record_pid(&self, pid: u32) {
        if let Some(parent) = self.config.pidfile.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.config.pidfile, pid.to_string()) {
            warn!("Failed to write pidfile: {}", e);
        }
    }

    fn clear_pidfile(pidfile: &PathBuf) {
        let _ = std::fs::remove_file(pidfile);
    }

    /// Check the process table for an instance of the tunnel binary
    ///
    /// An instance whose pid matches our pidfile is "own" (stale from a
    /// previous run); anything else is foreign and needs the operator.
    fn find_running_instance(&self, binary: &str) -> Option<(u32, bool)> {
        let name = std::path::Path::new(binary)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| binary.to_string());

        let output = std::process::Command::new("pgrep")
            .args(["-x", &name])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let own_pid = self.recorded_pid();
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            if let Ok(pid) = line.trim().parse::<u32>() {
                let foreign = own_pid != Some(pid);
                return Some((pid, foreign));
            }
        }
        None
    }

    async fn scan_lines<R: AsyncRead + Unpin>(
        reader: R,
        watcher: Arc<LogWatcher>,
        tx: mpsc::UnboundedSender<LogSignal>,
    ) {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("tunnel: {}", line);
            if let Some(signal) = watcher.parse_line(&line) {
                if tx.send(signal).is_err() {
                    break;
                }
            }
        }
    }

    /// Send a signal and poll until the pid is gone or the deadline passes
    async fn wait_for_death(pid: nix::unistd::Pid, timeout: Duration) -> bool {
        use nix::sys::signal::kill;

        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            sleep(Duration::from_millis(200)).await;
            if kill(pid, None).is_err() {
                return true;
            }
        }
        false
    }

    async fn terminate_pid(pid: u32, timeout: Duration) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = Pid::from_raw(pid as i32);

        if kill(pid, None).is_err() {
            debug!("Tunnel process {} already gone", pid);
            return;
        }

        info!("Sending SIGTERM to tunnel process {}", pid);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to {}: {}", pid, e);
        }

        if Self::wait_for_death(pid, timeout).await {
            info!("Tunnel process {} terminated gracefully", pid);
            return;
        }

        warn!("Graceful shutdown timed out, sending SIGKILL to {}", pid);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            warn!("Failed to send SIGKILL to {}: {}", pid, e);
        }

        if !Self::wait_for_death(pid, Duration::from_secs(2)).await {
            warn!("Tunnel process {} survived SIGKILL", pid);
        }
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn launch(&self, spec: LaunchSpec) -> Result<Launched, LaunchError> {
        // Pre-flight: everything that would otherwise surface as a crash
        if which::which(&spec.binary).is_err() {
            return Err(LaunchError::BinaryNotFound {
                binary: spec.binary.clone(),
            });
        }
        if !is_elevation_tool_available(spec.elevation) {
            return Err(LaunchError::ElevationToolMissing {
                tool: spec.elevation.tool().unwrap_or_default().to_string(),
            });
        }
        if !is_elevation_agent_running(spec.elevation) {
            return Err(LaunchError::ElevationAgentMissing);
        }
        if let Some((pid, foreign)) = self.find_running_instance(&spec.binary) {
            return Err(LaunchError::AlreadyRunning { pid, foreign });
        }

        let mut command_line = Vec::new();
        let mut cmd = match spec.elevation.tool() {
            Some(tool) => {
                command_line.push(tool.to_string());
                let mut c = Command::new(tool);
                c.arg(&spec.binary);
                c
            }
            None => Command::new(&spec.binary),
        };
        command_line.push(spec.binary.clone());
        command_line.extend(spec.args.iter().cloned());

        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| LaunchError::Spawn {
            reason: format!("Failed to spawn {}: {}", spec.binary, e),
        })?;

        let pid = child.id().ok_or_else(|| LaunchError::Spawn {
            reason: "Spawned process has no pid".to_string(),
        })?;

        info!("Tunnel process spawned with pid {}", pid);
        self.record_pid(pid);

        let handle = SubprocessHandle {
            pid,
            command: command_line,
            elevation: spec.elevation,
            started_at: chrono::Utc::now(),
        };
        {
            let mut current = self.current.lock().await;
            *current = Some(handle);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sig_tx, mut sig_rx) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::scan_lines(stdout, self.watcher.clone(), sig_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::scan_lines(stderr, self.watcher.clone(), sig_tx.clone()));
        }
        drop(sig_tx);

        let user_stopped = self.user_stopped.clone();
        let current = self.current.clone();
        let pidfile = self.config.pidfile.clone();

        // Monitor task: drain log signals until the pipes close (the
        // process is exiting), then reap and map the exit.
        tokio::spawn(async move {
            let mut fatal: Option<LogSignal> = None;
            while let Some(signal) = sig_rx.recv().await {
                match signal {
                    LogSignal::TunnelUp => {
                        let _ = events_tx.send(ProcessEvent::Up);
                    }
                    other => fatal = Some(other),
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to reap tunnel process: {}", e);
                    None
                }
            };

            let outcome = map_exit(code, user_stopped.load(Ordering::SeqCst), fatal);
            info!("Tunnel process finished: {}", outcome);

            {
                let mut current = current.lock().await;
                *current = None;
            }
            Self::clear_pidfile(&pidfile);

            let _ = events_tx.send(ProcessEvent::Exited(outcome));
        });

        Ok(Launched {
            pid,
            events: events_rx,
        })
    }

    async fn terminate(&self, timeout: Duration) {
        let pid = {
            let current = self.current.lock().await;
            current.as_ref().map(|h| h.pid)
        };

        if let Some(pid) = pid {
            Self::terminate_pid(pid, timeout).await;
        }
    }

    async fn stop_stale(&self) -> bool {
        let Some(pid) = self.recorded_pid() else {
            return false;
        };

        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
            // Recorded instance is already gone; just forget it
            Self::clear_pidfile(&self.config.pidfile);
            return false;
        }

        info!("Stopping stale tunnel instance {}", pid);
        Self::terminate_pid(pid, Duration::from_secs(5)).await;
        Self::clear_pidfile(&self.config.pidfile);
        true
    }
}
