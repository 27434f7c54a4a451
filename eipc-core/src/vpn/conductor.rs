//! Tunnel connection conductor
//!
//! The state machine that owns the tunnel lifecycle. One task consumes a
//! single message queue, so transitions are atomic and never interleave:
//! commands from front ends, bootstrap results, subprocess events and
//! restart timers all arrive as messages. Workers (bootstrap download,
//! exit monitoring, reachability resolution) run on their own tasks and
//! report back through the same queue.
//!
//! Every bootstrap attempt and timer carries the epoch of the attempt
//! that started it; results from a superseded attempt are discarded on
//! arrival instead of being allowed to fire a stale transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{BootstrapError, ConnectError};
use crate::provider::{best_config, Bootstrap, ProviderBootstrap, ProviderConfig};
use crate::vpn::elevation::ElevationMethod;
use crate::vpn::events::{Bus, TunnelEvent};
use crate::vpn::reachability::{ReachabilityChecker, ReachabilityResult};
use crate::vpn::retry::{RestartDirective, RetryPolicy};
use crate::vpn::state::ConnectionState;
use crate::vpn::supervisor::{
    LaunchSpec, ProcessEvent, ProcessSupervisor, Supervise, SupervisorConfig, TerminationOutcome,
};

/// Conductor construction parameters
///
/// Everything that used to be ambient (offline switch, retry tunables)
/// is an explicit field here.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Provider domain to connect to
    pub domain: String,
    /// Tunnel binary name or path
    pub tunnel_binary: String,
    /// Privilege wrapper for the tunnel binary
    pub elevation: ElevationMethod,
    /// Use only the on-disk provisional provider config; no network calls
    pub offline: bool,
    /// Restart policy for unexpected terminations
    pub retry: RetryPolicy,
    /// Graceful-stop budget before SIGKILL
    pub terminate_timeout: Duration,
    /// Budget for the post-connect reachability resolution
    pub reachability_timeout: Duration,
}

impl ConductorConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tunnel_binary: "openvpn".to_string(),
            elevation: ElevationMethod::Pkexec,
            offline: false,
            retry: RetryPolicy::default(),
            terminate_timeout: Duration::from_secs(5),
            reachability_timeout: Duration::from_secs(10),
        }
    }
}

/// Commands a front end can issue
enum Command {
    Connect(oneshot::Sender<std::result::Result<(), ConnectError>>),
    Disconnect(oneshot::Sender<()>),
    Restart,
    Shutdown,
}

/// Everything that reaches the conductor goes through this queue
enum Msg {
    Command(Command),
    BootstrapDone {
        epoch: u64,
        provisional: bool,
        result: std::result::Result<ProviderConfig, BootstrapError>,
    },
    Process {
        epoch: u64,
        event: ProcessEvent,
    },
    RestartTimer {
        epoch: u64,
    },
    Reachability {
        epoch: u64,
        result: ReachabilityResult,
    },
}

/// Cloneable handle for driving and observing a conductor
#[derive(Clone)]
pub struct ConductorHandle {
    msg_tx: mpsc::UnboundedSender<Msg>,
    state_rx: watch::Receiver<ConnectionState>,
    bus: Bus,
}

impl ConductorHandle {
    /// Request a connection attempt
    ///
    /// Fails with [`ConnectError::AlreadyConnecting`] unless the machine
    /// is in `Disconnected`, `Aborted` or `Died`.
    pub async fn connect(&self) -> std::result::Result<(), ConnectError> {
        let (tx, rx) = oneshot::channel();
        self.msg_tx
            .send(Msg::Command(Command::Connect(tx)))
            .map_err(|_| ConnectError::ManagerGone)?;
        rx.await.map_err(|_| ConnectError::ManagerGone)?
    }

    /// Request a disconnect; a no-op when nothing is running
    ///
    /// Returns once the stop signal has been delivered (the state settles
    /// to `Disconnected` shortly after, observable via the state watch).
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.msg_tx.send(Msg::Command(Command::Disconnect(tx))).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop the tunnel and start it again after the restart delay
    pub fn restart(&self) {
        let _ = self.msg_tx.send(Msg::Command(Command::Restart));
    }

    /// Hard stop: force-terminate the subprocess, skip all retries
    pub fn shutdown(&self) {
        let _ = self.msg_tx.send(Msg::Command(Command::Shutdown));
    }

    /// Current committed state
    pub fn current_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to the ordered event stream
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.bus.subscribe()
    }

    /// Wait until the state satisfies the predicate, bounded by `timeout`
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(ConnectionState) -> bool,
        timeout: Duration,
    ) -> Option<ConnectionState> {
        let mut rx = self.state_rx.clone();
        tokio::time::timeout(timeout, async move {
            loop {
                let state = *rx.borrow();
                if pred(state) {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return state;
                }
            }
        })
        .await
        .ok()
    }
}

/// The connection state machine
pub struct Conductor<B: Bootstrap, S: Supervise> {
    config: ConductorConfig,
    bootstrap: Arc<B>,
    supervisor: Arc<S>,
    bus: Bus,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    msg_tx: mpsc::UnboundedSender<Msg>,
    msg_rx: mpsc::UnboundedReceiver<Msg>,

    /// Whether the last stop was asked for by the user. Cleared at the
    /// start of every attempt; the only way an exit is told apart from a
    /// deliberate stop.
    user_stopped: Arc<AtomicBool>,

    /// Attempt generation; stale bootstrap results and timers are dropped
    epoch: u64,
    consecutive_failures: u32,

    /// Authoritative (downloaded) and provisional (disk-cached) configs
    provider: Option<ProviderConfig>,
    provisional: Option<ProviderConfig>,

    bootstrap_task: Option<JoinHandle<()>>,
    process_live: bool,
    restart_pending: bool,
    restart_requested: bool,
    shutting_down: bool,
    done: bool,
}

impl<B: Bootstrap, S: Supervise> Conductor<B, S> {
    /// Spawn the conductor task and return its handle
    pub fn spawn(
        config: ConductorConfig,
        bootstrap: B,
        supervisor: S,
        user_stopped: Arc<AtomicBool>,
        bus: Bus,
    ) -> ConductorHandle {
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let handle = ConductorHandle {
            msg_tx: msg_tx.clone(),
            state_rx,
            bus: bus.clone(),
        };

        let conductor = Self {
            config,
            bootstrap: Arc::new(bootstrap),
            supervisor: Arc::new(supervisor),
            bus,
            state: ConnectionState::Disconnected,
            state_tx,
            msg_tx,
            msg_rx,
            user_stopped,
            epoch: 0,
            consecutive_failures: 0,
            provider: None,
            provisional: None,
            bootstrap_task: None,
            process_live: false,
            restart_pending: false,
            restart_requested: false,
            shutting_down: false,
            done: false,
        };

        tokio::spawn(conductor.run());
        handle
    }

    async fn run(mut self) {
        while let Some(msg) = self.msg_rx.recv().await {
            match msg {
                Msg::Command(cmd) => self.handle_command(cmd).await,
                Msg::BootstrapDone {
                    epoch,
                    provisional,
                    result,
                } => self.handle_bootstrap_done(epoch, provisional, result).await,
                Msg::Process { epoch, event } => self.handle_process(epoch, event).await,
                Msg::RestartTimer { epoch } => self.handle_restart_timer(epoch),
                Msg::Reachability { epoch, result } => self.handle_reachability(epoch, result),
            }

            if self.done {
                break;
            }
        }
        debug!("Conductor loop ended");
    }

    /// Commit a state and notify observers, in that order
    fn transition(&mut self, new: ConnectionState, reason: impl Into<String>) {
        if self.state == new {
            return;
        }
        let old = self.state;
        let reason = reason.into();
        info!("Tunnel state {} -> {}: {}", old, new, reason);

        self.state = new;
        let _ = self.state_tx.send(new);
        self.bus.publish(TunnelEvent::state_changed(old, new, reason));
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                if !self.state.accepts_connect() {
                    let _ = reply.send(Err(ConnectError::AlreadyConnecting));
                    return;
                }
                let _ = reply.send(Ok(()));
                self.begin_attempt("connect requested", true);
            }

            Command::Disconnect(reply) => {
                self.handle_disconnect().await;
                let _ = reply.send(());
            }

            Command::Restart => {
                if !self.state.is_active() {
                    return;
                }
                self.restart_requested = true;
                self.handle_disconnect().await;

                // A restart during bootstrap stops nothing; arm the timer
                // here since no termination will arrive to do it
                if !self.process_live
                    && self.state == ConnectionState::Disconnected
                    && self.restart_requested
                {
                    self.restart_requested = false;
                    self.restart_pending = true;
                    self.schedule_restart(self.config.retry.restart_delay());
                }
            }

            Command::Shutdown => {
                self.shutting_down = true;
                self.restart_pending = false;
                self.restart_requested = false;
                self.abort_bootstrap();

                if self.process_live {
                    self.user_stopped.store(true, Ordering::SeqCst);
                    self.supervisor.terminate(self.config.terminate_timeout).await;
                    // The Exited message completes the shutdown
                } else {
                    self.transition(ConnectionState::Disconnected, "client shutdown");
                    self.done = true;
                }
            }
        }
    }

    async fn handle_disconnect(&mut self) {
        match self.state {
            ConnectionState::Disconnected
            | ConnectionState::Aborted
            | ConnectionState::Disconnecting => {
                // Nothing to stop; deliberately not an error
            }

            ConnectionState::Died => {
                // A restart may be scheduled; user intent cancels it
                if self.restart_pending {
                    self.restart_pending = false;
                    self.epoch += 1;
                    self.transition(ConnectionState::Disconnected, "stopped by user");
                }
            }

            ConnectionState::Connecting if !self.process_live => {
                // Still bootstrapping; cancel the attempt outright
                self.user_stopped.store(true, Ordering::SeqCst);
                self.epoch += 1;
                self.abort_bootstrap();
                self.transition(ConnectionState::Disconnected, "stopped by user");
            }

            ConnectionState::Connecting | ConnectionState::Connected => {
                self.user_stopped.store(true, Ordering::SeqCst);
                self.transition(ConnectionState::Disconnecting, "disconnect requested");
                self.supervisor.terminate(self.config.terminate_timeout).await;
                // The Exited message takes the machine to Disconnected
            }
        }
    }

    /// Start a fresh connection attempt under a new epoch
    fn begin_attempt(&mut self, reason: &str, reset_failures: bool) {
        self.user_stopped.store(false, Ordering::SeqCst);
        if reset_failures {
            self.consecutive_failures = 0;
        }
        self.epoch += 1;
        self.restart_pending = false;
        self.transition(ConnectionState::Connecting, reason);
        self.start_bootstrap();
    }

    fn abort_bootstrap(&mut self) {
        if let Some(task) = self.bootstrap_task.take() {
            task.abort();
        }
    }

    fn start_bootstrap(&mut self) {
        self.abort_bootstrap();
        let epoch = self.epoch;

        if self.config.offline {
            // Offline mode never touches the network; the provisional
            // config from a previous session is the only source.
            let result = self.bootstrap.load_cached(&self.config.domain);
            let _ = self.msg_tx.send(Msg::BootstrapDone {
                epoch,
                provisional: true,
                result,
            });
            return;
        }

        let bootstrap = self.bootstrap.clone();
        let domain = self.config.domain.clone();
        let tx = self.msg_tx.clone();
        self.bootstrap_task = Some(tokio::spawn(async move {
            let result = bootstrap.ensure(&domain).await;
            let _ = tx.send(Msg::BootstrapDone {
                epoch,
                provisional: false,
                result,
            });
        }));
    }

    async fn handle_bootstrap_done(
        &mut self,
        epoch: u64,
        provisional: bool,
        result: std::result::Result<ProviderConfig, BootstrapError>,
    ) {
        if epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!("Discarding stale bootstrap result (epoch {})", epoch);
            return;
        }
        self.bootstrap_task = None;

        let config = match result {
            Ok(config) => config,
            Err(e) => {
                self.transition(ConnectionState::Aborted, format!("bootstrap failed: {}", e));
                return;
            }
        };

        if provisional {
            self.provisional = Some(config);
        } else {
            self.provider = Some(config);
        }

        let best = match best_config(self.provider.as_ref(), self.provisional.as_ref()) {
            Some(best) => best.clone(),
            None => {
                self.transition(ConnectionState::Aborted, "no provider configuration available");
                return;
            }
        };

        if !best.provides_tunnel() {
            self.transition(
                ConnectionState::Aborted,
                "provider does not offer the tunnel service",
            );
            return;
        }

        self.launch_process(best).await;
    }

    async fn launch_process(&mut self, provider: ProviderConfig) {
        let Some(spec) = LaunchSpec::for_provider(
            &provider,
            &self.config.tunnel_binary,
            self.config.elevation,
        ) else {
            self.transition(ConnectionState::Aborted, "provider lists no gateways");
            return;
        };

        match self.supervisor.launch(spec).await {
            Ok(launched) => {
                info!("Tunnel subprocess launched (pid {})", launched.pid);
                self.process_live = true;

                let epoch = self.epoch;
                let tx = self.msg_tx.clone();
                let mut events = launched.events;
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tx.send(Msg::Process { epoch, event }).is_err() {
                            break;
                        }
                    }
                });
            }
            Err(err) => {
                warn!("Tunnel launch failed: {}", err);
                let outcome = TerminationOutcome::from_launch_error(&err);
                self.bus.publish(TunnelEvent::process_exited(outcome));
                self.handle_termination(outcome).await;
            }
        }
    }

    async fn handle_process(&mut self, epoch: u64, event: ProcessEvent) {
        if epoch != self.epoch {
            debug!("Discarding stale process event (epoch {})", epoch);
            return;
        }

        match event {
            ProcessEvent::Up => {
                if self.state == ConnectionState::Connecting {
                    self.transition(ConnectionState::Connected, "tunnel initialization completed");
                    self.spawn_reachability_check();
                }
            }
            ProcessEvent::Exited(outcome) => {
                self.bus.publish(TunnelEvent::process_exited(outcome));
                self.handle_termination(outcome).await;
            }
        }
    }

    async fn handle_termination(&mut self, outcome: TerminationOutcome) {
        self.process_live = false;

        if self.shutting_down {
            self.transition(ConnectionState::Disconnected, "client shutdown");
            self.done = true;
            return;
        }

        if self.user_stopped.load(Ordering::SeqCst) {
            self.consecutive_failures = 0;
            self.transition(ConnectionState::Disconnected, "stopped by user");

            if self.restart_requested {
                self.restart_requested = false;
                self.restart_pending = true;
                self.schedule_restart(self.config.retry.restart_delay());
            }
            return;
        }

        if outcome == TerminationOutcome::AuthenticationDenied {
            self.transition(ConnectionState::Aborted, "authentication denied");
            return;
        }

        self.transition(ConnectionState::Died, outcome.to_string());
        self.consecutive_failures += 1;

        match self.config.retry.decide(&outcome, self.consecutive_failures) {
            RestartDirective::NoRestart => {}

            RestartDirective::Abort => {
                let reason = if self.consecutive_failures > self.config.retry.max_consecutive_failures
                {
                    format!(
                        "giving up after {} consecutive failures",
                        self.consecutive_failures
                    )
                } else {
                    format!("not retrying: {}", outcome)
                };
                self.transition(ConnectionState::Aborted, reason);
            }

            RestartDirective::RestartAfterDelay(delay) => {
                if outcome == TerminationOutcome::AlreadyRunningOwn {
                    // Clear the stale instance before the timer arms, so
                    // the restart cannot race it
                    self.supervisor.stop_stale().await;
                }
                self.restart_pending = true;
                self.schedule_restart(delay);
            }
        }
    }

    fn schedule_restart(&self, delay: Duration) {
        let epoch = self.epoch;
        let tx = self.msg_tx.clone();
        debug!("Restart scheduled in {:?}", delay);
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Msg::RestartTimer { epoch });
        });
    }

    fn handle_restart_timer(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.restart_pending {
            debug!("Discarding stale restart timer (epoch {})", epoch);
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Died | ConnectionState::Disconnected
        ) {
            self.begin_attempt("automatic restart", false);
        }
    }

    fn spawn_reachability_check(&self) {
        let checker = ReachabilityChecker::new(self.config.reachability_timeout);
        let domain = self.config.domain.clone();
        let epoch = self.epoch;
        let tx = self.msg_tx.clone();
        tokio::spawn(async move {
            let result = checker.check(&domain).await;
            let _ = tx.send(Msg::Reachability { epoch, result });
        });
    }

    fn handle_reachability(&mut self, epoch: u64, result: ReachabilityResult) {
        if epoch != self.epoch {
            return;
        }
        // Advisory only: observers are told, the state stays put
        if !result.is_reachable() {
            warn!("Tunnel endpoint reachability check failed: {:?}", result);
        }
        self.bus.publish(TunnelEvent::reachability(result));
    }
}

/// Wire up a conductor over the real bootstrap and supervisor
pub fn start(config: ConductorConfig) -> anyhow::Result<ConductorHandle> {
    let config_dir = crate::config::toml_config::get_config_dir()?;
    let bus = Bus::default();
    let user_stopped = Arc::new(AtomicBool::new(false));

    let bootstrap = ProviderBootstrap::new(config_dir.clone())?.with_events(bus.clone());
    let supervisor = ProcessSupervisor::new(
        SupervisorConfig {
            pidfile: config_dir.join("tunnel.pid"),
        },
        user_stopped.clone(),
    );

    Ok(Conductor::spawn(
        config, bootstrap, supervisor, user_stopped, bus,
    ))
}
