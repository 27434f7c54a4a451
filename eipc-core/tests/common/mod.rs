//! Shared test fixtures: scripted bootstrap and supervisor stubs driving
//! the conductor through the same trait seams the real implementations use.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use eipc_core::error::{BootstrapError, LaunchError};
use eipc_core::provider::{Bootstrap, ProviderConfig, ProviderMeta, Service};
use eipc_core::vpn::conductor::{Conductor, ConductorConfig, ConductorHandle};
use eipc_core::vpn::supervisor::{
    map_exit, LaunchSpec, Launched, ProcessEvent, Supervise, TerminationOutcome,
};
use eipc_core::vpn::{Bus, TunnelEvent};

/// A loaded provider config offering the tunnel service
pub fn tunnel_provider(domain: &str) -> ProviderConfig {
    ProviderConfig::from_meta(
        ProviderMeta {
            domain: domain.to_string(),
            api_version: "1".to_string(),
            minimum_client_version: None,
            services: [Service::Tunnel].into_iter().collect(),
            gateways: vec!["198.51.100.7:1194".to_string()],
        },
        None,
    )
}

struct BootstrapInner {
    results: Mutex<VecDeque<Result<ProviderConfig, BootstrapError>>>,
    fallback: ProviderConfig,
    gate: Option<tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>>,
    calls: AtomicU32,
}

/// Scripted bootstrap stub
///
/// Scripted results are consumed in order; once exhausted, every call
/// succeeds with a tunnel-capable config. A gated stub parks each call
/// until the test releases it, which keeps an attempt in `Connecting`.
#[derive(Clone)]
pub struct StubBootstrap {
    inner: Arc<BootstrapInner>,
}

impl StubBootstrap {
    pub fn new(domain: &str) -> Self {
        Self {
            inner: Arc::new(BootstrapInner {
                results: Mutex::new(VecDeque::new()),
                fallback: tunnel_provider(domain),
                gate: None,
                calls: AtomicU32::new(0),
            }),
        }
    }

    pub fn script(self, result: Result<ProviderConfig, BootstrapError>) -> Self {
        self.inner.results.lock().unwrap().push_back(result);
        self
    }

    /// Park every call until the returned sender releases it
    pub fn gated(self, domain: &str) -> (Self, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = BootstrapInner {
            results: Mutex::new(self.inner.results.lock().unwrap().clone()),
            fallback: tunnel_provider(domain),
            gate: Some(tokio::sync::Mutex::new(rx)),
            calls: AtomicU32::new(0),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            tx,
        )
    }

    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bootstrap for StubBootstrap {
    async fn ensure(&self, _domain: &str) -> Result<ProviderConfig, BootstrapError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let result = self
            .inner
            .results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(self.inner.fallback.clone()));

        if let Some(gate) = &self.inner.gate {
            let mut rx = gate.lock().await;
            let _ = rx.recv().await;
        }

        result
    }

    fn invalidate(&self, _domain: &str) {}

    fn load_cached(&self, _domain: &str) -> Result<ProviderConfig, BootstrapError> {
        Ok(self.inner.fallback.clone())
    }
}

struct SupervisorInner {
    user_stopped: Arc<AtomicBool>,
    launch_errors: Mutex<VecDeque<LaunchError>>,
    current: Mutex<Option<mpsc::UnboundedSender<ProcessEvent>>>,
    launches: AtomicU32,
    stale_stops: AtomicU32,
    terminate_code: Mutex<i32>,
}

/// Scripted supervisor stub
///
/// Launches always succeed unless a failure was scripted; the test fires
/// process events by hand. `terminate` emulates the real supervisor: the
/// process dies and the monitor reports an exit mapped with the shared
/// user-intent flag.
#[derive(Clone)]
pub struct StubSupervisor {
    inner: Arc<SupervisorInner>,
}

impl StubSupervisor {
    pub fn new(user_stopped: Arc<AtomicBool>) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                user_stopped,
                launch_errors: Mutex::new(VecDeque::new()),
                current: Mutex::new(None),
                launches: AtomicU32::new(0),
                stale_stops: AtomicU32::new(0),
                terminate_code: Mutex::new(0),
            }),
        }
    }

    pub fn fail_next_launch(&self, err: LaunchError) {
        self.inner.launch_errors.lock().unwrap().push_back(err);
    }

    /// Exit code the emulated process dies with when terminated
    pub fn set_terminate_code(&self, code: i32) {
        *self.inner.terminate_code.lock().unwrap() = code;
    }

    /// The tunnel reports successful initialization
    pub fn send_up(&self) {
        if let Some(tx) = self.inner.current.lock().unwrap().as_ref() {
            let _ = tx.send(ProcessEvent::Up);
        }
    }

    /// The process exits on its own with the given code
    pub fn exit_with_code(&self, code: i32) {
        let outcome = map_exit(
            Some(code),
            self.inner.user_stopped.load(Ordering::SeqCst),
            None,
        );
        self.exit_with(outcome);
    }

    pub fn exit_with(&self, outcome: TerminationOutcome) {
        if let Some(tx) = self.inner.current.lock().unwrap().take() {
            let _ = tx.send(ProcessEvent::Exited(outcome));
        }
    }

    pub fn launches(&self) -> u32 {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub fn stale_stops(&self) -> u32 {
        self.inner.stale_stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Supervise for StubSupervisor {
    async fn launch(&self, _spec: LaunchSpec) -> Result<Launched, LaunchError> {
        if let Some(err) = self.inner.launch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.current.lock().unwrap() = Some(tx);
        self.inner.launches.fetch_add(1, Ordering::SeqCst);

        Ok(Launched {
            pid: 4242,
            events: rx,
        })
    }

    async fn terminate(&self, _timeout: Duration) {
        let code = *self.inner.terminate_code.lock().unwrap();
        let outcome = map_exit(
            Some(code),
            self.inner.user_stopped.load(Ordering::SeqCst),
            None,
        );
        if let Some(tx) = self.inner.current.lock().unwrap().take() {
            let _ = tx.send(ProcessEvent::Exited(outcome));
        }
    }

    async fn stop_stale(&self) -> bool {
        self.inner.stale_stops.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// A conductor wired over the stubs, plus the stubs themselves
pub struct Fixture {
    pub handle: ConductorHandle,
    pub bootstrap: StubBootstrap,
    pub supervisor: StubSupervisor,
    pub user_stopped: Arc<AtomicBool>,
}

pub fn fixture(domain: &str) -> Fixture {
    fixture_with(ConductorConfig::new(domain), StubBootstrap::new(domain))
}

pub fn fixture_with(config: ConductorConfig, bootstrap: StubBootstrap) -> Fixture {
    let user_stopped = Arc::new(AtomicBool::new(false));
    let supervisor = StubSupervisor::new(user_stopped.clone());
    let bus = Bus::default();

    let handle = Conductor::spawn(
        config,
        bootstrap.clone(),
        supervisor.clone(),
        user_stopped.clone(),
        bus,
    );

    Fixture {
        handle,
        bootstrap,
        supervisor,
        user_stopped,
    }
}

/// Poll a condition until it holds; panics after a generous timeout
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Drain everything currently buffered on an event receiver
pub fn drain_events(rx: &mut broadcast::Receiver<TunnelEvent>) -> Vec<TunnelEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
