//! The star message bus hub: accepts WebSocket connections, performs the
//! connect handshake, and routes envelopes between connected clients.

pub mod config;
pub mod error;
pub mod registry;
pub mod router;
pub mod server;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use config::Config;
pub use error::{HandshakeFailure, HubError};
pub use registry::{Connection, ConnectionRegistry, RegistryStats};

/// Broadcasts the "stop accepting, close every connection" signal described
/// in `spec.md` §4.4. Cloned into every per-connection task; `trigger`
/// flips the watched value so each task's `tokio::select!` observes the
/// change and closes its socket with the shutdown close code.
#[derive(Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
    tx: Arc<watch::Sender<()>>,
    rx: watch::Receiver<()>,
}

impl Shutdown {
    fn new() -> Self {
        let (tx, rx) = watch::channel(());
        Self {
            running: Arc::new(AtomicBool::new(true)),
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Idempotent: a second call after `running` has already flipped to
    /// `false` is a no-op (the watch send still fires but nothing is
    /// listening for a second wake).
    pub fn trigger(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// Resolves once `trigger` has been called. Each per-connection task
    /// clones its own receiver so all of them observe the same signal.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if !self.is_running() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state handed to every axum handler: the connection table, the
/// configuration it was constructed with, and the shutdown signal.
#[derive(Clone)]
pub struct HubState {
    pub registry: ConnectionRegistry,
    pub config: Arc<Config>,
    pub shutdown: Shutdown,
}

impl HubState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            config: Arc::new(config),
            shutdown: Shutdown::new(),
        }
    }

    /// Drives the shutdown sequence from `spec.md` §4.4: flip the
    /// not-running flag (stops the heartbeat sweeper and tells every
    /// connection task to close), then poll the registry until it drains
    /// or `grace` elapses. Idempotent — a second call just re-polls.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.trigger();
        let deadline = tokio::time::Instant::now() + grace;
        while self.registry.stats().await.total > 0 {
            if tokio::time::Instant::now() >= deadline {
                info!("shutdown grace period elapsed with connections still draining");
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

pub fn build_router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(server::ws_handler))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Spawns the background heartbeat sweeper task for `state`. Returns its
/// handle so callers can abort it during shutdown if desired; in practice
/// the sweeper exits on its own once `state.shutdown` is triggered.
pub fn spawn_heartbeat_sweeper(state: &HubState) -> tokio::task::JoinHandle<()> {
    let registry = state.registry.clone();
    let interval = state.config.heartbeat_interval;
    let shutdown = state.shutdown.clone();
    tokio::spawn(server::heartbeat_sweeper(registry, interval, shutdown))
}

pub const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}
