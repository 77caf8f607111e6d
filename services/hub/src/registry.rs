//! Connection registry: the hub's single source of truth for who is
//! connected. Grounded on the source's `ConnectionManager` (primary map
//! plus a type index and an env index), rebuilt here around a
//! `tokio::sync::RwLock` the way the teacher's `AppState` guards its
//! forwarder/broadcast maps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message as WsMessage;
use star_protocol::{ClientInfo, ClientType, Envelope};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

/// One live connection: everything the router needs to address it plus
/// the sender half of its outbound frame channel.
pub struct Connection {
    pub client_info: ClientInfo,
    pub last_heartbeat: Instant,
    outbound: mpsc::Sender<WsMessage>,
    prune: Option<oneshot::Sender<()>>,
}

impl Connection {
    fn new(client_info: ClientInfo, outbound: mpsc::Sender<WsMessage>, prune: oneshot::Sender<()>) -> Self {
        Self {
            client_info,
            last_heartbeat: Instant::now(),
            outbound,
            prune: Some(prune),
        }
    }

    /// Queues an envelope for this connection's writer task. A full
    /// queue (peer reading too slowly) is treated the same as a closed
    /// socket: the caller should drop the connection.
    pub fn try_send(&self, envelope: &Envelope) -> bool {
        let Ok(text) = envelope.encode() else {
            warn!(client_id = %self.client_info.client_id, "failed to encode outgoing envelope");
            return false;
        };
        self.outbound.try_send(WsMessage::Text(text)).is_ok()
    }
}

/// A point-in-time snapshot of registry counters, per `spec.md` §4.2.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub agents: usize,
    pub environments: usize,
    pub humans: usize,
    pub env_count: usize,
}

struct Inner {
    connections: HashMap<String, Connection>,
    by_kind: HashMap<ClientType, HashSet<String>>,
    by_env: HashMap<String, HashSet<String>>,
}

impl Inner {
    fn new() -> Self {
        let mut by_kind = HashMap::new();
        by_kind.insert(ClientType::Agent, HashSet::new());
        by_kind.insert(ClientType::Environment, HashSet::new());
        by_kind.insert(ClientType::Human, HashSet::new());
        Self {
            connections: HashMap::new(),
            by_kind,
            by_env: HashMap::new(),
        }
    }
}

/// Shared connection table. Cheaply `Clone`-able; every clone refers to
/// the same underlying map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::new())),
        }
    }

    /// Registers a new connection. `prune` is the owning reader task's
    /// half of a one-shot channel: firing it (via [`request_close`])
    /// tells that task it was pruned for heartbeat timeout, so it can
    /// close its own socket instead of the registry silently disappearing
    /// out from under a reader task that is still blocked on the socket.
    /// Returns `false` (and registers nothing) if `client_info.client_id`
    /// is already present.
    ///
    /// [`request_close`]: ConnectionRegistry::request_close
    pub async fn add(
        &self,
        client_info: ClientInfo,
        outbound: mpsc::Sender<WsMessage>,
        prune: oneshot::Sender<()>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let client_id = client_info.client_id.clone();
        if inner.connections.contains_key(&client_id) {
            return false;
        }
        inner
            .by_kind
            .entry(client_info.client_type)
            .or_default()
            .insert(client_id.clone());
        if let Some(env_id) = client_info.env_id.clone() {
            inner.by_env.entry(env_id).or_default().insert(client_id.clone());
        }
        inner
            .connections
            .insert(client_id, Connection::new(client_info, outbound, prune));
        true
    }

    /// Removes a connection, dropping it from all three indices.
    /// Returns `false` if it was not present.
    pub async fn remove(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.remove(client_id) else {
            return false;
        };
        if let Some(set) = inner.by_kind.get_mut(&connection.client_info.client_type) {
            set.remove(client_id);
        }
        if let Some(env_id) = &connection.client_info.env_id {
            if let Some(set) = inner.by_env.get_mut(env_id) {
                set.remove(client_id);
                if set.is_empty() {
                    inner.by_env.remove(env_id);
                }
            }
        }
        true
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.inner.read().await.connections.contains_key(client_id)
    }

    pub async fn client_info(&self, client_id: &str) -> Option<ClientInfo> {
        self.inner
            .read()
            .await
            .connections
            .get(client_id)
            .map(|c| c.client_info.clone())
    }

    /// Attempts to deliver `envelope` to `client_id`. `Some(true)` on a
    /// successful enqueue, `Some(false)` if the write failed (caller
    /// should `remove` the connection), `None` if no such connection.
    pub async fn try_deliver(&self, client_id: &str, envelope: &Envelope) -> Option<bool> {
        let inner = self.inner.read().await;
        inner.connections.get(client_id).map(|c| c.try_send(envelope))
    }

    /// Snapshot of every connected `client_id`, for broadcast targeting.
    /// Held without the registry lock once returned.
    pub async fn all_ids(&self) -> Vec<String> {
        self.inner.read().await.connections.keys().cloned().collect()
    }

    pub async fn ids_by_kind(&self, kind: ClientType) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_kind
            .get(&kind)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn ids_by_env(&self, env_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .by_env
            .get(env_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn touch(&self, client_id: &str) {
        if let Some(connection) = self.inner.write().await.connections.get_mut(client_id) {
            connection.last_heartbeat = Instant::now();
        }
    }

    /// Signals the owning reader task that `client_id` was pruned for
    /// heartbeat timeout, so it sends its own close frame and exits
    /// instead of being torn down from outside while still blocked on
    /// the socket. Does not remove the connection from the registry —
    /// the reader task's own teardown does that once it observes the
    /// signal. Returns `false` if there was no connection, or its prune
    /// signal was already consumed.
    pub async fn request_close(&self, client_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let Some(connection) = inner.connections.get_mut(client_id) else {
            return false;
        };
        match connection.prune.take() {
            Some(prune) => prune.send(()).is_ok(),
            None => false,
        }
    }

    /// `client_id`s whose last heartbeat is older than `max_age`. Used
    /// by the sweeper; does not mutate the registry itself.
    pub async fn stale(&self, max_age: std::time::Duration) -> Vec<String> {
        let now = Instant::now();
        self.inner
            .read()
            .await
            .connections
            .iter()
            .filter(|(_, c)| now.duration_since(c.last_heartbeat) > max_age)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            total: inner.connections.len(),
            agents: inner.by_kind.get(&ClientType::Agent).map_or(0, HashSet::len),
            environments: inner
                .by_kind
                .get(&ClientType::Environment)
                .map_or(0, HashSet::len),
            humans: inner.by_kind.get(&ClientType::Human).map_or(0, HashSet::len),
            env_count: inner.by_env.len(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, kind: ClientType, env: Option<&str>) -> ClientInfo {
        let info = ClientInfo::new(id, kind);
        match env {
            Some(env) => info.with_env_id(env),
            None => info,
        }
    }

    fn sink() -> (mpsc::Sender<WsMessage>, mpsc::Receiver<WsMessage>) {
        mpsc::channel(8)
    }

    fn prune_pair() -> (oneshot::Sender<()>, oneshot::Receiver<()>) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = sink();
        let (tx2, _rx2) = sink();
        let (prune1, _prune_rx1) = prune_pair();
        let (prune2, _prune_rx2) = prune_pair();
        assert!(registry.add(info("a1", ClientType::Agent, None), tx1, prune1).await);
        assert!(!registry.add(info("a1", ClientType::Agent, None), tx2, prune2).await);
    }

    #[tokio::test]
    async fn indices_stay_consistent_across_add_remove() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = sink();
        let (prune, _prune_rx) = prune_pair();
        registry
            .add(info("a1", ClientType::Agent, Some("env1")), tx, prune)
            .await;

        assert!(registry.contains("a1").await);
        assert_eq!(registry.ids_by_kind(ClientType::Agent).await, vec!["a1"]);
        assert_eq!(registry.ids_by_env("env1").await, vec!["a1"]);

        registry.remove("a1").await;
        assert!(!registry.contains("a1").await);
        assert!(registry.ids_by_kind(ClientType::Agent).await.is_empty());
        assert!(registry.ids_by_env("env1").await.is_empty());
    }

    #[tokio::test]
    async fn stats_count_by_kind_and_env() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = sink();
        let (tx2, _rx2) = sink();
        let (prune1, _prune_rx1) = prune_pair();
        let (prune2, _prune_rx2) = prune_pair();
        registry
            .add(info("a1", ClientType::Agent, Some("env1")), tx1, prune1)
            .await;
        registry
            .add(info("e1", ClientType::Environment, Some("env1")), tx2, prune2)
            .await;

        let stats = registry.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.agents, 1);
        assert_eq!(stats.environments, 1);
        assert_eq!(stats.env_count, 1);
    }

    #[tokio::test]
    async fn request_close_fires_the_prune_signal_once() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = sink();
        let (prune, prune_rx) = prune_pair();
        registry
            .add(info("a1", ClientType::Agent, None), tx, prune)
            .await;

        assert!(registry.request_close("a1").await);
        prune_rx.await.expect("prune signal delivered");

        // The sender was already consumed; a second call finds nothing to fire.
        assert!(!registry.request_close("a1").await);
        assert!(!registry.request_close("ghost").await);
    }
}
