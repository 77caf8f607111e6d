//! Client-side request/response correlation.
//!
//! Turns the asynchronous action/outcome and event/event protocol into
//! ordinary awaitable request/response for callers, with timeouts and a
//! periodic sweep of stale entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::ClientError;

/// The kind of request a context entry was opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Action,
    Event,
}

impl RequestType {
    fn as_str(self) -> &'static str {
        match self {
            RequestType::Action => "action",
            RequestType::Event => "event",
        }
    }
}

/// Where a context entry currently stands. Once it leaves `Pending` it
/// never returns (invariant 6 of the data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Pending,
    Completed,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
enum Completion {
    Completed(serde_json::Value),
    Timeout,
    Error(String),
}

struct EntryState {
    status: ContextStatus,
    completed_at: Option<Instant>,
}

/// A single outstanding request, waiting for its matching outcome/event.
pub struct ContextEntry {
    pub request_id: String,
    pub request_type: RequestType,
    pub request_data: serde_json::Value,
    pub created_at: Instant,
    pub timeout: Duration,
    pub metadata: serde_json::Value,
    state: Mutex<EntryState>,
    tx: watch::Sender<Option<Completion>>,
    rx: watch::Receiver<Option<Completion>>,
    callback: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>,
    stats: Arc<Mutex<ContextStats>>,
}

impl ContextEntry {
    pub fn status(&self) -> ContextStatus {
        self.state.lock().expect("context entry lock poisoned").status
    }

    pub fn completed_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .expect("context entry lock poisoned")
            .completed_at
    }

    /// Blocks until this entry resolves (or `timeout` elapses, defaulting
    /// to the entry's own `timeout`). Concurrent callers all observe the
    /// same terminal outcome, whichever of them drove the expiry.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<serde_json::Value, ClientError> {
        let deadline = timeout.unwrap_or(self.timeout);
        let mut rx = self.rx.clone();

        let resolved = tokio::time::timeout(deadline, async {
            loop {
                if let Some(completion) = rx.borrow_and_update().clone() {
                    return completion;
                }
                if rx.changed().await.is_err() {
                    return Completion::Error("context entry dropped".to_string());
                }
            }
        })
        .await;

        match resolved {
            Ok(Completion::Completed(value)) => Ok(value),
            Ok(Completion::Error(reason)) => {
                Err(ClientError::RequestFailed(self.request_id.clone(), reason))
            }
            Ok(Completion::Timeout) => Err(ClientError::RequestTimeout(self.request_id.clone())),
            Err(_elapsed) => {
                self.mark_timeout();
                Err(ClientError::RequestTimeout(self.request_id.clone()))
            }
        }
    }

    /// `pending -> completed`. Idempotent: returns `false` if the entry had
    /// already left `pending`.
    fn complete(&self, reply: serde_json::Value) -> bool {
        let transitioned = {
            let mut state = self.state.lock().expect("context entry lock poisoned");
            if state.status != ContextStatus::Pending {
                return false;
            }
            state.status = ContextStatus::Completed;
            state.completed_at = Some(Instant::now());
            true
        };
        if transitioned {
            self.stats.lock().expect("stats lock poisoned").completed += 1;
            let _ = self.tx.send(Some(Completion::Completed(reply.clone())));
            if let Some(callback) = &self.callback {
                callback(reply);
            }
        }
        transitioned
    }

    fn fail(&self, reason: impl Into<String>) -> bool {
        let transitioned = {
            let mut state = self.state.lock().expect("context entry lock poisoned");
            if state.status != ContextStatus::Pending {
                return false;
            }
            state.status = ContextStatus::Error;
            state.completed_at = Some(Instant::now());
            true
        };
        if transitioned {
            self.stats.lock().expect("stats lock poisoned").errors += 1;
            let _ = self.tx.send(Some(Completion::Error(reason.into())));
        }
        transitioned
    }

    /// `pending -> timeout`. Called both by a live `wait()` that hits its own
    /// deadline and by the background sweeper; whichever gets there first
    /// owns the transition and bumps `stats.timeout_requests` exactly once.
    fn mark_timeout(&self) -> bool {
        let transitioned = {
            let mut state = self.state.lock().expect("context entry lock poisoned");
            if state.status != ContextStatus::Pending {
                return false;
            }
            state.status = ContextStatus::Timeout;
            state.completed_at = Some(Instant::now());
            true
        };
        if transitioned {
            self.stats.lock().expect("stats lock poisoned").timeout_requests += 1;
            let _ = self.tx.send(Some(Completion::Timeout));
        }
        transitioned
    }
}

impl std::fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextEntry")
            .field("request_id", &self.request_id)
            .field("request_type", &self.request_type)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Snapshot of context-wide counters, used by callers and tests (scenario 5
/// checks `timeout_requests` after a context entry expires).
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextStats {
    pub created: u64,
    pub completed: u64,
    pub timeout_requests: u64,
    pub errors: u64,
    pub pending: u64,
}

/// Per-client map of outstanding context entries plus a background sweeper.
pub struct ClientContext {
    client_id: String,
    default_timeout: Duration,
    sweep_interval: Duration,
    entries: Mutex<HashMap<String, Arc<ContextEntry>>>,
    counter: AtomicU64,
    stats: Arc<Mutex<ContextStats>>,
}

impl ClientContext {
    pub fn new(client_id: impl Into<String>, default_timeout: Duration) -> Arc<Self> {
        Self::with_sweep_interval(client_id, default_timeout, Duration::from_secs(60))
    }

    fn with_sweep_interval(
        client_id: impl Into<String>,
        default_timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            default_timeout,
            sweep_interval,
            entries: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
            stats: Arc::new(Mutex::new(ContextStats::default())),
        })
    }

    #[cfg(test)]
    fn new_with_sweep_interval(
        client_id: impl Into<String>,
        default_timeout: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Self::with_sweep_interval(client_id, default_timeout, sweep_interval)
    }

    fn generate_request_id(&self, request_type: RequestType) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix = Uuid::new_v4().to_string();
        format!(
            "{}_{}_{}_{}",
            self.client_id,
            request_type.as_str(),
            counter,
            &suffix[..8]
        )
    }

    /// Creates a fresh context entry and registers it in the map. The
    /// caller embeds the returned `request_id` in the outgoing message.
    pub fn create(
        &self,
        request_type: RequestType,
        request_data: serde_json::Value,
        timeout: Option<Duration>,
        callback: Option<Arc<dyn Fn(serde_json::Value) + Send + Sync>>,
        metadata: Option<serde_json::Value>,
    ) -> Arc<ContextEntry> {
        let request_id = self.generate_request_id(request_type);
        let (tx, rx) = watch::channel(None);
        let entry = Arc::new(ContextEntry {
            request_id: request_id.clone(),
            request_type,
            request_data,
            created_at: Instant::now(),
            timeout: timeout.unwrap_or(self.default_timeout),
            metadata: metadata.unwrap_or(serde_json::Value::Null),
            state: Mutex::new(EntryState {
                status: ContextStatus::Pending,
                completed_at: None,
            }),
            tx,
            rx,
            callback,
            stats: Arc::clone(&self.stats),
        });
        self.entries
            .lock()
            .expect("context map lock poisoned")
            .insert(request_id, entry.clone());
        self.stats.lock().expect("stats lock poisoned").created += 1;
        entry
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<ContextEntry>> {
        self.entries
            .lock()
            .expect("context map lock poisoned")
            .get(request_id)
            .cloned()
    }

    pub fn by_type(&self, request_type: RequestType) -> Vec<Arc<ContextEntry>> {
        self.entries
            .lock()
            .expect("context map lock poisoned")
            .values()
            .filter(|entry| entry.request_type == request_type)
            .cloned()
            .collect()
    }

    pub fn pending(&self) -> Vec<Arc<ContextEntry>> {
        self.entries
            .lock()
            .expect("context map lock poisoned")
            .values()
            .filter(|entry| entry.status() == ContextStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn remove(&self, request_id: &str) -> bool {
        self.entries
            .lock()
            .expect("context map lock poisoned")
            .remove(request_id)
            .is_some()
    }

    /// Invoked by the dispatcher when an outcome/event carries a matching
    /// `request_id`. Returns `false` if there was no such pending entry —
    /// callers log that at debug and drop (invariant 4 / §7 "Request
    /// correlation").
    pub fn complete(&self, request_id: &str, reply: serde_json::Value) -> bool {
        let Some(entry) = self.get(request_id) else {
            return false;
        };
        entry.complete(reply)
    }

    pub fn error(&self, request_id: &str, reason: impl Into<String>) -> bool {
        let Some(entry) = self.get(request_id) else {
            return false;
        };
        entry.fail(reason)
    }

    pub async fn wait(&self, request_id: &str) -> Result<serde_json::Value, ClientError> {
        let entry = self
            .get(request_id)
            .ok_or_else(|| ClientError::UnknownRequest(request_id.to_string()))?;
        entry.wait(None).await
    }

    pub fn stats(&self) -> ContextStats {
        let mut snapshot = *self.stats.lock().expect("stats lock poisoned");
        snapshot.pending = self
            .entries
            .lock()
            .expect("context map lock poisoned")
            .values()
            .filter(|entry| entry.status() == ContextStatus::Pending)
            .count() as u64;
        snapshot
    }

    /// Runs the sweep loop until the returned handle is aborted. Every pass:
    /// expires `pending` entries older than their own timeout, and removes
    /// terminal entries older than five minutes to bound memory.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(context.sweep_interval);
            loop {
                ticker.tick().await;
                context.sweep_once();
            }
        })
    }

    fn sweep_once(&self) {
        const RETENTION: Duration = Duration::from_secs(5 * 60);
        let now = Instant::now();
        let mut to_remove = Vec::new();

        {
            let entries = self.entries.lock().expect("context map lock poisoned");
            for (request_id, entry) in entries.iter() {
                match entry.status() {
                    ContextStatus::Pending => {
                        if now.duration_since(entry.created_at) > entry.timeout {
                            entry.mark_timeout();
                        }
                    }
                    ContextStatus::Completed | ContextStatus::Timeout | ContextStatus::Error => {
                        if let Some(completed_at) = entry.completed_at() {
                            if now.duration_since(completed_at) > RETENTION {
                                to_remove.push(request_id.clone());
                            }
                        }
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut entries = self.entries.lock().expect("context map lock poisoned");
            for request_id in to_remove {
                entries.remove(&request_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_wakes_a_pending_waiter() {
        let context = ClientContext::new("agent-1", Duration::from_secs(5));
        let entry = context.create(RequestType::Action, serde_json::json!({}), None, None, None);
        let request_id = entry.request_id.clone();

        let waiter = tokio::spawn({
            let context = Arc::clone(&context);
            async move { context.wait(&request_id).await }
        });

        tokio::task::yield_now().await;
        assert!(context.complete(&entry.request_id, serde_json::json!({"ok": true})));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert_eq!(context.stats().completed, 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_observe_the_same_outcome() {
        let context = ClientContext::new("agent-1", Duration::from_secs(5));
        let entry = context.create(RequestType::Event, serde_json::json!({}), None, None, None);

        let w1 = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.wait(None).await })
        };
        let w2 = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.wait(None).await })
        };

        tokio::task::yield_now().await;
        entry.complete(serde_json::json!({"v": 1}));

        assert_eq!(w1.await.unwrap().unwrap(), serde_json::json!({"v": 1}));
        assert_eq!(w2.await.unwrap().unwrap(), serde_json::json!({"v": 1}));
    }

    #[tokio::test]
    async fn wait_times_out_and_marks_entry() {
        let context = ClientContext::new("agent-1", Duration::from_millis(20));
        let entry = context.create(RequestType::Action, serde_json::json!({}), None, None, None);

        let err = entry.wait(None).await.unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout(_)));
        assert_eq!(entry.status(), ContextStatus::Timeout);
    }

    #[tokio::test]
    async fn complete_after_timeout_is_a_no_op() {
        let context = ClientContext::new("agent-1", Duration::from_millis(10));
        let entry = context.create(RequestType::Action, serde_json::json!({}), None, None, None);
        let _ = entry.wait(None).await;
        assert!(!context.complete(&entry.request_id, serde_json::json!({"late": true})));
    }

    #[tokio::test]
    async fn unknown_request_id_is_a_no_op() {
        let context = ClientContext::new("agent-1", Duration::from_secs(5));
        assert!(!context.complete("does-not-exist", serde_json::json!(null)));
        assert!(!context.error("does-not-exist", "boom"));
    }

    #[tokio::test]
    async fn sweeper_expires_stale_pending_entries() {
        let context = ClientContext::new_with_sweep_interval(
            "agent-1",
            Duration::from_millis(10),
            Duration::from_millis(15),
        );
        let entry = context.create(RequestType::Action, serde_json::json!({}), None, None, None);
        let handle = context.spawn_sweeper();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(entry.status(), ContextStatus::Timeout);
        assert!(context.stats().timeout_requests >= 1);
        handle.abort();
    }
}
