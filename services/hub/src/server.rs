//! Per-connection lifecycle and the accept-time handshake. Grounded on
//! the teacher's `ws_forwarder::handle_forwarder_socket` for the overall
//! shape (timeout-bounded first frame, `tokio::select!` read/heartbeat
//! loop, cleanup on exit) and on the source's `ConnectionManager.add_connection`
//! / hub handshake sequence for the protocol-level steps.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use star_protocol::{ClientInfo, ClientType, Envelope, EventMessage, Message};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::HandshakeFailure;
use crate::registry::ConnectionRegistry;
use crate::router;
use crate::{HubState, Shutdown};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_QUEUE_CAPACITY: usize = 64;
const SHUTDOWN_CLOSE_CODE: u16 = 1001;
const HEARTBEAT_TIMEOUT_CLOSE_CODE: u16 = 1001;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: HubState) {
    if !state.shutdown.is_running() {
        close_with(&mut socket, HandshakeFailure::InvalidHandshake).await;
        return;
    }

    let handshake = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => text,
        Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => return,
        Ok(Some(Ok(_))) => {
            close_with(&mut socket, HandshakeFailure::InvalidHandshake).await;
            return;
        }
        Ok(Some(Err(_))) => return,
        Err(_) => {
            close_with(&mut socket, HandshakeFailure::Timeout).await;
            return;
        }
    };

    let envelope = match Envelope::decode(&handshake) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "handshake frame failed to decode");
            close_with(&mut socket, HandshakeFailure::InvalidHandshake).await;
            return;
        }
    };

    let Some(client_info) = connect_client_info(&envelope) else {
        close_with(&mut socket, HandshakeFailure::InvalidHandshake).await;
        return;
    };

    if state.registry.stats().await.total >= state.config.hub_max_connections {
        close_with(&mut socket, HandshakeFailure::Overloaded).await;
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (prune_tx, prune_rx) = oneshot::channel();
    if !state
        .registry
        .add(client_info.clone(), outbound_tx.clone(), prune_tx)
        .await
    {
        close_with(&mut socket, HandshakeFailure::DuplicateClientId).await;
        return;
    }

    let (mut sink, mut stream) = socket.split();

    if send_connected_reply(&mut sink, &client_info).await.is_err() {
        state.registry.remove(&client_info.client_id).await;
        close_sink_with(&mut sink, HandshakeFailure::RegistrationFailed).await;
        return;
    }

    if client_info.client_type == ClientType::Agent {
        if let Some(env_id) = &client_info.env_id {
            announce_agent_joined(&state.registry, &client_info.client_id, env_id).await;
        }
    }

    info!(client_id = %client_info.client_id, client_type = %client_info.client_type, "client connected");

    let writer_task = tokio::spawn(run_writer(sink, outbound_rx));
    run_reader(&state, &client_info.client_id, &mut stream, &outbound_tx, prune_rx).await;

    // Drop both outbound senders so the writer's `recv()` drains whatever
    // `run_reader` just queued (a shutdown or heartbeat-timeout close
    // frame) and then returns `None`, instead of aborting the writer and
    // racing that frame.
    state.registry.remove(&client_info.client_id).await;
    drop(outbound_tx);
    let _ = writer_task.await;
    info!(client_id = %client_info.client_id, "client disconnected");
}

/// Drains the per-connection outbound queue onto the socket. Lives as
/// its own task so a slow writer never blocks the reader or the router.
async fn run_writer(
    mut sink: futures_util::stream::SplitSink<WebSocket, WsMessage>,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = outbound_rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn run_reader(
    state: &HubState,
    client_id: &str,
    stream: &mut futures_util::stream::SplitStream<WebSocket>,
    outbound_tx: &mpsc::Sender<WsMessage>,
    mut prune_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            () = state.shutdown.wait() => {
                let frame = CloseFrame {
                    code: SHUTDOWN_CLOSE_CODE,
                    reason: "Server shutdown".into(),
                };
                let _ = outbound_tx.send(WsMessage::Close(Some(frame))).await;
                break;
            }
            _ = &mut prune_rx => {
                warn!(%client_id, "closing connection for heartbeat timeout");
                let frame = CloseFrame {
                    code: HEARTBEAT_TIMEOUT_CLOSE_CODE,
                    reason: "Heartbeat timeout".into(),
                };
                let _ = outbound_tx.send(WsMessage::Close(Some(frame))).await;
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let envelope = match Envelope::decode(&text) {
                        Ok(mut envelope) => {
                            envelope.sender = client_id.to_string();
                            envelope
                        }
                        Err(err) => {
                            debug!(%client_id, error = %err, "dropping malformed envelope");
                            continue;
                        }
                    };
                    router::route(&state.registry, &envelope).await;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(WsMessage::Binary(_))) => {
                    debug!(%client_id, "dropping unexpected binary frame");
                }
                Some(Err(err)) => {
                    warn!(%client_id, error = %err, "transport error, closing connection");
                    break;
                }
            }
        }
    }
}

/// Validates the first frame is a `connect` event and extracts the
/// identity it declares. Per `spec.md` §4.4 step 2.
fn connect_client_info(envelope: &Envelope) -> Option<ClientInfo> {
    if envelope.envelope_type != star_protocol::EnvelopeType::Message {
        return None;
    }
    let Some(Message::Event(EventMessage { event, data, .. })) = &envelope.message else {
        return None;
    };
    if event != "connect" {
        return None;
    }

    let client_type = match data.get("client_type").and_then(|v| v.as_str())? {
        "agent" => ClientType::Agent,
        "environment" => ClientType::Environment,
        "human" => ClientType::Human,
        _ => return None,
    };

    let mut info = ClientInfo::new(envelope.sender.clone(), client_type);
    if let Some(env_id) = data.get("env_id").and_then(|v| v.as_str()) {
        info = info.with_env_id(env_id);
    }
    if let Some(metadata) = data.get("metadata") {
        info = info.with_metadata(metadata.clone());
    }
    Some(info)
}

async fn send_connected_reply(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    client_info: &ClientInfo,
) -> Result<(), axum::Error> {
    let data = serde_json::json!({
        "status": "success",
        "client_id": client_info.client_id,
        "client_type": client_info.client_type,
        "env_id": client_info.env_id,
    });
    let envelope = Envelope::new(
        "hub",
        Some(client_info.client_id.clone()),
        Message::Event(EventMessage {
            event: "connected".to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            data,
        }),
    );
    let Ok(text) = envelope.encode() else {
        return Err(axum::Error::new("failed to encode connected reply"));
    };
    sink.send(WsMessage::Text(text)).await
}

/// Notifies the environment with client id `env_id` that an agent has
/// joined it. Point-to-point, not a broadcast: the convention (followed by
/// every example and test in this workspace) is that an environment
/// registers with `client_id == env_id`, so this looks up that one
/// connection directly rather than fanning out to the whole env. A miss
/// (environment not yet connected) is silent, matching the source's own
/// `_notify_environment_agent_joined`.
async fn announce_agent_joined(registry: &ConnectionRegistry, client_id: &str, env_id: &str) {
    let envelope = Envelope::new(
        "hub",
        Some(env_id.to_string()),
        Message::Event(EventMessage {
            event: "agent_joined".to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            data: serde_json::json!({ "agent_id": client_id, "env_id": env_id }),
        }),
    );
    if registry.try_deliver(env_id, &envelope).await == Some(false) {
        registry.remove(env_id).await;
    }
}

async fn close_with(socket: &mut WebSocket, failure: HandshakeFailure) {
    let frame = CloseFrame {
        code: failure.close_code(),
        reason: failure.reason().into(),
    };
    let _ = socket.send(WsMessage::Close(Some(frame))).await;
}

/// Same as [`close_with`] but for a handshake failure discovered after the
/// socket has already been split into its sink half.
async fn close_sink_with(
    sink: &mut futures_util::stream::SplitSink<WebSocket, WsMessage>,
    failure: HandshakeFailure,
) {
    let frame = CloseFrame {
        code: failure.close_code(),
        reason: failure.reason().into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
}

/// Runs until `shutdown` fires, pruning connections whose heartbeat is
/// older than `2 * heartbeat_interval`. Per `spec.md` §4.4. Pruning only
/// signals the connection's own reader task (via
/// [`ConnectionRegistry::request_close`]) rather than removing it from the
/// registry directly: the reader task is what owns the socket, so it is
/// the one that sends the close frame and unregisters on its own exit.
pub async fn heartbeat_sweeper(registry: ConnectionRegistry, heartbeat_interval: Duration, shutdown: Shutdown) {
    let max_age = heartbeat_interval * 2;
    let mut ticker = tokio::time::interval(heartbeat_interval);
    loop {
        tokio::select! {
            biased;
            () = shutdown.wait() => break,
            _ = ticker.tick() => {
                for client_id in registry.stale(max_age).await {
                    registry.request_close(&client_id).await;
                }
            }
        }
    }
}
