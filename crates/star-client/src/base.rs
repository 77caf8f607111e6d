//! Single outbound socket, single inbound dispatcher.
//!
//! `BaseClient` owns one socket and one read loop. It does the same job for
//! every client kind: send envelopes, fan inbound envelopes out to
//! per-kind user handler lists, and match outcome/event replies against the
//! [`ClientContext`] correlation layer before those handlers run. The three
//! specializations in `agent`/`environment`/`human` are thin wrappers that
//! fix `client_type` and add kind-appropriate send helpers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use star_protocol::{
    ActionMessage, ClientInfo, Envelope, EnvelopeType, EventMessage, Message, OutcomeMessage,
    StreamMessage,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{ClientContext, RequestType};
use crate::error::ClientError;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Envelope metadata handed to a handler alongside the typed message body.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub sender: String,
    pub recipient: Option<String>,
    pub envelope_id: String,
    pub timestamp: f64,
}

type ActionHandler = Arc<dyn Fn(ActionMessage, MessageContext) -> BoxFuture + Send + Sync>;
type OutcomeHandler = Arc<dyn Fn(OutcomeMessage, MessageContext) -> BoxFuture + Send + Sync>;
type EventHandler = Arc<dyn Fn(EventMessage, MessageContext) -> BoxFuture + Send + Sync>;
type StreamHandler = Arc<dyn Fn(StreamMessage, MessageContext) -> BoxFuture + Send + Sync>;

struct Registered<H> {
    name_filter: Option<String>,
    handler: H,
}

#[derive(Default)]
struct Handlers {
    actions: Mutex<Vec<Registered<ActionHandler>>>,
    outcomes: Mutex<Vec<Registered<OutcomeHandler>>>,
    events: Mutex<Vec<Registered<EventHandler>>>,
    streams: Mutex<Vec<Registered<StreamHandler>>>,
}

/// Runs one registered handler, catching a panic so a broken handler never
/// stops the rest of the list (spec: "an exception in one handler does not
/// stop the rest").
async fn run_guarded(label: &'static str, fut: BoxFuture) {
    use futures_util::FutureExt;
    if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        tracing::error!(handler = label, "handler panicked, continuing");
    }
}

/// One outbound socket plus one inbound dispatcher, generic over the
/// underlying transport so tests can drive it over an in-memory duplex
/// pair instead of a real TCP socket.
pub struct BaseClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info: ClientInfo,
    write: Arc<AsyncMutex<SplitSink<WebSocketStream<T>, WsMessage>>>,
    context: Arc<ClientContext>,
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BaseClient<MaybeTlsStream<TcpStream>> {
    /// Opens a real WebSocket connection to `hub_url` and completes the
    /// full handshake: socket open, context start, `connect` event, read
    /// loop spawn.
    pub async fn connect(
        hub_url: &str,
        info: ClientInfo,
        default_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let (stream, _response) = tokio_tungstenite::connect_async(hub_url).await?;
        Self::from_stream(stream, info, default_timeout).await
    }
}

impl<T> BaseClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Completes the handshake over an already-established WebSocket
    /// stream. Exposed so tests (and non-TCP transports) can hand in a
    /// stream built any way they like.
    pub async fn from_stream(
        stream: WebSocketStream<T>,
        info: ClientInfo,
        default_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let (write, mut read) = stream.split();
        let write = Arc::new(AsyncMutex::new(write));
        let context = ClientContext::new(info.client_id.clone(), default_timeout);
        let handlers = Arc::new(Handlers::default());
        let connected = Arc::new(AtomicBool::new(true));
        let shutting_down = Arc::new(AtomicBool::new(false));

        let client = Self {
            info,
            write,
            context,
            handlers,
            connected,
            shutting_down,
            tasks: Mutex::new(Vec::new()),
        };

        client.send_connect_event().await?;
        await_connected_reply(&mut read, &client.info.client_id).await?;

        let sweeper = client.context.spawn_sweeper();
        let reader = tokio::spawn(read_loop(
            read,
            Arc::clone(&client.write),
            Arc::clone(&client.context),
            Arc::clone(&client.handlers),
            Arc::clone(&client.connected),
            client.info.client_id.clone(),
        ));
        client.tasks.lock().expect("task list lock poisoned").push(sweeper);
        client.tasks.lock().expect("task list lock poisoned").push(reader);

        Ok(client)
    }

    pub fn client_info(&self) -> &ClientInfo {
        &self.info
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.context
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_connect_event(&self) -> Result<(), ClientError> {
        let data = serde_json::json!({
            "client_type": self.info.client_type,
            "env_id": self.info.env_id,
            "metadata": self.info.metadata,
        });
        let connect_event = Message::Event(EventMessage {
            event: "connect".to_string(),
            event_id: Uuid::new_v4().to_string(),
            data,
        });
        let envelope = Envelope::new(
            self.info.client_id.clone(),
            Some("hub".to_string()),
            connect_event,
        );
        self.send(envelope).await
    }

    /// Stops the context sweeper and the read loop, and closes the socket.
    /// Caller-initiated, as opposed to the read loop noticing the socket
    /// died on its own: a `send` after this point reports
    /// [`ClientError::NotRunning`] rather than [`ClientError::NotConnected`],
    /// so callers can tell "I told it to stop" apart from "the connection
    /// dropped out from under me."
    pub async fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().expect("task list lock poisoned").drain(..) {
            task.abort();
        }
        let mut write = self.write.lock().await;
        let _ = write.close().await;
    }

    /// Writes a fully-built envelope to the socket.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ClientError::NotRunning);
        }
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let encoded = envelope.encode()?;
        let mut write = self.write.lock().await;
        write
            .send(WsMessage::Text(encoded.into()))
            .await
            .map_err(ClientError::Transport)
    }

    /// Wraps `message` in a `message`-kind envelope addressed to `recipient`
    /// and sends it.
    pub async fn send_message(&self, message: Message, recipient: impl Into<String>) -> Result<(), ClientError> {
        let envelope = Envelope::new(self.info.client_id.clone(), Some(recipient.into()), message);
        self.send(envelope).await
    }

    pub fn on_action<F, Fut>(&self, name_filter: Option<&str>, handler: F)
    where
        F: Fn(ActionMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .actions
            .lock()
            .expect("handler list lock poisoned")
            .push(Registered {
                name_filter: name_filter.map(str::to_string),
                handler: Arc::new(move |msg, ctx| Box::pin(handler(msg, ctx))),
            });
    }

    pub fn on_outcome<F, Fut>(&self, action_id_filter: Option<&str>, handler: F)
    where
        F: Fn(OutcomeMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .outcomes
            .lock()
            .expect("handler list lock poisoned")
            .push(Registered {
                name_filter: action_id_filter.map(str::to_string),
                handler: Arc::new(move |msg, ctx| Box::pin(handler(msg, ctx))),
            });
    }

    pub fn on_event<F, Fut>(&self, event_name_filter: Option<&str>, handler: F)
    where
        F: Fn(EventMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .events
            .lock()
            .expect("handler list lock poisoned")
            .push(Registered {
                name_filter: event_name_filter.map(str::to_string),
                handler: Arc::new(move |msg, ctx| Box::pin(handler(msg, ctx))),
            });
    }

    pub fn on_stream<F, Fut>(&self, stream_name_filter: Option<&str>, handler: F)
    where
        F: Fn(StreamMessage, MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .streams
            .lock()
            .expect("handler list lock poisoned")
            .push(Registered {
                name_filter: stream_name_filter.map(str::to_string),
                handler: Arc::new(move |msg, ctx| Box::pin(handler(msg, ctx))),
            });
    }

    /// Sends an action and, by default, awaits its outcome through the
    /// context layer. `action_id` is set to the context's `request_id` so
    /// the two correlate exactly (spec: "the same id threads through
    /// action -> outcome -> context completion").
    pub async fn send_action_with_context(
        &self,
        action: impl Into<String>,
        params: serde_json::Value,
        recipient: impl Into<String>,
        timeout: Option<Duration>,
        wait_for_outcome: bool,
    ) -> Result<ContextOutcome, ClientError> {
        let action = action.into();
        let recipient = recipient.into();
        let entry = self.context.create(
            RequestType::Action,
            serde_json::json!({
                "action": action.clone(),
                "params": params.clone(),
                "recipient": recipient.clone(),
            }),
            timeout,
            None,
            None,
        );
        let request_id = entry.request_id.clone();

        let message = Message::Action(ActionMessage {
            action,
            action_id: request_id.clone(),
            parameters: params,
        });
        self.send_message(message, recipient).await?;

        if wait_for_outcome {
            Ok(ContextOutcome::Value(entry.wait(timeout).await?))
        } else {
            Ok(ContextOutcome::RequestId(request_id))
        }
    }

    /// Sends an event and, if `wait_for_response` is set, injects
    /// `request_id` into `data` and awaits the matching reply.
    pub async fn send_event_with_context(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
        recipient: impl Into<String>,
        timeout: Option<Duration>,
        wait_for_response: bool,
    ) -> Result<ContextOutcome, ClientError> {
        let event = event.into();
        let recipient = recipient.into();

        if !wait_for_response {
            let message = Message::Event(EventMessage {
                event,
                event_id: Uuid::new_v4().to_string(),
                data,
            });
            self.send_message(message, recipient).await?;
            return Ok(ContextOutcome::RequestId(String::new()));
        }

        let entry = self.context.create(
            RequestType::Event,
            serde_json::json!({
                "event": event.clone(),
                "data": data.clone(),
                "recipient": recipient.clone(),
            }),
            timeout,
            None,
            None,
        );
        let request_id = entry.request_id.clone();

        let mut data = data;
        if let serde_json::Value::Object(ref mut map) = data {
            map.insert("request_id".to_string(), serde_json::Value::String(request_id.clone()));
        }
        let message = Message::Event(EventMessage {
            event,
            event_id: Uuid::new_v4().to_string(),
            data,
        });
        self.send_message(message, recipient).await?;

        Ok(ContextOutcome::Value(entry.wait(timeout).await?))
    }
}

/// Blocks until the hub's `connected` reply to our handshake arrives, or
/// fails with [`ClientError::HandshakeRejected`] if the hub closes the
/// socket first or replies with a non-success status (per `spec.md` §6,
/// "Hub reply on success: an envelope with message `event=\"connected\"`").
async fn await_connected_reply<T>(
    read: &mut SplitStream<WebSocketStream<T>>,
    client_id: &str,
) -> Result<(), ClientError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match read.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let envelope = Envelope::decode(&text).map_err(|err| {
                    ClientError::HandshakeRejected(format!("malformed handshake reply: {err}"))
                })?;
                match envelope.message {
                    Some(Message::Event(event)) if event.event == "connected" => {
                        let status = event.data.get("status").and_then(|v| v.as_str());
                        return if status == Some("success") {
                            Ok(())
                        } else {
                            Err(ClientError::HandshakeRejected(format!(
                                "hub rejected handshake for {client_id}: {:?}",
                                event.data
                            )))
                        };
                    }
                    _ => continue,
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = frame.map_or_else(|| "connection closed".to_string(), |f| f.reason.to_string());
                return Err(ClientError::HandshakeRejected(reason));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(ClientError::Transport(err)),
            None => {
                return Err(ClientError::HandshakeRejected(
                    "connection closed before handshake completed".to_string(),
                ))
            }
        }
    }
}

/// What a context-bearing send resolves to.
#[derive(Debug, Clone)]
pub enum ContextOutcome {
    Value(serde_json::Value),
    RequestId(String),
}

async fn read_loop<T>(
    mut read: SplitStream<WebSocketStream<T>>,
    write: Arc<AsyncMutex<SplitSink<WebSocketStream<T>, WsMessage>>>,
    context: Arc<ClientContext>,
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
    client_id: String,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = read.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match Envelope::decode(&text) {
                Ok(envelope) => dispatch(envelope, &context, &handlers).await,
                Err(err) => warn!(client_id = %client_id, error = %err, "malformed envelope"),
            },
            Ok(WsMessage::Ping(payload)) => {
                let mut write = write.lock().await;
                let _ = write.send(WsMessage::Pong(payload)).await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "read error, disconnecting");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!(client_id = %client_id, "read loop exited");
}

async fn dispatch(envelope: Envelope, context: &Arc<ClientContext>, handlers: &Arc<Handlers>) {
    match envelope.envelope_type {
        EnvelopeType::Heartbeat => {
            debug!(sender = %envelope.sender, "heartbeat");
        }
        EnvelopeType::Error => {
            if let Some(Message::Error(err)) = envelope.message {
                warn!(sender = %envelope.sender, error = %err.error_message, "error envelope received");
            }
        }
        EnvelopeType::Message => {
            let Some(message) = envelope.message else {
                return;
            };
            let ctx = MessageContext {
                sender: envelope.sender,
                recipient: envelope.recipient,
                envelope_id: envelope.envelope_id,
                timestamp: envelope.timestamp,
            };
            match message {
                Message::Action(action) => dispatch_action(action, ctx, handlers).await,
                Message::Outcome(outcome) => dispatch_outcome(outcome, ctx, context, handlers).await,
                Message::Event(event) => dispatch_event(event, ctx, context, handlers).await,
                Message::Stream(stream) => dispatch_stream(stream, ctx, handlers).await,
                Message::Registration(_) | Message::Error(_) => {}
            }
        }
    }
}

async fn dispatch_action(message: ActionMessage, ctx: MessageContext, handlers: &Arc<Handlers>) {
    let registered = handlers.actions.lock().expect("handler list lock poisoned");
    let matching: Vec<_> = registered
        .iter()
        .filter(|r| r.name_filter.as_deref().is_none_or(|n| n == message.action))
        .map(|r| Arc::clone(&r.handler))
        .collect();
    drop(registered);
    for handler in matching {
        run_guarded("action", handler(message.clone(), ctx.clone())).await;
    }
}

async fn dispatch_outcome(
    message: OutcomeMessage,
    ctx: MessageContext,
    context: &Arc<ClientContext>,
    handlers: &Arc<Handlers>,
) {
    let reply = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);
    let completed = context.complete(&message.action_id, reply);
    if completed {
        debug!(action_id = %message.action_id, "matched outcome to context entry");
    } else {
        debug!(action_id = %message.action_id, "no pending context entry for outcome");
    }

    let registered = handlers.outcomes.lock().expect("handler list lock poisoned");
    let matching: Vec<_> = registered
        .iter()
        .filter(|r| r.name_filter.as_deref().is_none_or(|id| id == message.action_id))
        .map(|r| Arc::clone(&r.handler))
        .collect();
    drop(registered);
    for handler in matching {
        run_guarded("outcome", handler(message.clone(), ctx.clone())).await;
    }
}

async fn dispatch_event(
    message: EventMessage,
    ctx: MessageContext,
    context: &Arc<ClientContext>,
    handlers: &Arc<Handlers>,
) {
    if message.event != "client_registered" && message.event != "agent_joined" {
        if let Some(request_id) = extract_request_id(&message.data) {
            let reply = serde_json::to_value(&message).unwrap_or(serde_json::Value::Null);
            let completed = context.complete(&request_id, reply);
            if completed {
                debug!(request_id = %request_id, "matched event to context entry");
            }
        }
    }

    let registered = handlers.events.lock().expect("handler list lock poisoned");
    let matching: Vec<_> = registered
        .iter()
        .filter(|r| r.name_filter.as_deref().is_none_or(|n| n == message.event))
        .map(|r| Arc::clone(&r.handler))
        .collect();
    drop(registered);
    for handler in matching {
        run_guarded("event", handler(message.clone(), ctx.clone())).await;
    }
}

fn extract_request_id(data: &serde_json::Value) -> Option<String> {
    let object = data.as_object()?;
    object
        .get("request_id")
        .or_else(|| object.get("action_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn dispatch_stream(message: StreamMessage, ctx: MessageContext, handlers: &Arc<Handlers>) {
    let registered = handlers.streams.lock().expect("handler list lock poisoned");
    let matching: Vec<_> = registered
        .iter()
        .filter(|r| r.name_filter.as_deref().is_none_or(|n| n == message.stream))
        .map(|r| Arc::clone(&r.handler))
        .collect();
    drop(registered);
    for handler in matching {
        run_guarded("stream", handler(message.clone(), ctx.clone())).await;
    }
}
