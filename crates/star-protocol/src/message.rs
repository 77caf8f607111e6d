use serde::{Deserialize, Serialize};

use crate::types::ClientInfo;

/// Outcome of a completed action, carried in `OutcomeMessage::status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failure,
}

/// A request for some recipient to perform a named action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action: String,
    pub action_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// The result of a previously-sent action, correlated by `action_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeMessage {
    pub action_id: String,
    pub status: Status,
    #[serde(default)]
    pub outcome: serde_json::Value,
}

/// A fire-and-forget notification, optionally correlated by `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event: String,
    pub event_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One chunk of a sequenced, multi-part payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream_id: String,
    pub stream: String,
    pub sequence: u64,
    #[serde(default)]
    pub chunk: serde_json::Value,
}

/// A client's self-announced identity, used during handshake and in tests
/// that want to hand the hub a pre-built registration instead of round
/// tripping through a `connect` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationMessage {
    pub client_info: ClientInfo,
}

/// The payload of an `error`-typed envelope: a human-readable message plus
/// optional structured detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// The payload carried by a non-heartbeat envelope, discriminated on the
/// wire by `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum Message {
    Action(ActionMessage),
    Outcome(OutcomeMessage),
    Event(EventMessage),
    Stream(StreamMessage),
    Registration(RegistrationMessage),
    Error(ErrorMessage),
}

impl Message {
    /// The discriminator string this message would serialize `message_type` as.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Action(_) => "action",
            Message::Outcome(_) => "outcome",
            Message::Event(_) => "event",
            Message::Stream(_) => "stream",
            Message::Registration(_) => "registration",
            Message::Error(_) => "error",
        }
    }
}
