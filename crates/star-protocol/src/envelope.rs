use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::message::Message;
use crate::types::EnvelopeType;

/// Recipient literal that routes an envelope to every connected client
/// (subject to the broadcast rules a router applies).
pub const BROADCAST: &str = "broadcast";

fn new_envelope_id() -> String {
    Uuid::new_v4().to_string()
}

fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The unit of transport between a client and the hub.
///
/// `recipient` distinguishes three cases: a concrete client id, the
/// [`BROADCAST`] literal, or `None`/empty for envelopes scoped to the hub
/// itself (e.g. a bare heartbeat). The wire key must still be present —
/// decoding fails if it is missing entirely, see [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub sender: String,
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default = "new_envelope_id")]
    pub envelope_id: String,
    #[serde(default = "now_timestamp")]
    pub timestamp: f64,
}

impl Envelope {
    /// Build a `message`-kind envelope, minting a fresh id and timestamp.
    pub fn new(sender: impl Into<String>, recipient: Option<String>, message: Message) -> Self {
        Self {
            envelope_type: EnvelopeType::Message,
            sender: sender.into(),
            recipient,
            message: Some(message),
            envelope_id: new_envelope_id(),
            timestamp: now_timestamp(),
        }
    }

    /// Build a bare heartbeat envelope, addressed to nobody in particular.
    pub fn heartbeat(sender: impl Into<String>) -> Self {
        Self {
            envelope_type: EnvelopeType::Heartbeat,
            sender: sender.into(),
            recipient: None,
            message: None,
            envelope_id: new_envelope_id(),
            timestamp: now_timestamp(),
        }
    }

    /// Build an `error`-kind envelope carrying a human-readable message and
    /// optional structured detail.
    pub fn error(
        sender: impl Into<String>,
        recipient: Option<String>,
        error_message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            envelope_type: EnvelopeType::Error,
            sender: sender.into(),
            recipient,
            message: Some(Message::Error(crate::message::ErrorMessage {
                error_message: error_message.into(),
                details,
            })),
            envelope_id: new_envelope_id(),
            timestamp: now_timestamp(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.as_deref() == Some(BROADCAST)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the JSON wire format, enforcing the rules `serde`'s derive
    /// can't express on its own: a non-heartbeat envelope must carry a
    /// `message` whose `message_type` is present and recognized.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        if envelope.envelope_type != EnvelopeType::Heartbeat && envelope.message.is_none() {
            return Err(ProtocolError::MalformedEnvelope(
                "message is required for non-heartbeat envelopes".to_string(),
            ));
        }
        Ok(envelope)
    }
}
