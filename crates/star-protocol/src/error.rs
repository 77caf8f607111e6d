use thiserror::Error;

/// Decode/construction failures for the envelope & message codec.
///
/// Every variant maps onto the single `MalformedEnvelope` failure mode
/// described by the wire contract — outer record missing a required key,
/// an unknown envelope/message discriminator, or a field of the wrong type
/// for its message kind. The string payload carries the `serde_json`
/// diagnostic (or a hand-written reason for rules `serde` can't express,
/// like "message required for non-heartbeat envelope").
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedEnvelope(err.to_string())
    }
}
