use thiserror::Error;

/// Failures a [`crate::base::BaseClient`] (or a specialization built on top
/// of it) can surface to a caller.
///
/// Transport and malformed-envelope errors are recovered locally by the
/// read loop (logged, connection marked disconnected) and never reach here;
/// this enum is only for errors a caller's own action can observe directly.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,

    #[error("request {0} timed out")]
    RequestTimeout(String),

    #[error("no context entry for request {0}")]
    UnknownRequest(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] star_protocol::ProtocolError),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("request {0} failed: {1}")]
    RequestFailed(String, String),

    #[error("client is shutting down")]
    NotRunning,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}
