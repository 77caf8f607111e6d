use thiserror::Error;

/// Failures that can surface out of hub startup or a single handshake.
/// Per-connection runtime errors (transport, malformed envelope, routing)
/// are recovered locally and only ever reach `tracing`, never this enum.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Why a handshake was refused, mapped 1:1 onto the close codes in
/// `spec.md` §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    InvalidHandshake,
    DuplicateClientId,
    Overloaded,
    RegistrationFailed,
    Timeout,
}

impl HandshakeFailure {
    /// The WebSocket close code this failure maps to.
    pub fn close_code(self) -> u16 {
        match self {
            HandshakeFailure::InvalidHandshake | HandshakeFailure::Timeout => 1002,
            HandshakeFailure::DuplicateClientId => 1002,
            HandshakeFailure::Overloaded => 1013,
            HandshakeFailure::RegistrationFailed => 1011,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HandshakeFailure::InvalidHandshake => "Invalid handshake",
            HandshakeFailure::Timeout => "Invalid handshake",
            HandshakeFailure::DuplicateClientId => "Duplicate client id",
            HandshakeFailure::Overloaded => "Overloaded",
            HandshakeFailure::RegistrationFailed => "Registration failed",
        }
    }
}
